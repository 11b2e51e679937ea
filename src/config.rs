use anyhow::{Result, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Gateway configuration, loaded from CLI flags and optionally merged with a TOML file.
///
/// Example configuration file content
/// # Stream Gateway Configuration
///
/// listen_on_port = 8000
/// internal_port = 8001
/// base_url = "https://media.example.com"
/// secret_key = "change-me"
/// token_ttl_secs = 3600
///
/// # Admission and upstream protocol
/// max_concurrent_streams = 6
/// alignment = 4096
/// block_size = 1048576
/// fetch_timeout_secs = 30
/// fetch_retries = 1
///
/// # Storage configuration
/// storage_backend = "s3"  # Options: "local" or "s3"
/// s3_bucket = "media"
/// s3_access_key_id = "minioadmin"
/// s3_secret_access_key = "minioadmin"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port the external (streaming) API listens on
    #[arg(short, long, default_value_t = 8000)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Port the internal (link issuance) API listens on
    #[arg(long, default_value_t = 8001)]
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Public base URL used when building stream links
    #[arg(long, default_value = "http://localhost:8000")]
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Shared secret for signing links. A random one is generated when unset.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Lifetime of issued links in seconds
    #[arg(long, default_value_t = 3600)]
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Maximum number of streams served at the same time
    #[arg(short = 'm', long, default_value_t = 6)]
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,

    /// Offset granularity required by the upstream
    #[arg(long, default_value_t = 4096)]
    #[serde(default = "default_alignment")]
    pub alignment: u64,

    /// Bytes requested per upstream fetch
    #[arg(long, default_value_t = 1024 * 1024)]
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Upper bound on a single upstream fetch, in seconds
    #[arg(long, default_value_t = 30)]
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Extra attempts for a failed block fetch (0 = no retry)
    #[arg(long, default_value_t = 1)]
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,

    /// Cover the declared size with the link signature
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    #[serde(default = "default_sign_size")]
    pub sign_size: bool,

    /// Per-stream bandwidth cap in bytes per second (0.0 = disabled)
    #[arg(short, long, default_value_t = 0.0)]
    #[serde(default = "default_token_rate")]
    pub token_rate: f64,

    /// Content type declared when the link carries no file name
    #[arg(long, default_value = "video/mp4")]
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Root directory for the local storage backend
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Configuration file path (overrides all other arguments)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Storage backend: local or s3
    #[arg(short, long, default_value = "local")]
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// S3 bucket name (required when storage-backend is s3)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,

    /// S3 endpoint (for MinIO/custom S3)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_endpoint: Option<String>,

    /// S3 region
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_region: Option<String>,

    /// S3 access key ID
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_secret_access_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            internal_port: default_internal_port(),
            base_url: default_base_url(),
            secret_key: None,
            token_ttl_secs: default_token_ttl_secs(),
            max_concurrent_streams: default_max_concurrent_streams(),
            alignment: default_alignment(),
            block_size: default_block_size(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            fetch_retries: default_fetch_retries(),
            sign_size: default_sign_size(),
            token_rate: default_token_rate(),
            content_type: default_content_type(),
            workspace: default_workspace(),
            config: None,
            storage_backend: default_storage_backend(),
            s3_bucket: None,
            s3_endpoint: None,
            s3_region: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.internal_port == default_internal_port() {
            self.internal_port = file_config.internal_port;
        }
        if self.base_url == default_base_url() {
            self.base_url = file_config.base_url;
        }
        if self.token_ttl_secs == default_token_ttl_secs() {
            self.token_ttl_secs = file_config.token_ttl_secs;
        }
        if self.max_concurrent_streams == default_max_concurrent_streams() {
            self.max_concurrent_streams = file_config.max_concurrent_streams;
        }
        if self.alignment == default_alignment() {
            self.alignment = file_config.alignment;
        }
        if self.block_size == default_block_size() {
            self.block_size = file_config.block_size;
        }
        if self.fetch_timeout_secs == default_fetch_timeout_secs() {
            self.fetch_timeout_secs = file_config.fetch_timeout_secs;
        }
        if self.fetch_retries == default_fetch_retries() {
            self.fetch_retries = file_config.fetch_retries;
        }
        if self.sign_size == default_sign_size() {
            self.sign_size = file_config.sign_size;
        }
        if self.token_rate == default_token_rate() {
            self.token_rate = file_config.token_rate;
        }
        if self.content_type == default_content_type() {
            self.content_type = file_config.content_type;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.storage_backend == default_storage_backend() {
            self.storage_backend = file_config.storage_backend;
        }

        // For Option fields, CLI takes precedence if Some
        if self.secret_key.is_none() {
            self.secret_key = file_config.secret_key;
        }
        if self.s3_bucket.is_none() {
            self.s3_bucket = file_config.s3_bucket;
        }
        if self.s3_endpoint.is_none() {
            self.s3_endpoint = file_config.s3_endpoint;
        }
        if self.s3_region.is_none() {
            self.s3_region = file_config.s3_region;
        }
        if self.s3_access_key_id.is_none() {
            self.s3_access_key_id = file_config.s3_access_key_id;
        }
        if self.s3_secret_access_key.is_none() {
            self.s3_secret_access_key = file_config.s3_secret_access_key;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 {
            return Err(anyhow!("alignment must be greater than zero"));
        }
        if self.block_size == 0 {
            return Err(anyhow!("block_size must be greater than zero"));
        }
        if self.block_size as u64 % self.alignment != 0 {
            return Err(anyhow!(
                "block_size ({}) must be a multiple of alignment ({})",
                self.block_size,
                self.alignment
            ));
        }
        if self.max_concurrent_streams == 0 {
            return Err(anyhow!("max_concurrent_streams must be greater than zero"));
        }
        if self.max_concurrent_streams > Semaphore::MAX_PERMITS {
            return Err(anyhow!(
                "max_concurrent_streams cannot exceed {}",
                Semaphore::MAX_PERMITS
            ));
        }
        if self.token_ttl_secs == 0 {
            return Err(anyhow!("token_ttl_secs must be greater than zero"));
        }
        if !self.token_rate.is_finite() || self.token_rate < 0.0 {
            return Err(anyhow!("token_rate must be a finite, non-negative number"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(anyhow!("base_url must start with http:// or https://"));
        }
        if let Some(secret) = &self.secret_key
            && secret.is_empty()
        {
            return Err(anyhow!("secret_key cannot be empty"));
        }

        match self.storage_backend.as_str() {
            "local" => {}
            "s3" => {
                if self.s3_bucket.as_ref().is_none_or(|s| s.is_empty()) {
                    return Err(anyhow!("S3 bucket name is required when backend is 's3'"));
                }
                if self.s3_access_key_id.as_ref().is_none_or(|s| s.is_empty()) {
                    return Err(anyhow!("S3 access key ID is required when backend is 's3'"));
                }
                if self
                    .s3_secret_access_key
                    .as_ref()
                    .is_none_or(|s| s.is_empty())
                {
                    return Err(anyhow!(
                        "S3 secret access key is required when backend is 's3'"
                    ));
                }
            }
            backend => {
                return Err(anyhow!(
                    "Unsupported storage backend: {backend}. Use 'local' or 's3'"
                ));
            }
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Convert to S3 storage backend configuration
    pub fn to_s3_config(&self) -> Option<S3Config> {
        if self.storage_backend != "s3" {
            return None;
        }

        Some(S3Config {
            bucket: self.s3_bucket.clone()?,
            endpoint: self.s3_endpoint.clone(),
            region: self.s3_region.clone(),
            access_key_id: self.s3_access_key_id.clone()?,
            secret_access_key: self.s3_secret_access_key.clone()?,
        })
    }
}

// S3 configuration subset
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

fn default_port() -> u16 {
    8000
}

fn default_internal_port() -> u16 {
    8001
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_max_concurrent_streams() -> usize {
    6
}

fn default_alignment() -> u64 {
    4096
}

fn default_block_size() -> usize {
    1024 * 1024
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_fetch_retries() -> u32 {
    1
}

fn default_sign_size() -> bool {
    true
}

fn default_token_rate() -> f64 {
    0.0
}

fn default_content_type() -> String {
    "video/mp4".to_string()
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}
