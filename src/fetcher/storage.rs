use crate::Config;
use crate::fetcher::{FetchError, ResourceFetcher};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use opendal::services::{Fs, S3};
use opendal::{ErrorKind, Operator, layers::RetryLayer};
use std::path::Path;
use tracing::{info, trace};

/// Fetcher over an opendal operator (local filesystem or S3).
///
/// Objects are addressed by resource id relative to the operator root. Reads
/// follow the aligned block protocol: misaligned offsets are refused and a read
/// at or past the end of the object returns no bytes.
#[derive(Clone)]
pub struct OpendalFetcher {
    operator: Operator,
    alignment: u64,
}

impl OpendalFetcher {
    pub fn new(operator: Operator, alignment: u64) -> Self {
        Self { operator, alignment }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let operator = match config.storage_backend.as_str() {
            "local" => build_fs_operator(Path::new(&config.workspace))?,
            "s3" => {
                let s3 = config
                    .to_s3_config()
                    .ok_or_else(|| anyhow!("S3 configuration is required when using S3 backend"))?;
                build_s3_operator(
                    &s3.bucket,
                    s3.endpoint.as_deref(),
                    s3.region.as_deref(),
                    &s3.access_key_id,
                    &s3.secret_access_key,
                )?
            }
            backend => {
                return Err(anyhow!(
                    "Unsupported storage backend: {backend}. Use 'local' or 's3'"
                ));
            }
        };

        Ok(Self::new(operator, config.alignment))
    }

    pub fn local(root: &Path, alignment: u64) -> Result<Self> {
        Ok(Self::new(build_fs_operator(root)?, alignment))
    }

    async fn object_len(&self, resource_id: &str) -> Result<u64, FetchError> {
        let path = object_path(resource_id)?;
        let meta = self
            .operator
            .stat(path)
            .await
            .map_err(|error| map_error(resource_id, error))?;
        Ok(meta.content_length())
    }
}

#[async_trait]
impl ResourceFetcher for OpendalFetcher {
    async fn fetch(&self, resource_id: &str, offset: u64, limit: usize) -> Result<Bytes, FetchError> {
        let len = self.object_len(resource_id).await?;
        if offset >= len || limit == 0 {
            return Ok(Bytes::new());
        }
        if offset % self.alignment != 0 {
            return Err(FetchError::Misaligned {
                offset,
                alignment: self.alignment,
            });
        }
        let end = offset.saturating_add(limit as u64).min(len);

        trace!(resource_id, offset, end, "Reading object range");
        let buffer = self
            .operator
            .read_with(object_path(resource_id)?)
            .range(offset..end)
            .await
            .map_err(|error| map_error(resource_id, error))?;

        Ok(buffer.to_bytes())
    }

    async fn content_length(&self, resource_id: &str) -> Result<Option<u64>, FetchError> {
        match self.object_len(resource_id).await {
            Ok(len) => Ok(Some(len)),
            Err(FetchError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

/// Keep resource ids inside the operator root.
fn object_path(resource_id: &str) -> Result<&str, FetchError> {
    if resource_id.is_empty()
        || resource_id.starts_with('/')
        || resource_id.ends_with('/')
        || resource_id.split(['/', '\\']).any(|segment| segment == "..")
    {
        return Err(FetchError::InvalidResource(resource_id.to_string()));
    }
    Ok(resource_id)
}

fn map_error(resource_id: &str, error: opendal::Error) -> FetchError {
    match error.kind() {
        ErrorKind::NotFound => FetchError::NotFound(resource_id.to_string()),
        _ => FetchError::Backend(error.to_string()),
    }
}

fn build_fs_operator(root: &Path) -> Result<Operator> {
    info!(root = ?root, "Building filesystem operator");

    let mut builder = Fs::default();
    builder = builder.root(
        root.to_str()
            .ok_or_else(|| anyhow!("Invalid root path: {:?}", root))?,
    );

    Ok(Operator::new(builder)?
        .layer(RetryLayer::new().with_max_times(3))
        .finish())
}

fn build_s3_operator(
    bucket: &str,
    endpoint: Option<&str>,
    region: Option<&str>,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    info!(
        bucket = %bucket,
        endpoint = ?endpoint,
        region = ?region,
        "Building S3 operator"
    );

    let mut builder = S3::default()
        .bucket(bucket)
        .access_key_id(access_key_id)
        .secret_access_key(secret_access_key);

    if let Some(region) = region {
        builder = builder.region(region);
    }

    if let Some(endpoint) = endpoint {
        builder = builder.endpoint(endpoint);
    }

    Ok(Operator::new(builder)?
        .layer(RetryLayer::new().with_max_times(3))
        .finish())
}
