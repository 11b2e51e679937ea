use crate::Config;
use crate::admission::AdmissionController;
use crate::fetcher::ResourceFetcher;
use crate::reassembly::{ChunkReassembler, FetchSettings};
use crate::token::{LinkIssuer, SignatureScope, TokenCodec};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub issuer: LinkIssuer,
    pub admission: AdmissionController,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub reassembler: ChunkReassembler,

    /// Per-stream byte rate, 0.0 when unthrottled
    pub token_rate: f64,
    pub content_type: String,
}

impl AppState {
    pub fn new(config: &Config, fetcher: Arc<dyn ResourceFetcher>) -> anyhow::Result<Self> {
        config.validate()?;

        let scope = if config.sign_size {
            SignatureScope::ResourceSizeExpiry
        } else {
            SignatureScope::ResourceExpiry
        };

        let codec = match &config.secret_key {
            Some(secret) => TokenCodec::new(secret.as_bytes(), scope)?,
            None => {
                warn!("No secret_key configured, using a random one; links will not survive a restart");
                TokenCodec::random(scope)?
            }
        };

        let settings = FetchSettings::from_config(config);
        info!(
            max_concurrent_streams = config.max_concurrent_streams,
            alignment = settings.alignment,
            block_size = settings.block_size,
            ?scope,
            "Gateway state initialized"
        );

        Ok(Self {
            issuer: LinkIssuer::new(codec, &config.base_url, config.token_ttl()),
            admission: AdmissionController::new(config.max_concurrent_streams),
            reassembler: ChunkReassembler::new(fetcher.clone(), settings),
            fetcher,

            token_rate: config.token_rate,
            content_type: config.content_type.clone(),
        })
    }
}
