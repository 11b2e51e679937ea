//! Maps an arbitrary byte window onto aligned upstream block reads.
//!
//! The first read starts at the window start rounded down to the alignment
//! unit. Bytes before the window are dropped from the front of the stream,
//! bytes past it are trimmed from the back. The upstream cursor always advances
//! by the raw length returned, independent of local trimming. Short reads are
//! followed up at the advanced offset; an empty read ends the stream.

use crate::Config;
use crate::admission::AdmissionSlot;
use crate::fetcher::{FetchError, ResourceFetcher};
use crate::range::ByteWindow;
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Upstream exhausted after {delivered} of {expected} bytes")]
    UpstreamExhausted { delivered: u64, expected: u64 },

    #[error("Upstream fetch at offset {offset} failed: {source}")]
    UpstreamTransient {
        offset: u64,
        #[source]
        source: FetchError,
    },

    #[error("Upstream fetch at offset {offset} timed out after {timeout:?}")]
    UpstreamTimeout { offset: u64, timeout: Duration },
}

/// Upstream protocol parameters, fixed at startup.
#[derive(Clone, Debug)]
pub struct FetchSettings {
    /// Offset granularity the upstream requires
    pub alignment: u64,
    /// Bytes requested per fetch
    pub block_size: usize,
    pub fetch_timeout: Duration,
    /// Extra attempts for a block after a transient failure
    pub fetch_retries: u32,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            alignment: config.alignment,
            block_size: config.block_size,
            fetch_timeout: config.fetch_timeout(),
            fetch_retries: config.fetch_retries,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            alignment: 4096,
            block_size: 1024 * 1024,
            fetch_timeout: Duration::from_secs(30),
            fetch_retries: 1,
        }
    }
}

#[derive(Clone)]
pub struct ChunkReassembler {
    fetcher: Arc<dyn ResourceFetcher>,
    settings: FetchSettings,
}

impl ChunkReassembler {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, settings: FetchSettings) -> Self {
        Self { fetcher, settings }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Stream exactly the bytes of `window`, in order.
    ///
    /// The stream owns `slot` for its whole lifetime: it is released when the
    /// stream finishes, fails or is dropped, never while a chunk is still with
    /// the consumer. Fetches are issued lazily, one at a time, as the consumer
    /// polls.
    pub fn stream(&self, resource_id: String, window: ByteWindow, slot: AdmissionSlot) -> ChunkStream {
        Box::pin(window_stream(
            self.fetcher.clone(),
            self.settings.clone(),
            resource_id,
            window,
            slot,
        ))
    }
}

fn window_stream(
    fetcher: Arc<dyn ResourceFetcher>,
    settings: FetchSettings,
    resource_id: String,
    window: ByteWindow,
    slot: AdmissionSlot,
) -> impl Stream<Item = Result<Bytes, StreamError>> + Send {
    try_stream! {
        let _slot = slot;
        let ByteWindow { start, end } = window;
        let expected = window.len();

        let aligned_start = start - start % settings.alignment;
        let mut skip = start - aligned_start;
        let mut cursor = aligned_start;
        let mut delivered = 0u64;

        debug!(%resource_id, start, end, aligned_start, skip, "Streaming window");

        while cursor <= end {
            let limit = if fetcher.accepts_exact_limits() {
                usize::try_from(end - cursor + 1)
                    .map_or(settings.block_size, |rest| rest.min(settings.block_size))
            } else {
                settings.block_size
            };

            let raw = fetch_block(fetcher.as_ref(), &settings, &resource_id, cursor, limit).await?;
            if raw.is_empty() {
                break;
            }
            let raw_len = raw.len() as u64;
            trace!(%resource_id, offset = cursor, raw_len, "Fetched block");

            let mut chunk = raw;
            if skip > 0 {
                let dropped = skip.min(raw_len);
                skip -= dropped;
                if dropped == raw_len {
                    cursor += raw_len;
                    continue;
                }
                chunk = chunk.slice(dropped as usize..);
            }

            let wanted = expected - delivered;
            if chunk.len() as u64 > wanted {
                chunk.truncate(wanted as usize);
            }
            delivered += chunk.len() as u64;
            cursor += raw_len;
            yield chunk;
        }

        if delivered < expected {
            Err(StreamError::UpstreamExhausted { delivered, expected })?;
        }
    }
}

/// One block read, bounded in time and retried on transient failure.
async fn fetch_block(
    fetcher: &dyn ResourceFetcher,
    settings: &FetchSettings,
    resource_id: &str,
    offset: u64,
    limit: usize,
) -> Result<Bytes, StreamError> {
    let mut attempt = 0;
    loop {
        let error = match timeout(settings.fetch_timeout, fetcher.fetch(resource_id, offset, limit)).await {
            Ok(Ok(bytes)) => return Ok(bytes),
            Ok(Err(source)) if !source.is_transient() => {
                return Err(StreamError::UpstreamTransient { offset, source });
            }
            Ok(Err(source)) => StreamError::UpstreamTransient { offset, source },
            Err(_) => StreamError::UpstreamTimeout {
                offset,
                timeout: settings.fetch_timeout,
            },
        };

        if attempt >= settings.fetch_retries {
            return Err(error);
        }
        attempt += 1;
        warn!(resource_id, offset, attempt, %error, "Retrying upstream fetch");
    }
}
