//! Upstream chunk source.
//!
//! The upstream only serves reads that start on an alignment boundary and may
//! return fewer bytes than asked for. A read at or past the end of the object
//! returns no bytes, whatever its alignment.

pub mod memory;
pub mod storage;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::{FetchCall, FetchGate, MemoryFetcher};
pub use storage::OpendalFetcher;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FetchError {
    #[error("Offset {offset} is not a multiple of {alignment}")]
    Misaligned { offset: u64, alignment: u64 },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid resource id: {0}")]
    InvalidResource(String),

    #[error("Upstream error: {0}")]
    Backend(String),
}

impl FetchError {
    /// Whether repeating the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Backend(_))
    }
}

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Read up to `limit` bytes of `resource_id` starting at `offset`.
    async fn fetch(&self, resource_id: &str, offset: u64, limit: usize) -> Result<Bytes, FetchError>;

    /// Whether `limit` may be smaller than a full block without upsetting the upstream.
    fn accepts_exact_limits(&self) -> bool {
        false
    }

    /// Size of the resource when the upstream can tell it.
    async fn content_length(&self, _resource_id: &str) -> Result<Option<u64>, FetchError> {
        Ok(None)
    }
}
