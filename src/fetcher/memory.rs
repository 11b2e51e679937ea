use crate::fetcher::{FetchError, ResourceFetcher};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// One recorded call to [`MemoryFetcher::fetch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchCall {
    pub offset: u64,
    pub limit: usize,
}

/// Holds fetches until let through, one permit per fetch.
#[derive(Clone, Debug)]
pub struct FetchGate {
    permits: Arc<Semaphore>,
}

impl FetchGate {
    /// Let `count` more fetches through.
    pub fn allow(&self, count: usize) {
        self.permits.add_permits(count);
    }

    /// Let every pending and future fetch through.
    pub fn open(&self) {
        self.permits.close();
    }
}

/// In-process upstream with the same alignment and short-read contract as the
/// real one. Cloning shares objects, scripts and the call log.
#[derive(Clone)]
pub struct MemoryFetcher {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
    alignment: u64,
    max_read: Option<usize>,
    exact_limits: bool,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    scripted_reads: Arc<Mutex<VecDeque<usize>>>,
    pending_failures: Arc<Mutex<u32>>,
    calls: Arc<Mutex<Vec<FetchCall>>>,
}

impl MemoryFetcher {
    pub fn new(alignment: u64) -> Self {
        Self {
            objects: Arc::default(),
            alignment: alignment.max(1),
            max_read: None,
            exact_limits: false,
            delay: None,
            gate: None,
            scripted_reads: Arc::default(),
            pending_failures: Arc::default(),
            calls: Arc::default(),
        }
    }

    pub fn with_object(self, resource_id: &str, content: impl Into<Bytes>) -> Self {
        self.insert(resource_id, content);
        self
    }

    /// Cap every read, forcing short reads.
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = Some(max_read);
        self
    }

    /// Cap the next reads, in order, to the given lengths.
    pub fn with_scripted_reads(self, lengths: impl IntoIterator<Item = usize>) -> Self {
        self.scripted_reads.lock().extend(lengths);
        self
    }

    pub fn with_exact_limits(mut self) -> Self {
        self.exact_limits = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block every fetch until the returned gate lets it through.
    pub fn with_gate(mut self) -> (Self, FetchGate) {
        let permits = Arc::new(Semaphore::new(0));
        self.gate = Some(permits.clone());
        (self, FetchGate { permits })
    }

    pub fn insert(&self, resource_id: &str, content: impl Into<Bytes>) {
        self.objects
            .write()
            .insert(resource_id.to_string(), content.into());
    }

    /// Make the next `count` fetches fail with a backend error.
    pub fn fail_next(&self, count: u32) {
        *self.pending_failures.lock() += count;
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.calls.lock().iter().map(|call| call.offset).collect()
    }
}

#[async_trait]
impl ResourceFetcher for MemoryFetcher {
    async fn fetch(&self, resource_id: &str, offset: u64, limit: usize) -> Result<Bytes, FetchError> {
        self.calls.lock().push(FetchCall { offset, limit });

        // A closed gate semaphore means the gate is open
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.pending_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(FetchError::Backend("injected failure".into()));
            }
        }

        let object = self
            .objects
            .read()
            .get(resource_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(resource_id.to_string()))?;

        let len = object.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        if offset % self.alignment != 0 {
            return Err(FetchError::Misaligned {
                offset,
                alignment: self.alignment,
            });
        }

        let mut n = limit.min((len - offset) as usize);
        if let Some(max_read) = self.max_read {
            n = n.min(max_read);
        }
        if let Some(scripted) = self.scripted_reads.lock().pop_front() {
            n = n.min(scripted);
        }

        let start = offset as usize;
        Ok(object.slice(start..start + n))
    }

    fn accepts_exact_limits(&self) -> bool {
        self.exact_limits
    }

    async fn content_length(&self, resource_id: &str) -> Result<Option<u64>, FetchError> {
        Ok(self
            .objects
            .read()
            .get(resource_id)
            .map(|object| object.len() as u64))
    }
}
