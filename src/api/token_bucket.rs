use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::trace;

struct TokenBucketInner {
    /// Current tokens in micro-units (1,000,000 = one byte)
    tokens_micro: AtomicU64,
    /// Refill rate in micro-units per second
    rate_micro: u64,
    /// One second worth of tokens
    capacity_micro: u64,
    /// Milliseconds since `base_instant` at the last successful take
    last_refill_ms: AtomicU64,
    base_instant: Instant,
}

/// Byte-rate throttle for one outgoing stream.
///
/// Lock-free; starts full and holds at most one second of burst. A rate of zero
/// disables throttling.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<TokenBucketInner>,
}

impl TokenBucket {
    const MICRO_UNITS: u64 = 1_000_000;

    pub fn new(bytes_per_sec: f64) -> Self {
        let rate_micro = (bytes_per_sec.max(0.0) * Self::MICRO_UNITS as f64) as u64;

        TokenBucket {
            inner: Arc::new(TokenBucketInner {
                tokens_micro: AtomicU64::new(rate_micro),
                rate_micro,
                capacity_micro: rate_micro,
                last_refill_ms: AtomicU64::new(0),
                base_instant: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.rate_micro == 0
    }

    /// Take `amount` bytes worth of tokens, waiting for refills as needed.
    ///
    /// Amounts larger than the burst are taken in burst-sized pieces.
    pub async fn consume(&self, amount: usize) {
        if self.is_unlimited() {
            return;
        }

        let mut remaining = (amount as u64).saturating_mul(Self::MICRO_UNITS);
        while remaining > 0 {
            let piece = remaining.min(self.inner.capacity_micro);
            while let Err(wait_ms) = self.try_take(piece, self.now_ms()) {
                trace!(amount, wait_ms, "Throttling stream");
                sleep(Duration::from_millis(wait_ms)).await;
            }
            remaining -= piece;
        }
    }

    /// Ok when `piece` was taken, Err(milliseconds to wait) otherwise.
    fn try_take(&self, piece: u64, now_ms: u64) -> Result<(), u64> {
        let inner = &self.inner;
        loop {
            let current = inner.tokens_micro.load(Ordering::Acquire);
            let last_ms = inner.last_refill_ms.load(Ordering::Acquire);
            let refilled = self.refilled(current, now_ms.saturating_sub(last_ms));

            if refilled < piece {
                let needed = (piece - refilled) as u128;
                let wait_ms = (needed * 1000).div_ceil(inner.rate_micro as u128).max(1);
                return Err(u64::try_from(wait_ms).unwrap_or(u64::MAX));
            }

            if inner
                .tokens_micro
                .compare_exchange_weak(current, refilled - piece, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                inner.last_refill_ms.fetch_max(now_ms, Ordering::Release);
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    fn refilled(&self, current: u64, elapsed_ms: u64) -> u64 {
        let gained = (elapsed_ms as u128 * self.inner.rate_micro as u128) / 1000;
        let total = (current as u128 + gained).min(self.inner.capacity_micro as u128);
        total as u64
    }

    fn now_ms(&self) -> u64 {
        Instant::now()
            .duration_since(self.inner.base_instant)
            .as_millis() as u64
    }

    /// Bytes that could be taken right now without waiting.
    pub fn available_tokens(&self) -> f64 {
        let current = self.inner.tokens_micro.load(Ordering::Relaxed);
        let last_ms = self.inner.last_refill_ms.load(Ordering::Relaxed);
        let refilled = self.refilled(current, self.now_ms().saturating_sub(last_ms));
        refilled as f64 / Self::MICRO_UNITS as f64
    }
}
