//! Stream rate limiting.
//!
//! Token buckets for the four transfer directions. A [`StreamLimits`]
//! context is built once at startup and shared by reference with every
//! session; config reloads mutate the limiters in place so callers that
//! are already waiting pick up the new rate immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::LimitSettings;
use crate::vfs::{RangeReader, VfsResult};

/// Refill rate of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// No limiting at all.
    Unlimited,
    /// Bytes per second. Zero blocks every waiter until reconfigured.
    PerSecond(u64),
}

impl Limit {
    /// Map an optional bytes/second setting: `None` is unlimited.
    pub fn from_setting(setting: Option<u64>) -> Self {
        match setting {
            Some(n) => Limit::PerSecond(n),
            None => Limit::Unlimited,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    limit: Limit,
    burst: u64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn capacity(&self) -> u64 {
        self.burst.max(1)
    }

    fn refill(&mut self, now: Instant) {
        if let Limit::PerSecond(rate) = self.limit {
            let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(self.capacity() as f64);
        }
        self.last = now;
    }
}

enum Step {
    Done,
    Took(u64),
    Sleep(Duration),
    Starved,
}

/// Token-bucket limiter measured in bytes.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    changed: Notify,
}

impl RateLimiter {
    /// Create a limiter from an optional bytes/second setting.
    ///
    /// The burst equals the rate, so a full second of traffic can pass
    /// without waiting.
    pub fn new(bytes_per_sec: Option<u64>) -> Self {
        let limit = Limit::from_setting(bytes_per_sec);
        let burst = bytes_per_sec.unwrap_or(0);
        Self {
            bucket: Mutex::new(Bucket {
                limit,
                burst,
                tokens: burst as f64,
                last: Instant::now(),
            }),
            changed: Notify::new(),
        }
    }

    /// Create a limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Current refill rate.
    pub fn limit(&self) -> Limit {
        self.bucket.lock().limit
    }

    /// Current burst size.
    pub fn burst(&self) -> u64 {
        self.bucket.lock().burst
    }

    /// Change the refill rate in place and wake all waiters.
    pub fn set_limit(&self, limit: Limit) {
        {
            let mut bucket = self.bucket.lock();
            bucket.refill(Instant::now());
            bucket.limit = limit;
        }
        self.changed.notify_waiters();
    }

    /// Change the burst size in place and wake all waiters.
    pub fn set_burst(&self, burst: u64) {
        {
            let mut bucket = self.bucket.lock();
            bucket.refill(Instant::now());
            bucket.burst = burst;
            bucket.tokens = bucket.tokens.min(bucket.capacity() as f64);
        }
        self.changed.notify_waiters();
    }

    /// Apply an optional bytes/second setting (rate and burst together).
    pub fn reconfigure(&self, bytes_per_sec: Option<u64>) {
        {
            let mut bucket = self.bucket.lock();
            bucket.refill(Instant::now());
            bucket.limit = Limit::from_setting(bytes_per_sec);
            bucket.burst = bytes_per_sec.unwrap_or(0);
            bucket.tokens = bucket.tokens.min(bucket.capacity() as f64);
        }
        self.changed.notify_waiters();
    }

    /// Wait until `n` bytes may pass.
    ///
    /// Requests larger than the burst are consumed in burst-sized chunks.
    /// There is no timeout: a starved caller waits until tokens accrue or
    /// the limiter is reconfigured.
    pub async fn wait_n(&self, n: usize) {
        let mut remaining = n as u64;
        while remaining > 0 {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before inspecting the bucket so a concurrent
            // reconfigure cannot slip between the check and the wait.
            notified.as_mut().enable();

            match self.step(remaining) {
                Step::Done => return,
                Step::Took(taken) => remaining -= taken,
                Step::Sleep(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut notified => {}
                    }
                }
                Step::Starved => notified.await,
            }
        }
    }

    fn step(&self, remaining: u64) -> Step {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        match bucket.limit {
            Limit::Unlimited => Step::Done,
            Limit::PerSecond(rate) => {
                let want = remaining.min(bucket.capacity());
                if bucket.tokens >= want as f64 {
                    bucket.tokens -= want as f64;
                    Step::Took(want)
                } else if rate == 0 {
                    Step::Starved
                } else {
                    let deficit = want as f64 - bucket.tokens;
                    Step::Sleep(Duration::from_secs_f64(deficit / rate as f64))
                }
            }
        }
    }
}

/// The four process-wide stream limiters.
#[derive(Debug)]
pub struct StreamLimits {
    client_download: Arc<RateLimiter>,
    client_upload: Arc<RateLimiter>,
    server_download: Arc<RateLimiter>,
    server_upload: Arc<RateLimiter>,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl StreamLimits {
    /// Build limiters from settings.
    pub fn new(settings: &LimitSettings) -> Self {
        Self {
            client_download: Arc::new(RateLimiter::new(settings.client_download)),
            client_upload: Arc::new(RateLimiter::new(settings.client_upload)),
            server_download: Arc::new(RateLimiter::new(settings.server_download)),
            server_upload: Arc::new(RateLimiter::new(settings.server_upload)),
        }
    }

    /// Limits that never wait.
    pub fn unlimited() -> Self {
        Self::new(&LimitSettings::default())
    }

    /// Apply new settings to the existing limiters in place.
    pub fn apply(&self, settings: &LimitSettings) {
        self.client_download.reconfigure(settings.client_download);
        self.client_upload.reconfigure(settings.client_upload);
        self.server_download.reconfigure(settings.server_download);
        self.server_upload.reconfigure(settings.server_upload);
    }

    /// Bytes sent to protocol clients.
    pub fn client_download(&self) -> &Arc<RateLimiter> {
        &self.client_download
    }

    /// Bytes received from protocol clients.
    pub fn client_upload(&self) -> &Arc<RateLimiter> {
        &self.client_upload
    }

    /// Bytes fetched from storage backends.
    pub fn server_download(&self) -> &Arc<RateLimiter> {
        &self.server_download
    }

    /// Bytes committed to storage backends.
    pub fn server_upload(&self) -> &Arc<RateLimiter> {
        &self.server_upload
    }
}

/// A [`RangeReader`] that charges every successful read to a limiter.
pub struct LimitedReader {
    inner: Box<dyn RangeReader>,
    limiter: Arc<RateLimiter>,
}

impl LimitedReader {
    pub fn new(inner: Box<dyn RangeReader>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl RangeReader for LimitedReader {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let n = self.inner.read_at(buf, offset).await?;
        self.limiter.wait_n(n).await;
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn close(&self) -> VfsResult<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.wait_n(10 * 1024 * 1024).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_passes_then_waits() {
        let limiter = RateLimiter::new(Some(100));
        let start = Instant::now();

        // Full bucket: the first 100 bytes are free.
        limiter.wait_n(100).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        // The next 50 need half a second of refill.
        limiter.wait_n(50).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(490), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_larger_than_burst_is_chunked() {
        let limiter = RateLimiter::new(Some(10));
        let start = Instant::now();
        limiter.wait_n(30).await;
        // 10 free, then two more seconds for 20 bytes.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1990), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_blocks_until_reconfigured() {
        let limiter = Arc::new(RateLimiter::new(Some(0)));
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.wait_n(5).await })
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!waiter.is_finished());

        limiter.reconfigure(None);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on reconfigure")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_observe_new_rate() {
        let limiter = Arc::new(RateLimiter::new(Some(1)));
        limiter.wait_n(1).await;

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let start = Instant::now();
                limiter.wait_n(1).await;
                start.elapsed()
            })
        };
        tokio::task::yield_now().await;

        limiter.set_limit(Limit::Unlimited);
        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_millis(100), "{waited:?}");
    }

    #[test]
    fn test_stream_limits_apply_in_place() {
        let limits = StreamLimits::unlimited();
        let before = Arc::clone(limits.client_upload());

        limits.apply(&LimitSettings {
            client_upload: Some(2048),
            ..Default::default()
        });

        assert!(Arc::ptr_eq(&before, limits.client_upload()));
        assert_eq!(before.limit(), Limit::PerSecond(2048));
        assert_eq!(before.burst(), 2048);
        assert_eq!(limits.client_download().limit(), Limit::Unlimited);
    }
}
