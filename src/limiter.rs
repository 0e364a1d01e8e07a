//! Global transfer rate limiting
//!
//! Token buckets shared by every torrent in a session. Applied at the peer
//! reader (download) and peer writer (upload) so a saturated link throttles
//! the sockets, never the coordinator loops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A token bucket over bytes. `None` rate means unlimited.
pub struct RateLimiter {
    state: Option<Mutex<Bucket>>,
}

struct Bucket {
    /// Sustained rate, bytes per second
    rate: u64,
    /// Bucket capacity, bytes
    burst: u64,
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Create a limiter. A rate of `None` or zero disables limiting.
    pub fn new(rate: Option<u64>) -> Arc<Self> {
        let state = rate.filter(|&r| r > 0).map(|rate| {
            // One second of burst, but always enough for a full block
            let burst = rate.max(crate::piece::BLOCK_SIZE as u64);
            Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst as f64,
                refilled_at: Instant::now(),
            })
        });
        Arc::new(Self { state })
    }

    /// An unlimited limiter.
    pub fn unlimited() -> Arc<Self> {
        Self::new(None)
    }

    /// Wait until `bytes` tokens are available, then consume them.
    pub async fn acquire(&self, bytes: usize) {
        let Some(state) = &self.state else {
            return;
        };

        let bytes = bytes as f64;
        loop {
            let wait = {
                let mut bucket = state.lock();
                bucket.refill();
                if bucket.tokens >= bytes {
                    bucket.tokens -= bytes;
                    return;
                }
                let deficit = bytes - bucket.tokens;
                Duration::from_secs_f64(deficit / bucket.rate as f64)
            };
            tokio::time::sleep(wait.min(Duration::from_secs(1))).await;
        }
    }

    /// True when this limiter actually limits.
    pub fn is_limited(&self) -> bool {
        self.state.is_some()
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.refilled_at = now;
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.burst as f64);
    }
}

/// The pair of session-wide limiters handed to each torrent.
#[derive(Clone)]
pub struct RateLimits {
    pub download: Arc<RateLimiter>,
    pub upload: Arc<RateLimiter>,
}

impl RateLimits {
    /// No limiting in either direction.
    pub fn unlimited() -> Self {
        Self {
            download: RateLimiter::unlimited(),
            upload: RateLimiter::unlimited(),
        }
    }

    /// Limit both directions in bytes per second.
    pub fn new(download: Option<u64>, upload: Option<u64>) -> Self {
        Self {
            download: RateLimiter::new(download),
            upload: RateLimiter::new(upload),
        }
    }
}
