//! Adaptive download rate limiting (spec.md §2 "adaptive rate limiting").
//!
//! Grounded on `original_source/src/dlcon.cc`'s speed limiter: the
//! configured `maxdlspeed` (KiB/s) is divided by the number of currently
//! active downloads (`nSpeedNowKib = cfg::maxdlspeed / nCntNew`), so each
//! job's fair share shrinks as more run concurrently. The source computes a
//! per-"take" byte cap against a high-resolution clock; this translation
//! instead sleeps proportionally to bytes consumed against the current
//! share, which is simpler and has the same steady-state effect without
//! reimplementing its microsecond-rounding bucket math.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct RateLimiter {
    max_bytes_per_sec: u64,
    active: AtomicUsize,
}

impl RateLimiter {
    /// `max_kib_per_sec == 0` disables limiting entirely (spec.md §6.4
    /// `maxdlspeed` "documented 'disabled' sentinel").
    pub fn new(max_kib_per_sec: u64) -> Arc<Self> {
        Arc::new(Self { max_bytes_per_sec: max_kib_per_sec * 1024, active: AtomicUsize::new(0) })
    }

    pub fn is_enabled(&self) -> bool {
        self.max_bytes_per_sec > 0
    }

    /// Registers one more concurrently-active download; its fair share
    /// shrinks accordingly until the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard { limiter: self.clone() }
    }

    /// Sleeps long enough that `bytes` consumed looks like it arrived at
    /// this job's current fair share of `max_bytes_per_sec`.
    pub async fn throttle(&self, bytes: usize) {
        if self.max_bytes_per_sec == 0 || bytes == 0 {
            return;
        }
        let active = self.active.load(Ordering::Relaxed).max(1);
        let share = self.max_bytes_per_sec / active as u64;
        if share == 0 {
            return;
        }
        let secs = bytes as f64 / share as f64;
        if secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }
}

pub struct ActiveGuard {
    limiter: Arc<RateLimiter>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::Relaxed);
    }
}
