//! Peer liveness tracking.
//!
//! Each session records when it last sent and last received a heartbeat.
//! Timestamps only move forward; a late, stale update never rewinds them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

/// Millisecond time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Tokio's monotonic clock, so paused test time applies.
pub struct MonotonicClock {
    base: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }
}

/// Clock driven by hand.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

pub struct Heartbeat {
    clock: Arc<dyn Clock>,
    timeout_ms: AtomicU64,
    last_sent: AtomicU64,
    last_recv: AtomicU64,
}

impl Heartbeat {
    pub fn new(clock: Arc<dyn Clock>, timeout_ms: u64) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            timeout_ms: AtomicU64::new(timeout_ms),
            last_sent: AtomicU64::new(now),
            last_recv: AtomicU64::new(now),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn record_sent(&self) {
        self.last_sent.fetch_max(self.clock.now_ms(), Ordering::AcqRel);
    }

    pub fn record_received(&self) {
        self.last_recv.fetch_max(self.clock.now_ms(), Ordering::AcqRel);
    }

    /// Restart the liveness window, e.g. after a reconnect.
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        self.last_sent.fetch_max(now, Ordering::AcqRel);
        self.last_recv.fetch_max(now, Ordering::AcqRel);
    }

    pub fn last_sent_ms(&self) -> u64 {
        self.last_sent.load(Ordering::Acquire)
    }

    pub fn last_received_ms(&self) -> u64 {
        self.last_recv.load(Ordering::Acquire)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Acquire)
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Release);
    }

    /// Three quarters of the timeout.
    pub fn warn_threshold_ms(&self) -> u64 {
        let t = self.timeout_ms();
        (t >> 1) + (t >> 2)
    }

    fn silence_ms(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.last_received_ms())
    }

    /// Whether the peer has been silent for at least the timeout.
    /// A zero timeout never expires.
    pub fn check_timeout(&self) -> bool {
        let timeout = self.timeout_ms();
        timeout != 0 && self.silence_ms() >= timeout
    }

    /// Whether the silence has crossed the warning threshold.
    pub fn check_warn(&self) -> bool {
        let timeout = self.timeout_ms();
        timeout != 0 && self.silence_ms() >= self.warn_threshold_ms()
    }
}
