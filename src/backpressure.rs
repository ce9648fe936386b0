//! Send-buffer depth tracking for cooperative backpressure.
//!
//! The transport link cannot see the kernel's socket buffer, so it keeps
//! its own byte gauge: incremented when a frame is queued, decremented
//! once the frame has been handed to the socket. The relay engines consult
//! the gauge before enqueueing the next frame and yield while it sits
//! above their threshold (1 MiB for TCP/UDP, 4 MiB for HTTP bodies).
//!
//! Pressure is not propagated to the network source beyond yielding;
//! bounded growth is guaranteed by the link's frame-count queue bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::BACKPRESSURE_POLL;

/// Shared byte gauge for one transport link.
///
/// Lock-free; cheap to clone and share across the per-stream tasks.
#[derive(Debug, Clone, Default)]
pub struct BufferGauge {
    bytes: Arc<AtomicUsize>,
}

impl BufferGauge {
    /// Create a gauge at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes entering the send queue.
    #[inline]
    pub fn add(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    /// Record bytes handed to the socket.
    #[inline]
    pub fn sub(&self, n: usize) {
        let prev = self.bytes.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "gauge underflow: {prev} - {n}");
    }

    /// Current depth in bytes.
    #[inline]
    pub fn level(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    /// Check whether the depth is at or above a threshold.
    #[inline]
    pub fn above(&self, limit: usize) -> bool {
        self.level() > limit
    }

    /// Reset to zero (socket replaced; queued bytes were re-counted).
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Release);
    }

    /// Yield until the depth drops to or below `limit`.
    ///
    /// Polls at [`BACKPRESSURE_POLL`] rather than parking on a waker; the
    /// writer task drains continuously so the wait is short-lived.
    pub async fn wait_below(&self, limit: usize) {
        self.wait_below_with(limit, BACKPRESSURE_POLL).await
    }

    /// [`Self::wait_below`] with an explicit poll interval.
    pub async fn wait_below_with(&self, limit: usize, poll: Duration) {
        while self.above(limit) {
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_starts_at_zero() {
        let gauge = BufferGauge::new();
        assert_eq!(gauge.level(), 0);
        assert!(!gauge.above(0));
    }

    #[test]
    fn test_add_sub() {
        let gauge = BufferGauge::new();
        gauge.add(100);
        gauge.add(50);
        assert_eq!(gauge.level(), 150);
        gauge.sub(100);
        assert_eq!(gauge.level(), 50);
    }

    #[test]
    fn test_clone_shares_state() {
        let a = BufferGauge::new();
        let b = a.clone();
        a.add(10);
        assert_eq!(b.level(), 10);
        b.sub(10);
        assert_eq!(a.level(), 0);
    }

    #[test]
    fn test_above_is_strict() {
        let gauge = BufferGauge::new();
        gauge.add(1024);
        assert!(!gauge.above(1024));
        assert!(gauge.above(1023));
    }

    #[test]
    fn test_reset() {
        let gauge = BufferGauge::new();
        gauge.add(4096);
        gauge.reset();
        assert_eq!(gauge.level(), 0);
    }

    #[tokio::test]
    async fn test_wait_below_returns_immediately_under_limit() {
        let gauge = BufferGauge::new();
        gauge.add(10);
        gauge.wait_below(100).await;
    }

    #[tokio::test]
    async fn test_wait_below_wakes_after_drain() {
        let gauge = BufferGauge::new();
        gauge.add(200);

        let drainer = gauge.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drainer.sub(150);
        });

        gauge
            .wait_below_with(100, Duration::from_millis(1))
            .await;
        assert!(gauge.level() <= 100);
    }
}
