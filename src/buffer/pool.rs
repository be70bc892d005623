//! Process-wide segment budget.
//!
//! # Responsibilities
//! - Hold the segment size and the memory ceiling shared by all contexts
//! - Hand out segment reservations without locking
//! - Wake stalled writers when reservations are returned
//!
//! # Design Decisions
//! - The pool never owns memory itself; chains allocate their own segments
//!   and only account for them here
//! - Reservation is a compare-and-swap loop, so the ceiling is never
//!   overshot even under contention

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::BufferConfig;
use crate::observability::metrics;

/// Shared accounting for output segments.
#[derive(Debug)]
pub struct SegmentPool {
    segment_size: usize,
    max_segments: usize,
    live: AtomicUsize,
    capacity_freed: Notify,
}

impl SegmentPool {
    /// Create a pool of `segment_size` segments bounded by `max_memory` bytes.
    /// The ceiling is at least one segment.
    pub fn new(segment_size: usize, max_memory: usize) -> Arc<Self> {
        let segment_size = segment_size.max(1);
        Arc::new(Self {
            segment_size,
            max_segments: (max_memory / segment_size).max(1),
            live: AtomicUsize::new(0),
            capacity_freed: Notify::new(),
        })
    }

    pub fn from_config(config: &BufferConfig) -> Arc<Self> {
        Self::new(config.segment_size, config.max_memory)
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Maximum number of live segments across all chains.
    pub fn ceiling(&self) -> usize {
        self.max_segments
    }

    /// Segments currently reserved by chains.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.max_segments.saturating_sub(self.live())
    }

    /// Reserve one segment. Returns false when the ceiling is reached.
    pub fn try_reserve(&self) -> bool {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            if current >= self.max_segments {
                return false;
            }
            match self.live.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    metrics::record_segments_live(current + 1);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `count` reservations and wake anyone waiting for capacity.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self.live.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(previous >= count, "released more segments than reserved");
        metrics::record_segments_live(previous.saturating_sub(count));
        self.capacity_freed.notify_waiters();
    }

    /// Resolve once at least one segment can be reserved.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.capacity_freed.notified();
            if self.available() > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ceiling_from_memory() {
        let pool = SegmentPool::new(4096, 16 * 4096 + 100);
        assert_eq!(pool.ceiling(), 16);
        let tiny = SegmentPool::new(4096, 10);
        assert_eq!(tiny.ceiling(), 1);
    }

    #[test]
    fn test_reserve_and_release() {
        let pool = SegmentPool::new(16, 32);
        assert!(pool.try_reserve());
        assert!(pool.try_reserve());
        assert!(!pool.try_reserve());
        assert_eq!(pool.live(), 2);
        pool.release(1);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_reserve());
    }

    #[tokio::test]
    async fn test_waiter_woken_on_release() {
        let pool = SegmentPool::new(16, 16);
        assert!(pool.try_reserve());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_for_capacity().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }
}
