//! Lock-free stream counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Snapshot of the stream counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Completions accepted into the frame slot.
    pub frames_completed: u64,
    /// Frames claimed by the consumer.
    pub frames_delivered: u64,
    /// Frames replaced in the slot before the consumer saw them.
    pub frames_dropped: u64,
    /// Zero-length or unmapped completions.
    pub completions_rejected: u64,
    /// Buffers returned to the pool for resubmission.
    pub buffers_recycled: u64,
}

/// Updated by the capture callback and the consumer without taking the stream mutex.
#[derive(Default)]
pub(crate) struct Counters {
    inner: CachePadded<Inner>,
}

#[derive(Default)]
struct Inner {
    completed: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    pub fn completed(&self) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_frames_completed_total").increment(1);
    }

    pub fn delivered(&self) {
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_frames_dropped_total").increment(1);
    }

    pub fn rejected(&self) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_frames_rejected_total").increment(1);
    }

    /// `recycled` comes from the buffer pool, which counts under the stream mutex.
    pub fn snapshot(&self, recycled: u64) -> StreamStats {
        StreamStats {
            frames_completed: self.inner.completed.load(Ordering::Relaxed),
            frames_delivered: self.inner.delivered.load(Ordering::Relaxed),
            frames_dropped: self.inner.dropped.load(Ordering::Relaxed),
            completions_rejected: self.inner.rejected.load(Ordering::Relaxed),
            buffers_recycled: recycled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let counters = Counters::default();
        counters.completed();
        counters.completed();
        counters.dropped();
        counters.rejected();
        let stats = counters.snapshot(3);
        assert_eq!(stats.frames_completed, 2);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.completions_rejected, 1);
        assert_eq!(stats.frames_delivered, 0);
        assert_eq!(stats.buffers_recycled, 3);
    }
}
