use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters shared across the producer/consumer boundary. This and
/// the keyframe-request signal are the only things that cross it; per-frame
/// errors stay inside the worker that saw them.
#[derive(Default)]
pub struct PipelineCounters {
    /// Frames offered to the producer by the capture side.
    pub frames_in: AtomicU64,
    /// Frames rejected at the producer boundary (encode still in flight).
    pub producer_busy_drops: AtomicU64,
    pub encoded: AtomicU64,
    pub encode_errors: AtomicU64,
    pub keyframes_encoded: AtomicU64,
    pub keyframe_requests: AtomicU64,
    /// Publishes whose notification could not be delivered and were
    /// compensated with an immediate release.
    pub notify_failures: AtomicU64,
    /// Notifications released without decoding because the consumer was
    /// still busy with an earlier frame.
    pub consumer_busy_drops: AtomicU64,
    pub decode_errors: AtomicU64,
    pub decoded: AtomicU64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            producer_busy_drops: self.producer_busy_drops.load(Ordering::Relaxed),
            encoded: self.encoded.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            keyframes_encoded: self.keyframes_encoded.load(Ordering::Relaxed),
            keyframe_requests: self.keyframe_requests.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
            consumer_busy_drops: self.consumer_busy_drops.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub frames_in: u64,
    pub producer_busy_drops: u64,
    pub encoded: u64,
    pub encode_errors: u64,
    pub keyframes_encoded: u64,
    pub keyframe_requests: u64,
    pub notify_failures: u64,
    pub consumer_busy_drops: u64,
    pub decode_errors: u64,
    pub decoded: u64,
}
