//! Pipeline counters
//!
//! Lock-free counters shared between the feeding side, the reassembler
//! thread and the owner thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one decode session
#[derive(Debug, Default)]
pub struct PipelineStats {
    bytes_fed: AtomicU64,
    bytes_decoded: AtomicU64,
    frames_emitted: AtomicU64,
    partial_frames: AtomicU64,
    frames_uploaded: AtomicU64,
    upload_failures: AtomicU64,
    tasks_dropped: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Compressed bytes written to the decoder
    pub bytes_fed: u64,
    /// Raw bytes read back from the decoder
    pub bytes_decoded: u64,
    /// Complete frames cut by the reassembler
    pub frames_emitted: u64,
    /// Trailing partial frames flushed at end of stream
    pub partial_frames: u64,
    /// Frames copied into the texture
    pub frames_uploaded: u64,
    /// Frames rejected by the upload engine
    pub upload_failures: u64,
    /// Deliveries lost because the owner thread was gone
    pub tasks_dropped: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fed(&self, bytes: usize) {
        self.bytes_fed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, bytes: usize) {
        self.bytes_decoded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, complete: bool) {
        if complete {
            self.frames_emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.partial_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_uploaded(&self) {
        self.frames_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload_failure(&self) {
        self.upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.tasks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_fed: self.bytes_fed.load(Ordering::Relaxed),
            bytes_decoded: self.bytes_decoded.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            partial_frames: self.partial_frames.load(Ordering::Relaxed),
            frames_uploaded: self.frames_uploaded.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            tasks_dropped: self.tasks_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.record_fed(100);
        stats.record_fed(28);
        stats.record_decoded(16);
        stats.record_emitted(true);
        stats.record_emitted(true);
        stats.record_emitted(false);
        stats.record_uploaded();
        stats.record_upload_failure();
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_fed, 128);
        assert_eq!(snap.bytes_decoded, 16);
        assert_eq!(snap.frames_emitted, 2);
        assert_eq!(snap.partial_frames, 1);
        assert_eq!(snap.frames_uploaded, 1);
        assert_eq!(snap.upload_failures, 1);
        assert_eq!(snap.tasks_dropped, 1);
    }
}
