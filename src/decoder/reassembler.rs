//! Frame reassembly
//!
//! Turns the decoder's unstructured output stream into fixed-size frames.
//! A dedicated thread performs bounded blocking reads, appends them to the
//! frame buffer and hands every cut frame to a sink callback.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};
use crate::telemetry::PipelineStats;
use crate::video::{FrameLayout, PendingFrame};

/// How many complete frames are cut after a single read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BacklogPolicy {
    /// Emit every complete frame present after the read
    #[default]
    DrainAll,
    /// Emit at most one frame per read and carry the rest forward
    OnePerRead,
}

/// Why the reassembly loop exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The decoder closed its output (zero-byte read)
    StreamEnded,
    /// The running flag was cleared
    Cancelled,
    /// A read failed; frames already emitted stay valid
    ReadFailed,
}

/// Summary returned when the reassembler thread finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyReport {
    pub reason: StopReason,
    /// Complete frames emitted
    pub frames: u64,
    /// Whether a trailing partial frame was flushed
    pub flushed_partial: bool,
    /// Total bytes read from the decoder
    pub bytes_read: u64,
}

/// Accumulating frame buffer
///
/// Owned by exactly one thread. Frames are split off the front of the buffer
/// at exact multiples of the frame size; the remainder stays queued.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    frame_size: usize,
    next_index: u64,
}

impl FrameReassembler {
    /// Fails with `InvalidArgument` for a zero frame size
    pub fn new(frame_size: usize) -> StreamResult<Self> {
        if frame_size == 0 {
            return Err(StreamError::invalid_argument("frame size must be non-zero"));
        }
        Ok(Self::with_frame_size(frame_size))
    }

    fn with_frame_size(frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(frame_size),
            frame_size,
            next_index: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Bytes waiting for the next frame boundary
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk of decoder output
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Cut one complete frame off the front of the buffer, if available
    pub fn next_frame(&mut self) -> Option<PendingFrame> {
        if self.buffer.len() < self.frame_size {
            return None;
        }
        let data = self.buffer.split_to(self.frame_size).freeze();
        Some(self.tag(data, true))
    }

    /// Cut frames according to `policy`
    pub fn take_frames(&mut self, policy: BacklogPolicy) -> Vec<PendingFrame> {
        match policy {
            BacklogPolicy::OnePerRead => self.next_frame().into_iter().collect(),
            BacklogPolicy::DrainAll => std::iter::from_fn(|| self.next_frame()).collect(),
        }
    }

    /// End of stream: every remaining complete frame, then the partial remainder once
    pub fn finish(&mut self) -> Vec<PendingFrame> {
        let mut frames = self.take_frames(BacklogPolicy::DrainAll);
        if !self.buffer.is_empty() {
            let data = self.buffer.split().freeze();
            frames.push(self.tag(data, false));
        }
        frames
    }

    fn tag(&mut self, data: bytes::Bytes, complete: bool) -> PendingFrame {
        let index = self.next_index;
        self.next_index += 1;
        PendingFrame {
            data,
            index,
            complete,
        }
    }
}

/// Parameters for one reassembly loop; the frame size is always non-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblerConfig {
    frame_size: usize,
    chunk_size: usize,
    policy: BacklogPolicy,
}

impl ReassemblerConfig {
    pub fn new(frame_size: usize, chunk_size: usize, policy: BacklogPolicy) -> StreamResult<Self> {
        if frame_size == 0 {
            return Err(StreamError::invalid_argument("frame size must be non-zero"));
        }
        Ok(Self {
            frame_size,
            chunk_size: chunk_size.max(1),
            policy,
        })
    }

    /// Frames of a validated layout
    pub fn for_layout(layout: &FrameLayout, chunk_size: usize, policy: BacklogPolicy) -> Self {
        Self {
            frame_size: layout.frame_size(),
            chunk_size: chunk_size.max(1),
            policy,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn policy(&self) -> BacklogPolicy {
        self.policy
    }
}

/// Run the read/accumulate/emit loop until end of stream or cancellation.
///
/// The running flag is checked before every read. Because reads block, a
/// cleared flag only takes effect once the current read returns; closing
/// the source (or killing the decoder) forces that return.
pub fn run_reassembly<R, F>(
    mut source: R,
    config: ReassemblerConfig,
    running: &AtomicBool,
    stats: &PipelineStats,
    mut sink: F,
) -> ReassemblyReport
where
    R: Read,
    F: FnMut(PendingFrame),
{
    let mut reassembler = FrameReassembler::with_frame_size(config.frame_size);
    let mut chunk = vec![0u8; config.chunk_size];
    let mut report = ReassemblyReport {
        reason: StopReason::Cancelled,
        frames: 0,
        flushed_partial: false,
        bytes_read: 0,
    };

    let mut emit = |frame: PendingFrame, report: &mut ReassemblyReport| {
        stats.record_emitted(frame.complete);
        if frame.complete {
            report.frames += 1;
        } else {
            report.flushed_partial = true;
        }
        tracing::trace!(index = frame.index, len = frame.len(), complete = frame.complete, "frame cut");
        sink(frame);
    };

    while running.load(Ordering::Acquire) {
        let read = match source.read(&mut chunk) {
            Ok(0) => {
                report.reason = StopReason::StreamEnded;
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Decoder output read failed: {}", e);
                report.reason = StopReason::ReadFailed;
                break;
            }
        };

        report.bytes_read += read as u64;
        stats.record_decoded(read);
        reassembler.push(&chunk[..read]);

        for frame in reassembler.take_frames(config.policy) {
            emit(frame, &mut report);
        }
    }

    for frame in reassembler.finish() {
        emit(frame, &mut report);
    }

    report
}

/// Handle to a running reassembler thread
pub struct ReassemblerHandle {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<ReassemblyReport>>,
    finished: Receiver<()>,
}

impl ReassemblerHandle {
    /// Start the reassembly loop on its own thread.
    pub fn spawn<R, F>(
        source: R,
        config: ReassemblerConfig,
        stats: Arc<PipelineStats>,
        sink: F,
    ) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
        F: FnMut(PendingFrame) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let (finished_tx, finished_rx) = crossbeam_channel::bounded::<()>(1);

        let thread_handle = thread::Builder::new()
            .name("frame-reassembler".to_string())
            .spawn(move || {
                tracing::debug!("Reassembler started (frame size {} bytes)", config.frame_size);
                let report = run_reassembly(source, config, &running_clone, &stats, sink);
                tracing::debug!(
                    "Reassembler stopped: {:?}, {} frames, partial flushed: {}",
                    report.reason,
                    report.frames,
                    report.flushed_partial
                );
                let _ = finished_tx.send(());
                report
            })?;

        Ok(Self {
            running,
            thread_handle: Some(thread_handle),
            finished: finished_rx,
        })
    }

    /// Ask the loop to stop after its current read
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Wait up to `timeout` for the loop to exit; true if it has
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        if self.is_finished() {
            return true;
        }
        match self.finished.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Join the thread. Returns `None` if it was already joined or panicked.
    pub fn join(&mut self) -> Option<ReassemblyReport> {
        let handle = self.thread_handle.take()?;
        match handle.join() {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Failed to join reassembler thread: {:?}", e);
                None
            }
        }
    }
}

impl Drop for ReassemblerHandle {
    fn drop(&mut self) {
        self.cancel();
        // Detaching is the only option left; the thread exits at its next read
        if self.thread_handle.is_some() && !self.is_finished() {
            tracing::warn!("Reassembler dropped while its read was still blocked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out a stream in fixed, uneven chunk sizes
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        sizes: Vec<usize>,
        turn: usize,
    }

    impl ChunkedReader {
        fn new(data: Vec<u8>, sizes: Vec<usize>) -> Self {
            Self { data, pos: 0, sizes, turn: 0 }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let want = self.sizes[self.turn % self.sizes.len()];
            self.turn += 1;
            let n = want.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn collect(source: impl Read, frame_size: usize, policy: BacklogPolicy) -> (Vec<PendingFrame>, ReassemblyReport) {
        let running = AtomicBool::new(true);
        let stats = PipelineStats::new();
        let mut frames = Vec::new();
        let config = ReassemblerConfig::new(frame_size, 4096, policy).unwrap();
        let report = run_reassembly(source, config, &running, &stats, |f| frames.push(f));
        (frames, report)
    }

    #[test]
    fn test_single_write_two_frames() {
        let data: Vec<u8> = (1..=16).collect();
        let (frames, report) = collect(Cursor::new(data), 8, BacklogPolicy::DrainAll);

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].data[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&frames[1].data[..], &[9, 10, 11, 12, 13, 14, 15, 16]);
        assert!(frames.iter().all(|f| f.complete));
        assert_eq!(report.reason, StopReason::StreamEnded);
        assert!(!report.flushed_partial);
    }

    #[test]
    fn test_partial_flush_at_end() {
        let (frames, report) = collect(Cursor::new(vec![1, 2, 3, 4, 5]), 8, BacklogPolicy::DrainAll);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data[..], &[1, 2, 3, 4, 5]);
        assert!(!frames[0].complete);
        assert!(report.flushed_partial);
        assert_eq!(report.frames, 0);
    }

    #[test]
    fn test_concatenation_preserves_stream_for_any_chunking() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        let chunkings = [vec![1], vec![3, 17, 5], vec![64], vec![999, 1], vec![12, 12, 13]];

        for sizes in chunkings {
            for policy in [BacklogPolicy::DrainAll, BacklogPolicy::OnePerRead] {
                let (frames, _) = collect(ChunkedReader::new(data.clone(), sizes.clone()), 12, policy);
                let joined: Vec<u8> = frames.iter().flat_map(|f| f.data.iter().copied()).collect();
                assert_eq!(joined, data, "chunking {:?} policy {:?}", sizes, policy);

                // Every frame but the last is complete and exactly frame-sized
                let (last, rest) = frames.split_last().unwrap();
                assert!(rest.iter().all(|f| f.complete && f.len() == 12));
                assert_eq!(last.len(), 1000 % 12);
                assert!(!last.complete);

                let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
                assert_eq!(indices, (0..frames.len() as u64).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_same_stream_same_frames() {
        let data: Vec<u8> = (0..=255).collect();
        let (a, _) = collect(ChunkedReader::new(data.clone(), vec![7, 30]), 16, BacklogPolicy::DrainAll);
        let (b, _) = collect(ChunkedReader::new(data, vec![7, 30]), 16, BacklogPolicy::DrainAll);
        assert_eq!(a, b);
    }

    #[test]
    fn test_one_per_read_carries_backlog() {
        let mut reassembler = FrameReassembler::new(4).unwrap();
        reassembler.push(&[0; 12]);
        assert_eq!(reassembler.take_frames(BacklogPolicy::OnePerRead).len(), 1);
        assert_eq!(reassembler.buffered(), 8);
        reassembler.push(&[1; 2]);
        assert_eq!(reassembler.take_frames(BacklogPolicy::OnePerRead).len(), 1);
        assert_eq!(reassembler.buffered(), 6);

        // End of stream drains the backlog before the partial flush
        let tail = reassembler.finish();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].complete);
        assert_eq!(tail[1].len(), 2);
        assert!(!tail[1].complete);
    }

    #[test]
    fn test_drain_all_keeps_buffer_below_frame_size() {
        let mut reassembler = FrameReassembler::new(4).unwrap();
        reassembler.push(&[0; 11]);
        assert_eq!(reassembler.take_frames(BacklogPolicy::DrainAll).len(), 2);
        assert!(reassembler.buffered() < reassembler.frame_size());
    }

    #[test]
    fn test_zero_frame_size_is_rejected() {
        assert!(matches!(FrameReassembler::new(0), Err(StreamError::InvalidArgument(_))));
        let err = ReassemblerConfig::new(0, 4096, BacklogPolicy::DrainAll).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");

        let config = ReassemblerConfig::new(8, 0, BacklogPolicy::OnePerRead).unwrap();
        assert_eq!(config.chunk_size(), 1);
    }

    #[test]
    fn test_layout_config_uses_frame_size() {
        let layout = FrameLayout::new(2, 3, crate::video::PixelFormat::Bgra8).unwrap();
        let config = ReassemblerConfig::for_layout(&layout, 4096, BacklogPolicy::DrainAll);
        assert_eq!(config.frame_size(), 24);
        assert_eq!(config.policy(), BacklogPolicy::DrainAll);
    }

    #[test]
    fn test_cleared_flag_skips_reads() {
        let running = AtomicBool::new(false);
        let stats = PipelineStats::new();
        let config = ReassemblerConfig::new(4, 16, BacklogPolicy::DrainAll).unwrap();
        let mut count = 0;
        let report = run_reassembly(Cursor::new(vec![0u8; 8]), config, &running, &stats, |_| count += 1);
        assert_eq!(report.reason, StopReason::Cancelled);
        assert_eq!(report.bytes_read, 0);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_read_error_stops_loop_and_flushes() {
        struct FailAfter(Option<Vec<u8>>);
        impl Read for FailAfter {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.0.take() {
                    Some(data) => {
                        buf[..data.len()].copy_from_slice(&data);
                        Ok(data.len())
                    }
                    None => Err(std::io::Error::new(ErrorKind::BrokenPipe, "gone")),
                }
            }
        }

        let (frames, report) = collect(FailAfter(Some(vec![9; 6])), 4, BacklogPolicy::DrainAll);
        assert_eq!(report.reason, StopReason::ReadFailed);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].complete);
        assert!(!frames[1].complete);
    }

    #[test]
    fn test_spawned_thread_reports() {
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = ReassemblerConfig::new(8, 4096, BacklogPolicy::DrainAll).unwrap();
        let mut handle = ReassemblerHandle::spawn(
            Cursor::new((1..=20).collect::<Vec<u8>>()),
            config,
            Arc::clone(&stats),
            move |frame| tx.send(frame).unwrap(),
        )
        .unwrap();

        assert!(handle.wait_finished(Duration::from_secs(5)));
        let report = handle.join().unwrap();
        assert_eq!(report.frames, 2);
        assert!(report.flushed_partial);
        assert!(handle.join().is_none());

        let frames: Vec<PendingFrame> = rx.try_iter().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(stats.snapshot().bytes_decoded, 20);
        assert_eq!(stats.snapshot().frames_emitted, 2);
        assert_eq!(stats.snapshot().partial_frames, 1);
    }
}
