//! Decode session lifecycle
//!
//! A [`Session`] ties one decoder process, its reassembler thread and one
//! texture together. The [`SessionManager`] lives on the GPU-owning thread,
//! owns the upload engine and the dispatcher queue, and is the only place
//! sessions are started and stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::decoder::{
    ChannelWriter, DecoderCommand, ProcessChannel, ReassemblerConfig, ReassemblerHandle,
    ReassemblyReport,
};
use crate::dispatch::Dispatcher;
use crate::error::{StreamError, StreamResult};
use crate::settings::StreamSettings;
use crate::telemetry::{PipelineStats, StatsSnapshot};
use crate::video::{
    FrameLayout, PendingFrame, TextureBackend, TextureHandle, TextureId, TextureRegistry,
    UploadEngine,
};

/// Validated parameters for starting a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartParams {
    pub width: u32,
    pub height: u32,
    /// Codec configuration (e.g. parameter sets) written ahead of any fed data
    pub codec_config: Vec<Bytes>,
}

impl StartParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            codec_config: Vec::new(),
        }
    }

    pub fn with_codec_config(mut self, blob: impl Into<Bytes>) -> Self {
        self.codec_config.push(blob.into());
        self
    }
}

/// Start call as received from the remote call layer
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codec_config: Vec<Bytes>,
}

impl StartRequest {
    pub fn validate(self) -> StreamResult<StartParams> {
        let (Some(width), Some(height)) = (self.width, self.height) else {
            return Err(StreamError::invalid_argument("Missing width or height parameter"));
        };
        Ok(StartParams {
            width,
            height,
            codec_config: self.codec_config,
        })
    }
}

/// Feed call as received from the remote call layer
#[derive(Debug, Clone, Default)]
pub struct FeedRequest {
    pub payload: Option<Bytes>,
}

impl FeedRequest {
    pub fn validate(self) -> StreamResult<Bytes> {
        self.payload
            .ok_or_else(|| StreamError::invalid_argument("Missing frame parameter"))
    }
}

/// Cloneable handle for writing compressed input into a session.
///
/// Feeding may block on pipe back-pressure, so it belongs on a thread
/// other than the one delivering frames.
#[derive(Clone)]
pub struct FeedHandle {
    id: TextureId,
    writer: Arc<Mutex<Option<ChannelWriter>>>,
    stats: Arc<PipelineStats>,
}

impl FeedHandle {
    /// Forward bytes to the decoder. Empty input is a successful no-op.
    pub fn feed(&self, bytes: &[u8]) -> StreamResult<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StreamError::NotInitialized)?;
        if bytes.is_empty() {
            return Ok(());
        }

        if let Err(e) = writer.write(bytes) {
            tracing::warn!("Decoder input for {} failed, closing it: {}", self.id, e);
            guard.take();
            return Err(StreamError::Channel(e));
        }
        self.stats.record_fed(bytes.len());
        Ok(())
    }

    /// Signal end of compressed input; the decoder drains and exits
    pub fn close_input(&self) -> bool {
        let closed = self.writer.lock().take().is_some();
        if closed {
            tracing::debug!("Closed decoder input for {}", self.id);
        }
        closed
    }

    /// Close input unless a feed has held the writer for longer than `timeout`
    fn try_close_input(&self, timeout: Duration) -> bool {
        match self.writer.try_lock_for(timeout) {
            Some(mut guard) => {
                guard.take();
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.lock().is_some()
    }
}

/// One active decode: process, reassembler thread and bound texture
pub struct Session {
    handle: TextureHandle,
    channel: ProcessChannel,
    feeder: FeedHandle,
    reassembler: ReassemblerHandle,
    stats: Arc<PipelineStats>,
    shutdown_grace: Duration,
    stopped: bool,
}

impl Session {
    /// Spawn the decoder, start reassembly into `sink` and write the codec preamble.
    ///
    /// On any failure the decoder is terminated and nothing is left running.
    pub fn open<F>(
        handle: TextureHandle,
        command: &DecoderCommand,
        config: ReassemblerConfig,
        codec_config: &[Bytes],
        stats: Arc<PipelineStats>,
        shutdown_grace: Duration,
        sink: F,
    ) -> StreamResult<Self>
    where
        F: FnMut(PendingFrame) + Send + 'static,
    {
        let mut channel = ProcessChannel::open(command)?;
        let (Some(writer), Some(reader)) = (channel.take_writer(), channel.take_reader()) else {
            abandon(&mut channel);
            return Err(StreamError::SpawnFailed(std::io::Error::other(
                "decoder pipes already taken",
            )));
        };

        let reassembler = match ReassemblerHandle::spawn(reader, config, Arc::clone(&stats), sink) {
            Ok(r) => r,
            Err(e) => {
                abandon(&mut channel);
                return Err(StreamError::SpawnFailed(e));
            }
        };

        let feeder = FeedHandle {
            id: handle.id,
            writer: Arc::new(Mutex::new(Some(writer))),
            stats: Arc::clone(&stats),
        };

        let mut session = Self {
            handle,
            channel,
            feeder,
            reassembler,
            stats,
            shutdown_grace,
            stopped: false,
        };

        for blob in codec_config {
            if let Err(e) = session.feeder.feed(blob) {
                tracing::error!("Failed to write codec configuration: {}", e);
                session.stop();
                return Err(e);
            }
        }

        Ok(session)
    }

    pub fn handle(&self) -> &TextureHandle {
        &self.handle
    }

    pub fn feeder(&self) -> FeedHandle {
        self.feeder.clone()
    }

    pub fn feed(&self, bytes: &[u8]) -> StreamResult<()> {
        if self.stopped {
            return Err(StreamError::NotInitialized);
        }
        self.feeder.feed(bytes)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The reassembler has exited and every frame it cut has been posted
    pub fn is_finished(&self) -> bool {
        self.reassembler.is_finished()
    }

    /// Stop reading, close the decoder's pipes, join the thread and reap the
    /// process. Safe to call more than once.
    pub fn stop(&mut self) -> Option<ReassemblyReport> {
        if self.stopped {
            return None;
        }
        self.stopped = true;

        self.reassembler.cancel();
        let input_closed = self.feeder.try_close_input(self.shutdown_grace);
        let finished = self.reassembler.wait_finished(self.shutdown_grace);

        if !finished || !input_closed {
            tracing::warn!(
                "Decoder for {} did not shut down within {:?}, killing pid {}",
                self.handle.id,
                self.shutdown_grace,
                self.channel.id()
            );
            if let Err(e) = self.channel.kill() {
                tracing::warn!("Failed to kill decoder: {}", e);
            }
        }
        if !input_closed {
            // The blocked write fails now that the decoder is gone
            self.feeder.close_input();
        }

        let report = self.reassembler.join();

        match self.channel.wait() {
            Ok(status) => tracing::debug!("Decoder for {} exited: {}", self.handle.id, status),
            Err(e) => tracing::warn!("Failed to reap decoder for {}: {}", self.handle.id, e),
        }

        report
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Kill and reap a decoder that never became a session
fn abandon(channel: &mut ProcessChannel) {
    let _ = channel.kill();
    let _ = channel.wait();
}

/// Outcome of stopping a session
#[derive(Debug, Clone, Copy)]
pub struct SessionSummary {
    pub handle: TextureHandle,
    /// `None` if the reassembler thread could not be joined
    pub report: Option<ReassemblyReport>,
    pub stats: StatsSnapshot,
}

/// Owner-thread entry point for starting, feeding and stopping sessions
pub struct SessionManager<B, R>
where
    B: TextureBackend + 'static,
    R: TextureRegistry + 'static,
{
    settings: StreamSettings,
    engine: UploadEngine<B, R>,
    dispatcher: Dispatcher<UploadEngine<B, R>>,
    sessions: HashMap<TextureId, Session>,
}

impl<B, R> SessionManager<B, R>
where
    B: TextureBackend + 'static,
    R: TextureRegistry + 'static,
{
    /// Create a manager bound to the calling (GPU-owning) thread
    pub fn new(mut settings: StreamSettings, backend: B, registry: R) -> Self {
        settings.clamp_chunk_size();
        Self {
            settings,
            engine: UploadEngine::new(backend, registry),
            dispatcher: Dispatcher::new(),
            sessions: HashMap::new(),
        }
    }

    /// Create the texture, launch the decoder and start frame delivery.
    ///
    /// Either the session is fully running or nothing is left behind.
    pub fn start(&mut self, params: StartParams) -> StreamResult<TextureHandle> {
        let layout = FrameLayout::new(params.width, params.height, self.settings.pixel_format)?;
        let stats = Arc::new(PipelineStats::new());
        let handle = self.engine.create_texture(layout, Arc::clone(&stats))?;
        let id = handle.id;

        let command = DecoderCommand::from_settings(&self.settings.decoder, &layout);
        let config = ReassemblerConfig::for_layout(
            &layout,
            self.settings.read_chunk_size,
            self.settings.backlog_policy,
        );

        let poster = self.dispatcher.poster();
        let sink_stats = Arc::clone(&stats);
        let sink = move |frame: PendingFrame| {
            let posted = poster.post(move |engine: &mut UploadEngine<B, R>| engine.deliver(id, frame));
            if !posted {
                sink_stats.record_dropped();
            }
        };

        let session = match Session::open(
            handle,
            &command,
            config,
            &params.codec_config,
            stats,
            self.settings.shutdown_grace(),
            sink,
        ) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Failed to start session for {}: {}", id, e);
                self.dispatcher.run_pending(&mut self.engine);
                self.engine.release_texture(id);
                return Err(e);
            }
        };

        tracing::info!(
            "Started session {}: {}x{} ({} bytes/frame) via {}",
            id,
            layout.width,
            layout.height,
            layout.frame_size(),
            command
        );
        self.sessions.insert(id, session);
        Ok(handle)
    }

    /// Forward compressed bytes to a session's decoder
    pub fn feed(&self, id: TextureId, bytes: &[u8]) -> StreamResult<()> {
        self.session(id)?.feed(bytes)
    }

    /// Handle for feeding a session from another thread
    pub fn feeder(&self, id: TextureId) -> StreamResult<FeedHandle> {
        Ok(self.session(id)?.feeder())
    }

    /// Run queued frame deliveries; call from the owner thread's event loop
    pub fn pump(&mut self) -> usize {
        self.dispatcher.run_pending(&mut self.engine)
    }

    /// Like [`SessionManager::pump`], waiting up to `timeout` for work
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        self.dispatcher.run_with_timeout(&mut self.engine, timeout)
    }

    pub fn pending_tasks(&self) -> usize {
        self.dispatcher.pending()
    }

    /// Stop a session and release its texture.
    ///
    /// Frames already queued are delivered first. Returns `None` if the
    /// session does not exist (never started or already stopped).
    pub fn stop(&mut self, id: TextureId) -> Option<SessionSummary> {
        let mut session = self.sessions.remove(&id)?;
        let report = session.stop();
        let handle = *session.handle();
        let stats = Arc::clone(&session.stats);
        drop(session);

        // Thread is joined: nothing can post for this texture any more
        self.pump();
        self.engine.release_texture(id);

        let summary = SessionSummary {
            handle,
            report,
            stats: stats.snapshot(),
        };
        tracing::info!(
            "Stopped session {}: {} frames uploaded, {} partial, {} bytes fed",
            id,
            summary.stats.frames_uploaded,
            summary.stats.partial_frames,
            summary.stats.bytes_fed
        );
        Some(summary)
    }

    /// Stop every session
    pub fn stop_all(&mut self) -> Vec<SessionSummary> {
        let ids: Vec<TextureId> = self.sessions.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.stop(id)).collect()
    }

    /// Whether the session's decoder output has ended
    pub fn is_finished(&self, id: TextureId) -> bool {
        self.sessions.get(&id).map_or(true, Session::is_finished)
    }

    pub fn stats(&self, id: TextureId) -> Option<StatsSnapshot> {
        self.sessions.get(&id).map(Session::stats)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn engine(&self) -> &UploadEngine<B, R> {
        &self.engine
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    fn session(&self, id: TextureId) -> StreamResult<&Session> {
        self.sessions.get(&id).ok_or(StreamError::NotInitialized)
    }
}

impl<B, R> Drop for SessionManager<B, R>
where
    B: TextureBackend + 'static,
    R: TextureRegistry + 'static,
{
    fn drop(&mut self) {
        self.stop_all();
    }
}
