//! GPU texture upload engine
//!
//! Lives on the thread that owns the GPU context. Creates textures, copies
//! frames into them and tells the render surface when a new frame is ready.
//! The raw GPU work is behind [`TextureBackend`] and the render surface
//! behind [`TextureRegistry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_channel::{Receiver, Sender};

use super::{FrameLayout, PendingFrame, StreamTexture};
use crate::error::{StreamError, StreamResult};
use crate::gpu_context::GpuContext;
use crate::telemetry::PipelineStats;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a streamed texture, handed to the remote caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

/// Texture target type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureTarget {
    Texture2D,
}

/// Description of a created texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureHandle {
    pub id: TextureId,
    pub target: TextureTarget,
    pub width: u32,
    pub height: u32,
    pub layout: FrameLayout,
}

/// Raw GPU operations for one kind of texture storage
pub trait TextureBackend {
    type Texture;

    /// Allocate a texture and its staging storage
    fn create_texture(&mut self, layout: FrameLayout) -> StreamResult<Self::Texture>;

    /// Copy one frame (already length-checked) into the texture
    fn write_frame(&mut self, texture: &mut Self::Texture, frame: &[u8]) -> StreamResult<()>;
}

/// Render-surface side: learns about textures and new frames
pub trait TextureRegistry {
    fn register(&mut self, handle: &TextureHandle);
    fn mark_frame_available(&mut self, handle: &TextureHandle);
    fn unregister(&mut self, handle: &TextureHandle);
}

/// Registry that ignores every notification
#[derive(Debug, Default)]
pub struct NullRegistry;

impl TextureRegistry for NullRegistry {
    fn register(&mut self, _handle: &TextureHandle) {}
    fn mark_frame_available(&mut self, _handle: &TextureHandle) {}
    fn unregister(&mut self, _handle: &TextureHandle) {}
}

/// Notification delivered to a renderer through [`ChannelRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureEvent {
    Registered(TextureHandle),
    FrameAvailable(TextureId),
    Unregistered(TextureId),
}

/// Registry that forwards notifications over a channel
pub struct ChannelRegistry {
    sender: Sender<TextureEvent>,
}

impl ChannelRegistry {
    pub fn new() -> (Self, Receiver<TextureEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    fn send(&self, event: TextureEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Texture event receiver gone, dropping {:?}", event);
        }
    }
}

impl TextureRegistry for ChannelRegistry {
    fn register(&mut self, handle: &TextureHandle) {
        self.send(TextureEvent::Registered(*handle));
    }

    fn mark_frame_available(&mut self, handle: &TextureHandle) {
        self.send(TextureEvent::FrameAvailable(handle.id));
    }

    fn unregister(&mut self, handle: &TextureHandle) {
        self.send(TextureEvent::Unregistered(handle.id));
    }
}

/// wgpu-backed storage
pub struct WgpuBackend {
    gpu: Arc<GpuContext>,
}

impl WgpuBackend {
    pub fn new(gpu: Arc<GpuContext>) -> Self {
        Self { gpu }
    }
}

impl TextureBackend for WgpuBackend {
    type Texture = StreamTexture;

    fn create_texture(&mut self, layout: FrameLayout) -> StreamResult<StreamTexture> {
        let limit = self.gpu.device.limits().max_texture_dimension_2d;
        if layout.width > limit || layout.height > limit {
            return Err(StreamError::invalid_argument(format!(
                "{}x{} exceeds the GPU texture limit of {}",
                layout.width, layout.height, limit
            )));
        }
        Ok(StreamTexture::new(&self.gpu.device, layout))
    }

    fn write_frame(&mut self, texture: &mut StreamTexture, frame: &[u8]) -> StreamResult<()> {
        texture.write_frame(&self.gpu.device, &self.gpu.queue, frame)
    }
}

/// Host-memory storage keeping the latest frame; used without a GPU
#[derive(Debug, Default)]
pub struct CpuBackend;

/// Latest frame held by [`CpuBackend`]
#[derive(Debug, Clone, Default)]
pub struct CpuTexture {
    pub pixels: Vec<u8>,
    pub writes: u64,
}

impl TextureBackend for CpuBackend {
    type Texture = CpuTexture;

    fn create_texture(&mut self, layout: FrameLayout) -> StreamResult<CpuTexture> {
        Ok(CpuTexture {
            pixels: vec![0; layout.frame_size()],
            writes: 0,
        })
    }

    fn write_frame(&mut self, texture: &mut CpuTexture, frame: &[u8]) -> StreamResult<()> {
        texture.pixels.copy_from_slice(frame);
        texture.writes += 1;
        Ok(())
    }
}

struct UploadTarget<T> {
    handle: TextureHandle,
    texture: T,
    stats: Arc<PipelineStats>,
}

/// Owns every live texture and performs uploads on the owner thread
pub struct UploadEngine<B: TextureBackend, R: TextureRegistry> {
    backend: B,
    registry: R,
    targets: HashMap<TextureId, UploadTarget<B::Texture>>,
    owner_thread: ThreadId,
}

impl<B: TextureBackend, R: TextureRegistry> UploadEngine<B, R> {
    /// Create an engine bound to the calling thread
    pub fn new(backend: B, registry: R) -> Self {
        Self {
            backend,
            registry,
            targets: HashMap::new(),
            owner_thread: thread::current().id(),
        }
    }

    /// Allocate a texture, register it and announce its initial contents
    pub fn create_texture(
        &mut self,
        layout: FrameLayout,
        stats: Arc<PipelineStats>,
    ) -> StreamResult<TextureHandle> {
        self.assert_owner_thread();
        let texture = self.backend.create_texture(layout)?;
        let handle = TextureHandle {
            id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
            target: TextureTarget::Texture2D,
            width: layout.width,
            height: layout.height,
            layout,
        };

        self.registry.register(&handle);
        self.registry.mark_frame_available(&handle);
        self.targets.insert(
            handle.id,
            UploadTarget {
                handle,
                texture,
                stats,
            },
        );
        tracing::debug!("Registered {} ({}x{})", handle.id, handle.width, handle.height);
        Ok(handle)
    }

    /// Copy one frame into the texture and mark it available.
    ///
    /// Fails without touching the texture unless `frame` is exactly one
    /// frame long.
    pub fn update_texture(&mut self, id: TextureId, frame: &[u8]) -> StreamResult<()> {
        self.assert_owner_thread();
        let target = self.targets.get_mut(&id).ok_or(StreamError::NotInitialized)?;

        if let Err(e) = target.handle.layout.check_len(frame.len()) {
            target.stats.record_upload_failure();
            tracing::error!("Rejected frame for {}: {}", id, e);
            return Err(e);
        }

        if let Err(e) = self.backend.write_frame(&mut target.texture, frame) {
            target.stats.record_upload_failure();
            tracing::error!("Upload to {} failed: {}", id, e);
            return Err(e);
        }

        target.stats.record_uploaded();
        self.registry.mark_frame_available(&target.handle);
        Ok(())
    }

    /// Route a reassembled frame: complete frames are uploaded, the
    /// trailing partial frame is only counted.
    pub fn deliver(&mut self, id: TextureId, frame: PendingFrame) {
        if !frame.complete {
            tracing::debug!(
                "Discarding {}-byte partial frame #{} for {}",
                frame.len(),
                frame.index,
                id
            );
            return;
        }
        if !self.targets.contains_key(&id) {
            tracing::trace!("Frame #{} arrived after {} was released", frame.index, id);
            return;
        }
        tracing::trace!("Uploading frame #{} to {}", frame.index, id);
        // Errors are logged and counted inside update_texture
        let _ = self.update_texture(id, &frame.data);
    }

    /// Drop a texture and its staging storage
    pub fn release_texture(&mut self, id: TextureId) -> bool {
        self.assert_owner_thread();
        match self.targets.remove(&id) {
            Some(target) => {
                self.registry.unregister(&target.handle);
                tracing::debug!("Released {}", id);
                true
            }
            None => false,
        }
    }

    pub fn handle(&self, id: TextureId) -> Option<&TextureHandle> {
        self.targets.get(&id).map(|t| &t.handle)
    }

    /// Backend texture, e.g. for binding its view in a render pass
    pub fn texture(&self, id: TextureId) -> Option<&B::Texture> {
        self.targets.get(&id).map(|t| &t.texture)
    }

    pub fn texture_count(&self) -> usize {
        self.targets.len()
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    fn assert_owner_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner_thread,
            "texture operations must run on the GPU-owning thread"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::PixelFormat;
    use bytes::Bytes;

    #[derive(Default)]
    struct RecordingRegistry {
        events: Vec<TextureEvent>,
    }

    impl TextureRegistry for RecordingRegistry {
        fn register(&mut self, handle: &TextureHandle) {
            self.events.push(TextureEvent::Registered(*handle));
        }
        fn mark_frame_available(&mut self, handle: &TextureHandle) {
            self.events.push(TextureEvent::FrameAvailable(handle.id));
        }
        fn unregister(&mut self, handle: &TextureHandle) {
            self.events.push(TextureEvent::Unregistered(handle.id));
        }
    }

    fn engine() -> (UploadEngine<CpuBackend, RecordingRegistry>, TextureHandle, Arc<PipelineStats>) {
        let mut engine = UploadEngine::new(CpuBackend, RecordingRegistry::default());
        let stats = Arc::new(PipelineStats::new());
        let layout = FrameLayout::new(2, 1, PixelFormat::Rgba8).unwrap();
        let handle = engine.create_texture(layout, Arc::clone(&stats)).unwrap();
        (engine, handle, stats)
    }

    #[test]
    fn test_create_registers_and_marks_once() {
        let (engine, handle, _) = engine();
        assert_eq!(handle.target, TextureTarget::Texture2D);
        assert_eq!((handle.width, handle.height), (2, 1));
        assert_eq!(
            engine.registry().events,
            vec![TextureEvent::Registered(handle), TextureEvent::FrameAvailable(handle.id)]
        );
    }

    #[test]
    fn test_update_copies_and_notifies() {
        let (mut engine, handle, stats) = engine();
        engine.update_texture(handle.id, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let texture = engine.texture(handle.id).unwrap();
        assert_eq!(texture.pixels, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(texture.writes, 1);
        assert_eq!(stats.snapshot().frames_uploaded, 1);
        assert_eq!(engine.registry().events.len(), 3);
    }

    #[test]
    fn test_length_mismatch_fails_without_writing() {
        let (mut engine, handle, stats) = engine();
        for bad in [&[1u8, 2, 3][..], &[0u8; 16][..], &[][..]] {
            let err = engine.update_texture(handle.id, bad).unwrap_err();
            assert!(matches!(err, StreamError::FrameSizeMismatch { expected: 8, .. }));
        }
        assert_eq!(engine.texture(handle.id).unwrap().writes, 0);
        assert_eq!(stats.snapshot().upload_failures, 3);
        // Only the creation notifications
        assert_eq!(engine.registry().events.len(), 2);
    }

    #[test]
    fn test_partial_frames_are_never_uploaded() {
        let (mut engine, handle, _) = engine();
        engine.deliver(
            handle.id,
            PendingFrame {
                data: Bytes::from_static(&[1, 2, 3, 4, 5]),
                index: 0,
                complete: false,
            },
        );
        assert_eq!(engine.texture(handle.id).unwrap().writes, 0);
    }

    #[test]
    fn test_release_is_idempotent_and_late_frames_are_discarded() {
        let (mut engine, handle, stats) = engine();
        assert!(engine.release_texture(handle.id));
        assert!(!engine.release_texture(handle.id));
        assert_eq!(engine.texture_count(), 0);

        engine.deliver(
            handle.id,
            PendingFrame {
                data: Bytes::from_static(&[0; 8]),
                index: 3,
                complete: true,
            },
        );
        assert_eq!(stats.snapshot().frames_uploaded, 0);
        assert!(matches!(
            engine.update_texture(handle.id, &[0; 8]),
            Err(StreamError::NotInitialized)
        ));
        assert_eq!(
            engine.registry().events.last(),
            Some(&TextureEvent::Unregistered(handle.id))
        );
    }

    #[test]
    fn test_channel_registry_forwards_events() {
        let (registry, events) = ChannelRegistry::new();
        let mut engine = UploadEngine::new(CpuBackend, registry);
        let layout = FrameLayout::new(1, 1, PixelFormat::Bgra8).unwrap();
        let handle = engine
            .create_texture(layout, Arc::new(PipelineStats::new()))
            .unwrap();
        engine.update_texture(handle.id, &[9, 9, 9, 9]).unwrap();
        engine.release_texture(handle.id);

        let received: Vec<TextureEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                TextureEvent::Registered(handle),
                TextureEvent::FrameAvailable(handle.id),
                TextureEvent::FrameAvailable(handle.id),
                TextureEvent::Unregistered(handle.id),
            ]
        );
    }
}
