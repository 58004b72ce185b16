//! Stream Texture Library
//!
//! Feeds compressed video to an out-of-process decoder, rebuilds raw frames
//! from its output on a background thread and uploads them into GPU
//! textures on the thread that owns the GPU.

pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod gpu_context;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod video;

pub use decoder::{BacklogPolicy, DecoderCommand, ProcessChannel, ReassemblerHandle, ReassemblyReport, StopReason};
pub use dispatch::{Dispatcher, Poster};
pub use error::{StreamError, StreamResult};
pub use gpu_context::{GpuContext, GpuContextError};
pub use session::{FeedHandle, FeedRequest, Session, SessionManager, SessionSummary, StartParams, StartRequest};
pub use settings::{DecoderSettings, SettingsError, StreamSettings};
pub use video::{
    ChannelRegistry, CpuBackend, FrameLayout, NullRegistry, PendingFrame, PixelFormat, StreamTexture,
    TextureBackend, TextureEvent, TextureHandle, TextureId, TextureRegistry, UploadEngine, WgpuBackend,
};
