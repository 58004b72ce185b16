//! Frame representation, GPU texture and upload engine
//!
//! Raw frames arrive as tightly packed pixel bytes in the layout negotiated
//! with the decoder and are copied into a wgpu texture through staging
//! buffers on the GPU-owning thread.

mod frame;
mod texture;
mod upload;

pub use frame::{FrameLayout, PendingFrame, PixelFormat};
pub use texture::StreamTexture;
pub use upload::{
    ChannelRegistry, CpuBackend, CpuTexture, NullRegistry, TextureBackend, TextureEvent,
    TextureHandle, TextureId, TextureRegistry, TextureTarget, UploadEngine, WgpuBackend,
};
