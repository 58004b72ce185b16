//! Error types for the frame streaming pipeline

use thiserror::Error;

/// Errors surfaced by session, channel and upload operations.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Pipe or process creation for the decoder failed
    #[error("Failed to spawn decoder process: {0}")]
    SpawnFailed(#[source] std::io::Error),
    /// Operation needs a session that does not exist (never started or already stopped)
    #[error("No active decode session")]
    NotInitialized,
    /// A required parameter was missing or out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// A frame payload does not match the texture's byte size
    #[error("Frame size mismatch: got {actual} bytes, expected {expected}")]
    FrameSizeMismatch { expected: usize, actual: usize },
    /// Writing to or reading from the decoder pipes failed
    #[error("Decoder channel I/O failed: {0}")]
    Channel(#[from] std::io::Error),
    /// The GPU rejected an allocation or upload
    #[error("GPU upload failed: {0}")]
    Gpu(String),
}

impl StreamError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        StreamError::InvalidArgument(msg.into())
    }

    /// Stable category string reported across the remote call boundary.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::SpawnFailed(_) => "SPAWN_FAILED",
            StreamError::NotInitialized => "NOT_INITIALIZED",
            StreamError::InvalidArgument(_) | StreamError::FrameSizeMismatch { .. } => {
                "INVALID_ARGUMENT"
            }
            StreamError::Channel(_) => "CHANNEL_ERROR",
            StreamError::Gpu(_) => "GPU_ERROR",
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
