//! Settings management
//!
//! Decoder invocation and pipeline tuning, stored as XML either at an explicit
//! path or in the platform config directory.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::decoder::BacklogPolicy;
use crate::video::PixelFormat;

/// Smallest and largest accepted read chunk sizes
const MIN_READ_CHUNK: usize = 512;
const MAX_READ_CHUNK: usize = 1024 * 1024;

/// How the external decoder is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderSettings {
    /// Full command line run through the platform shell.
    ///
    /// When set, it replaces the generated ffmpeg invocation entirely and must
    /// read compressed input on stdin and write raw frames on stdout.
    #[serde(rename = "commandLine", default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,

    /// Explicit ffmpeg binary (otherwise searched on PATH)
    #[serde(rename = "ffmpegPath", default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,

    /// Demuxer name for the compressed input (ffmpeg `-f`)
    #[serde(rename = "inputFormat", default = "default_input_format")]
    pub input_format: String,

    /// Hardware acceleration method (ffmpeg `-hwaccel`)
    #[serde(rename = "hwaccel", default, skip_serializing_if = "Option::is_none")]
    pub hwaccel: Option<String>,

    /// Hardware acceleration device (ffmpeg `-hwaccel_device`)
    #[serde(rename = "hwaccelDevice", default, skip_serializing_if = "Option::is_none")]
    pub hwaccel_device: Option<String>,

    /// Extra arguments inserted before the output options
    #[serde(rename = "extraArg", default)]
    pub extra_args: Vec<String>,

    /// Pass decoder stderr through to ours instead of discarding it
    #[serde(rename = "inheritStderr", default)]
    pub inherit_stderr: bool,
}

fn default_input_format() -> String {
    "hevc".to_string()
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            command_line: None,
            ffmpeg_path: None,
            input_format: default_input_format(),
            hwaccel: None,
            hwaccel_device: None,
            extra_args: Vec::new(),
            inherit_stderr: false,
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "StreamSettings")]
pub struct StreamSettings {
    /// Decoder process configuration
    #[serde(rename = "decoder", default)]
    pub decoder: DecoderSettings,

    /// Pixel format the decoder emits and the texture stores
    #[serde(rename = "pixelFormat", default)]
    pub pixel_format: PixelFormat,

    /// Bytes requested per blocking read of decoder output
    #[serde(rename = "readChunkSize", default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// How many complete frames are emitted per read
    #[serde(rename = "backlogPolicy", default)]
    pub backlog_policy: BacklogPolicy,

    /// How long `stop` waits for the decoder to drain before killing it
    #[serde(rename = "shutdownGraceMs", default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            decoder: DecoderSettings::default(),
            pixel_format: PixelFormat::default(),
            read_chunk_size: default_read_chunk_size(),
            backlog_policy: BacklogPolicy::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl StreamSettings {
    /// Clamp the read chunk size to a sane range
    pub fn clamp_chunk_size(&mut self) {
        self.read_chunk_size = self.read_chunk_size.clamp(MIN_READ_CHUNK, MAX_READ_CHUNK);
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Load settings from an XML file
    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        let mut settings: Self = from_str(&contents)?;
        settings.clamp_chunk_size();
        Ok(settings)
    }

    /// Save settings to an XML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        let xml = to_string(self)?;
        let formatted = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", xml);
        fs::write(path, formatted)?;
        Ok(())
    }

    /// Default location in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("StreamTexture");
            p.push("settings.xml");
            p
        })
    }

    /// Load from the config directory, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match Self::load_from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Ignoring unreadable settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save to the config directory
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::default_path().ok_or(SettingsError::NoConfigDir)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.save_to_file(&path)
    }
}

/// Settings-related errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML parse error: {0}")]
    XmlParse(#[from] quick_xml::DeError),
    #[error("XML write error: {0}")]
    XmlWrite(#[from] quick_xml::SeError),
    #[error("Could not find config directory")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = StreamSettings::default();
        assert_eq!(settings.read_chunk_size, 4096);
        assert_eq!(settings.pixel_format, PixelFormat::Rgba8);
        assert_eq!(settings.backlog_policy, BacklogPolicy::DrainAll);
        assert_eq!(settings.decoder.input_format, "hevc");
        assert!(settings.decoder.command_line.is_none());
    }

    #[test]
    fn test_chunk_size_clamping() {
        let mut settings = StreamSettings::default();
        settings.read_chunk_size = 1;
        settings.clamp_chunk_size();
        assert_eq!(settings.read_chunk_size, 512);

        settings.read_chunk_size = usize::MAX;
        settings.clamp_chunk_size();
        assert_eq!(settings.read_chunk_size, 1024 * 1024);
    }

    #[test]
    fn test_save_and_load_file() {
        let mut settings = StreamSettings::default();
        settings.decoder.command_line = Some("cat".to_string());
        settings.decoder.hwaccel = Some("drm".to_string());
        settings.backlog_policy = BacklogPolicy::OnePerRead;
        settings.shutdown_grace_ms = 250;

        let path = std::env::temp_dir().join(format!(
            "stream_texture_settings_{}.xml",
            std::process::id()
        ));
        settings.save_to_file(&path).unwrap();
        let loaded = StreamSettings::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.decoder.command_line.as_deref(), Some("cat"));
        assert_eq!(loaded.decoder.hwaccel.as_deref(), Some("drm"));
        assert_eq!(loaded.backlog_policy, BacklogPolicy::OnePerRead);
        assert_eq!(loaded.shutdown_grace_ms, 250);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let xml = "<StreamSettings><readChunkSize>8192</readChunkSize></StreamSettings>";
        let settings: StreamSettings = from_str(xml).unwrap();
        assert_eq!(settings.read_chunk_size, 8192);
        assert_eq!(settings.shutdown_grace_ms, 500);
        assert_eq!(settings.decoder, DecoderSettings::default());
    }
}
