//! External decoder process channel
//!
//! Spawns the decoder as a child process with piped stdin/stdout and exposes
//! the two pipe ends as plain byte streams. Frame logic never sees the
//! process or its handles, only [`ChannelWriter`] and [`ChannelReader`].

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use crate::error::{StreamError, StreamResult};
use crate::settings::DecoderSettings;
use crate::video::FrameLayout;

/// A fully resolved decoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderCommand {
    program: OsString,
    args: Vec<OsString>,
    inherit_stderr: bool,
}

impl DecoderCommand {
    /// Run a program directly with the given arguments
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            inherit_stderr: false,
        }
    }

    /// Run a command line through the platform shell
    pub fn shell(command_line: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd", ["/C", command_line])
        } else {
            Self::new("/bin/sh", ["-c", command_line])
        }
    }

    pub fn with_inherited_stderr(mut self, inherit: bool) -> Self {
        self.inherit_stderr = inherit;
        self
    }

    /// Resolve the invocation for a session from settings.
    ///
    /// An explicit command line wins; otherwise ffmpeg is asked to decode
    /// stdin and emit raw frames of exactly the session's layout on stdout.
    pub fn from_settings(settings: &DecoderSettings, layout: &FrameLayout) -> Self {
        let command = match &settings.command_line {
            Some(line) => Self::shell(line),
            None => {
                let ffmpeg = settings
                    .ffmpeg_path
                    .as_ref()
                    .map(PathBuf::from)
                    .or_else(find_ffmpeg)
                    .unwrap_or_else(|| PathBuf::from("ffmpeg"));
                Self::new(ffmpeg, ffmpeg_args(settings, layout))
            }
        };
        command.with_inherited_stderr(settings.inherit_stderr)
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl std::fmt::Display for DecoderCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Build the ffmpeg argv for decoding stdin into raw frames on stdout
fn ffmpeg_args(settings: &DecoderSettings, layout: &FrameLayout) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-probesize".into(),
        "4K".into(),
    ];

    if let Some(hwaccel) = &settings.hwaccel {
        args.extend(["-hwaccel".into(), hwaccel.clone()]);
        if let Some(device) = &settings.hwaccel_device {
            args.extend(["-hwaccel_device".into(), device.clone()]);
        }
    }

    args.extend([
        "-f".into(),
        settings.input_format.clone(),
        "-i".into(),
        "pipe:0".into(),
        "-an".into(),
    ]);
    args.extend(settings.extra_args.iter().cloned());
    args.extend([
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        layout.format.ffmpeg_name().into(),
        "-s".into(),
        format!("{}x{}", layout.width, layout.height),
        "pipe:1".into(),
    ]);
    args
}

/// Find the ffmpeg binary on PATH or in common install locations
fn find_ffmpeg() -> Option<PathBuf> {
    if let Ok(path) = which::which("ffmpeg") {
        return Some(path);
    }

    let common_paths: &[&str] = if cfg!(target_os = "macos") {
        &["/usr/local/bin/ffmpeg", "/opt/homebrew/bin/ffmpeg"]
    } else if cfg!(target_os = "windows") {
        &["C:\\ffmpeg\\bin\\ffmpeg.exe", "C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe"]
    } else {
        &["/usr/bin/ffmpeg", "/usr/local/bin/ffmpeg"]
    };

    common_paths.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Write end of the channel (decoder stdin)
pub struct ChannelWriter {
    stdin: ChildStdin,
}

impl ChannelWriter {
    /// Write all of `bytes`, blocking on pipe back-pressure.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stdin.write_all(bytes)?;
        self.stdin.flush()
    }
}

/// Read end of the channel (decoder stdout)
///
/// A read returning 0 means the decoder closed its output.
pub struct ChannelReader {
    stdout: ChildStdout,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

/// A running decoder process and its pipe ends
pub struct ProcessChannel {
    child: Child,
    input: Option<ChannelWriter>,
    output: Option<ChannelReader>,
}

impl ProcessChannel {
    /// Spawn the decoder with piped stdin/stdout.
    pub fn open(command: &DecoderCommand) -> StreamResult<Self> {
        let stderr = if command.inherit_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .map_err(StreamError::SpawnFailed)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StreamError::SpawnFailed(io::Error::other(
                "decoder pipes were not created",
            )));
        };

        tracing::debug!("Spawned decoder pid {}: {}", child.id(), command);

        Ok(Self {
            child,
            input: Some(ChannelWriter { stdin }),
            output: Some(ChannelReader { stdout }),
        })
    }

    /// Process id of the decoder
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Write to the decoder's input if it is still open
    pub fn write(&mut self, bytes: &[u8]) -> StreamResult<()> {
        let input = self.input.as_mut().ok_or(StreamError::NotInitialized)?;
        input.write(bytes)?;
        Ok(())
    }

    /// Blocking read from the decoder's output; 0 at end of stream
    pub fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize> {
        match self.output.as_mut() {
            Some(output) => Ok(output.read(buf)?),
            None => Ok(0),
        }
    }

    /// Hand the write end to its owner (the feeding side)
    pub fn take_writer(&mut self) -> Option<ChannelWriter> {
        self.input.take()
    }

    /// Hand the read end to its owner (the reassembler thread)
    pub fn take_reader(&mut self) -> Option<ChannelReader> {
        self.output.take()
    }

    /// Close any pipe ends still held here.
    ///
    /// The child is not killed; it is expected to exit once its input closes.
    pub fn close(&mut self) {
        self.input.take();
        self.output.take();
    }

    /// Forcibly terminate the decoder, closing its output.
    pub fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reap the decoder
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.close();
        self.child.wait()
    }
}
