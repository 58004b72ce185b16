//! Stream Texture - command line driver
//!
//! Usage: stream-texture <input> <width> <height> [settings.xml]
//!
//! Feeds a compressed elementary stream to the configured decoder, uploads
//! every decoded frame into a texture and reports the pipeline counters.
//! Falls back to host-memory textures when no GPU adapter is available.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stream_texture::telemetry::{init_logging, LogConfig};
use stream_texture::{
    ChannelRegistry, CpuBackend, FeedHandle, GpuContext, SessionManager, StartParams, StreamSettings,
    TextureBackend, TextureEvent, WgpuBackend,
};

const FEED_CHUNK_SIZE: usize = 64 * 1024;

struct Args {
    input: PathBuf,
    width: u32,
    height: u32,
    settings: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("stream-texture");
    if args.len() < 4 {
        return Err(format!("Usage: {} <input> <width> <height> [settings.xml]", program));
    }

    let width = args[2]
        .parse()
        .map_err(|e| format!("Invalid width '{}': {}", args[2], e))?;
    let height = args[3]
        .parse()
        .map_err(|e| format!("Invalid height '{}': {}", args[3], e))?;

    Ok(Args {
        input: PathBuf::from(&args[1]),
        width,
        height,
        settings: args.get(4).map(PathBuf::from),
    })
}

/// Stream the input file into the decoder, then close its input
fn spawn_feeder(path: &Path, feeder: FeedHandle) -> std::io::Result<thread::JoinHandle<u64>> {
    let mut file = File::open(path)?;
    thread::Builder::new()
        .name("stream-feeder".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; FEED_CHUNK_SIZE];
            let mut total = 0u64;
            loop {
                let n = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::error!("Failed to read input: {}", e);
                        break;
                    }
                };
                if let Err(e) = feeder.feed(&buf[..n]) {
                    tracing::error!("Decoder rejected input: {}", e);
                    break;
                }
                total += n as u64;
            }
            feeder.close_input();
            total
        })
}

fn run<B: TextureBackend + 'static>(args: &Args, settings: StreamSettings, backend: B) -> Result<(), String> {
    let (registry, events) = ChannelRegistry::new();
    let mut manager = SessionManager::new(settings, backend, registry);

    let handle = manager
        .start(StartParams::new(args.width, args.height))
        .map_err(|e| format!("[{}] {}", e.code(), e))?;
    let feeder = manager.feeder(handle.id).map_err(|e| e.to_string())?;
    let producer = match spawn_feeder(&args.input, feeder) {
        Ok(p) => p,
        Err(e) => {
            manager.stop(handle.id);
            return Err(format!("Failed to open {}: {}", args.input.display(), e));
        }
    };

    let mut frames_seen = 0u64;
    while !(manager.is_finished(handle.id) && manager.pending_tasks() == 0) {
        manager.pump_timeout(Duration::from_millis(16));
        for event in events.try_iter() {
            if let TextureEvent::FrameAvailable(_) = event {
                frames_seen += 1;
                if frames_seen % 100 == 0 {
                    tracing::info!("{} frames available", frames_seen);
                }
            }
        }
    }

    let fed = producer.join().unwrap_or(0);
    let summary = manager
        .stop(handle.id)
        .ok_or_else(|| "Session vanished before stop".to_string())?;

    tracing::info!(
        "Done: {} bytes in, {} bytes decoded, {} frames uploaded, {} partial, {} failures",
        fed,
        summary.stats.bytes_decoded,
        summary.stats.frames_uploaded,
        summary.stats.partial_frames,
        summary.stats.upload_failures
    );
    if let Some(report) = summary.report {
        tracing::info!("Decoder output ended: {:?}", report.reason);
    }
    Ok(())
}

fn main() {
    // Keep the guard alive for the program duration
    let _log_guard = match init_logging(&LogConfig::from_env()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            process::exit(1);
        }
    };

    let settings = match &args.settings {
        Some(path) => match StreamSettings::load_from_file(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => StreamSettings::load(),
    };

    let result = match GpuContext::headless_blocking() {
        Ok(gpu) => run(&args, settings, WgpuBackend::new(Arc::new(gpu))),
        Err(e) => {
            tracing::warn!("{}; uploading to host memory instead", e);
            run(&args, settings, CpuBackend)
        }
    };

    if let Err(msg) = result {
        tracing::error!("{}", msg);
        process::exit(1);
    }
}
