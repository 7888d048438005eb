//! live-alert-capture - camera to shared memory publisher
//!
//! This daemon:
//! 1. Opens the log destinations (stderr + <log_dir>/capture.log)
//! 2. Creates or attaches to the named lock and the shared segment
//! 3. Pulls snapshots from the camera, decodes and resizes them
//! 4. Publishes each frame under the lock with an advancing sequence number
//! 5. Unmaps and unlinks the shared objects on Ctrl-C / SIGTERM

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use zeroize::Zeroizing;

use live_alert::{
    logging, CaptureConfig, CaptureExit, CaptureLoop, CaptureOverrides, CaptureStats,
    HikvisionCamera, ImageDecoder, PixelFormat, RelayError, SharedResources, Shutdown,
    SnapshotPreview,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Publish camera snapshots into shared memory for live-alert detectors"
)]
struct Args {
    /// Optional JSON config file.
    #[arg(long, env = "LIVE_ALERT_CONFIG")]
    config: Option<PathBuf>,

    /// Frame width after resizing (default: 640).
    #[arg(long)]
    width: Option<u32>,

    /// Frame height after resizing (default: 480).
    #[arg(long)]
    height: Option<u32>,

    /// Camera IP address or http(s)://host[:port].
    #[arg(long)]
    host: Option<String>,

    /// Camera username.
    #[arg(long)]
    username: Option<String>,

    /// Camera password.
    #[arg(long)]
    password: Option<String>,

    /// ISAPI streaming channel (default: 301).
    #[arg(long)]
    channel: Option<u32>,

    /// Directory for log files (default: ./logs).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Channel order of published pixels: bgr or rgb (default: bgr).
    #[arg(long)]
    pixel_format: Option<PixelFormat>,

    /// Write each published frame to <log_dir>/preview.jpg; type q + Enter to quit.
    #[arg(long, alias = "test")]
    preview: bool,

    /// Unlink leftover shared objects from a previous run before starting.
    #[arg(long)]
    reset_stale: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();
    let cfg = CaptureConfig::load(config_path.as_deref(), overrides(args))?;
    let layout = cfg.layout()?;

    let log_path = logging::init(&cfg.log_dir)?;
    log::info!("{}", "=".repeat(50));
    log::info!("initializing live-alert capture {}", env!("CARGO_PKG_VERSION"));
    log::info!("resolution: {}x{}", layout.width(), layout.height());
    log::info!("frame size: {} bytes", layout.frame_len());
    log::info!("pixel format: {:?}", cfg.pixel_format);
    log::info!("camera host: {} channel {}", cfg.camera.host, cfg.camera.channel);
    log::info!("log file: {}", log_path.display());

    let shutdown = Shutdown::new();
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.request();
    })
    .expect("error setting Ctrl-C handler");

    let mut resources = SharedResources::open(cfg.names.clone(), layout, cfg.reset_stale)
        .map_err(|e| {
            log::error!("shared memory error: {}", e);
            e
        })?
        .with_shutdown(shutdown.clone());

    let exit = run(&cfg, &mut resources, shutdown);
    resources.teardown();

    match exit {
        Ok((CaptureExit::Shutdown, stats)) => {
            log::info!("shutting down gracefully ({:?})", stats);
            Ok(())
        }
        Ok((CaptureExit::PreviewQuit, stats)) => {
            log::info!("preview quit ({:?})", stats);
            Ok(())
        }
        Err(e) => {
            log::error!("fatal error: {:#}", e);
            Err(e)
        }
    }
}

fn run(
    cfg: &CaptureConfig,
    resources: &mut SharedResources,
    shutdown: Shutdown,
) -> Result<(CaptureExit, CaptureStats)> {
    let layout = resources.layout();
    let first_sequence = match resources.resume_sequence() {
        Ok(sequence) => sequence,
        Err(RelayError::Cancelled(_)) => {
            return Ok((CaptureExit::Shutdown, CaptureStats::default()));
        }
        Err(e) => return Err(e.into()),
    };

    log::info!("connecting to camera at {}...", cfg.camera.host);
    let camera = HikvisionCamera::new(&cfg.camera).context("configure camera client")?;
    let decoder = ImageDecoder::new(layout, cfg.pixel_format);

    let mut capture = CaptureLoop::new(camera, decoder, resources, cfg.timing, shutdown)
        .starting_at(first_sequence);
    if cfg.preview {
        let preview = SnapshotPreview::with_stdin_quit(
            cfg.log_dir.join("preview.jpg"),
            layout,
            cfg.pixel_format,
        )?;
        capture = capture.with_preview(Box::new(preview));
    }

    let exit = capture.run()?;
    Ok((exit, capture.stats()))
}

fn overrides(args: Args) -> CaptureOverrides {
    CaptureOverrides {
        width: args.width,
        height: args.height,
        host: args.host,
        username: args.username,
        password: args.password.map(Zeroizing::new),
        channel: args.channel,
        log_dir: args.log_dir,
        pixel_format: args.pixel_format,
        preview: args.preview,
        reset_stale: args.reset_stale,
    }
}
