//! Camera monitoring daemon.
//!
//! Loads configuration, starts the capture pipeline, and runs until
//! interrupted. SIGINT/SIGTERM stop the pipeline cleanly, closing any
//! recording in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use homecam::{CameraState, HomecamConfig, Pipeline, PipelineParts};

#[derive(Parser, Debug)]
#[command(name = "homecamd", about = "Single-camera monitoring daemon")]
struct Args {
    /// Camera device URI (overrides config and HOMECAM_DEVICE).
    #[arg(long)]
    device: Option<String>,

    /// Start a recording immediately and keep it open until shutdown.
    #[arg(long)]
    record: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = HomecamConfig::load()?;
    if let Some(device) = args.device {
        config.device = device;
    }
    info!("starting with device {}", config.device);

    let parts = PipelineParts::defaults(&config);
    let mut pipeline = Pipeline::new(config, parts)?;
    pipeline.start().context("pipeline start")?;

    if args.record {
        let session = pipeline
            .start_recording()
            .context("starting initial recording")?;
        info!("recording to {}", session.path.display());
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if pipeline.camera_state() == CameraState::Stopped {
            break;
        }
    }

    info!("shutting down");
    pipeline.stop();
    Ok(())
}
