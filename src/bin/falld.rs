//! falld - fall detection daemon
//!
//! Pulls pose frames from a source, detects falls, persists events under the
//! configured base directory and runs retention sweeps in the background.
//! Ctrl-C seals open events and drains the persistence queue before exiting.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use fallwatch::sink::PoseJsonRenderer;
use fallwatch::store::next_event_seq;
use fallwatch::{
    FallwatchConfig, FilesystemSink, FsEventStore, Pipeline, PipelineConfig, PoseSource,
    ReplaySource, RetentionManager, StatvfsProbe, SyntheticScript, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(name = "falld", version, about = "Pose-based fall detection daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "FALLWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Replay recorded pose frames (JSON lines)
    #[arg(long, value_name = "PATH", conflicts_with = "synthetic")]
    replay: Option<PathBuf>,

    /// Release frames at the pace of their timestamps
    #[arg(long)]
    realtime: bool,

    /// Scripted synthetic source, e.g. "upright:3000,lying:4000,upright:3000"
    #[arg(long, value_name = "SCRIPT", num_args = 0..=1, default_missing_value = "demo")]
    synthetic: Option<String>,

    /// Do not run background retention sweeps
    #[arg(long)]
    no_retention: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => FallwatchConfig::from_path(path)?,
        None => FallwatchConfig::load()?,
    };
    log::info!(
        "falld {} starting: camera={} base_dir={}",
        env!("CARGO_PKG_VERSION"),
        cfg.camera.camera_id,
        cfg.storage.base_dir.display()
    );
    std::fs::create_dir_all(&cfg.storage.base_dir).map_err(|e| {
        anyhow!(
            "cannot create base dir {}: {}",
            cfg.storage.base_dir.display(),
            e
        )
    })?;

    let source = open_source(&args, &cfg)?;
    let sink = FilesystemSink::with_renderer(
        cfg.sink_settings(),
        PoseJsonRenderer {
            min_keypoint_confidence: cfg.detection.min_keypoint_confidence,
        },
    );
    let retention = if args.no_retention {
        None
    } else {
        Some(RetentionManager::new(
            cfg.storage.base_dir.clone(),
            cfg.retention_policy(),
            Box::new(FsEventStore::new(cfg.storage.base_dir.clone())),
            Box::new(StatvfsProbe),
        )?)
    };

    let mut pipeline_cfg = PipelineConfig::from_config(&cfg);
    pipeline_cfg.first_event_seq = next_event_seq(
        &FsEventStore::new(cfg.storage.base_dir.clone()),
        &cfg.camera.camera_id,
    )?;
    if pipeline_cfg.first_event_seq > 1 {
        log::info!(
            "continuing event numbering at {} for camera {}",
            pipeline_cfg.first_event_seq,
            cfg.camera.camera_id
        );
    }

    let handle = Pipeline::start(
        pipeline_cfg,
        source,
        Box::new(sink),
        retention,
    )?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let stats = loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, draining events...");
                break handle.stop()?;
            }
            Err(RecvTimeoutError::Timeout) => {
                if handle.source_finished() {
                    log::info!("pose source finished, draining events...");
                    break handle.wait()?;
                }
            }
        }
    };

    log::info!(
        "falld exiting: frames={} falls={} persisted={} failed={} dropped={} abandoned={}",
        stats.frames,
        stats.events.opened,
        stats.persisted,
        stats.failed,
        stats.queue.dropped,
        stats.abandoned
    );
    Ok(())
}

fn open_source(args: &Args, cfg: &FallwatchConfig) -> Result<Box<dyn PoseSource>> {
    if let Some(path) = &args.replay {
        let source = ReplaySource::open(path, args.realtime)?.rebase_relative(fallwatch::now_ms());
        return Ok(Box::new(source));
    }
    if let Some(script) = &args.synthetic {
        let start = fallwatch::now_ms();
        let script = if script == "demo" {
            SyntheticScript::demo(start)
        } else {
            SyntheticScript::new(
                cfg.camera.fps,
                start,
                SyntheticScript::parse_segments(script)?,
            )
        };
        let source = SyntheticSource::new(script)?;
        log::info!("synthetic source: {} ms scripted", source.duration_ms());
        let source = if args.realtime { source.realtime() } else { source };
        return Ok(Box::new(source));
    }
    Err(anyhow!(
        "no pose source configured: pass --replay <PATH> or --synthetic [SCRIPT]"
    ))
}
