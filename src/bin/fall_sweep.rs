//! fall_sweep - one-shot retention sweep over the event store
//!
//! Deletes complete event records older than the retention period, then the
//! oldest remaining records while free disk space is below the threshold.
//! In-flight records (no `complete` flag yet) are never touched.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use fallwatch::retention::DiskProbe;
use fallwatch::{EventStore, FallwatchConfig, FsEventStore, RetentionManager, StatvfsProbe};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "fall_sweep", about = "Apply retention to stored fall events")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "FALLWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Event store root (overrides the configured base_dir)
    #[arg(long, value_name = "PATH")]
    base_dir: Option<PathBuf>,

    /// List records past retention without deleting anything
    #[arg(long)]
    dry_run: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::new(ui::UiMode::parse(&args.ui), is_tty, !stdout_is_tty);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        match &args.config {
            Some(path) => FallwatchConfig::from_path(path)?,
            None => FallwatchConfig::load()?,
        }
    };
    let base_dir = args
        .base_dir
        .clone()
        .unwrap_or_else(|| cfg.storage.base_dir.clone());
    let policy = cfg.retention_policy();

    let store = FsEventStore::new(base_dir.clone());
    {
        let mut stage = ui.stage("Scan event store");
        let entries = store.list()?;
        let in_flight = entries.iter().filter(|e| !e.complete).count();
        let bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
        stage.note(format!(
            "{} records, {} in flight, {} bytes",
            entries.len(),
            in_flight,
            bytes
        ));
    }

    let probe = StatvfsProbe;
    match probe.free_percent(&base_dir) {
        Ok(free) => println!(
            "free space: {:.1}% (threshold {:.1}%)",
            free, policy.low_disk_threshold_pct
        ),
        Err(e) => println!("free space: unknown ({:#})", e),
    }

    let mut manager = RetentionManager::new(
        base_dir.clone(),
        policy,
        Box::new(store),
        Box::new(probe),
    )?;
    let now = fallwatch::now_ms();

    if args.dry_run {
        let plan = {
            let mut stage = ui.stage("Plan age-based deletions");
            let plan = manager.plan_at(now)?;
            stage.note(format!("{} past {} days", plan.len(), policy.retention_days));
            plan
        };
        for entry in &plan {
            println!(
                "would delete {} (started {}) {}",
                entry.event_id,
                format_ts(entry.start_ts),
                entry.location.display()
            );
        }
        return Ok(());
    }

    let report = {
        let mut stage = ui.stage("Sweep");
        let report = manager.sweep_at(now);
        stage.note(format!("{} deleted", report.deleted()));
        report
    };
    println!(
        "deleted {} by age, {} for disk space; {} failed; {} in flight skipped; {} remaining",
        report.age_deleted,
        report.pressure_deleted,
        report.failed,
        report.in_flight_skipped,
        report.remaining
    );
    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn format_ts(ts_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms as i64)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts_ms.to_string())
}
