//! Retention sweeps over the event store.
//!
//! Two independent triggers, evaluated oldest record first:
//! - age: records whose `start_ts` is older than `retention_days` are deleted;
//! - disk pressure: while free space is under `low_disk_threshold_pct`, the oldest
//!   remaining records are deleted regardless of age.
//!
//! Only records marked complete are candidates, even under disk pressure. Delete
//! failures are logged and skipped; the next sweep retries them. Running a sweep
//! twice with no new writes deletes nothing the second time.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::store::{EventStore, RecordEntry};

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub low_disk_threshold_pct: f64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            low_disk_threshold_pct: 5.0,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(anyhow!("retention_days must be greater than zero"));
        }
        if !(self.low_disk_threshold_pct > 0.0 && self.low_disk_threshold_pct < 100.0) {
            return Err(anyhow!(
                "low_disk_threshold_pct must be within (0, 100) (got {})",
                self.low_disk_threshold_pct
            ));
        }
        Ok(())
    }

    /// Records that started before this instant are past retention.
    pub fn cutoff_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.retention_days as u64 * DAY_MS)
    }
}

/// Free-space probe for the filesystem holding the event store.
pub trait DiskProbe: Send {
    /// Free space as a percentage (0..=100) of the filesystem containing `path`.
    fn free_percent(&self, path: &Path) -> Result<f64>;
}

/// `statvfs(2)`-backed probe, counting space available to unprivileged users.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    #[cfg(unix)]
    fn free_percent(&self, path: &Path) -> Result<f64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let probe_path = existing_ancestor(path);
        let c_path = CString::new(probe_path.as_os_str().as_bytes())
            .map_err(|_| anyhow!("path contains NUL: {}", probe_path.display()))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(anyhow!(
                "statvfs({}) failed: {}",
                probe_path.display(),
                std::io::Error::last_os_error()
            ));
        }
        let frsize = stat.f_frsize as f64;
        let total = stat.f_blocks as f64 * frsize;
        if total <= 0.0 {
            return Err(anyhow!("statvfs({}) reported zero size", probe_path.display()));
        }
        let available = stat.f_bavail as f64 * frsize;
        Ok(available / total * 100.0)
    }

    #[cfg(not(unix))]
    fn free_percent(&self, path: &Path) -> Result<f64> {
        Err(anyhow!(
            "free space probing is not supported on this platform ({})",
            path.display()
        ))
    }
}

#[cfg(unix)]
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub age_deleted: usize,
    pub pressure_deleted: usize,
    pub failed: usize,
    pub in_flight_skipped: usize,
    pub remaining: usize,
}

impl SweepReport {
    pub fn deleted(&self) -> usize {
        self.age_deleted + self.pressure_deleted
    }
}

pub struct RetentionManager {
    base_dir: PathBuf,
    policy: RetentionPolicy,
    store: Box<dyn EventStore>,
    disk: Box<dyn DiskProbe>,
}

impl RetentionManager {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        policy: RetentionPolicy,
        store: Box<dyn EventStore>,
        disk: Box<dyn DiskProbe>,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            base_dir: base_dir.into(),
            policy,
            store,
            disk,
        })
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn sweep(&mut self) -> SweepReport {
        self.sweep_at(crate::now_ms())
    }

    /// Complete records past retention at `now_ms`, oldest first. Deletes nothing.
    pub fn plan_at(&self, now_ms: u64) -> Result<Vec<RecordEntry>> {
        let cutoff = self.policy.cutoff_ms(now_ms);
        let mut entries: Vec<RecordEntry> = self
            .store
            .list()?
            .into_iter()
            .filter(|e| e.complete && e.start_ts < cutoff)
            .collect();
        sort_oldest_first(&mut entries);
        Ok(entries)
    }

    pub fn sweep_at(&mut self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let entries = match self.store.list() {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("retention: cannot enumerate event store: {:#}", e);
                return report;
            }
        };

        let (mut complete, in_flight): (Vec<RecordEntry>, Vec<RecordEntry>) =
            entries.into_iter().partition(|e| e.complete);
        report.in_flight_skipped = in_flight.len();
        sort_oldest_first(&mut complete);

        let cutoff = self.policy.cutoff_ms(now_ms);
        let mut remaining = VecDeque::with_capacity(complete.len());
        for entry in complete {
            if entry.start_ts >= cutoff {
                remaining.push_back(entry);
                continue;
            }
            match self.store.delete(&entry) {
                Ok(()) => {
                    report.age_deleted += 1;
                    log::info!(
                        "retention: deleted {} (older than {} days)",
                        entry.event_id,
                        self.policy.retention_days
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!("retention: failed to delete {}: {:#}", entry.event_id, e);
                }
            }
        }

        loop {
            let free = match self.disk.free_percent(&self.base_dir) {
                Ok(free) => free,
                Err(e) => {
                    log::warn!("retention: disk probe failed, skipping low-disk eviction: {:#}", e);
                    break;
                }
            };
            if free >= self.policy.low_disk_threshold_pct {
                break;
            }
            let Some(entry) = remaining.pop_front() else {
                log::warn!(
                    "retention: free space {:.1}% below {:.1}% but no deletable records remain",
                    free,
                    self.policy.low_disk_threshold_pct
                );
                break;
            };
            match self.store.delete(&entry) {
                Ok(()) => {
                    report.pressure_deleted += 1;
                    log::warn!(
                        "retention: low disk ({:.1}% free), deleted {}",
                        free,
                        entry.event_id
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!("retention: failed to delete {}: {:#}", entry.event_id, e);
                }
            }
        }

        report.remaining = remaining.len();
        if report.deleted() > 0 || report.failed > 0 {
            log::info!(
                "retention sweep: age={} pressure={} failed={} in_flight={} remaining={}",
                report.age_deleted,
                report.pressure_deleted,
                report.failed,
                report.in_flight_skipped,
                report.remaining
            );
        }
        report
    }

    /// Run sweeps every `interval` on a background thread.
    pub fn spawn(mut self, interval: Duration) -> Result<RetentionHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("retention".into())
            .spawn(move || {
                while !shutdown_thread.load(Ordering::SeqCst) {
                    self.sweep();
                    sleep_until_shutdown(&shutdown_thread, interval);
                }
            })?;
        Ok(RetentionHandle {
            shutdown,
            join: Some(join),
        })
    }
}

fn sort_oldest_first(entries: &mut [RecordEntry]) {
    entries.sort_by(|a, b| {
        a.start_ts
            .cmp(&b.start_ts)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}

fn sleep_until_shutdown(shutdown: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < total && !shutdown.load(Ordering::SeqCst) {
        let nap = step.min(total - waited);
        std::thread::sleep(nap);
        waited += nap;
    }
}

pub struct RetentionHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RetentionHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("retention thread panicked"))?;
        }
        Ok(())
    }
}
