//! On-disk event store: record schema and enumeration/deletion for retention.
//!
//! Layout: `base_dir/<camera_id>/<YYYY>/<MM>/<DD>/<event_id>/event.json` plus the
//! frame and clip files of that event. The `complete` flag in `event.json` is the
//! only coordination between the writer and the retention sweeper: it is written
//! last (atomically) by the sink, and the sweeper never deletes a record without it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::event::{DecisionSnapshot, EventAck, EventId, SealReason, SealedEvent};
use crate::retention::DiskProbe;
use crate::sink::{PersistenceSink, PrivacySettings};
use crate::SubjectId;

pub const EVENT_FILE: &str = "event.json";

/// Directory depth of event directories below the base dir.
const MAX_WALK_DEPTH: usize = 6;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub app_version: String,
}

/// Persisted form of a sealed event (`event.json`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: EventId,
    pub camera_id: String,
    pub subject_id: SubjectId,
    pub start_ts: u64,
    pub end_ts: Option<u64>,
    pub peak_severity: f32,
    pub frame_paths: Vec<String>,
    pub clip_path: Option<String>,
    pub complete: bool,
    pub sealed_by: SealReason,
    pub frames_truncated: usize,
    pub decision: DecisionSnapshot,
    pub privacy: PrivacySettings,
    pub system: SystemInfo,
}

impl EventRecord {
    pub fn from_sealed(
        sealed: &SealedEvent,
        privacy: PrivacySettings,
        system: SystemInfo,
    ) -> Self {
        let event = &sealed.event;
        Self {
            event_id: event.event_id.clone(),
            camera_id: sealed.camera_id.clone(),
            subject_id: event.subject_id.clone(),
            start_ts: event.start_ts,
            end_ts: event.end_ts,
            peak_severity: event.peak_severity,
            frame_paths: Vec::new(),
            clip_path: event.clip_ref.clone(),
            complete: false,
            sealed_by: sealed.sealed_by,
            frames_truncated: sealed.frames_truncated,
            decision: sealed.decision.clone(),
            privacy,
            system,
        }
    }
}

/// Minimal view of `event.json` the sweeper needs; tolerant of schema additions.
#[derive(Debug, Deserialize)]
struct RecordHeader {
    event_id: EventId,
    start_ts: u64,
    #[serde(default)]
    complete: bool,
}

/// One stored event as seen by the retention manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordEntry {
    pub event_id: EventId,
    pub start_ts: u64,
    pub complete: bool,
    pub location: PathBuf,
    pub size_bytes: u64,
}

pub trait EventStore: Send {
    /// Every record currently stored, in no particular order.
    fn list(&self) -> Result<Vec<RecordEntry>>;

    /// Delete one record and all of its files.
    fn delete(&mut self, entry: &RecordEntry) -> Result<()>;
}

/// First event sequence not yet used by `camera_id` in `store`.
///
/// Lets a restarted daemon (or a second replay into the same base dir) keep
/// minting fresh event ids instead of colliding with stored ones.
pub fn next_event_seq(store: &dyn EventStore, camera_id: &str) -> Result<u64> {
    let last = store
        .list()?
        .iter()
        .filter_map(|entry| entry.event_id.sequence_for(camera_id))
        .max()
        .unwrap_or(0);
    Ok(last + 1)
}

// -------------------- Filesystem store --------------------

pub struct FsEventStore {
    root: PathBuf,
}

impl FsEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(&self, dir: &Path, depth: usize, out: &mut Vec<RecordEntry>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("event store: cannot read {}: {}", dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let meta_path = path.join(EVENT_FILE);
            if meta_path.is_file() {
                match read_header(&meta_path) {
                    Ok(header) => out.push(RecordEntry {
                        event_id: header.event_id,
                        start_ts: header.start_ts,
                        complete: header.complete,
                        size_bytes: dir_size(&path),
                        location: path,
                    }),
                    Err(e) => {
                        log::debug!("event store: skipping {}: {}", path.display(), e);
                    }
                }
            } else if depth + 1 < MAX_WALK_DEPTH {
                self.walk(&path, depth + 1, out);
            }
        }
    }

    fn prune_empty_parents(&self, start: &Path) {
        let mut current = start.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

impl EventStore for FsEventStore {
    fn list(&self) -> Result<Vec<RecordEntry>> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        self.walk(&self.root, 0, &mut out);
        Ok(out)
    }

    fn delete(&mut self, entry: &RecordEntry) -> Result<()> {
        if !entry.location.starts_with(&self.root) || entry.location == self.root {
            return Err(anyhow!(
                "refusing to delete {} outside event store {}",
                entry.location.display(),
                self.root.display()
            ));
        }
        fs::remove_dir_all(&entry.location)
            .with_context(|| format!("failed to delete {}", entry.location.display()))?;
        self.prune_empty_parents(&entry.location);
        Ok(())
    }
}

fn read_header(path: &Path) -> Result<RecordHeader> {
    let raw = fs::read_to_string(path)?;
    let header = serde_json::from_str(&raw)?;
    Ok(header)
}

fn dir_size(dir: &Path) -> u64 {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

// -------------------- In-memory store --------------------

struct MemRecord {
    record: EventRecord,
    size_bytes: u64,
}

#[derive(Default)]
struct MemInner {
    records: BTreeMap<EventId, MemRecord>,
    failing_deletes: HashSet<EventId>,
}

/// Shared in-memory store. Acts as a persistence sink and as an event store, and
/// can simulate a fixed-size disk. Clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<MemInner>>,
}

/// Bytes a persisted record occupies in the simulated disk, per attached frame.
pub const MEM_BYTES_PER_FRAME: u64 = 1_024;

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: EventRecord, size_bytes: u64) {
        self.lock().records.insert(
            record.event_id.clone(),
            MemRecord { record, size_bytes },
        );
    }

    pub fn mark_complete(&self, event_id: &EventId) {
        if let Some(rec) = self.lock().records.get_mut(event_id) {
            rec.record.complete = true;
        }
    }

    /// Make deletes of this record fail, as a permission error would.
    pub fn fail_deletes_for(&self, event_id: &EventId) {
        self.lock().failing_deletes.insert(event_id.clone());
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.lock().records.values().map(|r| r.record.clone()).collect()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.lock().records.contains_key(event_id)
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().records.values().map(|r| r.size_bytes).sum()
    }

    /// A disk of `total_bytes` where `other_bytes` are used by everything else.
    pub fn disk(&self, total_bytes: u64, other_bytes: u64) -> MemoryDisk {
        MemoryDisk {
            store: self.clone(),
            total_bytes,
            other_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventStore for InMemoryEventStore {
    fn list(&self) -> Result<Vec<RecordEntry>> {
        Ok(self
            .lock()
            .records
            .values()
            .map(|r| RecordEntry {
                event_id: r.record.event_id.clone(),
                start_ts: r.record.start_ts,
                complete: r.record.complete,
                location: PathBuf::from(format!("mem://{}", r.record.event_id)),
                size_bytes: r.size_bytes,
            })
            .collect())
    }

    fn delete(&mut self, entry: &RecordEntry) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing_deletes.contains(&entry.event_id) {
            return Err(anyhow!("permission denied: {}", entry.event_id));
        }
        inner
            .records
            .remove(&entry.event_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("record {} not found", entry.event_id))
    }
}

impl PersistenceSink for InMemoryEventStore {
    fn persist(&mut self, sealed: &SealedEvent) -> EventAck {
        let mut record = EventRecord::from_sealed(
            sealed,
            PrivacySettings::default(),
            SystemInfo {
                host: None,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );
        record.frame_paths = sealed
            .frames
            .iter()
            .map(|f| format!("annotated_{}.json", f.ts_ms as i64 - record.start_ts as i64))
            .collect();
        record.complete = true;
        let size = MEM_BYTES_PER_FRAME * sealed.frames.len().max(1) as u64;
        self.insert(record, size);
        EventAck::Persisted {
            event_id: sealed.id().clone(),
            location: format!("mem://{}", sealed.id()),
        }
    }
}

/// Simulated disk whose usage is the in-memory store's total record size.
pub struct MemoryDisk {
    store: InMemoryEventStore,
    total_bytes: u64,
    other_bytes: u64,
}

impl DiskProbe for MemoryDisk {
    fn free_percent(&self, _path: &Path) -> Result<f64> {
        let used = self.other_bytes + self.store.used_bytes();
        let free = self.total_bytes.saturating_sub(used);
        Ok(free as f64 / self.total_bytes.max(1) as f64 * 100.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn write_record(root: &Path, rel: &str, id: &str, start_ts: u64, complete: bool) -> PathBuf {
        let dir = root.join(rel).join(id);
        fs::create_dir_all(&dir).unwrap();
        let json = format!(
            r#"{{"event_id":"{}","start_ts":{},"complete":{},"peak_severity":0.9}}"#,
            id, start_ts, complete
        );
        fs::write(dir.join(EVENT_FILE), json).unwrap();
        fs::write(dir.join("annotated_0.json"), b"{}").unwrap();
        dir
    }

    #[test]
    fn fs_store_lists_nested_records() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        write_record(tmp.path(), "cam01/2024/01/02", "ev_a", 10, true);
        write_record(tmp.path(), "cam01/2024/01/03", "ev_b", 20, false);
        fs::create_dir_all(tmp.path().join("cam01/2024/01/04/ev_partial"))?;

        let store = FsEventStore::new(tmp.path());
        let mut entries = store.list()?;
        entries.sort_by_key(|e| e.start_ts);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_id.as_str(), "ev_a");
        assert!(entries[0].complete);
        assert!(!entries[1].complete);
        assert!(entries[0].size_bytes > 0);
        Ok(())
    }

    #[test]
    fn fs_delete_prunes_empty_parents() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = write_record(tmp.path(), "cam01/2024/01/02", "ev_a", 10, true);
        write_record(tmp.path(), "cam01/2024/02/01", "ev_b", 20, true);
        let mut store = FsEventStore::new(tmp.path());
        let entry = store
            .list()?
            .into_iter()
            .find(|e| e.event_id.as_str() == "ev_a")
            .unwrap();
        store.delete(&entry)?;
        assert!(!dir.exists());
        assert!(!tmp.path().join("cam01/2024/01").exists());
        assert!(tmp.path().join("cam01/2024/02/01/ev_b").exists());
        Ok(())
    }

    #[test]
    fn fs_delete_refuses_paths_outside_root() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let other = tempfile::tempdir()?;
        let mut store = FsEventStore::new(tmp.path());
        let entry = RecordEntry {
            event_id: EventId::from("x"),
            start_ts: 0,
            complete: true,
            location: other.path().to_path_buf(),
            size_bytes: 0,
        };
        assert!(store.delete(&entry).is_err());
        assert!(other.path().exists());
        Ok(())
    }

    #[test]
    fn memory_disk_tracks_record_sizes() {
        let store = InMemoryEventStore::new();
        let disk = store.disk(1_000, 500);
        assert_eq!(disk.free_percent(Path::new("/")).unwrap(), 50.0);
        let mut rec = sample_record("a", 0);
        rec.complete = true;
        store.insert(rec, 250);
        assert_eq!(disk.free_percent(Path::new("/")).unwrap(), 25.0);
    }

    pub(crate) fn sample_record(id: &str, start_ts: u64) -> EventRecord {
        EventRecord {
            event_id: EventId::from(id),
            camera_id: "cam01".into(),
            subject_id: SubjectId::default(),
            start_ts,
            end_ts: Some(start_ts + 1_000),
            peak_severity: 0.8,
            frame_paths: vec![],
            clip_path: None,
            complete: false,
            sealed_by: SealReason::Recovered,
            frames_truncated: 0,
            decision: DecisionSnapshot {
                abnormality_threshold: 0.6,
                recovery_threshold: 0.4,
                suspected_dwell_ms: 500,
                recovery_dwell_ms: 500,
                peak_body: None,
            },
            privacy: PrivacySettings::default(),
            system: SystemInfo {
                host: None,
                app_version: "test".into(),
            },
        }
    }

    #[test]
    fn next_sequence_follows_stored_ids_for_the_camera() -> Result<()> {
        let store = InMemoryEventStore::new();
        assert_eq!(next_event_seq(&store, "cam01")?, 1);
        store.insert(sample_record("20250101T000000Z_cam01_fall_0007", 1_000), 10);
        store.insert(sample_record("20250101T000500Z_cam01_fall_0003", 2_000), 10);
        store.insert(sample_record("20250101T000000Z_cam02_fall_0042", 3_000), 10);
        store.insert(sample_record("manual-import", 4_000), 10);
        assert_eq!(next_event_seq(&store, "cam01")?, 8);
        assert_eq!(next_event_seq(&store, "cam02")?, 43);
        Ok(())
    }
}
