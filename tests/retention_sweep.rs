use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use fallwatch::event::DecisionSnapshot;
use fallwatch::source::Posture;
use fallwatch::store::SystemInfo;
use fallwatch::{
    DiskProbe, EventId, EventRecord, EventStore, FallEvent, FilesystemSink, FsEventStore,
    InMemoryEventStore, PersistenceSink, PrivacySettings, RetentionManager, RetentionPolicy,
    SealReason, SealedEvent, SinkSettings,
};

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;
const NOW: u64 = 1_760_000_000_000;

fn sealed(seq: u64, age_days: u64, frames: usize) -> SealedEvent {
    let start_ts = NOW - age_days * DAY_MS;
    SealedEvent {
        event: FallEvent {
            event_id: EventId::new("cam01", seq, start_ts),
            subject_id: Default::default(),
            start_ts,
            end_ts: Some(start_ts + 3_000),
            peak_severity: 0.85,
            frame_refs: vec![],
            clip_ref: None,
        },
        camera_id: "cam01".into(),
        sealed_by: SealReason::Recovered,
        frames: (0..frames as u64)
            .map(|i| Arc::new(Posture::Lying.frame(start_ts + i * 100, None)))
            .collect(),
        frames_truncated: 0,
        decision: DecisionSnapshot {
            abnormality_threshold: 0.6,
            recovery_threshold: 0.4,
            suspected_dwell_ms: 500,
            recovery_dwell_ms: 1_000,
            peak_body: None,
        },
    }
}

fn in_flight(seq: u64, age_days: u64) -> EventRecord {
    EventRecord::from_sealed(
        &sealed(seq, age_days, 1),
        PrivacySettings::default(),
        SystemInfo {
            host: None,
            app_version: "test".into(),
        },
    )
}

struct FixedFree(f64);

impl DiskProbe for FixedFree {
    fn free_percent(&self, _path: &Path) -> Result<f64> {
        Ok(self.0)
    }
}

fn policy(retention_days: u32, low_disk_threshold_pct: f64) -> RetentionPolicy {
    RetentionPolicy {
        retention_days,
        low_disk_threshold_pct,
    }
}

#[test]
fn deletes_only_records_past_retention() -> Result<()> {
    let mut store = InMemoryEventStore::new();
    let recent = sealed(1, 10, 2);
    let old = sealed(2, 40, 2);
    assert!(store.persist(&recent).is_success());
    assert!(store.persist(&old).is_success());

    let mut manager = RetentionManager::new(
        "/var/lib/fallwatch",
        policy(30, 5.0),
        Box::new(store.clone()),
        Box::new(FixedFree(80.0)),
    )?;
    let report = manager.sweep_at(NOW);
    assert_eq!(report.age_deleted, 1);
    assert_eq!(report.pressure_deleted, 0);
    assert!(store.contains(recent.id()));
    assert!(!store.contains(old.id()));

    // Nothing new was written, so a second sweep is a no-op.
    let again = manager.sweep_at(NOW);
    assert_eq!(again.deleted(), 0);
    assert_eq!(again.failed, 0);
    assert_eq!(store.records().len(), 1);
    Ok(())
}

#[test]
fn low_disk_evicts_oldest_first_regardless_of_age() -> Result<()> {
    let mut store = InMemoryEventStore::new();
    // 1 KiB per frame in the simulated disk.
    let events: Vec<SealedEvent> = (1..=4).map(|seq| sealed(seq, 5 - seq, 10)).collect();
    for event in &events {
        assert!(store.persist(event).is_success());
    }
    // 40 KiB used of 50 KiB: 20% free, threshold 50%.
    let disk = store.disk(50 * 1_024, 0);
    let mut manager = RetentionManager::new(
        "/data",
        policy(30, 50.0),
        Box::new(store.clone()),
        Box::new(disk),
    )?;
    let report = manager.sweep_at(NOW);
    assert_eq!(report.age_deleted, 0);
    assert_eq!(report.pressure_deleted, 2);
    // events[0] is 4 days old, events[3] is 1 day old.
    assert!(!store.contains(events[0].id()));
    assert!(!store.contains(events[1].id()));
    assert!(store.contains(events[2].id()));
    assert!(store.contains(events[3].id()));
    Ok(())
}

#[test]
fn in_flight_records_are_never_deleted() -> Result<()> {
    let mut store = InMemoryEventStore::new();
    let writing = in_flight(1, 90);
    let writing_id = writing.event_id.clone();
    store.insert(writing, 4_096);
    assert!(store.persist(&sealed(2, 90, 1)).is_success());

    let disk = store.disk(5_000, 0);
    let mut manager = RetentionManager::new(
        "/data",
        policy(30, 99.0),
        Box::new(store.clone()),
        Box::new(disk),
    )?;
    let report = manager.sweep_at(NOW);
    assert_eq!(report.in_flight_skipped, 1);
    assert_eq!(report.age_deleted, 1);
    assert!(store.contains(&writing_id));

    // Once the writer finishes, the record becomes eligible.
    store.mark_complete(&writing_id);
    let report = manager.sweep_at(NOW);
    assert_eq!(report.age_deleted, 1);
    assert!(!store.contains(&writing_id));
    Ok(())
}

#[test]
fn failed_delete_is_skipped_and_retried_later() -> Result<()> {
    let mut store = InMemoryEventStore::new();
    let stuck = sealed(1, 50, 1);
    let other = sealed(2, 45, 1);
    store.persist(&stuck);
    store.persist(&other);
    store.fail_deletes_for(stuck.id());

    let mut manager = RetentionManager::new(
        "/data",
        policy(30, 5.0),
        Box::new(store.clone()),
        Box::new(FixedFree(90.0)),
    )?;
    let report = manager.sweep_at(NOW);
    assert_eq!(report.failed, 1);
    assert_eq!(report.age_deleted, 1);
    assert!(store.contains(stuck.id()));
    assert!(!store.contains(other.id()));

    let report = manager.sweep_at(NOW);
    assert_eq!(report.failed, 1);
    Ok(())
}

#[test]
fn filesystem_store_sweep_removes_event_directories() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut sink = FilesystemSink::new(SinkSettings {
        base_dir: tmp.path().to_path_buf(),
        save_clip: false,
        privacy: PrivacySettings::default(),
        host: None,
    });
    let recent = sealed(1, 10, 3);
    let old = sealed(2, 40, 3);
    assert!(sink.persist(&recent).is_success());
    assert!(sink.persist(&old).is_success());
    let old_dir = sink.event_dir(&old);

    // A half-written record: event.json without the complete flag.
    let partial = sealed(3, 60, 1);
    let partial_dir = sink.event_dir(&partial);
    std::fs::create_dir_all(&partial_dir)?;
    std::fs::write(
        partial_dir.join("event.json"),
        serde_json::to_vec(&in_flight(3, 60))?,
    )?;

    let store = FsEventStore::new(tmp.path());
    assert_eq!(store.list()?.len(), 3);
    let mut manager = RetentionManager::new(
        tmp.path(),
        policy(30, 5.0),
        Box::new(store),
        Box::new(FixedFree(75.0)),
    )?;
    let plan = manager.plan_at(NOW)?;
    assert_eq!(plan.len(), 1);
    assert_eq!(&plan[0].event_id, old.id());

    let report = manager.sweep_at(NOW);
    assert_eq!(report.age_deleted, 1);
    assert_eq!(report.in_flight_skipped, 1);
    assert!(!old_dir.exists());
    assert!(sink.event_dir(&recent).join("event.json").is_file());
    assert!(partial_dir.exists());
    Ok(())
}
