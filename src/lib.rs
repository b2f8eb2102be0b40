//! Fallwatch: pose-based fall detection with privacy-aware event persistence.
//!
//! # Architecture
//!
//! Frames flow through one processing thread and one persistence thread:
//!
//! 1. **Detection**: a per-subject state machine (`fsm`) scores each pose frame and
//!    confirms a fall only after the score stays abnormal for a dwell period.
//!    Recovery uses a lower threshold (hysteresis) and its own dwell.
//! 2. **Aggregation**: confirmed falls become `FallEvent`s (`event`) with pre-roll
//!    frames from a bounded history (`history`). One open event per subject.
//! 3. **Hand-off**: sealed events go through a bounded queue (`queue`) that drops
//!    the oldest event rather than block detection.
//! 4. **Persistence**: a `PersistenceSink` (`sink`) writes each event and reports
//!    an ack back to the aggregator.
//! 5. **Retention**: `retention` deletes complete records past their age, and the
//!    oldest ones first while the disk is low on space.
//!
//! # Module Structure
//!
//! - `pose`: keypoints, frames, body-state features, abnormality scoring
//! - `fsm`: per-subject fall state machine
//! - `history`: pre-roll ring buffer
//! - `event`: event aggregation and sealing
//! - `queue`: bounded event queue
//! - `sink`, `store`: persistence and the on-disk record layout
//! - `retention`: age and disk-pressure eviction
//! - `source`: replay and synthetic pose sources
//! - `pipeline`: thread wiring and graceful shutdown
//! - `config`: file + environment configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod event;
pub mod fsm;
pub mod history;
pub mod pipeline;
pub mod pose;
pub mod queue;
pub mod retention;
pub mod sink;
pub mod source;
pub mod store;

pub use config::FallwatchConfig;
pub use event::{
    AggregatorSettings, EventAck, EventAggregator, EventId, FallEvent, SealReason, SealedEvent,
};
pub use fsm::{DetectorSettings, FallCandidate, FallDetector, FallState, FrameVerdict};
pub use history::PoseHistory;
pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle, PipelineStats};
pub use pose::{AbnormalityScorer, BBox, BodyState, Keypoint, KeypointKind, PoseFrame};
pub use queue::{EventQueue, PushOutcome};
pub use retention::{DiskProbe, RetentionManager, RetentionPolicy, StatvfsProbe, SweepReport};
pub use sink::{FilesystemSink, PersistenceSink, PrivacySettings, SinkSettings};
pub use source::{PoseSource, ReplaySource, SyntheticScript, SyntheticSource};
pub use store::{EventRecord, EventStore, FsEventStore, InMemoryEventStore};

/// Identifier of a tracked person within one camera stream.
///
/// Streams without tracking use the default id `"0"`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self("0".to_string())
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Camera ids become directory names and event-id components.
///
/// Allowed: "cam01", "ward-3_bed-2". Disallowed: uppercase, whitespace, slashes,
/// dots, anything longer than 64 characters.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<std::result::Result<regex::Regex, regex::Error>> =
        OnceLock::new();
    let re = CAMERA_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$"))
        .as_ref()
        .map_err(|e| anyhow!("camera id pattern failed to compile: {}", e))?;
    if !re.is_match(camera_id) {
        return Err(anyhow!(
            "camera_id must match ^[a-z0-9_-]{{1,64}}$ (got {:?})",
            camera_id
        ));
    }
    Ok(())
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
