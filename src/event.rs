//! Fall event aggregation.
//!
//! The aggregator turns per-frame verdicts into `FallEvent`s:
//! - an abnormal candidate opens an event for its subject (or folds into the open one);
//! - every frame of that subject is attached while the event is open;
//! - the recovery candidate seals it, as do timeout, subject loss and shutdown.
//!
//! An event sealed by recovery or timeout keeps collecting the subject's frames for
//! `post_roll_ms` of stream time before it is released. Subject loss and shutdown
//! release immediately.
//!
//! At most one event is open per subject at any time. Released events are returned
//! to the caller, who hands them to the `EventQueue`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsm::{DetectorSettings, FrameDisposition, FrameVerdict};
use crate::history::PoseHistory;
use crate::pose::{BodyState, PoseFrame};
use crate::SubjectId;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// `{YYYYMMDDTHHMMSSZ}_{camera_id}_fall_{seq:04}`
    pub fn new(camera_id: &str, seq: u64, ts_ms: u64) -> Self {
        let stamp = DateTime::<Utc>::from_timestamp_millis(ts_ms as i64)
            .unwrap_or_default()
            .format("%Y%m%dT%H%M%SZ");
        Self(format!("{}_{}_fall_{:04}", stamp, camera_id, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sequence number of an id minted by `new` for `camera_id`.
    pub fn sequence_for(&self, camera_id: &str) -> Option<u64> {
        let (stamp, rest) = self.0.split_once('_')?;
        if stamp.len() != 16 || !stamp.ends_with('Z') {
            return None;
        }
        rest.strip_prefix(camera_id)?
            .strip_prefix("_fall_")?
            .parse()
            .ok()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FallEvent {
    pub event_id: EventId,
    pub subject_id: SubjectId,
    pub start_ts: u64,
    /// None while open.
    pub end_ts: Option<u64>,
    pub peak_severity: f32,
    /// Timestamps of attached frames (pre-roll included).
    pub frame_refs: Vec<u64>,
    pub clip_ref: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SealReason {
    Recovered,
    Timeout,
    SubjectLost,
    Shutdown,
}

/// Detection parameters in force when the event was decided, plus the body
/// summary at peak severity. Persisted under `decision` in event.json.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DecisionSnapshot {
    pub abnormality_threshold: f32,
    pub recovery_threshold: f32,
    pub suspected_dwell_ms: u64,
    pub recovery_dwell_ms: u64,
    pub peak_body: Option<BodyState>,
}

/// Finalized event plus the frames it spans, ready for persistence.
#[derive(Clone, Debug)]
pub struct SealedEvent {
    pub event: FallEvent,
    pub camera_id: String,
    pub sealed_by: SealReason,
    pub frames: Vec<Arc<PoseFrame>>,
    pub frames_truncated: usize,
    pub decision: DecisionSnapshot,
}

impl SealedEvent {
    pub fn id(&self) -> &EventId {
        &self.event.event_id
    }
}

/// Persistence sink's answer for one sealed event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventAck {
    Persisted { event_id: EventId, location: String },
    Failed { event_id: EventId, reason: String },
}

impl EventAck {
    pub fn event_id(&self) -> &EventId {
        match self {
            EventAck::Persisted { event_id, .. } | EventAck::Failed { event_id, .. } => event_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, EventAck::Persisted { .. })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AggregatorSettings {
    pub pre_roll_ms: u64,
    /// Frames kept after a recovery or timeout seal.
    pub post_roll_ms: u64,
    pub max_frames_per_event: usize,
    pub max_event_duration_ms: u64,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            pre_roll_ms: 2_000,
            post_roll_ms: 3_000,
            max_frames_per_event: 300,
            max_event_duration_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub opened: u64,
    pub folded: u64,
    pub sealed: u64,
    pub persisted: u64,
    pub lost: u64,
    pub frames_truncated: u64,
}

struct OpenEvent {
    event: FallEvent,
    frames: Vec<Arc<PoseFrame>>,
    truncated: usize,
    peak_body: Option<BodyState>,
    last_seen_ts: u64,
}

impl OpenEvent {
    fn attach(&mut self, frame: &Arc<PoseFrame>, max_frames: usize) {
        if self.frames.len() >= max_frames {
            self.truncated += 1;
            return;
        }
        self.event.frame_refs.push(frame.ts_ms);
        self.frames.push(frame.clone());
    }
}

/// Sealed event still collecting post-roll frames.
struct Closing {
    sealed: SealedEvent,
    until_ts: u64,
}

impl Closing {
    /// Returns false when the frame cap truncated the frame.
    fn attach(&mut self, frame: &Arc<PoseFrame>, max_frames: usize) -> bool {
        let sealed = &mut self.sealed;
        if sealed.frames.len() >= max_frames {
            sealed.frames_truncated += 1;
            return false;
        }
        sealed.event.frame_refs.push(frame.ts_ms);
        sealed.frames.push(frame.clone());
        true
    }
}

pub struct EventAggregator {
    camera_id: String,
    settings: AggregatorSettings,
    detector: DetectorSettings,
    open: HashMap<SubjectId, OpenEvent>,
    closing: HashMap<SubjectId, Closing>,
    next_seq: u64,
    stats: AggregatorStats,
}

impl EventAggregator {
    pub fn new(camera_id: &str, settings: AggregatorSettings, detector: DetectorSettings) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            settings,
            detector,
            open: HashMap::new(),
            closing: HashMap::new(),
            next_seq: 1,
            stats: AggregatorStats::default(),
        }
    }

    /// Start numbering events at `seq` instead of 1.
    pub fn with_first_seq(mut self, seq: u64) -> Self {
        self.next_seq = seq.max(1);
        self
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Sealed events still collecting post-roll frames.
    pub fn post_roll_count(&self) -> usize {
        self.closing.len()
    }

    pub fn open_event(&self, subject: &SubjectId) -> Option<&FallEvent> {
        self.open.get(subject).map(|o| &o.event)
    }

    /// Consume one verdict and the frame it was computed from.
    ///
    /// Returns the event released by this frame, if any: either one sealed now
    /// (when `post_roll_ms` is zero) or one whose post-roll this frame ended.
    pub fn ingest(
        &mut self,
        verdict: &FrameVerdict,
        frame: &Arc<PoseFrame>,
        history: &PoseHistory,
    ) -> Option<SealedEvent> {
        if verdict.disposition == FrameDisposition::OutOfOrder {
            return None;
        }
        let subject = &verdict.subject_id;

        let mut released = None;
        if let Some(closing) = self.closing.get_mut(subject) {
            let reconfirmed = matches!(&verdict.candidate, Some(c) if c.is_abnormal);
            if reconfirmed || verdict.ts_ms >= closing.until_ts {
                released = self.release(subject);
            } else {
                if !closing.attach(frame, self.settings.max_frames_per_event) {
                    self.stats.frames_truncated += 1;
                }
                return None;
            }
        }
        // A subject has either an open event or one in post-roll, never both,
        // so at most one of these is set.
        let sealed = self.track(verdict, frame, history);
        released.or(sealed)
    }

    fn track(
        &mut self,
        verdict: &FrameVerdict,
        frame: &Arc<PoseFrame>,
        history: &PoseHistory,
    ) -> Option<SealedEvent> {
        let subject = &verdict.subject_id;

        if let Some(candidate) = verdict.candidate.as_ref().filter(|c| c.is_abnormal) {
            if let Some(open) = self.open.get_mut(subject) {
                self.stats.folded += 1;
                log::info!(
                    "event {}: subject {} confirmed again, extending",
                    open.event.event_id,
                    subject
                );
            } else {
                let event_id = EventId::new(&self.camera_id, self.next_seq, candidate.ts_ms);
                self.next_seq += 1;
                let from = candidate.ts_ms.saturating_sub(self.settings.pre_roll_ms);
                let mut open = OpenEvent {
                    event: FallEvent {
                        event_id,
                        subject_id: subject.clone(),
                        start_ts: candidate.ts_ms,
                        end_ts: None,
                        peak_severity: candidate.score,
                        frame_refs: Vec::new(),
                        clip_ref: None,
                    },
                    frames: Vec::new(),
                    truncated: 0,
                    peak_body: verdict.body,
                    last_seen_ts: candidate.ts_ms,
                };
                for pre in history.window(subject, from, candidate.ts_ms) {
                    open.attach(&pre, self.settings.max_frames_per_event);
                }
                self.stats.opened += 1;
                log::info!(
                    "event {} opened: subject {} at ts={} score={:.3}",
                    open.event.event_id,
                    subject,
                    candidate.ts_ms,
                    candidate.score
                );
                self.open.insert(subject.clone(), open);
            }
        }

        let max_frames = self.settings.max_frames_per_event;
        let open = self.open.get_mut(subject)?;
        open.attach(frame, max_frames);
        open.last_seen_ts = verdict.ts_ms;
        if let Some(score) = verdict.score {
            if score > open.event.peak_severity {
                open.event.peak_severity = score;
                open.peak_body = verdict.body;
            }
        }

        let reason = if matches!(&verdict.candidate, Some(c) if !c.is_abnormal) {
            SealReason::Recovered
        } else if verdict.ts_ms.saturating_sub(open.event.start_ts)
            >= self.settings.max_event_duration_ms
        {
            SealReason::Timeout
        } else {
            return None;
        };
        let sealed = self.seal(subject, verdict.ts_ms, reason)?;
        if self.settings.post_roll_ms == 0 {
            return Some(sealed);
        }
        let until_ts = verdict.ts_ms.saturating_add(self.settings.post_roll_ms);
        self.closing.insert(subject.clone(), Closing { sealed, until_ts });
        None
    }

    /// Release events whose post-roll window ended at or before `now_ms`
    /// (stream time), oldest first. Covers subjects that stopped sending frames.
    pub fn release_post_roll(&mut self, now_ms: u64) -> Vec<SealedEvent> {
        let mut due: Vec<(u64, SubjectId)> = self
            .closing
            .iter()
            .filter(|(_, c)| c.until_ts <= now_ms)
            .map(|(id, c)| (c.sealed.event.start_ts, id.clone()))
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, id)| self.release(&id))
            .collect()
    }

    /// Seal the subject's open event at its last observed frame, or release its
    /// event in post-roll. No further frames are attached either way.
    pub fn seal_subject(&mut self, subject: &SubjectId, reason: SealReason) -> Option<SealedEvent> {
        match self.open.get(subject) {
            Some(open) => {
                let end_ts = open.last_seen_ts;
                self.seal(subject, end_ts, reason)
            }
            None => self.release(subject),
        }
    }

    /// Seal every open event and release every post-roll, oldest first.
    pub fn seal_all(&mut self, reason: SealReason) -> Vec<SealedEvent> {
        let mut subjects: Vec<(u64, SubjectId)> = self
            .open
            .iter()
            .map(|(id, o)| (o.event.start_ts, id.clone()))
            .chain(
                self.closing
                    .iter()
                    .map(|(id, c)| (c.sealed.event.start_ts, id.clone())),
            )
            .collect();
        subjects.sort();
        subjects
            .into_iter()
            .filter_map(|(_, id)| self.seal_subject(&id, reason))
            .collect()
    }

    fn release(&mut self, subject: &SubjectId) -> Option<SealedEvent> {
        let closing = self.closing.remove(subject)?;
        log::debug!(
            "event {} released with {} frames after post-roll",
            closing.sealed.id(),
            closing.sealed.frames.len()
        );
        Some(closing.sealed)
    }

    /// Record the persistence outcome for a sealed event.
    pub fn acknowledge(&mut self, ack: &EventAck) {
        match ack {
            EventAck::Persisted { event_id, location } => {
                self.stats.persisted += 1;
                log::debug!("event {} persisted at {}", event_id, location);
            }
            EventAck::Failed { event_id, reason } => {
                self.stats.lost += 1;
                log::error!("event {} lost: {}", event_id, reason);
            }
        }
    }

    fn seal(&mut self, subject: &SubjectId, end_ts: u64, reason: SealReason) -> Option<SealedEvent> {
        let mut open = self.open.remove(subject)?;
        open.event.end_ts = Some(end_ts.max(open.event.start_ts));
        self.stats.sealed += 1;
        self.stats.frames_truncated += open.truncated as u64;
        log::info!(
            "event {} sealed ({:?}): subject {} {}..{} peak={:.3} frames={}",
            open.event.event_id,
            reason,
            subject,
            open.event.start_ts,
            end_ts,
            open.event.peak_severity,
            open.frames.len()
        );
        Some(SealedEvent {
            event: open.event,
            camera_id: self.camera_id.clone(),
            sealed_by: reason,
            frames: open.frames,
            frames_truncated: open.truncated,
            decision: DecisionSnapshot {
                abnormality_threshold: self.detector.abnormality_threshold,
                recovery_threshold: self.detector.recovery_threshold,
                suspected_dwell_ms: self.detector.suspected_dwell_ms,
                recovery_dwell_ms: self.detector.recovery_dwell_ms,
                peak_body: open.peak_body,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{FallCandidate, FallState};

    fn verdict(ts_ms: u64, score: f32, candidate: Option<bool>) -> FrameVerdict {
        FrameVerdict {
            subject_id: SubjectId::default(),
            ts_ms,
            state: FallState::Confirmed,
            score: Some(score),
            body: None,
            disposition: FrameDisposition::Scored,
            transition: None,
            candidate: candidate.map(|is_abnormal| FallCandidate {
                ts_ms,
                subject_id: SubjectId::default(),
                score,
                is_abnormal,
            }),
        }
    }

    fn frame(ts_ms: u64) -> Arc<PoseFrame> {
        Arc::new(PoseFrame::empty(ts_ms, None))
    }

    fn immediate() -> AggregatorSettings {
        AggregatorSettings {
            post_roll_ms: 0,
            ..AggregatorSettings::default()
        }
    }

    fn aggregator() -> EventAggregator {
        EventAggregator::new("cam01", immediate(), DetectorSettings::default())
    }

    #[test]
    fn event_id_has_timestamp_camera_and_sequence() {
        let id = EventId::new("cam01", 7, 1_700_000_000_000);
        assert_eq!(id.as_str(), "20231114T221320Z_cam01_fall_0007");
    }

    #[test]
    fn open_attach_and_seal_on_recovery() {
        let mut agg = aggregator();
        let mut history = PoseHistory::new(5_000, 100);
        for ts in (0..1_000).step_by(100) {
            history.push(frame(ts));
        }

        assert!(agg.ingest(&verdict(1_000, 0.7, Some(true)), &frame(1_000), &history).is_none());
        assert!(agg.ingest(&verdict(1_100, 0.9, None), &frame(1_100), &history).is_none());
        assert!(agg.ingest(&verdict(1_200, 0.2, None), &frame(1_200), &history).is_none());
        assert_eq!(agg.open_count(), 1);

        let sealed = agg
            .ingest(&verdict(1_700, 0.1, Some(false)), &frame(1_700), &history)
            .expect("sealed event");
        assert_eq!(sealed.sealed_by, SealReason::Recovered);
        assert_eq!(sealed.event.start_ts, 1_000);
        assert_eq!(sealed.event.end_ts, Some(1_700));
        assert!((sealed.event.peak_severity - 0.9).abs() < f32::EPSILON);
        // 10 pre-roll frames + 4 attached
        assert_eq!(sealed.frames.len(), 14);
        assert_eq!(agg.open_count(), 0);
    }

    #[test]
    fn second_confirmation_folds_into_open_event() {
        let mut agg = aggregator();
        let history = PoseHistory::new(5_000, 100);
        agg.ingest(&verdict(1_000, 0.7, Some(true)), &frame(1_000), &history);
        agg.ingest(&verdict(1_500, 0.8, Some(true)), &frame(1_500), &history);
        assert_eq!(agg.open_count(), 1);
        assert_eq!(agg.stats().opened, 1);
        assert_eq!(agg.stats().folded, 1);
        assert_eq!(agg.open_event(&SubjectId::default()).unwrap().start_ts, 1_000);
    }

    #[test]
    fn long_event_is_sealed_by_timeout() {
        let mut agg = EventAggregator::new(
            "cam01",
            AggregatorSettings {
                max_event_duration_ms: 1_000,
                ..immediate()
            },
            DetectorSettings::default(),
        );
        let history = PoseHistory::new(5_000, 100);
        agg.ingest(&verdict(0, 0.7, Some(true)), &frame(0), &history);
        assert!(agg.ingest(&verdict(500, 0.7, None), &frame(500), &history).is_none());
        let sealed = agg.ingest(&verdict(1_000, 0.7, None), &frame(1_000), &history).unwrap();
        assert_eq!(sealed.sealed_by, SealReason::Timeout);
        // The ongoing episode does not reopen without a new confirmation.
        assert!(agg.ingest(&verdict(1_100, 0.7, None), &frame(1_100), &history).is_none());
        assert_eq!(agg.open_count(), 0);
    }

    #[test]
    fn frame_cap_truncates_and_counts() {
        let mut agg = EventAggregator::new(
            "cam01",
            AggregatorSettings {
                max_frames_per_event: 3,
                ..AggregatorSettings::default()
            },
            DetectorSettings::default(),
        );
        let history = PoseHistory::new(5_000, 100);
        agg.ingest(&verdict(0, 0.7, Some(true)), &frame(0), &history);
        for ts in 1..10 {
            agg.ingest(&verdict(ts, 0.7, None), &frame(ts), &history);
        }
        let sealed = agg.seal_subject(&SubjectId::default(), SealReason::SubjectLost).unwrap();
        assert_eq!(sealed.frames.len(), 3);
        assert_eq!(sealed.frames_truncated, 7);
        assert_eq!(sealed.event.end_ts, Some(9));
    }

    #[test]
    fn post_roll_keeps_frames_after_recovery() {
        let mut agg = EventAggregator::new(
            "cam01",
            AggregatorSettings {
                post_roll_ms: 1_000,
                ..AggregatorSettings::default()
            },
            DetectorSettings::default(),
        );
        let history = PoseHistory::new(5_000, 100);
        agg.ingest(&verdict(0, 0.7, Some(true)), &frame(0), &history);
        assert!(agg.ingest(&verdict(500, 0.1, Some(false)), &frame(500), &history).is_none());
        assert_eq!(agg.open_count(), 0);
        assert_eq!(agg.post_roll_count(), 1);

        for ts in [700, 1_000, 1_400] {
            assert!(agg.ingest(&verdict(ts, 0.1, None), &frame(ts), &history).is_none());
        }
        let sealed = agg
            .ingest(&verdict(1_500, 0.1, None), &frame(1_500), &history)
            .expect("released after post-roll");
        assert_eq!(sealed.sealed_by, SealReason::Recovered);
        assert_eq!(sealed.event.end_ts, Some(500));
        assert_eq!(sealed.event.frame_refs, vec![0, 500, 700, 1_000, 1_400]);
        assert_eq!(agg.post_roll_count(), 0);
    }

    #[test]
    fn reconfirmation_during_post_roll_releases_and_reopens() {
        let mut agg = EventAggregator::new("cam01", AggregatorSettings::default(), DetectorSettings::default());
        let history = PoseHistory::new(5_000, 100);
        agg.ingest(&verdict(0, 0.7, Some(true)), &frame(0), &history);
        agg.ingest(&verdict(500, 0.1, Some(false)), &frame(500), &history);
        let first = agg
            .ingest(&verdict(900, 0.8, Some(true)), &frame(900), &history)
            .expect("previous event released");
        assert_eq!(first.event.end_ts, Some(500));
        assert!(!first.event.frame_refs.contains(&900));
        assert_eq!(agg.open_count(), 1);
        assert_eq!(agg.open_event(&SubjectId::default()).unwrap().start_ts, 900);
        assert_eq!(agg.stats().opened, 2);
    }

    #[test]
    fn post_roll_is_released_by_stream_time_and_shutdown() {
        let mut agg = EventAggregator::new("cam01", AggregatorSettings::default(), DetectorSettings::default());
        let history = PoseHistory::new(5_000, 100);
        agg.ingest(&verdict(0, 0.7, Some(true)), &frame(0), &history);
        agg.ingest(&verdict(500, 0.1, Some(false)), &frame(500), &history);
        assert!(agg.release_post_roll(3_000).is_empty());
        assert_eq!(agg.release_post_roll(3_500).len(), 1);

        agg.ingest(&verdict(4_000, 0.7, Some(true)), &frame(4_000), &history);
        agg.ingest(&verdict(4_500, 0.1, Some(false)), &frame(4_500), &history);
        let sealed = agg.seal_all(SealReason::Shutdown);
        assert_eq!(sealed.len(), 1);
        // Already sealed by recovery; shutdown only cuts the post-roll short.
        assert_eq!(sealed[0].sealed_by, SealReason::Recovered);
        assert_eq!(agg.post_roll_count(), 0);
    }

    #[test]
    fn sequence_is_recovered_from_event_id() {
        let id = EventId::new("ward-3", 42, 1_700_000_000_000);
        assert_eq!(id.sequence_for("ward-3"), Some(42));
        assert_eq!(id.sequence_for("ward"), None);
        assert_eq!(EventId::from("junk").sequence_for("ward-3"), None);

        let mut agg = EventAggregator::new("cam01", immediate(), DetectorSettings::default())
            .with_first_seq(8);
        let history = PoseHistory::new(5_000, 100);
        agg.ingest(&verdict(0, 0.7, Some(true)), &frame(0), &history);
        let sealed = agg.seal_all(SealReason::Shutdown);
        assert_eq!(sealed[0].id().sequence_for("cam01"), Some(8));
    }

    #[test]
    fn acknowledgements_are_counted() {
        let mut agg = aggregator();
        agg.acknowledge(&EventAck::Persisted {
            event_id: EventId::from("a"),
            location: "/tmp/a".into(),
        });
        agg.acknowledge(&EventAck::Failed {
            event_id: EventId::from("b"),
            reason: "disk full".into(),
        });
        assert_eq!(agg.stats().persisted, 1);
        assert_eq!(agg.stats().lost, 1);
    }
}
