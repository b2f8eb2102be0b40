//! Per-subject fall detection state machine.
//!
//! ```text
//!   NORMAL --score>=abn--> SUSPECTED --abn held for suspected_dwell--> CONFIRMED
//!     ^                       |                                         |  ^
//!     |<----score<abn---------+                              score<rec  |  | score>=abn
//!     |                                                                 v  |
//!     +<------------- rec held for recovery_dwell --------------- RECOVERING
//! ```
//!
//! Thresholds form a hysteresis band (`recovery_threshold < abnormality_threshold`).
//! Dwell is measured on frame timestamps, so variable frame rates behave the same
//! as fixed ones.
//!
//! Frames with low detection confidence, no usable torso or a body smaller than
//! `min_body_size_px` (too distant to judge) never move the state forward. They accumulate staleness; a stale SUSPECTED or RECOVERING subject falls
//! back to NORMAL after `staleness_timeout_ms`. CONFIRMED is never cleared by
//! staleness: a person who is down may stop moving and lose tracking.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::pose::{AbnormalityScorer, BodyState, PoseFrame, ScoringWeights};
use crate::SubjectId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallState {
    #[default]
    Normal,
    Suspected,
    Confirmed,
    Recovering,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: FallState,
    pub to: FallState,
}

/// Frame-level signal for the aggregator.
///
/// `is_abnormal = true` on entering CONFIRMED, `false` on RECOVERING -> NORMAL.
#[derive(Clone, Debug, PartialEq)]
pub struct FallCandidate {
    pub ts_ms: u64,
    pub subject_id: SubjectId,
    pub score: f32,
    pub is_abnormal: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Confident frame, scored and fed to the state machine.
    Scored,
    /// Missing detection, low confidence, no usable torso or body too small.
    LowConfidence,
    /// Timestamp not after the subject's previous frame; ignored.
    OutOfOrder,
}

/// Result of feeding one frame to the detector.
#[derive(Clone, Debug)]
pub struct FrameVerdict {
    pub subject_id: SubjectId,
    pub ts_ms: u64,
    pub state: FallState,
    pub score: Option<f32>,
    pub body: Option<BodyState>,
    pub disposition: FrameDisposition,
    pub transition: Option<Transition>,
    pub candidate: Option<FallCandidate>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectorSettings {
    pub suspected_dwell_ms: u64,
    pub recovery_dwell_ms: u64,
    pub abnormality_threshold: f32,
    pub recovery_threshold: f32,
    pub staleness_timeout_ms: u64,
    pub min_detection_confidence: f32,
    pub min_keypoint_confidence: f32,
    /// Longer side of the person box, in pixels.
    pub min_body_size_px: f32,
    pub subject_expiry_ms: u64,
    pub weights: ScoringWeights,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            suspected_dwell_ms: 500,
            recovery_dwell_ms: 1_000,
            abnormality_threshold: 0.6,
            recovery_threshold: 0.4,
            staleness_timeout_ms: 2_000,
            min_detection_confidence: 0.3,
            min_keypoint_confidence: 0.2,
            min_body_size_px: 120.0,
            subject_expiry_ms: 30_000,
            weights: ScoringWeights::default(),
        }
    }
}

impl DetectorSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("abnormality_threshold", self.abnormality_threshold),
            ("recovery_threshold", self.recovery_threshold),
            ("min_detection_confidence", self.min_detection_confidence),
            ("min_keypoint_confidence", self.min_keypoint_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within 0..=1 (got {})", name, value));
            }
        }
        if self.recovery_threshold >= self.abnormality_threshold {
            return Err(anyhow!(
                "recovery_threshold ({}) must be below abnormality_threshold ({})",
                self.recovery_threshold,
                self.abnormality_threshold
            ));
        }
        if !self.min_body_size_px.is_finite() || self.min_body_size_px < 0.0 {
            return Err(anyhow!(
                "min_body_size_px must be a non-negative number (got {})",
                self.min_body_size_px
            ));
        }
        if self.suspected_dwell_ms == 0 || self.recovery_dwell_ms == 0 {
            return Err(anyhow!("dwell durations must be greater than zero"));
        }
        let w = &self.weights;
        if w.angle < 0.0 || w.aspect < 0.0 || w.drop < 0.0 {
            return Err(anyhow!("scoring weights must be non-negative"));
        }
        if w.angle + w.aspect + w.drop <= 0.0 {
            return Err(anyhow!("scoring weights must not all be zero"));
        }
        Ok(())
    }
}

/// Bounded per-subject state. No frame history is kept here.
#[derive(Clone, Debug)]
struct SubjectTrack {
    state: FallState,
    /// Start of the current dwell (SUSPECTED entry, or RECOVERING streak start).
    since_ms: u64,
    last_ts: u64,
    last_confident_ts: u64,
    staleness_ms: u64,
    last_score: f32,
    prev_body: Option<(BodyState, u64)>,
}

impl SubjectTrack {
    fn new(ts_ms: u64) -> Self {
        Self {
            state: FallState::Normal,
            since_ms: ts_ms,
            last_ts: ts_ms,
            last_confident_ts: ts_ms,
            staleness_ms: 0,
            last_score: 0.0,
            prev_body: None,
        }
    }
}

/// Table of per-subject state machines, owned by the processing thread.
pub struct FallDetector {
    settings: DetectorSettings,
    scorer: AbnormalityScorer,
    tracks: HashMap<SubjectId, SubjectTrack>,
}

impl FallDetector {
    pub fn new(settings: DetectorSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            scorer: AbnormalityScorer::new(settings.weights),
            settings,
            tracks: HashMap::new(),
        })
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn state_of(&self, subject: &SubjectId) -> Option<FallState> {
        self.tracks.get(subject).map(|t| t.state)
    }

    pub fn staleness_of(&self, subject: &SubjectId) -> Option<u64> {
        self.tracks.get(subject).map(|t| t.staleness_ms)
    }

    pub fn tracked_subjects(&self) -> usize {
        self.tracks.len()
    }

    /// Feed one frame. Frames must arrive in timestamp order per subject;
    /// late frames are reported as `OutOfOrder` and leave state untouched.
    pub fn process(&mut self, frame: &PoseFrame) -> FrameVerdict {
        let subject = frame.subject();
        let ts = frame.ts_ms;
        let settings = self.settings;
        let scorer = self.scorer;

        let mut fresh = false;
        let track = self.tracks.entry(subject.clone()).or_insert_with(|| {
            fresh = true;
            SubjectTrack::new(ts)
        });

        let mut verdict = FrameVerdict {
            subject_id: subject.clone(),
            ts_ms: ts,
            state: track.state,
            score: None,
            body: None,
            disposition: FrameDisposition::Scored,
            transition: None,
            candidate: None,
        };

        if !fresh && ts <= track.last_ts {
            log::debug!(
                "subject {}: out-of-order frame ts={} (last={})",
                subject,
                ts,
                track.last_ts
            );
            verdict.disposition = FrameDisposition::OutOfOrder;
            return verdict;
        }
        track.last_ts = ts;

        let body = if frame.keypoints.is_empty()
            || frame.confidence < settings.min_detection_confidence
        {
            None
        } else {
            BodyState::derive(
                frame,
                track.prev_body.as_ref().map(|(b, t)| (b, *t)),
                settings.min_keypoint_confidence,
            )
            .filter(|_| {
                frame
                    .bbox_or_derived(settings.min_keypoint_confidence)
                    .map_or(0.0, |bbox| bbox.extent())
                    >= settings.min_body_size_px
            })
        };

        let Some(body) = body else {
            verdict.disposition = FrameDisposition::LowConfidence;
            track.staleness_ms = ts.saturating_sub(track.last_confident_ts);
            if track.staleness_ms > settings.staleness_timeout_ms {
                match track.state {
                    FallState::Suspected => {
                        verdict.transition = Some(enter(track, FallState::Normal, ts));
                    }
                    FallState::Recovering => {
                        verdict.transition = Some(enter(track, FallState::Normal, ts));
                        verdict.candidate = Some(FallCandidate {
                            ts_ms: ts,
                            subject_id: subject.clone(),
                            score: track.last_score,
                            is_abnormal: false,
                        });
                    }
                    FallState::Normal | FallState::Confirmed => {}
                }
                if verdict.transition.is_some() {
                    log::info!(
                        "subject {}: tracking stale for {} ms, reset to normal",
                        subject,
                        track.staleness_ms
                    );
                }
            }
            verdict.state = track.state;
            return verdict;
        };

        track.last_confident_ts = ts;
        track.staleness_ms = 0;
        track.prev_body = Some((body, ts));
        let score = scorer.score(&body);
        track.last_score = score;
        verdict.score = Some(score);
        verdict.body = Some(body);

        let abnormal = score >= settings.abnormality_threshold;
        let recovered = score < settings.recovery_threshold;

        match track.state {
            FallState::Normal => {
                if abnormal {
                    verdict.transition = Some(enter(track, FallState::Suspected, ts));
                }
            }
            FallState::Suspected => {
                if !abnormal {
                    verdict.transition = Some(enter(track, FallState::Normal, ts));
                } else if ts - track.since_ms >= settings.suspected_dwell_ms {
                    verdict.transition = Some(enter(track, FallState::Confirmed, ts));
                    verdict.candidate = Some(FallCandidate {
                        ts_ms: ts,
                        subject_id: subject.clone(),
                        score,
                        is_abnormal: true,
                    });
                }
            }
            FallState::Confirmed => {
                if recovered {
                    verdict.transition = Some(enter(track, FallState::Recovering, ts));
                }
            }
            FallState::Recovering => {
                if abnormal {
                    verdict.transition = Some(enter(track, FallState::Confirmed, ts));
                    verdict.candidate = Some(FallCandidate {
                        ts_ms: ts,
                        subject_id: subject.clone(),
                        score,
                        is_abnormal: true,
                    });
                } else if !recovered {
                    // Inside the band: recovery streak interrupted.
                    track.since_ms = ts;
                } else if ts - track.since_ms >= settings.recovery_dwell_ms {
                    verdict.transition = Some(enter(track, FallState::Normal, ts));
                    verdict.candidate = Some(FallCandidate {
                        ts_ms: ts,
                        subject_id: subject.clone(),
                        score,
                        is_abnormal: false,
                    });
                }
            }
        }

        if let Some(t) = verdict.transition {
            log::debug!(
                "subject {}: {:?} -> {:?} at ts={} score={:.3}",
                subject,
                t.from,
                t.to,
                ts,
                score
            );
        }
        verdict.state = track.state;
        verdict
    }

    /// Forget subjects whose last frame is older than `subject_expiry_ms`
    /// relative to `now_ms`. Returns the removed ids.
    pub fn expire_idle(&mut self, now_ms: u64) -> Vec<SubjectId> {
        let expiry = self.settings.subject_expiry_ms;
        let expired: Vec<SubjectId> = self
            .tracks
            .iter()
            .filter(|(_, t)| now_ms.saturating_sub(t.last_ts) > expiry)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(track) = self.tracks.remove(id) {
                log::debug!("subject {} expired in state {:?}", id, track.state);
            }
        }
        expired
    }
}

fn enter(track: &mut SubjectTrack, to: FallState, ts: u64) -> Transition {
    let from = track.state;
    track.state = to;
    track.since_ms = ts;
    Transition { from, to }
}
