//! Pose data model and per-frame body summary.
//!
//! - `Keypoint` / `PoseFrame`: what the pose estimator hands us, one frame per camera tick.
//! - `BodyState`: deterministic summary of a frame (torso angle, aspect ratio, vertical velocity).
//! - `AbnormalityScorer`: maps a `BodyState` to a fall-likeness score in 0..=1.
//!
//! The estimator itself is a black box. Coordinates are image coordinates with y growing
//! downward; units only need to be consistent within a stream.

use serde::{Deserialize, Serialize};

use crate::SubjectId;

/// COCO-17 joint set.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeypointKind {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Keypoint {
    pub kind: KeypointKind,
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f32>,
    /// 0..=1
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(kind: KeypointKind, x: f32, y: f32, confidence: f32) -> Self {
        Self {
            kind,
            x,
            y,
            z: None,
            confidence,
        }
    }
}

/// Axis-aligned person box (x, y = top-left).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn aspect_ratio(&self) -> f32 {
        self.h / self.w.max(1e-3)
    }

    /// Longer side; does not depend on whether the person is standing or lying.
    pub fn extent(&self) -> f32 {
        self.w.max(self.h)
    }
}

/// One pose-estimator output for one subject at one instant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PoseFrame {
    /// Capture time, milliseconds since the Unix epoch.
    ///
    /// Event ids, date directories and retention ages all derive from this value,
    /// so relative clocks (starting near zero) must be rebased before use; see
    /// `ReplaySource::rebase_relative`.
    pub ts_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,
    #[serde(default)]
    pub keypoints: Vec<Keypoint>,
    /// Overall detection confidence, 0..=1.
    #[serde(default)]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

impl PoseFrame {
    /// A "no detection" tick.
    pub fn empty(ts_ms: u64, subject_id: Option<SubjectId>) -> Self {
        Self {
            ts_ms,
            subject_id,
            keypoints: Vec::new(),
            confidence: 0.0,
            bbox: None,
        }
    }

    /// Subject this frame belongs to; single-subject streams map to the default id.
    pub fn subject(&self) -> SubjectId {
        self.subject_id.clone().unwrap_or_default()
    }

    pub fn keypoint(&self, kind: KeypointKind) -> Option<&Keypoint> {
        self.keypoints.iter().find(|kp| kp.kind == kind)
    }

    /// Explicit bbox if provided, otherwise the hull of keypoints above `min_confidence`.
    pub fn bbox_or_derived(&self, min_confidence: f32) -> Option<BBox> {
        if self.bbox.is_some() {
            return self.bbox;
        }
        let mut pts = self
            .keypoints
            .iter()
            .filter(|kp| kp.confidence >= min_confidence);
        let first = pts.next()?;
        let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
        for kp in pts {
            x0 = x0.min(kp.x);
            y0 = y0.min(kp.y);
            x1 = x1.max(kp.x);
            y1 = y1.max(kp.y);
        }
        Some(BBox {
            x: x0,
            y: y0,
            w: (x1 - x0).max(1.0),
            h: (y1 - y0).max(1.0),
        })
    }
}

/// Derived per-frame body summary. Pure value; recomputed from frames, never stored on its own.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BodyState {
    /// Degrees between the shoulder→hip vector and vertical. 0 = upright, 90 = horizontal.
    pub torso_angle_deg: f32,
    /// bbox height / width.
    pub aspect_ratio: f32,
    /// Vertical hip-centre velocity in body heights per second, positive = downward.
    pub vertical_velocity: f32,
    /// Hip-centre y; carried so the next frame can compute velocity.
    pub hip_y: f32,
    /// bbox height used to normalise velocity.
    pub body_height: f32,
}

impl BodyState {
    /// Derive the body summary for `frame`, using `previous` (same subject, earlier
    /// frame) for velocity. Returns `None` when the torso cannot be located.
    pub fn derive(
        frame: &PoseFrame,
        previous: Option<(&BodyState, u64)>,
        min_keypoint_confidence: f32,
    ) -> Option<BodyState> {
        let shoulder = joint_center(
            frame,
            KeypointKind::LeftShoulder,
            KeypointKind::RightShoulder,
            min_keypoint_confidence,
        )?;
        let hip = joint_center(
            frame,
            KeypointKind::LeftHip,
            KeypointKind::RightHip,
            min_keypoint_confidence,
        )?;
        let bbox = frame.bbox_or_derived(min_keypoint_confidence)?;

        let (vx, vy) = (hip.0 - shoulder.0, hip.1 - shoulder.1);
        // atan2(|dx|, |dy|): 0 when the torso is vertical, 90 when horizontal.
        let torso_angle_deg = vx.abs().atan2(vy.abs()).to_degrees();

        let body_height = bbox.h.max(1.0);
        let vertical_velocity = match previous {
            Some((prev, prev_ts)) if frame.ts_ms > prev_ts => {
                let dt_s = (frame.ts_ms - prev_ts) as f32 / 1000.0;
                let norm = body_height.max(prev.body_height);
                (hip.1 - prev.hip_y) / norm / dt_s
            }
            _ => 0.0,
        };

        Some(BodyState {
            torso_angle_deg,
            aspect_ratio: bbox.aspect_ratio(),
            vertical_velocity,
            hip_y: hip.1,
            body_height,
        })
    }
}

fn joint_center(
    frame: &PoseFrame,
    left: KeypointKind,
    right: KeypointKind,
    min_confidence: f32,
) -> Option<(f32, f32)> {
    let usable = |kind| frame.keypoint(kind).filter(|kp| kp.confidence >= min_confidence);
    match (usable(left), usable(right)) {
        (Some(a), Some(b)) => Some((0.5 * (a.x + b.x), 0.5 * (a.y + b.y))),
        (Some(a), None) | (None, Some(a)) => Some((a.x, a.y)),
        (None, None) => None,
    }
}

/// Weights for combining body features into one abnormality score.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    pub angle: f32,
    pub aspect: f32,
    pub drop: f32,
    /// Downward velocity (body heights/s) that saturates the drop term.
    pub drop_velocity_ref: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            angle: 0.5,
            aspect: 0.3,
            drop: 0.2,
            drop_velocity_ref: 1.5,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AbnormalityScorer {
    weights: ScoringWeights,
}

impl AbnormalityScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Score in 0..=1; higher means more fall-like.
    pub fn score(&self, body: &BodyState) -> f32 {
        let w = &self.weights;
        let total = w.angle + w.aspect + w.drop;
        if total <= 0.0 {
            return 0.0;
        }
        let angle_term = (body.torso_angle_deg / 90.0).clamp(0.0, 1.0);
        let aspect_term = ((1.0 - body.aspect_ratio) / 0.7).clamp(0.0, 1.0);
        let drop_term = if w.drop_velocity_ref > 0.0 {
            (body.vertical_velocity / w.drop_velocity_ref).clamp(0.0, 1.0)
        } else {
            0.0
        };
        ((w.angle * angle_term + w.aspect * aspect_term + w.drop * drop_term) / total)
            .clamp(0.0, 1.0)
    }
}
