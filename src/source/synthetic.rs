use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{Pacer, PoseSource};
use crate::pose::{BBox, Keypoint, KeypointKind, PoseFrame};
use crate::SubjectId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    /// Standing: vertical torso, tall narrow box.
    Upright,
    /// On the floor: horizontal torso, wide flat box.
    Lying,
    /// Nobody detected.
    Absent,
}

impl Posture {
    pub fn frame(self, ts_ms: u64, subject_id: Option<SubjectId>) -> PoseFrame {
        let (shoulder, hip, bbox) = match self {
            Posture::Upright => (
                (300.0, 100.0),
                (300.0, 250.0),
                BBox { x: 250.0, y: 60.0, w: 100.0, h: 380.0 },
            ),
            Posture::Lying => (
                (200.0, 400.0),
                (350.0, 410.0),
                BBox { x: 150.0, y: 370.0, w: 380.0, h: 90.0 },
            ),
            Posture::Absent => return PoseFrame::empty(ts_ms, subject_id),
        };
        PoseFrame {
            ts_ms,
            subject_id,
            keypoints: vec![
                Keypoint::new(KeypointKind::LeftShoulder, shoulder.0 - 20.0, shoulder.1, 0.9),
                Keypoint::new(KeypointKind::RightShoulder, shoulder.0 + 20.0, shoulder.1, 0.9),
                Keypoint::new(KeypointKind::LeftHip, hip.0 - 15.0, hip.1, 0.9),
                Keypoint::new(KeypointKind::RightHip, hip.0 + 15.0, hip.1, 0.9),
            ],
            confidence: 0.9,
            bbox: Some(bbox),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub posture: Posture,
    pub duration_ms: u64,
}

impl Segment {
    pub fn new(posture: Posture, duration_ms: u64) -> Self {
        Self {
            posture,
            duration_ms,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyntheticScript {
    pub fps: u32,
    pub start_ts_ms: u64,
    pub subject_id: Option<SubjectId>,
    pub segments: Vec<Segment>,
    /// Uniform keypoint noise in pixels.
    pub jitter_px: f32,
    /// Probability that a frame comes out empty.
    pub dropout: f64,
    pub seed: u64,
}

impl SyntheticScript {
    pub fn new(fps: u32, start_ts_ms: u64, segments: Vec<Segment>) -> Self {
        Self {
            fps,
            start_ts_ms,
            subject_id: None,
            segments,
            jitter_px: 0.0,
            dropout: 0.0,
            seed: 0,
        }
    }

    /// Standing, a fall, lying still, getting back up.
    pub fn demo(start_ts_ms: u64) -> Self {
        Self {
            jitter_px: 2.0,
            seed: 7,
            ..Self::new(
                10,
                start_ts_ms,
                vec![
                    Segment::new(Posture::Upright, 3_000),
                    Segment::new(Posture::Lying, 4_000),
                    Segment::new(Posture::Upright, 3_000),
                ],
            )
        }
    }

    /// Parse `posture:millis` pairs separated by commas, e.g. `upright:2000,lying:5000`.
    pub fn parse_segments(script: &str) -> Result<Vec<Segment>> {
        script
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let (name, millis) = part
                    .split_once(':')
                    .ok_or_else(|| anyhow!("segment '{}' must be posture:millis", part))?;
                let posture = match name.trim() {
                    "upright" => Posture::Upright,
                    "lying" => Posture::Lying,
                    "absent" => Posture::Absent,
                    other => return Err(anyhow!("unknown posture '{}'", other)),
                };
                let duration_ms = millis
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| anyhow!("segment '{}': {}", part, e))?;
                Ok(Segment::new(posture, duration_ms))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 || self.fps > 1_000 {
            return Err(anyhow!("fps must be within 1..=1000 (got {})", self.fps));
        }
        if self.segments.is_empty() {
            return Err(anyhow!("synthetic script has no segments"));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(anyhow!("dropout must be within 0..=1 (got {})", self.dropout));
        }
        if self.jitter_px.is_nan() || self.jitter_px < 0.0 {
            return Err(anyhow!("jitter_px must be non-negative"));
        }
        Ok(())
    }

    pub fn frame_interval_ms(&self) -> u64 {
        (1_000 / self.fps.max(1) as u64).max(1)
    }
}

/// Plays a `SyntheticScript` frame by frame.
pub struct SyntheticSource {
    script: SyntheticScript,
    rng: StdRng,
    segment: usize,
    elapsed_in_segment: u64,
    next_ts: u64,
    frames_emitted: u64,
    pacer: Option<Pacer>,
}

impl SyntheticSource {
    pub fn new(script: SyntheticScript) -> Result<Self> {
        script.validate()?;
        let rng = StdRng::seed_from_u64(script.seed);
        let next_ts = script.start_ts_ms;
        Ok(Self {
            script,
            rng,
            segment: 0,
            elapsed_in_segment: 0,
            next_ts,
            frames_emitted: 0,
            pacer: None,
        })
    }

    /// Release frames at the pace of their timestamps.
    pub fn realtime(mut self) -> Self {
        self.pacer = Some(Pacer::default());
        self
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Total scripted duration.
    pub fn duration_ms(&self) -> u64 {
        self.script.segments.iter().map(|s| s.duration_ms).sum()
    }

    fn perturb(&mut self, frame: &mut PoseFrame) {
        let jitter = self.script.jitter_px;
        if jitter <= 0.0 {
            return;
        }
        for kp in frame.keypoints.iter_mut() {
            kp.x += self.rng.gen_range(-jitter..=jitter);
            kp.y += self.rng.gen_range(-jitter..=jitter);
        }
    }
}

impl PoseSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<PoseFrame>> {
        let interval = self.script.frame_interval_ms();
        while let Some(segment) = self.script.segments.get(self.segment) {
            if self.elapsed_in_segment >= segment.duration_ms {
                self.segment += 1;
                self.elapsed_in_segment = 0;
                continue;
            }
            let posture = segment.posture;
            let ts = self.next_ts;
            self.next_ts += interval;
            self.elapsed_in_segment += interval;

            let dropped = self.script.dropout > 0.0 && self.rng.gen_bool(self.script.dropout);
            let mut frame = if dropped {
                PoseFrame::empty(ts, self.script.subject_id.clone())
            } else {
                posture.frame(ts, self.script.subject_id.clone())
            };
            self.perturb(&mut frame);
            if let Some(pacer) = self.pacer.as_mut() {
                pacer.wait_for(ts);
            }
            self.frames_emitted += 1;
            return Ok(Some(frame));
        }
        Ok(None)
    }
}
