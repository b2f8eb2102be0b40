//! Bounded per-subject ring buffers of recent pose frames.
//!
//! Used for pre-roll: when an event opens, the frames leading up to it are copied
//! into the event. Frames are shared (`Arc`) so the buffer and open events never
//! duplicate keypoint data. Each subject gets its own buffer, so interleaved
//! subjects do not crowd each other out of the pre-roll window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::pose::PoseFrame;
use crate::SubjectId;

/// Hard cap on buffered frames per subject regardless of configuration.
pub const MAX_HISTORY_FRAMES: usize = 900;

pub struct PoseHistory {
    subjects: HashMap<SubjectId, VecDeque<Arc<PoseFrame>>>,
    max_frames: usize,
    max_age_ms: u64,
}

impl PoseHistory {
    /// `max_age_ms` is measured against frame timestamps, not wall time.
    /// `max_frames` applies to each subject separately.
    pub fn new(max_age_ms: u64, max_frames: usize) -> Self {
        Self {
            subjects: HashMap::new(),
            max_frames: max_frames.clamp(1, MAX_HISTORY_FRAMES),
            max_age_ms,
        }
    }

    /// Push a frame, evicting that subject's frames that are too old or over capacity.
    pub fn push(&mut self, frame: Arc<PoseFrame>) {
        let newest = frame.ts_ms;
        let buffer = self
            .subjects
            .entry(frame.subject())
            .or_insert_with(VecDeque::new);
        while let Some(oldest) = buffer.front() {
            if newest.saturating_sub(oldest.ts_ms) > self.max_age_ms {
                buffer.pop_front();
            } else {
                break;
            }
        }
        while buffer.len() >= self.max_frames {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    /// Frames of `subject` with `from_ms <= ts < until_ms`, oldest first.
    pub fn window(&self, subject: &SubjectId, from_ms: u64, until_ms: u64) -> Vec<Arc<PoseFrame>> {
        self.subjects
            .get(subject)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|f| f.ts_ms >= from_ms && f.ts_ms < until_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop everything buffered for `subject` (called when its track expires).
    pub fn forget(&mut self, subject: &SubjectId) {
        self.subjects.remove(subject);
    }

    pub fn latest(&self, subject: &SubjectId) -> Option<&Arc<PoseFrame>> {
        self.subjects.get(subject).and_then(|buffer| buffer.back())
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    /// Buffered frames across all subjects.
    pub fn len(&self) -> usize {
        self.subjects.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.values().all(VecDeque::is_empty)
    }
}
