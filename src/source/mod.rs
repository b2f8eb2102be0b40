//! Pose sources: where frames come from.
//!
//! The pose estimator is out of scope; sources hand over its output. `ReplaySource`
//! reads recorded JSON-lines streams and `SyntheticSource` scripts postures for
//! demos and tests.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::pose::PoseFrame;

mod replay;
mod synthetic;

pub use replay::ReplaySource;
pub use synthetic::{Posture, Segment, SyntheticScript, SyntheticSource};

pub trait PoseSource: Send {
    /// Next frame, or `None` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<PoseFrame>>;
}

impl PoseSource for std::vec::IntoIter<PoseFrame> {
    fn next_frame(&mut self) -> Result<Option<PoseFrame>> {
        Ok(self.next())
    }
}

impl<S: PoseSource + ?Sized> PoseSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<PoseFrame>> {
        (**self).next_frame()
    }
}

/// Sleeps so that frames are released at the pace of their timestamps.
#[derive(Debug, Default)]
pub(crate) struct Pacer {
    anchor: Option<(u64, Instant)>,
}

impl Pacer {
    pub(crate) fn wait_for(&mut self, ts_ms: u64) {
        let Some((first_ts, started)) = self.anchor else {
            self.anchor = Some((ts_ms, Instant::now()));
            return;
        };
        let target = started + Duration::from_millis(ts_ms.saturating_sub(first_ts));
        let now = Instant::now();
        if target > now {
            std::thread::sleep(target - now);
        }
    }
}
