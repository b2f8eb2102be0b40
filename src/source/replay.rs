use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use super::{Pacer, PoseSource};
use crate::pose::PoseFrame;

/// Timestamps below this (2001-09-09) are taken as a relative clock.
pub const EPOCH_FLOOR_MS: u64 = 1_000_000_000_000;

/// Replays a JSON-lines file, one `PoseFrame` per line.
///
/// Blank lines and lines starting with `#` are skipped. With `realtime` set, frames
/// are released at the pace of their timestamps instead of as fast as possible.
pub struct ReplaySource {
    reader: Box<dyn BufRead + Send>,
    label: String,
    line_no: usize,
    pacer: Option<Pacer>,
    frames_read: u64,
    rebase_anchor: Option<u64>,
    offset_ms: Option<u64>,
}

impl ReplaySource {
    pub fn open(path: &Path, realtime: bool) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open replay file {}", path.display()))?;
        log::info!("replaying pose frames from {}", path.display());
        Ok(Self::from_reader(
            BufReader::new(file),
            path.display().to_string(),
            realtime,
        ))
    }

    pub fn from_reader(reader: impl BufRead + Send + 'static, label: String, realtime: bool) -> Self {
        Self {
            reader: Box::new(reader),
            label,
            line_no: 0,
            pacer: realtime.then(Pacer::default),
            frames_read: 0,
            rebase_anchor: None,
            offset_ms: None,
        }
    }

    /// If the first frame carries a relative timestamp (below `EPOCH_FLOOR_MS`),
    /// shift every frame so the stream starts at `anchor_ms`. Epoch-based
    /// recordings pass through unchanged.
    pub fn rebase_relative(mut self, anchor_ms: u64) -> Self {
        self.rebase_anchor = Some(anchor_ms);
        self
    }

    fn rebase(&mut self, frame: &mut PoseFrame) {
        let offset = match self.offset_ms {
            Some(offset) => offset,
            None => {
                let offset = match self.rebase_anchor {
                    Some(anchor) if frame.ts_ms < EPOCH_FLOOR_MS => {
                        log::warn!(
                            "{}: relative timestamps (first ts={}), rebasing to {}",
                            self.label,
                            frame.ts_ms,
                            anchor
                        );
                        anchor.saturating_sub(frame.ts_ms)
                    }
                    _ => 0,
                };
                self.offset_ms = Some(offset);
                offset
            }
        };
        frame.ts_ms = frame.ts_ms.saturating_add(offset);
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

impl PoseSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<PoseFrame>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .with_context(|| format!("{}: read failed", self.label))?;
            if read == 0 {
                log::info!("{}: end of replay after {} frames", self.label, self.frames_read);
                return Ok(None);
            }
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut frame: PoseFrame = serde_json::from_str(trimmed)
                .with_context(|| format!("{}:{}: invalid pose frame", self.label, self.line_no))?;
            self.rebase(&mut frame);
            if let Some(pacer) = self.pacer.as_mut() {
                pacer.wait_for(frame.ts_ms);
            }
            self.frames_read += 1;
            return Ok(Some(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_frames_and_skips_comments() -> Result<()> {
        let input = "# recorded at ward 3\n\
                     {\"ts_ms\":100,\"confidence\":0.9}\n\
                     \n\
                     {\"ts_ms\":200,\"subject_id\":\"7\"}\n";
        let mut source = ReplaySource::from_reader(Cursor::new(input), "mem".into(), false);
        let first = source.next_frame()?.expect("first frame");
        assert_eq!(first.ts_ms, 100);
        assert!(first.subject_id.is_none());
        let second = source.next_frame()?.expect("second frame");
        assert_eq!(second.subject().as_str(), "7");
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.frames_read(), 2);
        Ok(())
    }

    #[test]
    fn malformed_line_reports_position() {
        let input = "{\"ts_ms\":1}\nnot json\n";
        let mut source = ReplaySource::from_reader(Cursor::new(input), "ward.jsonl".into(), false);
        assert!(source.next_frame().is_ok());
        let err = source.next_frame().unwrap_err();
        assert!(format!("{:#}", err).contains("ward.jsonl:2"));
    }

    #[test]
    fn relative_clock_is_rebased_to_anchor() -> Result<()> {
        let input = "{\"ts_ms\":100}\n{\"ts_ms\":250}\n";
        let mut source = ReplaySource::from_reader(Cursor::new(input), "rel".into(), false)
            .rebase_relative(1_750_000_000_000);
        assert_eq!(source.next_frame()?.unwrap().ts_ms, 1_750_000_000_000);
        assert_eq!(source.next_frame()?.unwrap().ts_ms, 1_750_000_000_150);
        Ok(())
    }

    #[test]
    fn epoch_clock_is_left_alone() -> Result<()> {
        let input = "{\"ts_ms\":1700000000000}\n{\"ts_ms\":1700000000100}\n";
        let mut source = ReplaySource::from_reader(Cursor::new(input), "abs".into(), false)
            .rebase_relative(1_750_000_000_000);
        assert_eq!(source.next_frame()?.unwrap().ts_ms, 1_700_000_000_000);
        assert_eq!(source.next_frame()?.unwrap().ts_ms, 1_700_000_000_100);
        Ok(())
    }
}
