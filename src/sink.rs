//! Persistence of sealed events.
//!
//! `PersistenceSink` is the seam between the event queue and storage. The
//! reference `FilesystemSink` writes one directory per event:
//!
//! 1. `event.json` with `complete: false` (the record exists but is in flight);
//! 2. one annotated file per frame via a `FrameRenderer`, plus an optional clip;
//! 3. `event.json` rewritten atomically with `complete: true`.
//!
//! Pixel work (drawing, face blurring, encoding) lives behind `FrameRenderer`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventAck, SealedEvent};
use crate::pose::{BodyState, PoseFrame};
use crate::store::{EventRecord, SystemInfo, EVENT_FILE};

pub trait PersistenceSink: Send {
    /// Persist one sealed event. Never panics; failures come back as `EventAck::Failed`.
    fn persist(&mut self, sealed: &SealedEvent) -> EventAck;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivacySettings {
    pub face_blur: bool,
    pub blur_kernel: u32,
    pub redact_metadata: bool,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            face_blur: true,
            blur_kernel: 31,
            redact_metadata: true,
        }
    }
}

/// Renders event frames into files inside the event directory.
pub trait FrameRenderer: Send {
    /// Write one frame; returns the file name (relative to `dir`).
    fn render_frame(
        &mut self,
        dir: &Path,
        frame: &PoseFrame,
        t_rel_ms: i64,
        privacy: &PrivacySettings,
    ) -> Result<String>;

    /// Write a clip covering all frames; `None` when the renderer has no clip support.
    fn render_clip(
        &mut self,
        _dir: &Path,
        _frames: &[&PoseFrame],
        _privacy: &PrivacySettings,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Writes the pose annotation of each frame as JSON (`annotated_<t_rel_ms>.json`).
#[derive(Clone, Copy, Debug, Default)]
pub struct PoseJsonRenderer {
    pub min_keypoint_confidence: f32,
}

#[derive(Serialize)]
struct FrameAnnotation<'a> {
    t_rel_ms: i64,
    frame: &'a PoseFrame,
    body: Option<BodyState>,
}

impl FrameRenderer for PoseJsonRenderer {
    fn render_frame(
        &mut self,
        dir: &Path,
        frame: &PoseFrame,
        t_rel_ms: i64,
        _privacy: &PrivacySettings,
    ) -> Result<String> {
        let name = format!("annotated_{}.json", t_rel_ms);
        let annotation = FrameAnnotation {
            t_rel_ms,
            frame,
            body: BodyState::derive(frame, None, self.min_keypoint_confidence),
        };
        let json = serde_json::to_vec_pretty(&annotation)?;
        fs::write(dir.join(&name), json)?;
        Ok(name)
    }
}

#[derive(Clone, Debug)]
pub struct SinkSettings {
    pub base_dir: PathBuf,
    pub save_clip: bool,
    pub privacy: PrivacySettings,
    pub host: Option<String>,
}

pub struct FilesystemSink<R: FrameRenderer = PoseJsonRenderer> {
    settings: SinkSettings,
    renderer: R,
}

impl FilesystemSink<PoseJsonRenderer> {
    pub fn new(settings: SinkSettings) -> Self {
        Self::with_renderer(settings, PoseJsonRenderer::default())
    }
}

impl<R: FrameRenderer> FilesystemSink<R> {
    pub fn with_renderer(settings: SinkSettings, renderer: R) -> Self {
        Self { settings, renderer }
    }

    /// `base/<camera>/<YYYY>/<MM>/<DD>/<event_id>`
    pub fn event_dir(&self, sealed: &SealedEvent) -> PathBuf {
        let ts = DateTime::<Utc>::from_timestamp_millis(sealed.event.start_ts as i64)
            .unwrap_or_default();
        self.settings
            .base_dir
            .join(&sealed.camera_id)
            .join(format!("{:04}", ts.year()))
            .join(format!("{:02}", ts.month()))
            .join(format!("{:02}", ts.day()))
            .join(sealed.id().as_str())
    }

    fn write_event(&mut self, sealed: &SealedEvent, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let host = if self.settings.privacy.redact_metadata {
            None
        } else {
            self.settings.host.clone()
        };
        let mut record = EventRecord::from_sealed(
            sealed,
            self.settings.privacy,
            SystemInfo {
                host,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );
        let meta_path = dir.join(EVENT_FILE);
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&record)?)?;

        let privacy = self.settings.privacy;
        for frame in &sealed.frames {
            let t_rel_ms = frame.ts_ms as i64 - sealed.event.start_ts as i64;
            let name = self.renderer.render_frame(dir, frame, t_rel_ms, &privacy)?;
            record.frame_paths.push(name);
        }
        if self.settings.save_clip && sealed.frames.len() > 1 {
            let frames: Vec<&PoseFrame> = sealed.frames.iter().map(|f| f.as_ref()).collect();
            if let Some(clip) = self.renderer.render_clip(dir, &frames, &privacy)? {
                log::info!("clip saved: {}", dir.join(&clip).display());
                record.clip_path = Some(clip);
            }
        }

        record.complete = true;
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }
}

impl<R: FrameRenderer> PersistenceSink for FilesystemSink<R> {
    fn persist(&mut self, sealed: &SealedEvent) -> EventAck {
        let dir = self.event_dir(sealed);
        if dir.exists() {
            return EventAck::Failed {
                event_id: sealed.id().clone(),
                reason: format!("event directory {} already exists", dir.display()),
            };
        }
        match self.write_event(sealed, &dir) {
            Ok(()) => {
                log::info!("event saved: {} -> {}", sealed.id(), dir.display());
                EventAck::Persisted {
                    event_id: sealed.id().clone(),
                    location: dir.display().to_string(),
                }
            }
            Err(e) => {
                if dir.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(&dir) {
                        log::warn!(
                            "could not remove partial event dir {}: {}",
                            dir.display(),
                            cleanup
                        );
                    }
                }
                EventAck::Failed {
                    event_id: sealed.id().clone(),
                    reason: format!("{:#}", e),
                }
            }
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
