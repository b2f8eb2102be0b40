use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::event::AggregatorSettings;
use crate::fsm::DetectorSettings;
use crate::pose::ScoringWeights;
use crate::retention::RetentionPolicy;
use crate::sink::{PrivacySettings, SinkSettings};

const DEFAULT_CAMERA_ID: &str = "cam01";
const DEFAULT_FPS: u32 = 30;
const DEFAULT_BASE_DIR: &str = "./falls";
const DEFAULT_QUEUE_CAPACITY: usize = 16;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Deserialize, Default)]
struct FallwatchConfigFile {
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    events: Option<EventsConfigFile>,
    storage: Option<StorageConfigFile>,
    privacy: Option<PrivacyConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    camera_id: Option<String>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    suspected_dwell_ms: Option<u64>,
    recovery_dwell_ms: Option<u64>,
    abnormality_threshold: Option<f32>,
    recovery_threshold: Option<f32>,
    staleness_timeout_ms: Option<u64>,
    min_detection_confidence: Option<f32>,
    min_keypoint_confidence: Option<f32>,
    min_body_size_px: Option<f32>,
    subject_expiry_ms: Option<u64>,
    angle_weight: Option<f32>,
    aspect_weight: Option<f32>,
    drop_weight: Option<f32>,
    drop_velocity_ref: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    queue_capacity: Option<usize>,
    pre_roll_ms: Option<u64>,
    post_roll_ms: Option<u64>,
    max_frames_per_event: Option<usize>,
    max_event_duration_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    base_dir: Option<PathBuf>,
    save_clip: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PrivacyConfigFile {
    face_blur: Option<bool>,
    blur_kernel: Option<u32>,
    redact_metadata: Option<bool>,
    retention_days: Option<u32>,
    low_disk_threshold_pct: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FallwatchConfig {
    pub camera: CameraSettings,
    pub detection: DetectorSettings,
    pub events: EventSettings,
    pub storage: StorageSettings,
    pub privacy: PrivacySettings,
    pub retention: RetentionPolicy,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub camera_id: String,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub queue_capacity: usize,
    pub aggregator: AggregatorSettings,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub base_dir: PathBuf,
    pub save_clip: bool,
}

impl Default for FallwatchConfig {
    fn default() -> Self {
        Self::from_file(FallwatchConfigFile::default())
    }
}

impl FallwatchConfig {
    /// Load from `FALLWATCH_CONFIG` (if set), then environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FALLWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        Self::finish(file_cfg.unwrap_or_default())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::finish(read_config_file(path)?)
    }

    fn finish(file: FallwatchConfigFile) -> Result<Self> {
        let mut cfg = Self::from_file(file);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FallwatchConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let events = file.events.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let privacy = file.privacy.unwrap_or_default();

        let detector_defaults = DetectorSettings::default();
        let weight_defaults = ScoringWeights::default();
        let aggregator_defaults = AggregatorSettings::default();
        let privacy_defaults = PrivacySettings::default();
        let retention_defaults = RetentionPolicy::default();

        Self {
            camera: CameraSettings {
                camera_id: camera
                    .camera_id
                    .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
                fps: camera.fps.unwrap_or(DEFAULT_FPS),
            },
            detection: DetectorSettings {
                suspected_dwell_ms: detection
                    .suspected_dwell_ms
                    .unwrap_or(detector_defaults.suspected_dwell_ms),
                recovery_dwell_ms: detection
                    .recovery_dwell_ms
                    .unwrap_or(detector_defaults.recovery_dwell_ms),
                abnormality_threshold: detection
                    .abnormality_threshold
                    .unwrap_or(detector_defaults.abnormality_threshold),
                recovery_threshold: detection
                    .recovery_threshold
                    .unwrap_or(detector_defaults.recovery_threshold),
                staleness_timeout_ms: detection
                    .staleness_timeout_ms
                    .unwrap_or(detector_defaults.staleness_timeout_ms),
                min_detection_confidence: detection
                    .min_detection_confidence
                    .unwrap_or(detector_defaults.min_detection_confidence),
                min_keypoint_confidence: detection
                    .min_keypoint_confidence
                    .unwrap_or(detector_defaults.min_keypoint_confidence),
                min_body_size_px: detection
                    .min_body_size_px
                    .unwrap_or(detector_defaults.min_body_size_px),
                subject_expiry_ms: detection
                    .subject_expiry_ms
                    .unwrap_or(detector_defaults.subject_expiry_ms),
                weights: ScoringWeights {
                    angle: detection.angle_weight.unwrap_or(weight_defaults.angle),
                    aspect: detection.aspect_weight.unwrap_or(weight_defaults.aspect),
                    drop: detection.drop_weight.unwrap_or(weight_defaults.drop),
                    drop_velocity_ref: detection
                        .drop_velocity_ref
                        .unwrap_or(weight_defaults.drop_velocity_ref),
                },
            },
            events: EventSettings {
                queue_capacity: events.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                aggregator: AggregatorSettings {
                    pre_roll_ms: events.pre_roll_ms.unwrap_or(aggregator_defaults.pre_roll_ms),
                    post_roll_ms: events.post_roll_ms.unwrap_or(aggregator_defaults.post_roll_ms),
                    max_frames_per_event: events
                        .max_frames_per_event
                        .unwrap_or(aggregator_defaults.max_frames_per_event),
                    max_event_duration_ms: events
                        .max_event_duration_ms
                        .unwrap_or(aggregator_defaults.max_event_duration_ms),
                },
                shutdown_grace: Duration::from_millis(
                    events.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
                ),
            },
            storage: StorageSettings {
                base_dir: storage
                    .base_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR)),
                save_clip: storage.save_clip.unwrap_or(true),
            },
            privacy: PrivacySettings {
                face_blur: privacy.face_blur.unwrap_or(privacy_defaults.face_blur),
                blur_kernel: privacy.blur_kernel.unwrap_or(privacy_defaults.blur_kernel),
                redact_metadata: privacy
                    .redact_metadata
                    .unwrap_or(privacy_defaults.redact_metadata),
            },
            retention: RetentionPolicy {
                retention_days: privacy
                    .retention_days
                    .unwrap_or(retention_defaults.retention_days),
                low_disk_threshold_pct: privacy
                    .low_disk_threshold_pct
                    .unwrap_or(retention_defaults.low_disk_threshold_pct),
            },
            sweep_interval: Duration::from_secs(
                file.retention
                    .and_then(|retention| retention.sweep_interval_secs)
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("FALLWATCH_BASE_DIR") {
            if !dir.trim().is_empty() {
                self.storage.base_dir = PathBuf::from(dir);
            }
        }
        if let Ok(camera_id) = std::env::var("FALLWATCH_CAMERA_ID") {
            if !camera_id.trim().is_empty() {
                self.camera.camera_id = camera_id;
            }
        }
        if let Ok(capacity) = std::env::var("FALLWATCH_QUEUE_CAPACITY") {
            self.events.queue_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("FALLWATCH_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Ok(days) = std::env::var("FALLWATCH_RETENTION_DAYS") {
            self.retention.retention_days = days
                .trim()
                .parse()
                .map_err(|_| anyhow!("FALLWATCH_RETENTION_DAYS must be an integer number of days"))?;
        }
        if let Ok(pct) = std::env::var("FALLWATCH_LOW_DISK_PCT") {
            self.retention.low_disk_threshold_pct = pct
                .trim()
                .parse()
                .map_err(|_| anyhow!("FALLWATCH_LOW_DISK_PCT must be a number"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera.camera_id = self.camera.camera_id.trim().to_lowercase();
        crate::validate_camera_id(&self.camera.camera_id)?;
        if self.camera.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        self.detection.validate()?;
        if self.events.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be at least 1"));
        }
        if self.events.aggregator.max_frames_per_event == 0 {
            return Err(anyhow!("max_frames_per_event must be at least 1"));
        }
        if self.events.aggregator.max_event_duration_ms == 0 {
            return Err(anyhow!("max_event_duration_ms must be greater than zero"));
        }
        if self.privacy.face_blur && self.privacy.blur_kernel % 2 == 0 {
            return Err(anyhow!(
                "blur_kernel must be odd (got {})",
                self.privacy.blur_kernel
            ));
        }
        self.retention.validate()?;
        if self.sweep_interval.is_zero() {
            return Err(anyhow!("sweep_interval_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        self.detection
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        self.events.aggregator
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            base_dir: self.storage.base_dir.clone(),
            save_clip: self.storage.save_clip,
            privacy: self.privacy,
            host: std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()),
        }
    }
}

fn read_config_file(path: &Path) -> Result<FallwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
