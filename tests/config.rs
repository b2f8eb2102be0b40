use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use fallwatch::config::FallwatchConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FALLWATCH_CONFIG",
        "FALLWATCH_BASE_DIR",
        "FALLWATCH_CAMERA_ID",
        "FALLWATCH_QUEUE_CAPACITY",
        "FALLWATCH_RETENTION_DAYS",
        "FALLWATCH_LOW_DISK_PCT",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = FallwatchConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.camera_id, "cam01");
    assert_eq!(cfg.camera.fps, 30);
    assert_eq!(cfg.detection.suspected_dwell_ms, 500);
    assert_eq!(cfg.detection.recovery_dwell_ms, 1_000);
    assert_eq!(cfg.detection.abnormality_threshold, 0.6);
    assert_eq!(cfg.detection.recovery_threshold, 0.4);
    assert_eq!(cfg.events.queue_capacity, 16);
    assert_eq!(cfg.events.aggregator.pre_roll_ms, 2_000);
    assert_eq!(cfg.events.aggregator.post_roll_ms, 3_000);
    assert_eq!(cfg.detection.min_body_size_px, 120.0);
    assert_eq!(cfg.events.shutdown_grace, Duration::from_secs(3));
    assert_eq!(cfg.storage.base_dir.to_str(), Some("./falls"));
    assert!(cfg.privacy.face_blur);
    assert!(cfg.privacy.redact_metadata);
    assert_eq!(cfg.retention.retention_days, 30);
    assert_eq!(cfg.retention.low_disk_threshold_pct, 5.0);
    assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "camera": { "camera_id": "Ward3", "fps": 15 },
            "detection": {
                "suspected_dwell_ms": 800,
                "abnormality_threshold": 0.7,
                "recovery_threshold": 0.35,
                "angle_weight": 0.6,
                "min_body_size_px": 80
            },
            "events": { "queue_capacity": 8, "pre_roll_ms": 3000, "post_roll_ms": 0 },
            "storage": { "base_dir": "/srv/falls", "save_clip": false },
            "privacy": { "redact_metadata": false, "retention_days": 14 }
        }"#,
    );
    std::env::set_var("FALLWATCH_CONFIG", file.path());
    std::env::set_var("FALLWATCH_QUEUE_CAPACITY", "4");
    std::env::set_var("FALLWATCH_LOW_DISK_PCT", "12.5");

    let cfg = FallwatchConfig::load().expect("load config");
    assert_eq!(cfg.camera.camera_id, "ward3");
    assert_eq!(cfg.camera.fps, 15);
    assert_eq!(cfg.detection.suspected_dwell_ms, 800);
    assert_eq!(cfg.detection.recovery_dwell_ms, 1_000);
    assert_eq!(cfg.detection.weights.angle, 0.6);
    assert_eq!(cfg.events.queue_capacity, 4);
    assert_eq!(cfg.events.aggregator.pre_roll_ms, 3_000);
    assert_eq!(cfg.events.aggregator.post_roll_ms, 0);
    assert_eq!(cfg.detection.min_body_size_px, 80.0);
    assert_eq!(cfg.storage.base_dir.to_str(), Some("/srv/falls"));
    assert!(!cfg.storage.save_clip);
    assert!(!cfg.privacy.redact_metadata);
    assert_eq!(cfg.retention_policy().retention_days, 14);
    assert_eq!(cfg.retention_policy().low_disk_threshold_pct, 12.5);
    assert_eq!(cfg.sink_settings().base_dir.to_str(), Some("/srv/falls"));

    clear_env();
}

#[test]
fn loads_toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = config_file(
        ".toml",
        r#"
[camera]
camera_id = "hall-2"

[retention]
sweep_interval_secs = 60

[privacy]
blur_kernel = 15
"#,
    );
    let cfg = FallwatchConfig::from_path(file.path()).expect("load toml");
    assert_eq!(cfg.camera.camera_id, "hall-2");
    assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
    assert_eq!(cfg.privacy.blur_kernel, 15);
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    for body in [
        // Empty hysteresis band.
        r#"{ "detection": { "abnormality_threshold": 0.5, "recovery_threshold": 0.5 } }"#,
        r#"{ "detection": { "suspected_dwell_ms": 0 } }"#,
        r#"{ "detection": { "abnormality_threshold": 1.5 } }"#,
        r#"{ "detection": { "min_body_size_px": -1.0 } }"#,
        r#"{ "events": { "queue_capacity": 0 } }"#,
        r#"{ "camera": { "camera_id": "../etc" } }"#,
        r#"{ "privacy": { "retention_days": 0 } }"#,
        r#"{ "privacy": { "low_disk_threshold_pct": 100.0 } }"#,
        r#"{ "privacy": { "blur_kernel": 30 } }"#,
    ] {
        let file = config_file(".json", body);
        assert!(
            FallwatchConfig::from_path(file.path()).is_err(),
            "accepted {body}"
        );
    }

    std::env::set_var("FALLWATCH_RETENTION_DAYS", "thirty");
    assert!(FallwatchConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("FALLWATCH_CONFIG", "/nonexistent/fallwatch.json");
    let err = FallwatchConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
    clear_env();
}
