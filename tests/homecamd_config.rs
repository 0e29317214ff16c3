use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use homecam::config::HomecamConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "HOMECAM_CONFIG",
        "HOMECAM_DEVICE",
        "HOMECAM_SNAPSHOT_DIR",
        "HOMECAM_RECORDING_DIR",
        "HOMECAM_WATCH_LABELS",
        "HOMECAM_COOLDOWN_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "device": "/dev/video2",
        "fallback_devices": ["/dev/video0"],
        "width": 800,
        "height": 600,
        "detection": {
            "interval_ms": 120,
            "confidence_threshold": 0.6
        },
        "broadcast": {
            "width": 320,
            "height": 240,
            "jpeg_quality": 70,
            "interval_ms": 50
        },
        "recording": {
            "dir": "clips",
            "queue_capacity": 100,
            "container_fps": 25
        },
        "snapshot_dir": "stills",
        "notifications": {
            "cooldown_secs": 60,
            "watch_labels": ["person"]
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("HOMECAM_CONFIG", file.path());
    std::env::set_var("HOMECAM_DEVICE", "stub://override");
    std::env::set_var("HOMECAM_WATCH_LABELS", "person, dog ,cat");
    std::env::set_var("HOMECAM_COOLDOWN_SECS", "45");

    let cfg = HomecamConfig::load().expect("load config");

    assert_eq!(cfg.device, "stub://override");
    assert_eq!(cfg.fallback_devices, vec!["/dev/video0"]);
    assert_eq!((cfg.width, cfg.height), (800, 600));
    assert_eq!(cfg.detection.interval, Duration::from_millis(120));
    assert!((cfg.detection.confidence_threshold - 0.6).abs() < f32::EPSILON);
    assert_eq!((cfg.broadcast.width, cfg.broadcast.height), (320, 240));
    assert_eq!(cfg.broadcast.jpeg_quality, 70);
    assert_eq!(cfg.broadcast.interval, Duration::from_millis(50));
    assert_eq!(cfg.recording.dir, std::path::PathBuf::from("clips"));
    assert_eq!(cfg.recording.queue_capacity, 100);
    assert_eq!(cfg.recording.container_fps, 25);
    assert_eq!(cfg.snapshot_dir, std::path::PathBuf::from("stills"));
    assert_eq!(cfg.notifications.cooldown, Duration::from_secs(45));
    assert_eq!(cfg.notifications.watch_labels, vec!["person", "dog", "cat"]);

    clear_env();
}

#[test]
fn defaults_match_deployed_tuning() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = HomecamConfig::load().expect("load defaults");

    assert_eq!(cfg.device, "stub://front_door");
    assert_eq!((cfg.width, cfg.height), (640, 480));
    assert_eq!(cfg.detection.interval, Duration::from_millis(80));
    assert!((cfg.detection.confidence_threshold - 0.7).abs() < f32::EPSILON);
    assert_eq!((cfg.broadcast.width, cfg.broadcast.height), (480, 360));
    assert_eq!(cfg.broadcast.jpeg_quality, 65);
    assert_eq!(cfg.recording.queue_capacity, 300);
    assert_eq!(cfg.recording.first_frame_wait, Duration::from_secs(5));
    assert_eq!(cfg.recording.stop_timeout, Duration::from_secs(10));
    assert_eq!(cfg.recording.container_fps, 30);
    assert_eq!(cfg.notifications.cooldown, Duration::from_secs(30));
    assert_eq!(cfg.notifications.watch_labels, vec!["person", "dog", "cat"]);
    assert_eq!(cfg.capture.max_frame_retries, 3);
    assert_eq!(cfg.capture.staleness_timeout, Duration::from_secs(5));
    assert_eq!(cfg.capture.reconnect_backoff, Duration::from_secs(2));
    assert_eq!(cfg.capture.init_read_attempts, 5);
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "broadcast": { "jpeg_quality": 0 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("HOMECAM_CONFIG", file.path());

    assert!(HomecamConfig::load().is_err());

    std::env::remove_var("HOMECAM_CONFIG");
    std::env::set_var("HOMECAM_COOLDOWN_SECS", "not-a-number");
    assert!(HomecamConfig::load().is_err());

    clear_env();
}
