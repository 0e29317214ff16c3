use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DEVICE: &str = "stub://front_door";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_DETECTION_INTERVAL_MS: u64 = 80;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;
const DEFAULT_BROADCAST_WIDTH: u32 = 480;
const DEFAULT_BROADCAST_HEIGHT: u32 = 360;
const DEFAULT_JPEG_QUALITY: u8 = 65;
const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 33;
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_RECORDING_DIR: &str = "recordings";
const DEFAULT_QUEUE_CAPACITY: usize = 300;
const DEFAULT_FIRST_FRAME_WAIT_SECS: u64 = 5;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONTAINER_FPS: u32 = 30;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_MAX_FRAME_RETRIES: u32 = 3;
const DEFAULT_STALENESS_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 2;
const DEFAULT_INIT_READ_ATTEMPTS: u32 = 5;

fn default_watch_labels() -> Vec<String> {
    vec!["person".to_string(), "dog".to_string(), "cat".to_string()]
}

#[derive(Debug, Deserialize, Default)]
struct HomecamConfigFile {
    device: Option<String>,
    fallback_devices: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    detection: Option<DetectionConfigFile>,
    broadcast: Option<BroadcastConfigFile>,
    recording: Option<RecordingConfigFile>,
    snapshot_dir: Option<PathBuf>,
    notifications: Option<NotifyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    interval_ms: Option<u64>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct BroadcastConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    dir: Option<PathBuf>,
    queue_capacity: Option<usize>,
    container_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    cooldown_secs: Option<u64>,
    watch_labels: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct HomecamConfig {
    /// Primary device URI (e.g. "/dev/video0" or "stub://front_door").
    pub device: String,
    /// Ordered fallback devices tried when the primary fails to open.
    pub fallback_devices: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub detection: DetectionSettings,
    pub broadcast: BroadcastSettings,
    pub recording: RecordingSettings,
    pub snapshot_dir: PathBuf,
    pub notifications: NotifySettings,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Minimum interval between detector invocations; ticks inside the
    /// interval reuse the previous detection set.
    pub interval: Duration,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    /// Per-tick pacing sleep; caps the outbound emit rate.
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub dir: PathBuf,
    pub queue_capacity: usize,
    pub first_frame_wait: Duration,
    pub stop_timeout: Duration,
    pub container_fps: u32,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub cooldown: Duration,
    pub watch_labels: Vec<String>,
}

/// Reconnect-machine thresholds. Defaults match the deployed tuning; tests
/// shrink them to keep scenarios fast.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Consecutive invalid reads tolerated in `Degraded` before reconnect.
    pub max_frame_retries: u32,
    /// Maximum time without a valid frame before forcing a reconnect.
    pub staleness_timeout: Duration,
    /// Sleep between failed reopen attempts while `Reconnecting`.
    pub reconnect_backoff: Duration,
    /// Read attempts allowed for a freshly opened device to produce one
    /// valid frame.
    pub init_read_attempts: u32,
    pub init_read_backoff: Duration,
    pub health_log_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_frame_retries: DEFAULT_MAX_FRAME_RETRIES,
            staleness_timeout: Duration::from_secs(DEFAULT_STALENESS_TIMEOUT_SECS),
            reconnect_backoff: Duration::from_secs(DEFAULT_RECONNECT_BACKOFF_SECS),
            init_read_attempts: DEFAULT_INIT_READ_ATTEMPTS,
            init_read_backoff: Duration::from_millis(100),
            health_log_interval: Duration::from_secs(5),
        }
    }
}

impl Default for HomecamConfig {
    fn default() -> Self {
        Self::from_file(HomecamConfigFile::default())
    }
}

impl HomecamConfig {
    /// Load configuration from the file named by `HOMECAM_CONFIG` (if set),
    /// apply `HOMECAM_*` env overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HOMECAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HomecamConfigFile) -> Self {
        let detection = DetectionSettings {
            interval: Duration::from_millis(
                file.detection
                    .as_ref()
                    .and_then(|d| d.interval_ms)
                    .unwrap_or(DEFAULT_DETECTION_INTERVAL_MS),
            ),
            confidence_threshold: file
                .detection
                .as_ref()
                .and_then(|d| d.confidence_threshold)
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
        };
        let broadcast = BroadcastSettings {
            width: file
                .broadcast
                .as_ref()
                .and_then(|b| b.width)
                .unwrap_or(DEFAULT_BROADCAST_WIDTH),
            height: file
                .broadcast
                .as_ref()
                .and_then(|b| b.height)
                .unwrap_or(DEFAULT_BROADCAST_HEIGHT),
            jpeg_quality: file
                .broadcast
                .as_ref()
                .and_then(|b| b.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
            interval: Duration::from_millis(
                file.broadcast
                    .as_ref()
                    .and_then(|b| b.interval_ms)
                    .unwrap_or(DEFAULT_BROADCAST_INTERVAL_MS),
            ),
        };
        let recording = RecordingSettings {
            dir: file
                .recording
                .as_ref()
                .and_then(|r| r.dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDING_DIR)),
            queue_capacity: file
                .recording
                .as_ref()
                .and_then(|r| r.queue_capacity)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            first_frame_wait: Duration::from_secs(DEFAULT_FIRST_FRAME_WAIT_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            container_fps: file
                .recording
                .and_then(|r| r.container_fps)
                .unwrap_or(DEFAULT_CONTAINER_FPS),
        };
        let notifications = NotifySettings {
            cooldown: Duration::from_secs(
                file.notifications
                    .as_ref()
                    .and_then(|n| n.cooldown_secs)
                    .unwrap_or(DEFAULT_COOLDOWN_SECS),
            ),
            watch_labels: file
                .notifications
                .and_then(|n| n.watch_labels)
                .unwrap_or_else(default_watch_labels),
        };
        Self {
            device: file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            fallback_devices: file.fallback_devices.unwrap_or_default(),
            width: file.width.unwrap_or(DEFAULT_WIDTH),
            height: file.height.unwrap_or(DEFAULT_HEIGHT),
            detection,
            broadcast,
            recording,
            snapshot_dir: file
                .snapshot_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            notifications,
            capture: CaptureSettings::default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("HOMECAM_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Ok(dir) = std::env::var("HOMECAM_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("HOMECAM_RECORDING_DIR") {
            if !dir.trim().is_empty() {
                self.recording.dir = PathBuf::from(dir);
            }
        }
        if let Ok(labels) = std::env::var("HOMECAM_WATCH_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.notifications.watch_labels = parsed;
            }
        }
        if let Ok(cooldown) = std::env::var("HOMECAM_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("HOMECAM_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.notifications.cooldown = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("capture resolution must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        if !(1..=100).contains(&self.broadcast.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.recording.queue_capacity == 0 {
            return Err(anyhow!("recording queue_capacity must be greater than zero"));
        }
        if self.recording.container_fps == 0 {
            return Err(anyhow!("recording container_fps must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<HomecamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
