//! Capture loop and pipeline supervisor.
//!
//! The capture thread is the only owner of the camera handle. Per tick it
//! reads a frame, runs the detection scheduler, offers the raw frame to
//! the recorder, evaluates notifications, and publishes the annotated
//! frame to the live view. Invalid reads drive a reconnect state machine
//! instead of killing the loop; only `stop()` ends it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use log::{error, info, warn};

use crate::broadcast::{BroadcastSink, FrameTransport, LogTransport};
use crate::config::{CaptureSettings, HomecamConfig};
use crate::detect::{DetectionScheduler, DetectorBackend, StubBackend, TickOutput};
use crate::device::{CameraDevice, DeviceFactory, SystemDeviceFactory};
use crate::notify::{LogNotifier, NotificationGate, Notifier};
use crate::record::{
    MjpegSinkFactory, RecordError, Recorder, RecordingSession, RecordingSummary, SinkFactory,
};
use crate::storage::MediaStore;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Camera lifecycle as observed from outside the capture thread.
///
/// Written only by the capture thread (and by `start` for the initial
/// `Initializing`); everyone else reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CameraState {
    Uninitialized = 0,
    Initializing = 1,
    Running = 2,
    /// Reads are failing but the retry budget is not exhausted.
    Degraded = 3,
    Reconnecting = 4,
    Stopped = 5,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraState::Uninitialized => "uninitialized",
            CameraState::Initializing => "initializing",
            CameraState::Running => "running",
            CameraState::Degraded => "degraded",
            CameraState::Reconnecting => "reconnecting",
            CameraState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lock-free state cell shared between the capture thread and observers.
pub struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(CameraState::Uninitialized as u8))
    }

    fn set(&self, state: CameraState) {
        let prev = self.0.swap(state as u8, Ordering::SeqCst);
        if prev != state as u8 {
            info!("camera state: {} -> {}", decode_state(prev), state);
        }
    }

    pub fn get(&self) -> CameraState {
        decode_state(self.0.load(Ordering::SeqCst))
    }
}

fn decode_state(raw: u8) -> CameraState {
    match raw {
        1 => CameraState::Initializing,
        2 => CameraState::Running,
        3 => CameraState::Degraded,
        4 => CameraState::Reconnecting,
        5 => CameraState::Stopped,
        _ => CameraState::Uninitialized,
    }
}

/// Pluggable seams of the pipeline. Production uses the defaults; tests
/// substitute scripted doubles.
pub struct PipelineParts {
    pub device_factory: Arc<dyn DeviceFactory>,
    pub backend: Box<dyn DetectorBackend>,
    pub transport: Box<dyn FrameTransport>,
    pub notifier: Box<dyn Notifier>,
    pub sink_factory: Arc<dyn SinkFactory>,
}

impl PipelineParts {
    pub fn defaults(config: &HomecamConfig) -> Self {
        Self {
            device_factory: Arc::new(SystemDeviceFactory),
            backend: Box::new(StubBackend::new()),
            transport: Box::new(LogTransport),
            notifier: Box::new(LogNotifier),
            sink_factory: Arc::new(MjpegSinkFactory {
                jpeg_quality: config.broadcast.jpeg_quality,
            }),
        }
    }
}

pub struct Pipeline {
    config: HomecamConfig,
    parts: Option<PipelineParts>,
    state: Arc<StateCell>,
    shutdown: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<TickOutput>>>,
    recorder: Arc<Mutex<Recorder>>,
    store: MediaStore,
    handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(config: HomecamConfig, parts: PipelineParts) -> Result<Self> {
        let store = MediaStore::new(&config.snapshot_dir, &config.recording.dir)?;
        let recorder = Recorder::new(config.recording.clone(), Arc::clone(&parts.sink_factory));
        Ok(Self {
            config,
            parts: Some(parts),
            state: Arc::new(StateCell::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            latest: Arc::new(Mutex::new(None)),
            recorder: Arc::new(Mutex::new(recorder)),
            store,
            handle: None,
        })
    }

    /// Open the camera and warm up the detector, then spawn the capture
    /// thread. A camera or detector that cannot be brought up makes start
    /// fail synchronously; no thread is left behind.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(anyhow!("pipeline already started"));
        }
        let parts = self
            .parts
            .take()
            .ok_or_else(|| anyhow!("pipeline cannot be restarted"))?;

        self.state.set(CameraState::Initializing);
        let uris = self.device_uris();
        let mut device = match open_any(
            parts.device_factory.as_ref(),
            &uris,
            self.config.width,
            self.config.height,
            &self.config.capture,
            &self.shutdown,
        ) {
            Some(device) => device,
            None => {
                self.state.set(CameraState::Stopped);
                return Err(anyhow!("no camera device could be opened (tried {:?})", uris));
            }
        };

        let mut scheduler = DetectionScheduler::new(
            parts.backend,
            self.config.detection.interval,
            self.config.detection.confidence_threshold,
        );
        if let Err(err) = scheduler.warm_up() {
            device.close();
            self.state.set(CameraState::Stopped);
            return Err(err).context("detector warm-up failed");
        }
        info!(
            "pipeline starting: device {}, detector '{}'",
            device.describe(),
            scheduler.backend_name()
        );

        let worker = CaptureWorker {
            device,
            factory: parts.device_factory,
            uris,
            width: self.config.width,
            height: self.config.height,
            scheduler,
            broadcast: BroadcastSink::new(self.config.broadcast.clone(), parts.transport),
            gate: NotificationGate::new(&self.config.notifications, parts.notifier),
            recorder: Arc::clone(&self.recorder),
            latest: Arc::clone(&self.latest),
            state: Arc::clone(&self.state),
            shutdown: Arc::clone(&self.shutdown),
            settings: self.config.capture.clone(),
            pace: self.config.broadcast.interval,
        };

        let handle = thread::Builder::new()
            .name("homecam-capture".to_string())
            .spawn(move || worker.run())
            .context("spawning capture thread")?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the capture thread and finish any active recording. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
        // Stopped regardless of how far start() ever got.
        self.state.set(CameraState::Stopped);
        let mut recorder = lock(&self.recorder);
        if recorder.is_recording() {
            match recorder.stop() {
                Ok(summary) => info!(
                    "recording closed on shutdown: {}",
                    summary.path.display()
                ),
                Err(err) => warn!("closing recording on shutdown: {}", err),
            }
        }
    }

    pub fn camera_state(&self) -> CameraState {
        self.state.get()
    }

    /// Most recent tick (annotated frame + detections), if any tick has
    /// completed yet.
    pub fn latest_tick(&self) -> Option<TickOutput> {
        lock(&self.latest).clone()
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.recorder).is_recording()
    }

    pub fn start_recording(&self) -> std::result::Result<RecordingSession, RecordError> {
        let path = self.store.recording_path(Local::now());
        lock(&self.recorder).start(path)
    }

    pub fn stop_recording(&self) -> std::result::Result<RecordingSummary, RecordError> {
        lock(&self.recorder).stop()
    }

    /// Persist a base64-encoded JPEG supplied by the transport layer.
    pub fn save_snapshot(&self, encoded: &str) -> Result<std::path::PathBuf> {
        self.store.save_snapshot_base64(encoded)
    }

    /// Encode the latest annotated frame as JPEG and persist it.
    pub fn snapshot(&self) -> Result<std::path::PathBuf> {
        let tick = self
            .latest_tick()
            .ok_or_else(|| anyhow!("no frame captured yet"))?;
        let image = tick.annotated.to_rgb_image()?;
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.config.broadcast.jpeg_quality)
            .encode_image(&image)
            .context("jpeg encode")?;
        self.store.save_snapshot_jpeg(&jpeg)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct CaptureWorker {
    device: Box<dyn CameraDevice>,
    factory: Arc<dyn DeviceFactory>,
    uris: Vec<String>,
    width: u32,
    height: u32,
    scheduler: DetectionScheduler,
    broadcast: BroadcastSink,
    gate: NotificationGate,
    recorder: Arc<Mutex<Recorder>>,
    latest: Arc<Mutex<Option<TickOutput>>>,
    state: Arc<StateCell>,
    shutdown: Arc<AtomicBool>,
    settings: CaptureSettings,
    pace: Duration,
}

impl CaptureWorker {
    fn run(mut self) {
        self.state.set(CameraState::Running);
        let mut seq: u64 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut last_valid = Instant::now();
        let mut last_health_log = Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            let tick_started = Instant::now();
            let read = self.device.read_frame();
            let now = Instant::now();

            match read {
                Ok(mut frame) if frame.is_valid() => {
                    consecutive_failures = 0;
                    last_valid = now;
                    self.state.set(CameraState::Running);
                    seq += 1;
                    frame.seq = seq;

                    let out = self.scheduler.process(&frame, now);
                    *lock(&self.latest) = Some(out.clone());
                    // Recordings get the capture output untouched; overlays
                    // exist only on the live view.
                    lock(&self.recorder).push_frame(frame.clone());
                    self.gate.process(&out.detections, now);
                    self.broadcast.publish(&out, now);

                    if now.duration_since(last_health_log) >= self.settings.health_log_interval {
                        last_health_log = now;
                        info!("capture healthy: {} frames", seq);
                    }
                }
                read => {
                    consecutive_failures += 1;
                    match read {
                        Ok(_) => warn!(
                            "invalid frame from {} ({} consecutive)",
                            self.device.describe(),
                            consecutive_failures
                        ),
                        Err(err) => warn!(
                            "read failed on {} ({} consecutive): {:#}",
                            self.device.describe(),
                            consecutive_failures,
                            err
                        ),
                    }
                    self.state.set(CameraState::Degraded);

                    let stale = now.duration_since(last_valid) >= self.settings.staleness_timeout;
                    if consecutive_failures > self.settings.max_frame_retries || stale {
                        if self.reconnect() {
                            consecutive_failures = 0;
                            last_valid = Instant::now();
                        }
                    } else {
                        sleep_until_shutdown(&self.shutdown, self.settings.init_read_backoff);
                    }
                }
            }

            let elapsed = tick_started.elapsed();
            if elapsed < self.pace {
                sleep_until_shutdown(&self.shutdown, self.pace - elapsed);
            }
        }

        self.device.close();
        self.state.set(CameraState::Stopped);
    }

    /// Close the dead handle and cycle through the device list until one
    /// opens and warms up, backing off between full passes. Returns false
    /// only when shutdown interrupts the attempt.
    fn reconnect(&mut self) -> bool {
        self.state.set(CameraState::Reconnecting);
        self.broadcast
            .publish_error("camera lost, attempting to reconnect");
        self.device.close();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            self.state.set(CameraState::Initializing);
            if let Some(device) = open_any(
                self.factory.as_ref(),
                &self.uris,
                self.width,
                self.height,
                &self.settings,
                &self.shutdown,
            ) {
                info!("reconnected to {}", device.describe());
                self.device = device;
                self.state.set(CameraState::Running);
                return true;
            }
            self.state.set(CameraState::Reconnecting);
            sleep_until_shutdown(&self.shutdown, self.settings.reconnect_backoff);
        }
    }
}

/// Try each device URI in order; the first that opens and produces a valid
/// frame within the init read budget wins. Returns None when every URI
/// failed one pass or shutdown was requested.
fn open_any(
    factory: &dyn DeviceFactory,
    uris: &[String],
    width: u32,
    height: u32,
    settings: &CaptureSettings,
    shutdown: &AtomicBool,
) -> Option<Box<dyn CameraDevice>> {
    for uri in uris {
        if shutdown.load(Ordering::SeqCst) {
            return None;
        }
        match open_and_warm(factory, uri, width, height, settings) {
            Ok(device) => return Some(device),
            Err(err) => warn!("device {} unavailable: {:#}", uri, err),
        }
    }
    None
}

fn open_and_warm(
    factory: &dyn DeviceFactory,
    uri: &str,
    width: u32,
    height: u32,
    settings: &CaptureSettings,
) -> Result<Box<dyn CameraDevice>> {
    let mut device = factory.open(uri, width, height)?;
    for attempt in 1..=settings.init_read_attempts {
        match device.read_frame() {
            Ok(frame) if frame.is_valid() => return Ok(device),
            Ok(_) => warn!("warm-up frame {} from {} invalid", attempt, uri),
            Err(err) => warn!("warm-up read {} from {} failed: {:#}", attempt, uri, err),
        }
        thread::sleep(settings.init_read_backoff);
    }
    device.close();
    Err(anyhow!(
        "{} produced no valid frame in {} attempts",
        uri,
        settings.init_read_attempts
    ))
}

impl Pipeline {
    fn device_uris(&self) -> Vec<String> {
        let mut uris = vec![self.config.device.clone()];
        for fallback in &self.config.fallback_devices {
            if !uris.contains(fallback) {
                uris.push(fallback.clone());
            }
        }
        uris
    }
}

/// Sleep in short slices so shutdown is honored within ~50ms regardless of
/// the nominal duration.
fn sleep_until_shutdown(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(SHUTDOWN_POLL));
    }
}
