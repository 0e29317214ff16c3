//! Clip recording.
//!
//! Frames are pushed into a bounded queue read by a dedicated writer
//! thread; when the queue is full the oldest queued frame is evicted so
//! the capture loop never blocks. The writer defers container creation to
//! the first frame it receives, so a recording that never sees a frame
//! leaves no file behind.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::codecs::jpeg::JpegEncoder;
use log::{info, warn};

use crate::config::RecordingSettings;
use crate::frame::Frame;

/// Poll interval for the writer thread between queue reads.
const POP_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum RecordError {
    AlreadyRecording,
    NotRecording,
    /// No frame arrived within the first-frame wait; no file was created.
    NoFrames,
    /// The writer thread did not finish within the stop timeout.
    StopTimeout,
    /// The writer thread ended without reporting a result.
    WorkerLost,
    Sink(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::AlreadyRecording => write!(f, "a recording is already in progress"),
            RecordError::NotRecording => write!(f, "no recording in progress"),
            RecordError::NoFrames => write!(f, "no frames arrived before the first-frame wait expired"),
            RecordError::StopTimeout => write!(f, "writer thread did not stop within the timeout"),
            RecordError::WorkerLost => write!(f, "writer thread ended without a result"),
            RecordError::Sink(msg) => write!(f, "video sink error: {}", msg),
        }
    }
}

impl std::error::Error for RecordError {}

/// A recording accepted for writing.
#[derive(Clone, Debug)]
pub struct RecordingSession {
    pub path: PathBuf,
    pub started_at: SystemTime,
}

/// Result of a completed recording.
#[derive(Clone, Debug)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames_written: u64,
}

/// Container writer seam. One sink per recording; created lazily from the
/// first frame's dimensions.
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finalize(&mut self) -> Result<()>;
}

pub trait SinkFactory: Send + Sync {
    fn create(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoSink>>;
}

/// Produces MJPEG-in-AVI sinks.
pub struct MjpegSinkFactory {
    pub jpeg_quality: u8,
}

impl SinkFactory for MjpegSinkFactory {
    fn create(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn VideoSink>> {
        Ok(Box::new(MjpegAviSink::create(
            path,
            width,
            height,
            fps,
            self.jpeg_quality,
        )?))
    }
}

struct ActiveRecording {
    session: RecordingSession,
    sender: Sender<Frame>,
    evict: Receiver<Frame>,
    done: Receiver<std::result::Result<RecordingSummary, RecordError>>,
    handle: JoinHandle<()>,
}

pub struct Recorder {
    settings: RecordingSettings,
    factory: Arc<dyn SinkFactory>,
    active: Option<ActiveRecording>,
}

impl Recorder {
    pub fn new(settings: RecordingSettings, factory: Arc<dyn SinkFactory>) -> Self {
        Self {
            settings,
            factory,
            active: None,
        }
    }

    pub fn is_recording(&mut self) -> bool {
        self.reap_finished();
        self.active.is_some()
    }

    /// Clear the session slot when the worker has already ended on its own
    /// (no first frame, sink failure). A session that dies this way must
    /// not block the next `start`.
    fn reap_finished(&mut self) {
        let finished = match &self.active {
            Some(active) => active.done.try_recv().ok(),
            None => return,
        };
        if let Some(result) = finished {
            if let Some(active) = self.active.take() {
                let _ = active.handle.join();
                match result {
                    Ok(summary) => info!(
                        "recording ended on its own: {} ({} frames)",
                        summary.path.display(),
                        summary.frames_written
                    ),
                    Err(err) => warn!(
                        "recording {} ended: {}",
                        active.session.path.display(),
                        err
                    ),
                }
            }
        }
    }

    /// Begin recording into `path`. Fails if a recording is in progress,
    /// including one whose stop has not yet been consumed.
    pub fn start(&mut self, path: PathBuf) -> std::result::Result<RecordingSession, RecordError> {
        self.reap_finished();
        if self.active.is_some() {
            return Err(RecordError::AlreadyRecording);
        }

        let (sender, receiver) = bounded::<Frame>(self.settings.queue_capacity);
        let (done_tx, done_rx) = bounded(1);
        let session = RecordingSession {
            path: path.clone(),
            started_at: SystemTime::now(),
        };

        let factory = Arc::clone(&self.factory);
        let fps = self.settings.container_fps;
        let first_frame_wait = self.settings.first_frame_wait;
        let worker_rx = receiver.clone();
        let handle = thread::Builder::new()
            .name("homecam-writer".to_string())
            .spawn(move || {
                let result = write_clip(worker_rx, path, fps, first_frame_wait, factory.as_ref());
                let _ = done_tx.send(result);
            })
            .map_err(|e| RecordError::Sink(format!("spawning writer thread: {}", e)))?;

        info!("recording started: {}", session.path.display());
        self.active = Some(ActiveRecording {
            session: session.clone(),
            sender,
            evict: receiver,
            done: done_rx,
            handle,
        });
        Ok(session)
    }

    /// Offer one frame to the active recording. A full queue drops the
    /// oldest queued frame; no recording in progress is a no-op.
    pub fn push_frame(&self, frame: Frame) {
        let Some(active) = &self.active else {
            return;
        };
        push_with_evict(&active.sender, &active.evict, frame);
    }

    /// Stop the active recording and wait (bounded) for the writer to
    /// drain the queue and finalize the container.
    pub fn stop(&mut self) -> std::result::Result<RecordingSummary, RecordError> {
        let active = self.active.take().ok_or(RecordError::NotRecording)?;

        // Dropping the sender disconnects the queue; the writer drains what
        // is buffered and finalizes.
        drop(active.sender);
        drop(active.evict);

        match active.done.recv_timeout(self.settings.stop_timeout) {
            Ok(result) => {
                let _ = active.handle.join();
                match &result {
                    Ok(summary) => info!(
                        "recording stopped: {} ({} frames)",
                        summary.path.display(),
                        summary.frames_written
                    ),
                    Err(err) => warn!(
                        "recording {} failed: {}",
                        active.session.path.display(),
                        err
                    ),
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "writer thread for {} still running after stop timeout",
                    active.session.path.display()
                );
                Err(RecordError::StopTimeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(RecordError::WorkerLost),
        }
    }
}

/// Non-blocking enqueue: on a full queue, evict one (the oldest) and retry
/// once. A frame that still does not fit is dropped.
fn push_with_evict(sender: &Sender<Frame>, evict: &Receiver<Frame>, frame: Frame) {
    match sender.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(frame)) => {
            let _ = evict.try_recv();
            if sender.try_send(frame).is_err() {
                warn!("recording queue full, dropping frame");
            }
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

fn write_clip(
    rx: Receiver<Frame>,
    path: PathBuf,
    fps: u32,
    first_frame_wait: Duration,
    factory: &dyn SinkFactory,
) -> std::result::Result<RecordingSummary, RecordError> {
    let first = match rx.recv_timeout(first_frame_wait) {
        Ok(frame) => frame,
        Err(_) => return Err(RecordError::NoFrames),
    };

    let mut sink = factory
        .create(&path, first.width, first.height, fps)
        .map_err(|e| RecordError::Sink(format!("{:#}", e)))?;

    let mut written = 0u64;
    let mut dropped = 0u64;
    write_one(sink.as_mut(), &first, &mut written, &mut dropped);

    loop {
        match rx.recv_timeout(POP_TIMEOUT) {
            Ok(frame) => write_one(sink.as_mut(), &frame, &mut written, &mut dropped),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    sink.finalize()
        .map_err(|e| RecordError::Sink(format!("{:#}", e)))?;
    if dropped > 0 {
        warn!("recording {}: {} frames failed to encode", path.display(), dropped);
    }
    Ok(RecordingSummary {
        path,
        frames_written: written,
    })
}

fn write_one(sink: &mut dyn VideoSink, frame: &Frame, written: &mut u64, dropped: &mut u64) {
    match sink.write_frame(frame) {
        Ok(()) => *written += 1,
        Err(err) => {
            *dropped += 1;
            warn!("failed to write frame {}: {:#}", frame.seq, err);
        }
    }
}

/// Hand-built MJPEG-in-AVI container.
///
/// Every frame is an independently decodable JPEG stored as a `00dc` chunk
/// inside the `movi` list, indexed by a trailing `idx1`. Size fields are
/// written as placeholders and patched during finalize.
pub struct MjpegAviSink {
    writer: BufWriter<File>,
    width: u32,
    height: u32,
    jpeg_quality: u8,
    riff_size_pos: u64,
    total_frames_pos: u64,
    stream_length_pos: u64,
    movi_size_pos: u64,
    /// Position of the `movi` fourcc; index offsets are relative to it.
    movi_start: u64,
    index: Vec<(u32, u32)>,
    finalized: bool,
}

const FOURCC_DATA: &[u8; 4] = b"00dc";
const AVIF_HASINDEX: u32 = 0x0010;
const AVIIF_KEYFRAME: u32 = 0x0010;

impl MjpegAviSink {
    pub fn create(path: &Path, width: u32, height: u32, fps: u32, jpeg_quality: u8) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating recording file {}", path.display()))?;
        let mut sink = Self {
            writer: BufWriter::new(file),
            width,
            height,
            jpeg_quality,
            riff_size_pos: 0,
            total_frames_pos: 0,
            stream_length_pos: 0,
            movi_size_pos: 0,
            movi_start: 0,
            index: Vec::new(),
            finalized: false,
        };
        sink.write_header(fps)?;
        Ok(sink)
    }

    fn write_header(&mut self, fps: u32) -> Result<()> {
        let fps = fps.max(1);
        // strl = "strl" + strh chunk + strf chunk.
        let strl_size: u32 = 4 + (8 + 56) + (8 + 40);
        // hdrl = "hdrl" + avih chunk + strl LIST.
        let hdrl_size: u32 = 4 + (8 + 56) + (8 + strl_size);

        self.writer.write_all(b"RIFF")?;
        self.riff_size_pos = self.writer.stream_position()?;
        self.write_u32(0)?;
        self.writer.write_all(b"AVI ")?;

        self.writer.write_all(b"LIST")?;
        self.write_u32(hdrl_size)?;
        self.writer.write_all(b"hdrl")?;

        self.writer.write_all(b"avih")?;
        self.write_u32(56)?;
        self.write_u32(1_000_000 / fps)?; // microseconds per frame
        self.write_u32(0)?; // max bytes per second
        self.write_u32(0)?; // padding granularity
        self.write_u32(AVIF_HASINDEX)?;
        self.total_frames_pos = self.writer.stream_position()?;
        self.write_u32(0)?;
        self.write_u32(0)?; // initial frames
        self.write_u32(1)?; // stream count
        self.write_u32(0)?; // suggested buffer size
        self.write_u32(self.width)?;
        self.write_u32(self.height)?;
        for _ in 0..4 {
            self.write_u32(0)?; // reserved
        }

        self.writer.write_all(b"LIST")?;
        self.write_u32(strl_size)?;
        self.writer.write_all(b"strl")?;

        self.writer.write_all(b"strh")?;
        self.write_u32(56)?;
        self.writer.write_all(b"vids")?;
        self.writer.write_all(b"MJPG")?;
        self.write_u32(0)?; // flags
        self.write_u16(0)?; // priority
        self.write_u16(0)?; // language
        self.write_u32(0)?; // initial frames
        self.write_u32(1)?; // scale
        self.write_u32(fps)?; // rate; rate/scale = fps
        self.write_u32(0)?; // start
        self.stream_length_pos = self.writer.stream_position()?;
        self.write_u32(0)?;
        self.write_u32(0)?; // suggested buffer size
        self.write_u32(u32::MAX)?; // quality: default
        self.write_u32(0)?; // sample size
        self.write_u16(0)?; // frame rect
        self.write_u16(0)?;
        self.write_u16(self.width as u16)?;
        self.write_u16(self.height as u16)?;

        self.writer.write_all(b"strf")?;
        self.write_u32(40)?;
        self.write_u32(40)?; // BITMAPINFOHEADER size
        self.write_u32(self.width)?;
        self.write_u32(self.height)?;
        self.write_u16(1)?; // planes
        self.write_u16(24)?; // bits per pixel
        self.writer.write_all(b"MJPG")?; // compression
        self.write_u32(self.width * self.height * 3)?;
        for _ in 0..4 {
            self.write_u32(0)?; // resolution and palette fields
        }

        self.writer.write_all(b"LIST")?;
        self.movi_size_pos = self.writer.stream_position()?;
        self.write_u32(0)?;
        self.movi_start = self.writer.stream_position()?;
        self.writer.write_all(b"movi")?;
        Ok(())
    }

    fn write_u32(&mut self, value: u32) -> std::io::Result<()> {
        self.writer.write_all(&value.to_le_bytes())
    }

    fn write_u16(&mut self, value: u16) -> std::io::Result<()> {
        self.writer.write_all(&value.to_le_bytes())
    }

    fn patch_u32(&mut self, pos: u64, value: u32) -> std::io::Result<()> {
        self.writer.seek(SeekFrom::Start(pos))?;
        self.writer.write_all(&value.to_le_bytes())
    }
}

impl VideoSink for MjpegAviSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(anyhow::anyhow!(
                "frame is {}x{}, container is {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        let image = frame.to_rgb_image()?;
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode_image(&image)
            .context("jpeg encode")?;

        let chunk_pos = self.writer.stream_position()?;
        let offset = (chunk_pos - self.movi_start) as u32;
        self.writer.write_all(FOURCC_DATA)?;
        self.write_u32(jpeg.len() as u32)?;
        self.writer.write_all(&jpeg)?;
        if jpeg.len() % 2 == 1 {
            self.writer.write_all(&[0])?; // chunks are word-aligned
        }
        self.index.push((offset, jpeg.len() as u32));
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let movi_end = self.writer.stream_position()?;

        self.writer.write_all(b"idx1")?;
        self.write_u32(self.index.len() as u32 * 16)?;
        let entries = std::mem::take(&mut self.index);
        for (offset, size) in &entries {
            self.writer.write_all(FOURCC_DATA)?;
            self.write_u32(AVIIF_KEYFRAME)?;
            self.write_u32(*offset)?;
            self.write_u32(*size)?;
        }

        let file_end = self.writer.stream_position()?;
        let frames = entries.len() as u32;
        self.patch_u32(self.riff_size_pos, (file_end - 8) as u32)?;
        self.patch_u32(self.total_frames_pos, frames)?;
        self.patch_u32(self.stream_length_pos, frames)?;
        self.patch_u32(self.movi_size_pos, (movi_end - self.movi_start) as u32)?;
        self.writer.seek(SeekFrom::Start(file_end))?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn frame(seq: u64, width: u32, height: u32) -> Frame {
        let shade = (seq % 200) as u8 + 20;
        Frame::new(
            seq,
            width,
            height,
            SystemTime::now(),
            vec![shade; (width * height * 3) as usize],
        )
    }

    fn settings(dir: &Path) -> RecordingSettings {
        RecordingSettings {
            dir: dir.to_path_buf(),
            queue_capacity: 16,
            first_frame_wait: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
            container_fps: 30,
        }
    }

    fn recorder(dir: &Path) -> Recorder {
        Recorder::new(
            settings(dir),
            Arc::new(MjpegSinkFactory { jpeg_quality: 80 }),
        )
    }

    fn read_u32(bytes: &[u8], pos: usize) -> u32 {
        u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
    }

    #[test]
    fn avi_container_layout_is_consistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut sink = MjpegAviSink::create(&path, 16, 12, 30, 80).unwrap();
        sink.write_frame(&frame(1, 16, 12)).unwrap();
        sink.write_frame(&frame(2, 16, 12)).unwrap();
        sink.finalize().unwrap();
        drop(sink);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(read_u32(&bytes, 32), 1_000_000 / 30, "us per frame");
        assert_eq!(read_u32(&bytes, 48), 2, "total frames");
        assert!(bytes.windows(4).any(|w| w == b"movi"));
        assert!(bytes.windows(4).any(|w| w == b"idx1"));
        assert!(bytes.windows(4).any(|w| w == b"MJPG"));
    }

    #[test]
    fn sink_rejects_mismatched_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut sink = MjpegAviSink::create(&path, 16, 12, 30, 80).unwrap();
        assert!(sink.write_frame(&frame(1, 8, 8)).is_err());
    }

    #[test]
    fn records_pushed_frames_to_disk() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let path = dir.path().join("clip.avi");

        rec.start(path.clone()).unwrap();
        assert!(rec.is_recording());
        for seq in 1..=5 {
            rec.push_frame(frame(seq, 16, 12));
        }
        let summary = rec.stop().unwrap();
        assert!(!rec.is_recording());
        assert_eq!(summary.frames_written, 5);
        assert!(path.is_file());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        rec.start(dir.path().join("a.avi")).unwrap();
        assert!(matches!(
            rec.start(dir.path().join("b.avi")),
            Err(RecordError::AlreadyRecording)
        ));
        rec.push_frame(frame(1, 16, 12));
        rec.stop().unwrap();
    }

    #[test]
    fn stop_without_start_fails() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        assert!(matches!(rec.stop(), Err(RecordError::NotRecording)));
    }

    #[test]
    fn frameless_session_fails_closed_and_frees_the_slot() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.first_frame_wait = Duration::from_millis(30);
        let mut rec = Recorder::new(
            settings,
            Arc::new(MjpegSinkFactory { jpeg_quality: 80 }),
        );

        let dead = dir.path().join("dead.avi");
        rec.start(dead.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        // The worker gave up waiting for a first frame; the session clears
        // itself without an explicit stop.
        assert!(!rec.is_recording());
        assert!(!dead.exists());

        rec.start(dir.path().join("next.avi")).unwrap();
        rec.push_frame(frame(1, 16, 12));
        assert_eq!(rec.stop().unwrap().frames_written, 1);
    }

    #[test]
    fn no_frames_leaves_no_file() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path());
        let path = dir.path().join("empty.avi");
        rec.start(path.clone()).unwrap();
        assert!(matches!(rec.stop(), Err(RecordError::NoFrames)));
        assert!(!path.exists());
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let (tx, rx) = bounded::<Frame>(2);
        push_with_evict(&tx, &rx, frame(1, 4, 4));
        push_with_evict(&tx, &rx, frame(2, 4, 4));
        push_with_evict(&tx, &rx, frame(3, 4, 4));

        let remaining: Vec<u64> = rx.try_iter().map(|f| f.seq).collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    /// Sink double that records written sequence numbers.
    struct RecordingSink(Arc<Mutex<Vec<u64>>>);

    impl VideoSink for RecordingSink {
        fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            self.0.lock().unwrap().push(frame.seq);
            Ok(())
        }

        fn finalize(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingSinkFactory(Arc<Mutex<Vec<u64>>>);

    impl SinkFactory for RecordingSinkFactory {
        fn create(&self, _: &Path, _: u32, _: u32, _: u32) -> Result<Box<dyn VideoSink>> {
            Ok(Box::new(RecordingSink(Arc::clone(&self.0))))
        }
    }

    #[test]
    fn frames_reach_the_sink_in_order() {
        let dir = tempdir().unwrap();
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut rec = Recorder::new(
            settings(dir.path()),
            Arc::new(RecordingSinkFactory(Arc::clone(&written))),
        );

        rec.start(dir.path().join("clip.avi")).unwrap();
        for seq in 1..=4 {
            rec.push_frame(frame(seq, 16, 12));
        }
        rec.stop().unwrap();
        assert_eq!(*written.lock().unwrap(), vec![1, 2, 3, 4]);
    }
}
