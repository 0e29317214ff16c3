//! On-disk media layout: snapshot and recording directories, timestamped
//! filenames. Filenames use second resolution; a second snapshot within the
//! same second overwrites the first.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Local};
use log::info;

const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];

pub struct MediaStore {
    snapshot_dir: PathBuf,
    recording_dir: PathBuf,
}

impl MediaStore {
    /// Ensure both media directories exist.
    pub fn new(snapshot_dir: &Path, recording_dir: &Path) -> Result<Self> {
        fs::create_dir_all(snapshot_dir)
            .with_context(|| format!("creating snapshot dir {}", snapshot_dir.display()))?;
        fs::create_dir_all(recording_dir)
            .with_context(|| format!("creating recording dir {}", recording_dir.display()))?;
        Ok(Self {
            snapshot_dir: snapshot_dir.to_path_buf(),
            recording_dir: recording_dir.to_path_buf(),
        })
    }

    pub fn snapshot_path(&self, at: DateTime<Local>) -> PathBuf {
        self.snapshot_dir
            .join(format!("snapshot_{}.jpg", timestamp_slug(at)))
    }

    pub fn recording_path(&self, at: DateTime<Local>) -> PathBuf {
        self.recording_dir
            .join(format!("recording_{}.avi", timestamp_slug(at)))
    }

    /// Persist already-encoded JPEG bytes as a snapshot.
    pub fn save_snapshot_jpeg(&self, jpeg: &[u8]) -> Result<PathBuf> {
        if jpeg.len() < 2 || jpeg[..2] != JPEG_MAGIC {
            return Err(anyhow!("snapshot payload is not a JPEG"));
        }
        let path = self.snapshot_path(Local::now());
        fs::write(&path, jpeg)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        info!("saved snapshot {} ({} bytes)", path.display(), jpeg.len());
        Ok(path)
    }

    /// Persist a base64-wrapped JPEG, as carried by live-view packets.
    pub fn save_snapshot_base64(&self, encoded: &str) -> Result<PathBuf> {
        let jpeg = BASE64
            .decode(encoded.trim())
            .context("snapshot payload is not valid base64")?;
        self.save_snapshot_jpeg(&jpeg)
    }
}

fn timestamp_slug(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}
