//! Camera device layer.
//!
//! The pipeline owns exactly one camera handle at a time, always on the
//! capture thread. This module provides the seams for that handle:
//!
//! - `CameraDevice`: an open handle that yields frames and can be closed.
//! - `DeviceFactory`: opens a handle for a device URI; the capture loop
//!   uses it for the initial open, ordered fallback, and reconnects.
//! - `SyntheticDevice`: deterministic in-memory source for `stub://` URIs.
//! - `V4l2Device`: real device backend behind the `device-v4l2` feature.
//!
//! The device layer MUST NOT retain frames after handing them off, and
//! MUST NOT be touched from any thread but the capture thread.

use std::time::SystemTime;

use anyhow::Result;
#[cfg(not(feature = "device-v4l2"))]
use anyhow::anyhow;

use crate::frame::Frame;

/// An open camera handle. `read_frame` blocks on the driver; `close`
/// releases the handle and is called exactly once per open.
pub trait CameraDevice: Send {
    fn read_frame(&mut self) -> Result<Frame>;
    fn close(&mut self);
    fn describe(&self) -> String;
}

/// Opens camera handles. Shared with the capture thread so reconnects can
/// reopen without involving the supervisor.
pub trait DeviceFactory: Send + Sync {
    fn open(&self, uri: &str, width: u32, height: u32) -> Result<Box<dyn CameraDevice>>;
}

/// Factory for real deployments: `stub://` URIs get a synthetic source,
/// anything else is treated as a V4L2 device node.
pub struct SystemDeviceFactory;

impl DeviceFactory for SystemDeviceFactory {
    fn open(&self, uri: &str, width: u32, height: u32) -> Result<Box<dyn CameraDevice>> {
        if uri.starts_with("stub://") {
            return Ok(Box::new(SyntheticDevice::new(uri, width, height)));
        }
        #[cfg(feature = "device-v4l2")]
        {
            Ok(Box::new(v4l2::V4l2Device::open(uri, width, height)?))
        }
        #[cfg(not(feature = "device-v4l2"))]
        {
            Err(anyhow!(
                "device '{}' requires the device-v4l2 feature (only stub:// sources are built in)",
                uri
            ))
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic device (stub://)
// ----------------------------------------------------------------------------

/// Deterministic frame generator for tests and camera-less development.
///
/// Simulates a mostly-static scene whose content shifts every 50 frames,
/// which is enough to exercise the stub detector's change detection.
pub struct SyntheticDevice {
    uri: String,
    width: u32,
    height: u32,
    frame_count: u64,
    scene_state: u8,
    closed: bool,
}

impl SyntheticDevice {
    pub fn new(uri: &str, width: u32, height: u32) -> Self {
        log::info!("SyntheticDevice: opened {} ({}x{})", uri, width, height);
        Self {
            uri: uri.to_string(),
            width,
            height,
            frame_count: 0,
            scene_state: 0,
            closed: false,
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            // Mix position, frame count and scene state; never all-zero.
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 255 + 1) as u8;
        }
        pixels
    }
}

impl CameraDevice for SyntheticDevice {
    fn read_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Frame::new(
            0,
            self.width,
            self.height,
            SystemTime::now(),
            pixels,
        ))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            log::info!("SyntheticDevice: closed {}", self.uri);
        }
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

// ----------------------------------------------------------------------------
// V4L2 device backend
// ----------------------------------------------------------------------------

#[cfg(feature = "device-v4l2")]
mod v4l2 {
    use std::time::SystemTime;

    use anyhow::{Context, Result};
    use ouroboros::self_referencing;

    use super::CameraDevice;
    use crate::frame::Frame;

    pub struct V4l2Device {
        uri: String,
        state: Option<V4l2State>,
        active_width: u32,
        active_height: u32,
    }

    #[self_referencing]
    struct V4l2State {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl V4l2Device {
        pub fn open(uri: &str, width: u32, height: u32) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device = v4l::Device::with_path(uri)
                .with_context(|| format!("open v4l2 device {}", uri))?;
            let mut format = device.format().context("read v4l2 format")?;
            format.width = width;
            format.height = height;
            format.fourcc = v4l::FourCC::new(b"RGB3");

            let format = match device.set_format(&format) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!("V4l2Device: failed to set format on {}: {}", uri, err);
                    device
                        .format()
                        .context("read v4l2 format after set failure")?
                }
            };

            let active_width = format.width;
            let active_height = format.height;

            let state = V4l2StateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            log::info!(
                "V4l2Device: opened {} ({}x{})",
                uri,
                active_width,
                active_height
            );

            Ok(Self {
                uri: uri.to_string(),
                state: Some(state),
                active_width,
                active_height,
            })
        }
    }

    impl CameraDevice for V4l2Device {
        fn read_frame(&mut self) -> Result<Frame> {
            use v4l::io::traits::CaptureStream;

            let state = self.state.as_mut().context("v4l2 device closed")?;
            let (buf, _meta) = state
                .with_mut(|fields| fields.stream.next())
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;

            Ok(Frame::new(
                0,
                self.active_width,
                self.active_height,
                SystemTime::now(),
                buf.to_vec(),
            ))
        }

        fn close(&mut self) {
            if self.state.take().is_some() {
                log::info!("V4l2Device: closed {}", self.uri);
            }
        }

        fn describe(&self) -> String {
            self.uri.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
