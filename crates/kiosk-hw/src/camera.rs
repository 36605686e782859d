//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture geometry; drivers may negotiate something else.
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("empty frame")]
    EmptyFrame,
}

/// Anything that yields RGB frames one at a time.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel), the common UVC webcam format.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

/// Accept either a device path or a bare index ("0" → "/dev/video0").
pub fn device_path(device: &str) -> String {
    if !device.is_empty() && device.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{device}")
    } else {
        device.to_string()
    }
}

impl Camera {
    /// Open a V4L2 camera and negotiate `width` x `height`.
    pub fn open(device: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device_path = device_path(device);
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            fourcc,
            pixel_format,
        })
    }

    /// Capture a single RGB frame. Empty and fully dark frames are errors.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        if buf.is_empty() {
            return Err(CameraError::EmptyFrame);
        }
        let rgb = self.buf_to_rgb(buf)?;
        if frame::is_dark_frame(&rgb, DARK_FRAME_THRESHOLD) {
            tracing::debug!(seq = meta.sequence, "dark frame");
            return Err(CameraError::EmptyFrame);
        }

        Frame::from_rgb(rgb, self.width, self.height, meta.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// Grab and drop `count` frames while exposure settles.
    pub fn discard(&self, count: usize) {
        if count == 0 {
            return;
        }
        tracing::info!(count, "discarding warmup frames");
        for _ in 0..count {
            let _ = self.capture_frame();
        }
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))
    }
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_from_index() {
        assert_eq!(device_path("0"), "/dev/video0");
        assert_eq!(device_path("12"), "/dev/video12");
        assert_eq!(device_path("/dev/video2"), "/dev/video2");
        assert_eq!(device_path(""), "");
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/does-not-exist", DEFAULT_WIDTH, DEFAULT_HEIGHT).err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }
}
