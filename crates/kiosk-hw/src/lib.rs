//! kiosk-hw — Camera capture and frame handling.
//!
//! Provides V4L2-based capture to RGB frames, region cropping and JPEG
//! encoding for upload to the recognition service.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
