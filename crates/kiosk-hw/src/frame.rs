//! Frame type and pixel conversions — YUYV/GREY to RGB, dark detection, crop, JPEG.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::time::SystemTime;

const RGB_CHANNELS: usize = 3;

/// A captured camera frame in packed 8-bit RGB.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock time the frame was dequeued.
    pub captured_at: SystemTime,
    pub sequence: u32,
}

impl Frame {
    /// Wrap packed RGB data, checking its length against the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: SystemTime::now(),
            sequence,
        })
    }

    /// Copy out the region `x0..x1` by `y0..y1`.
    pub fn crop(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Frame, FrameError> {
        if x1 <= x0 || y1 <= y0 || x1 > self.width || y1 > self.height {
            return Err(FrameError::InvalidRegion {
                x0,
                y0,
                x1,
                y1,
                width: self.width,
                height: self.height,
            });
        }

        let row_bytes = self.width as usize * RGB_CHANNELS;
        let start = x0 as usize * RGB_CHANNELS;
        let end = x1 as usize * RGB_CHANNELS;
        let mut data = Vec::with_capacity(rgb_len(x1 - x0, y1 - y0));
        for y in y0 as usize..y1 as usize {
            let row = &self.data[y * row_bytes..(y + 1) * row_bytes];
            data.extend_from_slice(&row[start..end]);
        }

        Ok(Frame {
            data,
            width: x1 - x0,
            height: y1 - y0,
            captured_at: self.captured_at,
            sequence: self.sequence,
        })
    }

    /// Encode as baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            &self.data,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * RGB_CHANNELS
}

fn luma(px: &[u8]) -> f32 {
    0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], sharing chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(rgb_len(width, height));
    for quad in yuyv[..expected].chunks_exact(4) {
        let d = quad[1] as i32 - 128;
        let e = quad[3] as i32 - 128;
        for y in [quad[0], quad[2]] {
            let c = y as i32 - 16;
            rgb.push(clamp_u8((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c + 516 * d + 128) >> 8));
        }
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    if grey.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: grey.len(),
        });
    }
    Ok(grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect())
}

/// True if more than `threshold_pct` of the pixels have luma below 32.
pub fn is_dark_frame(rgb: &[u8], threshold_pct: f32) -> bool {
    let pixels = rgb.len() / RGB_CHANNELS;
    if pixels == 0 {
        return true;
    }
    let dark = rgb.chunks_exact(RGB_CHANNELS).filter(|px| luma(px) < 32.0).count();
    (dark as f32 / pixels as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("region ({x0},{y0})-({x1},{y1}) outside {width}x{height} frame")]
    InvalidRegion {
        x0: u32,
        y0: u32,
        x1: u32,
        y1: u32,
        width: u32,
        height: u32,
    },
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}
