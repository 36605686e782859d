use crate::face_key::FaceKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// Face bounding box as reported by the recognition service.
///
/// All fields are fractions of the frame size. The service may report
/// geometry outside of [0, 1] for faces cut by the frame edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Map to pixel coordinates of a `width` x `height` frame.
    ///
    /// Near edges are scaled then floored at 0. Far edges are capped at
    /// 1.0 as fractions before scaling, so the rectangle never extends
    /// past the frame.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> PixelRect {
        let w = f64::from(width);
        let h = f64::from(height);
        PixelRect {
            x0: (self.left * w).max(0.0) as u32,
            y0: (self.top * h).max(0.0) as u32,
            x1: ((self.left + self.width).min(1.0) * w) as u32,
            y1: ((self.top + self.height).min(1.0) * h) as u32,
        }
    }
}

/// Pixel rectangle, `x0..x1` by `y0..y1` (exclusive far edges).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// One raw hit from a search-by-image query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub face_id: String,
    pub external_id: Option<String>,
    /// Similarity in [0, 100].
    pub similarity: f32,
}

/// One face stored in the remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFace {
    pub face_id: String,
    pub external_id: Option<String>,
}

/// A search hit whose external id parsed into a [`FaceKey`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub key: FaceKey,
    pub similarity: f32,
}

/// A remote face whose external id parsed into a [`FaceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteIndexEntry {
    pub key: FaceKey,
    pub face_id: String,
}

impl RemoteIndexEntry {
    /// Interpret a remote face, logging and skipping unusable ids.
    pub fn from_remote(face: &RemoteFace) -> Option<Self> {
        let Some(external_id) = face.external_id.as_deref() else {
            tracing::debug!(face_id = %face.face_id, "remote face has no external id; skipped");
            return None;
        };
        match FaceKey::parse(external_id) {
            Ok(key) => Some(Self {
                key,
                face_id: face.face_id.clone(),
            }),
            Err(e) => {
                tracing::warn!(face_id = %face.face_id, error = %e, "skipped remote face");
                None
            }
        }
    }
}

/// A reference image discovered in the local catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub key: FaceKey,
    pub path: PathBuf,
    pub modified: SystemTime,
}
