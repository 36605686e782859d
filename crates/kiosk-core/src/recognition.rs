//! Contract of the remote face recognition service.

use crate::types::{BoundingBox, FaceMatch, RemoteFace};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out")]
    Timeout,
    #[error("service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("no face found in image to index")]
    NoFaceIndexed,
}

/// Remote detection / search / index operations.
///
/// The service is an opaque oracle: it reports bounding boxes and
/// similarity scores and keeps a per-collection face index keyed by an
/// external id string.
#[async_trait]
pub trait RecognitionClient: Send + Sync {
    /// Detect every face in a JPEG image.
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<BoundingBox>, RecognitionError>;

    /// Search the collection for faces similar to the largest face in `image`.
    async fn search_by_image(
        &self,
        image: &[u8],
        collection_id: &str,
    ) -> Result<Vec<FaceMatch>, RecognitionError>;

    /// List every face indexed in the collection.
    async fn list_indexed(&self, collection_id: &str) -> Result<Vec<RemoteFace>, RecognitionError>;

    /// Index the face in `image` under `external_id`.
    async fn index_image(
        &self,
        image: &[u8],
        collection_id: &str,
        external_id: &str,
    ) -> Result<(), RecognitionError>;
}
