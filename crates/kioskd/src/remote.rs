//! HTTP binding of the recognition service.
//!
//! JSON over HTTPS, images sent base64-encoded. Endpoints:
//!
//! ```text
//! POST /faces/detect                  detect faces in an image
//! POST /collections/{id}/search       search a collection by image
//! GET  /collections/{id}/faces        list indexed faces (paginated)
//! POST /collections/{id}/faces        index a face under an external id
//! ```

use async_trait::async_trait;
use base64::Engine;
use kiosk_core::{BoundingBox, FaceMatch, RecognitionClient, RecognitionError, RemoteFace};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

const USER_AGENT: &str = concat!("kioskd/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Deadline applied to every request.
    pub timeout: Duration,
    pub max_faces: Option<u32>,
    pub face_match_threshold: Option<f32>,
}

/// Recognition service client over HTTP.
pub struct HttpRecognitionClient {
    http: reqwest::Client,
    base: Url,
    config: ClientConfig,
}

impl HttpRecognitionClient {
    pub fn new(config: ClientConfig) -> Result<Self, RecognitionError> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| RecognitionError::Request(format!("bad endpoint {:?}: {e}", config.endpoint)))?;
        if base.cannot_be_a_base() {
            return Err(RecognitionError::Request(format!(
                "endpoint {:?} cannot be a base URL",
                config.endpoint
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| RecognitionError::Request(e.to_string()))?;

        Ok(Self { http, base, config })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // cannot_be_a_base was rejected in new()
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let req = self.http.request(method, self.url(segments));
        match &self.config.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, RecognitionError> {
        let response = req.send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), %message, "recognition service error");
            return Err(RecognitionError::Service {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RecognitionError::Decode(e.to_string()))
    }
}

fn request_error(e: reqwest::Error) -> RecognitionError {
    if e.is_timeout() {
        RecognitionError::Timeout
    } else {
        RecognitionError::Request(e.to_string())
    }
}

/// One page of a paginated listing.
struct Page<T> {
    items: Vec<T>,
    next_token: Option<String>,
}

/// Fetch pages until the service stops handing out a fresh token.
///
/// An empty token ends the listing. So does a token already followed,
/// which would otherwise cycle forever.
async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, RecognitionError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, RecognitionError>>,
{
    let mut items = Vec::new();
    let mut followed = HashSet::new();
    let mut token = None;

    loop {
        let page = fetch(token.take()).await?;
        items.extend(page.items);

        match page.next_token.filter(|t| !t.is_empty()) {
            Some(next) if followed.insert(next.clone()) => token = Some(next),
            Some(next) => {
                tracing::warn!(token = %next, "pagination token repeated, listing truncated");
                break;
            }
            None => break,
        }
    }

    Ok(items)
}

fn encode_image(image: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(image)
}

#[async_trait]
impl RecognitionClient for HttpRecognitionClient {
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<BoundingBox>, RecognitionError> {
        let req = self
            .request(Method::POST, &["faces", "detect"])
            .json(&ImageRequest {
                image: encode_image(image),
            });
        let resp: DetectResponse = self.send(req).await?;
        Ok(resp.into_boxes())
    }

    async fn search_by_image(
        &self,
        image: &[u8],
        collection_id: &str,
    ) -> Result<Vec<FaceMatch>, RecognitionError> {
        let req = self
            .request(Method::POST, &["collections", collection_id, "search"])
            .json(&SearchRequest {
                image: encode_image(image),
                max_faces: self.config.max_faces,
                face_match_threshold: self.config.face_match_threshold,
            });
        let resp: SearchResponse = self.send(req).await?;
        Ok(resp.into_matches())
    }

    async fn list_indexed(&self, collection_id: &str) -> Result<Vec<RemoteFace>, RecognitionError> {
        let faces = collect_pages(|token| async move {
            let mut req = self.request(Method::GET, &["collections", collection_id, "faces"]);
            if let Some(token) = &token {
                req = req.query(&[("nextToken", token)]);
            }
            let page: ListResponse = self.send(req).await?;
            Ok(page.into_page())
        })
        .await?;

        tracing::debug!(collection = collection_id, count = faces.len(), "listed remote index");
        Ok(faces)
    }

    async fn index_image(
        &self,
        image: &[u8],
        collection_id: &str,
        external_id: &str,
    ) -> Result<(), RecognitionError> {
        let req = self
            .request(Method::POST, &["collections", collection_id, "faces"])
            .json(&IndexRequest {
                image: encode_image(image),
                external_image_id: external_id,
            });
        let resp: IndexResponse = self.send(req).await?;
        if resp.face_records.is_empty() {
            return Err(RecognitionError::NoFaceIndexed);
        }
        Ok(())
    }
}

// --- Wire types ---

#[derive(Serialize)]
struct ImageRequest {
    image: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_faces: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    face_match_threshold: Option<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexRequest<'a> {
    image: String,
    external_image_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectResponse {
    #[serde(default)]
    face_details: Vec<FaceDetail>,
}

impl DetectResponse {
    fn into_boxes(self) -> Vec<BoundingBox> {
        self.face_details.into_iter().map(|d| d.bounding_box).collect()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FaceDetail {
    bounding_box: BoundingBox,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    face_matches: Vec<WireMatch>,
}

impl SearchResponse {
    fn into_matches(self) -> Vec<FaceMatch> {
        self.face_matches
            .into_iter()
            .map(|m| FaceMatch {
                face_id: m.face.face_id,
                external_id: m.face.external_image_id,
                similarity: m.similarity,
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct WireMatch {
    similarity: f32,
    face: WireFace,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFace {
    face_id: String,
    #[serde(default)]
    external_image_id: Option<String>,
}

impl WireFace {
    fn into_remote(self) -> RemoteFace {
        RemoteFace {
            face_id: self.face_id,
            external_id: self.external_image_id,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    faces: Vec<WireFace>,
    next_token: Option<String>,
}

impl ListResponse {
    fn into_page(self) -> Page<RemoteFace> {
        Page {
            items: self.faces.into_iter().map(WireFace::into_remote).collect(),
            next_token: self.next_token,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexResponse {
    #[serde(default)]
    face_records: Vec<serde_json::Value>,
}
