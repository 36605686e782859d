use kiosk_core::{
    BoundingBox, FaceKey, Identification, Identity, IdentityResolver, RecognitionClient,
    RecognitionError, Store, StoreError,
};
use kiosk_hw::{CameraError, Frame, FrameError, FrameSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Pause after a failed frame read so a detached camera does not spin the loop.
const CAMERA_ERROR_PAUSE: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("face detection failed: {0}")]
    Detect(#[source] RecognitionError),
    #[error("face search failed: {0}")]
    Search(#[source] RecognitionError),
    #[error("guest save failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub collection_id: String,
    pub jpeg_quality: u8,
    pub last_frame_path: Option<PathBuf>,
}

/// What happened to the faces of one frame.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Driver sequence number of the frame.
    pub sequence: u32,
    pub faces: usize,
    pub identified: Vec<FaceKey>,
    pub guests: Vec<PathBuf>,
    /// Hits existed but none carried a usable identity.
    pub unresolved: usize,
    /// Out-of-frame boxes that cropped to nothing.
    pub skipped: usize,
    pub failed: usize,
}

/// Frame → detect → crop → search → resolve, one frame at a time.
pub struct CaptureLoop<F, R: ?Sized, S: ?Sized> {
    source: F,
    client: Arc<R>,
    resolver: IdentityResolver<S>,
    config: CaptureConfig,
}

impl<F, R, S> CaptureLoop<F, R, S>
where
    F: FrameSource,
    R: RecognitionClient + ?Sized,
    S: Store + ?Sized,
{
    pub fn new(source: F, client: Arc<R>, store: Arc<S>, config: CaptureConfig) -> Self {
        Self {
            source,
            client,
            resolver: IdentityResolver::new(store),
            config,
        }
    }

    /// Process frames until `cancel` fires. Errors are logged and the
    /// loop moves on to the next frame.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("capture loop started");
        while !cancel.is_cancelled() {
            match self.process_frame().await {
                Ok(outcome) if outcome.faces > 0 => tracing::debug!(
                    seq = outcome.sequence,
                    faces = outcome.faces,
                    identified = outcome.identified.len(),
                    guests = outcome.guests.len(),
                    failed = outcome.failed,
                    "frame processed"
                ),
                Ok(_) => {}
                Err(CaptureError::Camera(e)) => {
                    tracing::warn!(error = %e, "frame capture failed");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(CAMERA_ERROR_PAUSE) => {}
                    }
                }
                Err(e) => tracing::warn!(error = %e, "frame skipped"),
            }
        }
        tracing::info!("capture loop stopped");
    }

    /// Capture one frame and identify every face in it.
    ///
    /// Fails only when the frame itself cannot be read, encoded or
    /// detected; per-face failures are counted in the outcome.
    pub async fn process_frame(&mut self) -> Result<FrameOutcome, CaptureError> {
        let source = &mut self.source;
        let frame = tokio::task::block_in_place(|| source.capture())?;
        let jpeg = frame.encode_jpeg(self.config.jpeg_quality)?;

        if let Some(path) = &self.config.last_frame_path {
            if let Err(e) = tokio::fs::write(path, &jpeg).await {
                tracing::debug!(path = %path.display(), error = %e, "failed to write last frame");
            }
        }

        let boxes = self
            .client
            .detect_faces(&jpeg)
            .await
            .map_err(CaptureError::Detect)?;

        let mut outcome = FrameOutcome {
            sequence: frame.sequence,
            faces: boxes.len(),
            ..FrameOutcome::default()
        };

        for (idx, bbox) in boxes.iter().enumerate() {
            match self.identify_face(&frame, idx, bbox).await {
                Ok(None) => outcome.skipped += 1,
                Ok(Some(Identification {
                    identity: Identity::Identified(candidate),
                    ..
                })) => outcome.identified.push(candidate.key),
                Ok(Some(Identification {
                    guest_path: Some(path),
                    ..
                })) => outcome.guests.push(path),
                Ok(Some(_)) => outcome.unresolved += 1,
                Err(e) => {
                    tracing::warn!(face = idx, error = %e, "face identification failed");
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn identify_face(
        &self,
        frame: &Frame,
        idx: usize,
        bbox: &BoundingBox,
    ) -> Result<Option<Identification>, CaptureError> {
        let rect = bbox.to_pixel_rect(frame.width, frame.height);
        if rect.is_empty() {
            tracing::debug!(face = idx, ?bbox, "face box outside frame");
            return Ok(None);
        }

        let crop = frame
            .crop(rect.x0, rect.y0, rect.x1, rect.y1)?
            .encode_jpeg(self.config.jpeg_quality)?;

        let matches = self
            .client
            .search_by_image(&crop, &self.config.collection_id)
            .await
            .map_err(CaptureError::Search)?;
        tracing::debug!(face = idx, hits = matches.len(), "search result");

        Ok(Some(
            self.resolver
                .identify(&crop, frame.captured_at, idx, &matches)
                .await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiosk_core::{FaceMatch, LocalStore, RemoteFace};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StillCamera {
        fail: bool,
    }

    impl FrameSource for StillCamera {
        fn capture(&mut self) -> Result<Frame, CameraError> {
            if self.fail {
                return Err(CameraError::EmptyFrame);
            }
            let data = (0..64u32 * 48)
                .flat_map(|i| {
                    let v = (i % 200) as u8 + 30;
                    [v, v, v]
                })
                .collect();
            Ok(Frame::from_rgb(data, 64, 48, 7).unwrap())
        }
    }

    #[derive(Default)]
    struct ScriptedClient {
        boxes: Vec<BoundingBox>,
        fail_detect: bool,
        /// One entry per search call, in order.
        searches: Mutex<VecDeque<Result<Vec<FaceMatch>, RecognitionError>>>,
        search_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecognitionClient for ScriptedClient {
        async fn detect_faces(&self, image: &[u8]) -> Result<Vec<BoundingBox>, RecognitionError> {
            assert_eq!(&image[..2], &[0xFF, 0xD8]);
            if self.fail_detect {
                return Err(RecognitionError::Timeout);
            }
            Ok(self.boxes.clone())
        }

        async fn search_by_image(
            &self,
            _image: &[u8],
            collection_id: &str,
        ) -> Result<Vec<FaceMatch>, RecognitionError> {
            self.search_calls.lock().unwrap().push(collection_id.to_string());
            self.searches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn list_indexed(&self, _collection_id: &str) -> Result<Vec<RemoteFace>, RecognitionError> {
            Ok(Vec::new())
        }

        async fn index_image(
            &self,
            _image: &[u8],
            _collection_id: &str,
            _external_id: &str,
        ) -> Result<(), RecognitionError> {
            Ok(())
        }
    }

    fn bbox(left: f64, top: f64, width: f64, height: f64) -> BoundingBox {
        BoundingBox {
            left,
            top,
            width,
            height,
        }
    }

    fn hit(external_id: Option<&str>, similarity: f32) -> FaceMatch {
        FaceMatch {
            face_id: "f".into(),
            external_id: external_id.map(String::from),
            similarity,
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        store: Arc<LocalStore>,
        client: Arc<ScriptedClient>,
    }

    async fn harness(client: ScriptedClient) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        store.setup().await.unwrap();
        Harness {
            _tmp: tmp,
            store,
            client: Arc::new(client),
        }
    }

    fn capture_loop(
        h: &Harness,
        fail_camera: bool,
        last_frame_path: Option<PathBuf>,
    ) -> CaptureLoop<StillCamera, ScriptedClient, LocalStore> {
        CaptureLoop::new(
            StillCamera { fail: fail_camera },
            h.client.clone(),
            h.store.clone(),
            CaptureConfig {
                collection_id: "lobby".into(),
                jpeg_quality: 80,
                last_frame_path,
            },
        )
    }

    fn guest_files(store: &LocalStore) -> usize {
        std::fs::read_dir(store.guest_dir()).unwrap().count()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_faces_no_search() {
        let h = harness(ScriptedClient::default()).await;
        let outcome = capture_loop(&h, false, None).process_frame().await.unwrap();
        assert_eq!(outcome.faces, 0);
        assert!(h.client.search_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_and_identified_faces() {
        let client = ScriptedClient {
            boxes: vec![bbox(0.1, 0.1, 0.3, 0.3), bbox(0.5, 0.5, 0.3, 0.3)],
            searches: Mutex::new(VecDeque::from([
                Ok(Vec::new()),
                Ok(vec![hit(Some("x_1"), 80.0), hit(Some("y_1"), 95.0)]),
            ])),
            ..ScriptedClient::default()
        };
        let h = harness(client).await;
        let outcome = capture_loop(&h, false, None).process_frame().await.unwrap();

        assert_eq!(outcome.faces, 2);
        assert_eq!(outcome.identified, vec![FaceKey::parse("y_1").unwrap()]);
        assert_eq!(outcome.guests.len(), 1);
        assert!(outcome.guests[0].to_str().unwrap().ends_with("-0.jpg"));
        assert_eq!(guest_files(&h.store), 1);
        assert_eq!(*h.client.search_calls.lock().unwrap(), vec!["lobby", "lobby"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guests_of_one_frame_share_capture_time() {
        let client = ScriptedClient {
            boxes: vec![bbox(0.1, 0.1, 0.3, 0.3), bbox(0.5, 0.5, 0.3, 0.3)],
            ..ScriptedClient::default()
        };
        let h = harness(client).await;
        let outcome = capture_loop(&h, false, None).process_frame().await.unwrap();

        assert_eq!(outcome.sequence, 7);
        let names: Vec<String> = outcome
            .guests
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(
            names[0].trim_end_matches("-0.jpg"),
            names[1].trim_end_matches("-1.jpg")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unusable_hits_are_not_saved() {
        let client = ScriptedClient {
            boxes: vec![bbox(0.1, 0.1, 0.3, 0.3)],
            searches: Mutex::new(VecDeque::from([Ok(vec![hit(None, 99.0)])])),
            ..ScriptedClient::default()
        };
        let h = harness(client).await;
        let outcome = capture_loop(&h, false, None).process_frame().await.unwrap();
        assert_eq!(outcome.unresolved, 1);
        assert_eq!(guest_files(&h.store), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_failure_isolated_to_face() {
        let client = ScriptedClient {
            boxes: vec![bbox(0.1, 0.1, 0.3, 0.3), bbox(0.5, 0.5, 0.3, 0.3)],
            searches: Mutex::new(VecDeque::from([
                Err(RecognitionError::Timeout),
                Ok(vec![hit(Some("alice_1"), 90.0)]),
            ])),
            ..ScriptedClient::default()
        };
        let h = harness(client).await;
        let outcome = capture_loop(&h, false, None).process_frame().await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.identified, vec![FaceKey::parse("alice_1").unwrap()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_out_of_frame_box_skipped() {
        let client = ScriptedClient {
            boxes: vec![bbox(1.2, 0.1, 0.3, 0.3)],
            ..ScriptedClient::default()
        };
        let h = harness(client).await;
        let outcome = capture_loop(&h, false, None).process_frame().await.unwrap();
        assert_eq!(outcome.skipped, 1);
        assert!(h.client.search_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_detect_failure_aborts_frame() {
        let client = ScriptedClient {
            fail_detect: true,
            ..ScriptedClient::default()
        };
        let h = harness(client).await;
        let err = capture_loop(&h, false, None).process_frame().await.err();
        assert!(matches!(err, Some(CaptureError::Detect(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_camera_failure() {
        let h = harness(ScriptedClient::default()).await;
        let err = capture_loop(&h, true, None).process_frame().await.err();
        assert!(matches!(err, Some(CaptureError::Camera(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_writes_last_frame() {
        let h = harness(ScriptedClient::default()).await;
        let path = h.store.guest_dir().with_file_name("capture.jpg");
        capture_loop(&h, false, Some(path.clone()))
            .process_frame()
            .await
            .unwrap();
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_stops_on_cancel() {
        let h = harness(ScriptedClient::default()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(capture_loop(&h, true, None).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("capture loop did not stop")
            .unwrap();
    }
}
