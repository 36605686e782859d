use crate::capture::CaptureConfig;
use crate::remote::ClientConfig;
use kiosk_core::SyncConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Agent configuration.
///
/// Layered lowest to highest: built-in defaults, optional TOML file,
/// `KIOSK_*` environment variables, command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path or index (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Root of the `catalogue/` and `guests/` trees.
    pub base_dir: PathBuf,
    /// Base URL of the recognition service.
    pub endpoint: String,
    /// Remote face collection to search and index.
    pub collection_id: String,
    /// Bearer token for the recognition service. Environment only.
    pub api_key: Option<String>,
    /// Deadline for each remote call.
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
    /// Frames to drop at startup while exposure settles.
    pub warmup_frames: usize,
    pub jpeg_quality: u8,
    pub max_faces: Option<u32>,
    pub face_match_threshold: Option<f32>,
    /// Write every encoded frame here (debug aid).
    pub last_frame_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: kiosk_hw::camera::DEFAULT_WIDTH,
            frame_height: kiosk_hw::camera::DEFAULT_HEIGHT,
            base_dir: PathBuf::from("localstore"),
            endpoint: "http://localhost:8900".to_string(),
            collection_id: String::new(),
            api_key: None,
            request_timeout_secs: 10,
            sync_interval_secs: 10,
            warmup_frames: 10,
            jpeg_quality: 90,
            max_faces: None,
            face_match_threshold: None,
            last_frame_path: None,
        }
    }
}

/// On-disk TOML layout. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub camera_device: Option<String>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub base_dir: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub collection_id: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub sync_interval_secs: Option<u64>,
    pub warmup_frames: Option<usize>,
    pub jpeg_quality: Option<u8>,
    pub max_faces: Option<u32>,
    pub face_match_threshold: Option<f32>,
    pub last_frame_path: Option<PathBuf>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

impl Config {
    /// Load from an optional TOML file and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match file {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    /// Merge defaults, `file` and variables returned by `env`.
    pub fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();

        Self {
            camera_device: env("KIOSK_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or(d.camera_device),
            frame_width: env_parse(&env, "KIOSK_FRAME_WIDTH")
                .or(file.frame_width)
                .unwrap_or(d.frame_width),
            frame_height: env_parse(&env, "KIOSK_FRAME_HEIGHT")
                .or(file.frame_height)
                .unwrap_or(d.frame_height),
            base_dir: env("KIOSK_BASE_DIR")
                .map(PathBuf::from)
                .or(file.base_dir)
                .unwrap_or(d.base_dir),
            endpoint: env("KIOSK_ENDPOINT")
                .or(file.endpoint)
                .unwrap_or(d.endpoint),
            collection_id: env("KIOSK_COLLECTION_ID")
                .or(file.collection_id)
                .unwrap_or(d.collection_id),
            api_key: env("KIOSK_API_KEY").filter(|k| !k.is_empty()),
            request_timeout_secs: env_parse(&env, "KIOSK_REQUEST_TIMEOUT_SECS")
                .or(file.request_timeout_secs)
                .unwrap_or(d.request_timeout_secs),
            sync_interval_secs: env_parse(&env, "KIOSK_SYNC_INTERVAL_SECS")
                .or(file.sync_interval_secs)
                .unwrap_or(d.sync_interval_secs),
            warmup_frames: env_parse(&env, "KIOSK_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(d.warmup_frames),
            jpeg_quality: env_parse(&env, "KIOSK_JPEG_QUALITY")
                .or(file.jpeg_quality)
                .unwrap_or(d.jpeg_quality),
            max_faces: env_parse(&env, "KIOSK_MAX_FACES").or(file.max_faces),
            face_match_threshold: env_parse(&env, "KIOSK_FACE_MATCH_THRESHOLD")
                .or(file.face_match_threshold),
            last_frame_path: env("KIOSK_LAST_FRAME_PATH")
                .map(PathBuf::from)
                .or(file.last_frame_path),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "collection id is unset (--collection-id or KIOSK_COLLECTION_ID)".into(),
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint is empty".into()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg quality {} outside 1..=100",
                self.jpeg_quality
            )));
        }
        if self.sync_interval_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync interval and request timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            collection_id: self.collection_id.clone(),
            interval: Duration::from_secs(self.sync_interval_secs),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_faces: self.max_faces,
            face_match_threshold: self.face_match_threshold,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            collection_id: self.collection_id.clone(),
            jpeg_quality: self.jpeg_quality,
            last_frame_path: self.last_frame_path.clone(),
        }
    }
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
