//! Local catalogue store.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/catalogue/<name>/<index>.jpg   reference faces
//! <base>/guests/<YYYYmmdd-HHMMSS>-<n>.jpg   unmatched crops
//! ```

use crate::face_key::FaceKey;
use crate::types::CatalogueEntry;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

const CATALOGUE_DIR: &str = "catalogue";
const GUEST_DIR: &str = "guests";
const IMAGE_EXTENSION: &str = "jpg";
const GUEST_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("catalogue image not found: {0}")]
    NotFound(FaceKey),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalogue walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Snapshot of the catalogue returned by [`Store::watch`] when it changed.
#[derive(Debug, Clone)]
pub struct CatalogueChange {
    pub entries: Vec<CatalogueEntry>,
    /// Newest modification time among `entries`.
    pub last_modified: SystemTime,
}

impl CatalogueChange {
    /// Wrap `entries` if any of them is newer than `since` or carries a
    /// key outside `known`. The key check catches images copied in with
    /// an old preserved mtime.
    ///
    /// An empty catalogue never counts as a change.
    pub fn since(
        entries: Vec<CatalogueEntry>,
        since: Option<SystemTime>,
        known: &HashSet<FaceKey>,
    ) -> Option<Self> {
        let last_modified = entries.iter().map(|e| e.modified).max()?;
        let newer = since.map_or(true, |s| last_modified > s);
        if !newer && entries.iter().all(|e| known.contains(&e.key)) {
            return None;
        }
        Some(Self {
            entries,
            last_modified,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &FaceKey> {
        self.entries.iter().map(|e| &e.key)
    }
}

/// Storage backend for reference faces and guest crops.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the backing layout. Safe to call repeatedly.
    async fn setup(&self) -> Result<(), StoreError>;

    /// Persist an unmatched crop of face `face_index` from the frame
    /// captured at `captured_at`. Never overwrites an existing image.
    async fn save_guest(
        &self,
        image: &[u8],
        captured_at: SystemTime,
        face_index: usize,
    ) -> Result<PathBuf, StoreError>;

    /// Read the reference image for `key`.
    async fn read_image(&self, key: &FaceKey) -> Result<Vec<u8>, StoreError>;

    /// List every reference image currently in the catalogue.
    async fn scan(&self) -> Result<Vec<CatalogueEntry>, StoreError>;

    /// Return the full catalogue if it changed since the pass that saw
    /// `known` at modification time `since`.
    async fn watch(
        &self,
        since: Option<SystemTime>,
        known: &HashSet<FaceKey>,
    ) -> Result<Option<CatalogueChange>, StoreError> {
        let entries = self.scan().await?;
        Ok(CatalogueChange::since(entries, since, known))
    }
}

/// Filesystem-backed [`Store`].
#[derive(Debug, Clone)]
pub struct LocalStore {
    base_dir: PathBuf,
}

impl LocalStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn catalogue_dir(&self) -> PathBuf {
        self.base_dir.join(CATALOGUE_DIR)
    }

    pub fn guest_dir(&self) -> PathBuf {
        self.base_dir.join(GUEST_DIR)
    }

    fn image_path(&self, key: &FaceKey) -> PathBuf {
        self.catalogue_dir()
            .join(key.name())
            .join(format!("{}.{IMAGE_EXTENSION}", key.index()))
    }

    /// Write `image` as `guests/<name>`, failing if the file exists.
    async fn save_guest_as(&self, name: &str, image: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.guest_dir().join(name);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(image)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&path, e))?;

        tracing::info!(path = %path.display(), bytes = image.len(), "guest saved");
        Ok(path)
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn setup(&self) -> Result<(), StoreError> {
        for dir in [self.catalogue_dir(), self.guest_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        tracing::debug!(base = %self.base_dir.display(), "store layout ready");
        Ok(())
    }

    async fn save_guest(
        &self,
        image: &[u8],
        captured_at: SystemTime,
        face_index: usize,
    ) -> Result<PathBuf, StoreError> {
        let at = chrono::DateTime::<chrono::Local>::from(captured_at);
        self.save_guest_as(&guest_file_name(at, face_index), image)
            .await
    }

    async fn read_image(&self, key: &FaceKey) -> Result<Vec<u8>, StoreError> {
        let path = self.image_path(key);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.clone())
            } else {
                StoreError::io(&path, e)
            }
        })
    }

    async fn scan(&self) -> Result<Vec<CatalogueEntry>, StoreError> {
        let root = self.catalogue_dir();
        tokio::task::spawn_blocking(move || walk_catalogue(&root))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Guest file name for face `face_index` of a frame taken at `at`,
/// e.g. `20240131-235959-0.jpg`.
pub fn guest_file_name<Tz>(at: chrono::DateTime<Tz>, face_index: usize) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}-{face_index}.{IMAGE_EXTENSION}",
        at.format(GUEST_TIMESTAMP_FORMAT)
    )
}

/// Walk `<root>/<name>/<index>.jpg`, skipping anything else.
fn walk_catalogue(root: &Path) -> Result<Vec<CatalogueEntry>, StoreError> {
    let mut entries = Vec::new();

    for dent in WalkDir::new(root).min_depth(2).max_depth(2).follow_links(true) {
        let dent = dent?;
        if !dent.file_type().is_file() {
            continue;
        }
        let Some(key) = catalogue_key(dent.path()) else {
            tracing::trace!(path = %dent.path().display(), "not a catalogue image");
            continue;
        };
        let modified = dent
            .metadata()?
            .modified()
            .map_err(|e| StoreError::io(dent.path(), e))?;
        entries.push(CatalogueEntry {
            key,
            path: dent.path().to_path_buf(),
            modified,
        });
    }

    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

/// Derive the key of `<name>/<index>.jpg`. Names are ASCII word
/// characters without `_`; indexes may also contain `-` and `_`.
fn catalogue_key(path: &Path) -> Option<FaceKey> {
    if path.extension()?.to_str()? != IMAGE_EXTENSION {
        return None;
    }
    let index = path.file_stem()?.to_str()?;
    let name = path.parent()?.file_name()?.to_str()?;

    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    if !index
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    FaceKey::new(name, index).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn put(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, rel.as_bytes()).unwrap();
    }

    fn key(s: &str) -> FaceKey {
        FaceKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        store.setup().await.unwrap();
        store.setup().await.unwrap();
        assert!(store.catalogue_dir().is_dir());
        assert!(store.guest_dir().is_dir());
    }

    #[tokio::test]
    async fn test_scan_matches_catalogue_pattern_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        store.setup().await.unwrap();
        let cat = store.catalogue_dir();
        put(&cat, "alice/1.jpg");
        put(&cat, "alice/left-45.jpg");
        put(&cat, "bob/1.jpg");
        put(&cat, "bob/notes.txt");
        put(&cat, "bob/1.png");
        put(&cat, "under_score/1.jpg");
        put(&cat, "stray.jpg");
        put(&cat, "carol/nested/1.jpg");

        let keys: Vec<FaceKey> = store.scan().await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![key("alice_1"), key("alice_left-45"), key("bob_1")]);
    }

    #[tokio::test]
    async fn test_scan_missing_catalogue_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("absent"));
        assert!(matches!(store.scan().await, Err(StoreError::Walk(_))));
    }

    #[tokio::test]
    async fn test_read_image() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        store.setup().await.unwrap();
        put(&store.catalogue_dir(), "alice/1.jpg");

        let bytes = store.read_image(&key("alice_1")).await.unwrap();
        assert_eq!(bytes, b"alice/1.jpg");

        let missing = store.read_image(&key("alice_2")).await;
        assert!(matches!(missing, Err(StoreError::NotFound(k)) if k == key("alice_2")));
    }

    #[tokio::test]
    async fn test_save_guest_writes_one_new_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        store.setup().await.unwrap();

        let at = chrono::Local.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let path = store.save_guest(b"crop", at.into(), 3).await.unwrap();
        assert_eq!(path.parent().unwrap(), store.guest_dir());
        assert_eq!(path.file_name().unwrap(), "20240506-070809-3.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), b"crop");
        assert_eq!(std::fs::read_dir(store.guest_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_save_guest_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        store.setup().await.unwrap();

        let first = store.save_guest_as("20240101-000000-0.jpg", b"first").await.unwrap();
        let err = store
            .save_guest_as("20240101-000000-0.jpg", b"second")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists
        ));
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read_dir(store.guest_dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_save_guest_same_frame_shares_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        store.setup().await.unwrap();

        let captured_at = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let a = store.save_guest(b"a", captured_at, 0).await.unwrap();
        let b = store.save_guest(b"b", captured_at, 1).await.unwrap();

        let stem = |p: &Path| p.file_name().unwrap().to_str().unwrap().to_string();
        let (a, b) = (stem(&a), stem(&b));
        assert_eq!(a.trim_end_matches("-0.jpg"), b.trim_end_matches("-1.jpg"));
        let again = store.save_guest(b"c", captured_at, 0).await;
        assert!(matches!(again, Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_guest_file_name() {
        let at = chrono::Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 58).unwrap();
        assert_eq!(guest_file_name(at, 2), "20240131-235958-2.jpg");
    }

    #[test]
    fn test_change_since() {
        let t0 = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(100);
        let t1 = t0 + std::time::Duration::from_secs(5);
        let entries = vec![
            CatalogueEntry {
                key: key("a_1"),
                path: "a/1.jpg".into(),
                modified: t0,
            },
            CatalogueEntry {
                key: key("b_1"),
                path: "b/1.jpg".into(),
                modified: t1,
            },
        ];

        let none = HashSet::new();
        let both: HashSet<FaceKey> = [key("a_1"), key("b_1")].into_iter().collect();

        let change = CatalogueChange::since(entries.clone(), None, &none).unwrap();
        assert_eq!(change.last_modified, t1);
        assert_eq!(change.keys().count(), 2);

        assert!(CatalogueChange::since(entries.clone(), Some(t0), &both).is_some());
        assert!(CatalogueChange::since(entries.clone(), Some(t1), &both).is_none());
        assert!(CatalogueChange::since(Vec::new(), None, &none).is_none());
    }

    #[test]
    fn test_change_on_unknown_key_with_old_mtime() {
        let t0 = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(100);
        let entries = vec![
            CatalogueEntry {
                key: key("a_1"),
                path: "a/1.jpg".into(),
                modified: t0,
            },
            CatalogueEntry {
                key: key("b_1"),
                path: "b/1.jpg".into(),
                modified: SystemTime::UNIX_EPOCH,
            },
        ];
        let only_a: HashSet<FaceKey> = [key("a_1")].into_iter().collect();

        let change = CatalogueChange::since(entries, Some(t0), &only_a).unwrap();
        assert_eq!(change.last_modified, t0);
    }
}
