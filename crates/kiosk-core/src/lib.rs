//! kiosk-core — Catalogue synchronization and face identity resolution.
//!
//! Keeps a remote face index in step with a local catalogue of reference
//! images and reduces remote search hits to a single identity or a guest.

pub mod face_key;
pub mod periodic;
pub mod recognition;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod types;

pub use face_key::{FaceKey, FaceKeyError};
pub use periodic::{Periodic, PeriodicTask};
pub use recognition::{RecognitionClient, RecognitionError};
pub use resolver::{Identification, Identity, IdentityResolver};
pub use store::{LocalStore, Store, StoreError};
pub use sync::{CatalogueSynchronizer, SyncConfig, SyncError, SyncReport};
pub use types::{BoundingBox, CatalogueEntry, FaceMatch, MatchCandidate, PixelRect, RemoteFace};
