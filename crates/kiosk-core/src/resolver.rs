//! Turns the raw hits of one search query into an identity.

use crate::face_key::FaceKey;
use crate::store::{Store, StoreError};
use crate::types::{FaceMatch, MatchCandidate};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// Who a cropped face belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Identified(MatchCandidate),
    Guest,
}

impl Identity {
    pub fn key(&self) -> Option<&FaceKey> {
        match self {
            Identity::Identified(candidate) => Some(&candidate.key),
            Identity::Guest => None,
        }
    }
}

/// Classification plus whether the crop belongs in the guest store.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub identity: Identity,
    /// Only set when the search found nothing at all. Hits with
    /// unusable external ids give a guest that is not persisted.
    pub save_guest: bool,
}

/// Result of [`IdentityResolver::identify`].
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    pub identity: Identity,
    pub guest_path: Option<PathBuf>,
}

/// Selects the best identity for a face and persists unmatched crops.
pub struct IdentityResolver<S: ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> IdentityResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Resolve `matches` for face `face_index` of the frame captured at
    /// `captured_at`, saving the crop as a guest when the search found
    /// nobody.
    pub async fn identify(
        &self,
        crop: &[u8],
        captured_at: SystemTime,
        face_index: usize,
        matches: &[FaceMatch],
    ) -> Result<Identification, StoreError> {
        let resolution = resolve(matches);

        let guest_path = if resolution.save_guest {
            Some(self.store.save_guest(crop, captured_at, face_index).await?)
        } else {
            None
        };

        if let Identity::Identified(candidate) = &resolution.identity {
            tracing::info!(
                key = %candidate.key,
                name = candidate.key.name(),
                similarity = candidate.similarity,
                "identified"
            );
        }

        Ok(Identification {
            identity: resolution.identity,
            guest_path,
        })
    }
}

/// Pick the highest-similarity usable hit. Equal scores keep the
/// first hit seen, in service order.
pub fn resolve(matches: &[FaceMatch]) -> Resolution {
    if matches.is_empty() {
        return Resolution {
            identity: Identity::Guest,
            save_guest: true,
        };
    }

    let mut best: Option<MatchCandidate> = None;
    for m in matches {
        let Some(candidate) = candidate_from(m) else {
            continue;
        };
        let is_better = match &best {
            None => true,
            Some(prev) => candidate.similarity > prev.similarity,
        };
        if is_better {
            best = Some(candidate);
        }
    }

    match best {
        Some(candidate) => Resolution {
            identity: Identity::Identified(candidate),
            save_guest: false,
        },
        None => {
            tracing::debug!(hits = matches.len(), "no usable identity among search hits");
            Resolution {
                identity: Identity::Guest,
                save_guest: false,
            }
        }
    }
}

fn candidate_from(m: &FaceMatch) -> Option<MatchCandidate> {
    let Some(external_id) = m.external_id.as_deref() else {
        tracing::warn!(face_id = %m.face_id, "match has no external id");
        return None;
    };
    match FaceKey::parse(external_id) {
        Ok(key) => Some(MatchCandidate {
            key,
            similarity: m.similarity,
        }),
        Err(e) => {
            tracing::warn!(face_id = %m.face_id, error = %e, "skipped match");
            None
        }
    }
}
