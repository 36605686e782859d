//! Catalogued face identity and its external-id encoding.
//!
//! A key is written to the remote index as `"{name}_{index}"`. The name
//! is the person label and may not contain `_`; everything after the
//! first `_` is the per-person variant index, possibly empty.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SEPARATOR: char = '_';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaceKeyError {
    #[error("invalid face key syntax: {0:?}")]
    Syntax(String),
    #[error("invalid face name {0:?}: must be non-empty without '_' or '/'")]
    InvalidName(String),
    #[error("invalid face index {0:?}: must not contain '/'")]
    InvalidIndex(String),
}

/// Identity of one reference image in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FaceKey {
    name: String,
    index: String,
}

impl FaceKey {
    /// Build a key, validating both parts.
    pub fn new(name: impl Into<String>, index: impl Into<String>) -> Result<Self, FaceKeyError> {
        let name = name.into();
        let index = index.into();
        if name.is_empty() || name.contains(SEPARATOR) || name.contains('/') {
            return Err(FaceKeyError::InvalidName(name));
        }
        if index.contains('/') {
            return Err(FaceKeyError::InvalidIndex(index));
        }
        Ok(Self { name, index })
    }

    /// Parse an external id, splitting at the first `_`.
    pub fn parse(s: &str) -> Result<Self, FaceKeyError> {
        let (name, index) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| FaceKeyError::Syntax(s.to_string()))?;
        Self::new(name, index).map_err(|_| FaceKeyError::Syntax(s.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// External id used by the remote index.
    pub fn external_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.name, self.index)
    }
}

impl FromStr for FaceKey {
    type Err = FaceKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
