//! Image references.
//!
//! Parsing follows the usual registry conventions:
//! - `alpine` -> `registry-1.docker.io/library/alpine:latest`
//! - `ghcr.io/org/repo:v1` -> (`ghcr.io`, `org/repo`, tag `v1`)
//! - `registry.example.com/foo/bar@sha256:...` -> digest reference
//! - `localhost:5000/app` -> the port is part of the host, not a tag

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::digest::{Digest, DigestError};

/// Default registry host for unqualified references.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,

    #[error("invalid image reference {reference:?}: {reason}")]
    Invalid { reference: String, reason: String },

    #[error(transparent)]
    Digest(#[from] DigestError),
}

/// Tag or digest part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// An immutable, fully-qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    registry: String,
    repository: String,
    reference: Reference,
}

impl ImageReference {
    /// Builds a reference from already-split parts.
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        reference: Reference,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            reference,
        }
    }

    /// Parses a human-written reference.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name, reference) = if let Some((name, digest)) = input.rsplit_once('@') {
            (name, Reference::Digest(Digest::parse(digest)?))
        } else if let Some((name, tag)) = input.rsplit_once(':') {
            if tag.contains('/') {
                // The colon belonged to a registry port.
                (input, Reference::Tag(DEFAULT_TAG.to_string()))
            } else {
                (name, Reference::Tag(tag.to_string()))
            }
        } else {
            (input, Reference::Tag(DEFAULT_TAG.to_string()))
        };

        if name.is_empty() || name.ends_with('/') || name.contains("//") {
            return Err(ReferenceError::Invalid {
                reference: input.to_string(),
                reason: "empty path component".to_string(),
            });
        }
        if let Reference::Tag(tag) = &reference {
            if tag.is_empty() {
                return Err(ReferenceError::Invalid {
                    reference: input.to_string(),
                    reason: "empty tag".to_string(),
                });
            }
        }

        let (registry, repository) = match name.split_once('/') {
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        Ok(Self {
            registry,
            repository: repository.to_ascii_lowercase(),
            reference,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// The digest, when this is a digest reference.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.reference {
            Reference::Digest(digest) => Some(digest),
            Reference::Tag(_) => None,
        }
    }

    /// Same repository, pinned to a digest.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: Reference::Digest(digest),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            Reference::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageReference {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageReference> for String {
    fn from(reference: ImageReference) -> Self {
        reference.to_string()
    }
}
