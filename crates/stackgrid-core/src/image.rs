//! Container image references and build-context digests.
//!
//! A workload definition may only point at an immutable image, i.e. one
//! pinned by digest. Tags are kept for display but never trusted.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// registry.example.com
    pub registry: String,
    /// team/app
    pub repository: String,
    pub tag: Option<String>,
    /// sha256:<64 hex chars>
    pub digest: Option<String>,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
    #[error("invalid digest (expected sha256:<64 hex>): {0}")]
    InvalidDigest(String),
    #[error("build context {0} contains no files")]
    EmptyContext(String),
    #[error("failed to read build context: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to walk build context: {0}")]
    Walk(#[from] walkdir::Error),
}

impl ImageRef {
    /// Parse `registry/repository[:tag][@sha256:digest]`.
    pub fn parse(reference: &str) -> Result<Self, ImageError> {
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest)?;
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (registry, path) = rest
            .split_once('/')
            .ok_or_else(|| ImageError::InvalidReference(reference.to_string()))?;
        if registry.is_empty() || path.is_empty() {
            return Err(ImageError::InvalidReference(reference.to_string()));
        }

        // A ':' after the last '/' separates the tag; earlier ones belong to
        // the registry port.
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_string())),
            _ => (path, None),
        };
        if repository.is_empty() {
            return Err(ImageError::InvalidReference(reference.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Whether the reference is pinned by digest.
    pub fn is_immutable(&self) -> bool {
        self.digest.is_some()
    }

    /// Return a copy pinned to the given digest.
    pub fn pinned(&self, digest: &str) -> Result<Self, ImageError> {
        validate_digest(digest)?;
        Ok(Self {
            digest: Some(digest.to_string()),
            ..self.clone()
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn validate_digest(digest: &str) -> Result<(), ImageError> {
    let hex_part = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| ImageError::InvalidDigest(digest.to_string()))?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ImageError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}

/// Content digest of a build context directory.
///
/// Files are visited in sorted order and hashed together with their
/// relative paths, so the digest is stable across machines. `.git` is
/// skipped.
pub fn context_digest(root: &Path) -> Result<String, ImageError> {
    let mut hasher = Sha256::new();
    let mut files = 0usize;

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let contents = std::fs::read(entry.path())?;

        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
        files += 1;
    }

    if files == 0 {
        return Err(ImageError::EmptyContext(root.display().to_string()));
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
