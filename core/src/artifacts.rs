//! Canonical artifact storage.
//!
//! Every file a persona produces is stamped into
//! `artifacts/{iteration_id}/{node_id}/{basename}` together with a
//! `{path}.meta.json` sidecar carrying the digest and provenance labels.
//! Stamped artifacts are immutable: re-stamping identical content is a
//! no-op, divergent content is an error.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Error types for artifact stamping.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact already stamped with different content: {0}")]
    Immutable(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source file has no basename: {0}")]
    NoBasename(PathBuf),
}

/// Result type for artifact operations.
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Sidecar metadata written next to each stamped artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub iteration_id: String,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_version: Option<u32>,
    pub sha256: String,
    pub original_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// A stamped artifact and where it lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedArtifact {
    /// `{iteration_id}/{node_id}/{basename}`.
    pub id: String,
    /// Absolute path of the stamped copy.
    pub path: PathBuf,
    pub meta: ArtifactMeta,
}

/// Provenance labels applied when stamping.
#[derive(Debug, Clone, Default)]
pub struct StampLabels {
    pub capability: Option<String>,
    pub contract_version: Option<u32>,
}

/// Stamps produced files into the canonical artifact tree.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    /// `base_dir` is the directory that contains `artifacts/`.
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    /// Canonical location for a given iteration, node, and file name.
    pub fn canonical_path(&self, iteration_id: &str, node_id: &str, basename: &str) -> PathBuf {
        self.base_dir
            .join("artifacts")
            .join(iteration_id)
            .join(node_id)
            .join(basename)
    }

    /// Stamp `source` (a file on disk) into the canonical tree.
    pub fn stamp(
        &self,
        iteration_id: &str,
        node_id: &str,
        source: &Path,
        labels: &StampLabels,
    ) -> ArtifactResult<StampedArtifact> {
        let basename = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArtifactError::NoBasename(source.to_path_buf()))?;

        let content = std::fs::read(source)?;
        let digest = sha256_hex(&content);
        let dest = self.canonical_path(iteration_id, node_id, basename);

        if dest.exists() {
            let existing = sha256_hex(&std::fs::read(&dest)?);
            if existing != digest {
                return Err(ArtifactError::Immutable(dest));
            }
            debug!(artifact = %dest.display(), "artifact already stamped, skipping");
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, &content)?;
        }

        let meta = ArtifactMeta {
            iteration_id: iteration_id.to_string(),
            node_id: node_id.to_string(),
            capability: labels.capability.clone(),
            contract_version: labels.contract_version,
            sha256: digest,
            original_path: source.to_path_buf(),
            timestamp: Utc::now(),
        };

        let sidecar = sidecar_path(&dest);
        std::fs::write(&sidecar, serde_json::to_string_pretty(&meta)?)?;

        Ok(StampedArtifact {
            id: format!("{}/{}/{}", iteration_id, node_id, basename),
            path: dest,
            meta,
        })
    }

    /// Load the sidecar metadata for a stamped artifact.
    pub fn read_meta(&self, artifact_path: &Path) -> ArtifactResult<ArtifactMeta> {
        let content = std::fs::read_to_string(sidecar_path(artifact_path))?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".meta.json");
    artifact.with_file_name(name)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
