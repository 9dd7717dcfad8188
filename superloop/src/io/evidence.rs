//! Evidence manifest (`evidence.json`): hashes of generated artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::signature::sha256_hex;
use crate::core::types::GateResult;
use crate::io::atomic::write_json_atomic;
use crate::io::config::EvidenceConfig;
use crate::io::paths::expand_glob;

/// Content metadata for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Path relative to the repository root.
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Hash and stat `path`; `None` when it does not exist.
pub fn describe_artifact(repo: &Path, path: &Path) -> Result<Option<ArtifactMeta>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read artifact {}", path.display()))?;
    let metadata =
        fs::metadata(path).with_context(|| format!("stat artifact {}", path.display()))?;
    let rel = path.strip_prefix(repo).unwrap_or(path);
    Ok(Some(ArtifactMeta {
        path: rel.to_string_lossy().replace('\\', "/"),
        sha256: sha256_hex(&bytes),
        size: metadata.len(),
        mtime: metadata.modified().ok().map(DateTime::<Utc>::from),
    }))
}

/// Describe every existing path, in the given order.
pub fn describe_artifacts(repo: &Path, paths: &[PathBuf]) -> Result<Vec<ArtifactMeta>> {
    let mut out = Vec::new();
    for path in paths {
        if let Some(meta) = describe_artifact(repo, path)? {
            out.push(meta);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceManifest {
    pub generated_at: DateTime<Utc>,
    pub iteration: u32,
    pub artifacts: Vec<ArtifactMeta>,
    /// Configured globs that matched no file.
    pub missing: Vec<String>,
}

pub struct EvidenceRequest<'a> {
    pub repo: &'a Path,
    pub config: &'a EvidenceConfig,
    /// Gate status files always included (tests, checklist).
    pub status_files: &'a [PathBuf],
    pub manifest_path: &'a Path,
    pub iteration: u32,
    pub now: DateTime<Utc>,
}

/// Write the manifest. Ok means it was written; when `required`, missing
/// artifacts also fail the gate.
#[instrument(skip_all, fields(iteration = request.iteration))]
pub fn evaluate_evidence(request: &EvidenceRequest<'_>) -> Result<GateResult> {
    if !request.config.enabled {
        return Ok(GateResult::disabled());
    }

    let mut paths = Vec::new();
    let mut missing = Vec::new();
    for pattern in &request.config.artifacts {
        let matched = expand_glob(request.repo, pattern)?;
        if matched.is_empty() {
            missing.push(pattern.clone());
        }
        paths.extend(matched);
    }
    paths.extend(request.status_files.iter().cloned());
    paths.sort();
    paths.dedup();

    let manifest = EvidenceManifest {
        generated_at: request.now,
        iteration: request.iteration,
        artifacts: describe_artifacts(request.repo, &paths)?,
        missing,
    };
    write_json_atomic(request.manifest_path, &manifest)?;
    debug!(
        artifacts = manifest.artifacts.len(),
        missing = manifest.missing.len(),
        "evidence manifest written"
    );

    if request.config.required && !manifest.missing.is_empty() {
        warn!(missing = ?manifest.missing, "required evidence missing");
        return Ok(GateResult::failed(format!(
            "missing artifacts: {}",
            manifest.missing.join(", ")
        )));
    }
    Ok(GateResult::passed().with_detail(format!("{} artifact(s)", manifest.artifacts.len())))
}
