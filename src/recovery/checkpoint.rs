// src/recovery/checkpoint.rs
//! Checkpoint documents: immutable JSON snapshots of a project written to
//! disk, named so the owning project and capture time can be recovered from
//! the filename alone.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FactoryError;
use crate::models::{Project, WorkflowStep};

/// Existence and size record for one registered project file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub exists: bool,
    pub size_bytes: Option<u64>,
}

/// Full snapshot of a project: metadata, ordered step rows and a digest of
/// the files its completed steps have registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub project: Project,
    pub steps: Vec<WorkflowStep>,
    pub file_digest: BTreeMap<String, FileDigest>,
    pub created_at: DateTime<Utc>,
}

/// `checkpoint_{project}_{YYYYmmdd_HHMMSS}[_{suffix}].json`. The optional
/// suffix disambiguates snapshots taken within the same second.
pub fn checkpoint_file_name(
    project_id: &str,
    at: DateTime<Utc>,
    suffix: Option<&str>,
) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    match suffix {
        Some(s) if !s.is_empty() => format!("checkpoint_{}_{}_{}.json", project_id, stamp, s),
        _ => format!("checkpoint_{}_{}.json", project_id, stamp),
    }
}

pub(crate) fn write_checkpoint_file(
    dir: &Path,
    name: &str,
    data: &CheckpointData,
) -> Result<PathBuf, FactoryError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let payload = serde_json::to_string_pretty(data)?;
    fs::write(&path, payload)?;
    Ok(path)
}

pub(crate) fn read_checkpoint_file(path: &Path) -> Result<CheckpointData, FactoryError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        FactoryError::Recovery(format!("cannot read checkpoint file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        FactoryError::Recovery(format!("malformed checkpoint file {}: {}", path.display(), e))
    })
}

/// Checkpoint files belonging to one project, newest first. Recency comes
/// from file modification time, with the stamped filename as tie-break.
pub(crate) fn list_checkpoint_files(
    dir: &Path,
    project_id: &str,
) -> Result<Vec<PathBuf>, FactoryError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let pattern = Regex::new(&format!(
        r"^checkpoint_{}_\d{{8}}_\d{{6}}(_.+)?\.json$",
        regex::escape(project_id)
    ))
    .map_err(|e| FactoryError::Recovery(format!("invalid checkpoint pattern: {}", e)))?;

    let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !pattern.is_match(name) {
            continue;
        }
        let modified = entry
            .metadata()?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((entry.path(), modified));
    }

    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    Ok(entries.into_iter().map(|(path, _)| path).collect())
}
