// src/recovery/mod.rs
//! Recovery manager: snapshots project state to checkpoint files, verifies
//! consistency between the database and the project directory, and brings
//! interrupted projects back to a runnable state without redoing finished
//! steps.

pub mod checkpoint;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::FactoryError;
use crate::models::{Project, ProjectStatus, StepOutput, StepStatus, WorkflowStep};
use crate::registry::{ProjectRegistry, PROJECT_SUBDIRS};
use crate::workflow::state_machine::WorkflowStateMachine;

use checkpoint::{
    checkpoint_file_name, list_checkpoint_files, read_checkpoint_file, write_checkpoint_file,
    CheckpointData, FileDigest,
};

/// Result of a structural checkpoint validation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Consistency report across the database and the project directory.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub database_consistency: bool,
    pub file_system_consistency: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub restored_steps: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeOutcome {
    pub resumable: bool,
    pub current_step: Option<WorkflowStep>,
    pub next_actions: Vec<String>,
}

/// How urgently a project needs operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPriority {
    Low,
    Medium,
    High,
}

impl RecoveryPriority {
    fn from_failure_count(failed: usize) -> Self {
        match failed {
            0 => RecoveryPriority::Low,
            1 | 2 => RecoveryPriority::Medium,
            _ => RecoveryPriority::High,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecommendations {
    pub failed_steps: Vec<WorkflowStep>,
    pub recommended_actions: Vec<String>,
    pub priority: RecoveryPriority,
}

#[derive(Clone)]
pub struct RecoveryManager {
    pool: SqlitePool,
    registry: ProjectRegistry,
    workflow: WorkflowStateMachine,
    checkpoints_root: PathBuf,
}

impl RecoveryManager {
    pub fn new(
        registry: ProjectRegistry,
        workflow: WorkflowStateMachine,
        checkpoints_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pool: registry.pool().clone(),
            registry,
            workflow,
            checkpoints_root: checkpoints_root.into(),
        }
    }

    pub fn checkpoints_root(&self) -> &Path {
        &self.checkpoints_root
    }

    async fn require_project(&self, project_id: &str) -> Result<Project, FactoryError> {
        self.registry
            .get_project(project_id)
            .await?
            .ok_or_else(|| FactoryError::ProjectNotFound(project_id.to_string()))
    }

    /// Pure read: assembles a snapshot without mutating anything.
    pub async fn create_checkpoint(&self, project_id: &str) -> Result<CheckpointData, FactoryError> {
        let project = self.require_project(project_id).await?;
        let steps = self.workflow.get_workflow_steps(project_id).await?;
        let file_digest = self.compute_file_digest(project_id, &steps);

        Ok(CheckpointData {
            project,
            steps,
            file_digest,
            created_at: Utc::now(),
        })
    }

    fn compute_file_digest(
        &self,
        project_id: &str,
        steps: &[WorkflowStep],
    ) -> BTreeMap<String, FileDigest> {
        let root = self.registry.project_dir(project_id);
        let mut digest = BTreeMap::new();
        for relative in registered_files(steps) {
            let entry = match fs::metadata(root.join(&relative)) {
                Ok(meta) => FileDigest {
                    exists: true,
                    size_bytes: Some(meta.len()),
                },
                Err(_) => FileDigest {
                    exists: false,
                    size_bytes: None,
                },
            };
            digest.insert(relative, entry);
        }
        digest
    }

    /// Writes a snapshot to the checkpoint directory. The filename is derived
    /// from the snapshot's own capture time, so saving the same data twice is
    /// idempotent rather than duplicating files.
    pub fn save_checkpoint_to_file(
        &self,
        data: &CheckpointData,
        suffix: Option<&str>,
    ) -> Result<PathBuf, FactoryError> {
        let name = checkpoint_file_name(&data.project.id, data.created_at, suffix);
        let path = write_checkpoint_file(&self.checkpoints_root, &name, data)?;
        info!("💾 Checkpoint saved: {}", path.display());
        Ok(path)
    }

    pub fn load_checkpoint_from_file(&self, path: &Path) -> Result<CheckpointData, FactoryError> {
        read_checkpoint_file(path)
    }

    /// Snapshot the current state and write it out in one go.
    pub async fn auto_save_checkpoint(&self, project_id: &str) -> Result<PathBuf, FactoryError> {
        let data = self.create_checkpoint(project_id).await?;
        self.save_checkpoint_to_file(&data, None)
    }

    /// Checkpoint files for a project, newest first.
    pub fn list_checkpoints(&self, project_id: &str) -> Result<Vec<PathBuf>, FactoryError> {
        list_checkpoint_files(&self.checkpoints_root, project_id)
    }

    pub fn load_latest_checkpoint(
        &self,
        project_id: &str,
    ) -> Result<Option<CheckpointData>, FactoryError> {
        match self.list_checkpoints(project_id)?.first() {
            Some(path) => Ok(Some(read_checkpoint_file(path)?)),
            None => Ok(None),
        }
    }

    /// Deletes all but the `keep_count` most recent checkpoints of a project.
    /// Returns how many files were removed; individual delete failures are
    /// logged and skipped so one stuck file cannot block the sweep.
    pub fn cleanup_old_checkpoints(
        &self,
        project_id: &str,
        keep_count: usize,
    ) -> Result<usize, FactoryError> {
        let files = self.list_checkpoints(project_id)?;
        let mut deleted = 0usize;
        for path in files.iter().skip(keep_count) {
            match fs::remove_file(path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete old checkpoint {}: {}", path.display(), e),
            }
        }
        if deleted > 0 {
            info!("🧹 Cleaned up {} old checkpoints for project {}", deleted, project_id);
        }
        Ok(deleted)
    }

    /// Structural checks on a snapshot before it may be restored: non-empty
    /// identity fields, dense step numbering and well-formed output payloads.
    pub fn validate_checkpoint_data(&self, data: &CheckpointData) -> CheckpointValidation {
        let mut errors = Vec::new();

        if data.project.id.trim().is_empty() {
            errors.push("project id is empty".to_string());
        }
        if data.project.theme.trim().is_empty() {
            errors.push("project theme is empty".to_string());
        }

        let mut seen = std::collections::BTreeSet::new();
        for step in &data.steps {
            if !seen.insert(step.step_number) {
                errors.push(format!("duplicate step number {}", step.step_number));
            }
            if step.project_id != data.project.id {
                errors.push(format!(
                    "step {} belongs to project {} instead of {}",
                    step.step_number, step.project_id, data.project.id
                ));
            }
            if let Err(e) = StepOutput::from_value(&step.output_data) {
                errors.push(format!(
                    "step {} ({}) has a malformed output document: {}",
                    step.step_number, step.step_name, e
                ));
            }
        }
        for (index, step) in data.steps.iter().enumerate() {
            let expected = index as i64 + 1;
            if step.step_number != expected {
                errors.push(format!(
                    "step numbering is not dense: expected {} at position {}, found {}",
                    expected, index, step.step_number
                ));
                break;
            }
        }

        CheckpointValidation {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// Overwrites all step rows of a project from a checkpoint file, in one
    /// transaction. A best-effort safety snapshot of the current state is
    /// written first so a bad restore can itself be undone.
    pub async fn restore_project_from_checkpoint(
        &self,
        project_id: &str,
        checkpoint_path: &Path,
    ) -> Result<RestoreOutcome, FactoryError> {
        let data = self.load_checkpoint_from_file(checkpoint_path)?;
        if data.project.id != project_id {
            return Err(FactoryError::Recovery(format!(
                "checkpoint belongs to project {} but restore target is {}",
                data.project.id, project_id
            )));
        }
        let validation = self.validate_checkpoint_data(&data);
        if !validation.is_valid {
            return Err(FactoryError::Recovery(format!(
                "checkpoint failed validation: {}",
                validation.errors.join("; ")
            )));
        }
        self.require_project(project_id).await?;

        match self.create_checkpoint(project_id).await {
            Ok(current) => {
                if let Err(e) = self.save_checkpoint_to_file(&current, Some("pre_restore")) {
                    warn!("Could not write pre-restore checkpoint for {}: {}", project_id, e);
                }
            }
            Err(e) => warn!("Could not snapshot {} before restore: {}", project_id, e),
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut restored = 0usize;
        for snapshot in &data.steps {
            let result = sqlx::query(
                r#"
                UPDATE workflow_steps
                SET status = ?1, started_at = ?2, completed_at = ?3, error_message = ?4,
                    retry_count = ?5, input_data = ?6, output_data = ?7
                WHERE project_id = ?8 AND step_number = ?9
                "#,
            )
            .bind(snapshot.status.as_str())
            .bind(snapshot.started_at)
            .bind(snapshot.completed_at)
            .bind(snapshot.error_message.as_deref())
            .bind(snapshot.retry_count)
            .bind(sqlx::types::Json(snapshot.input_data.clone()))
            .bind(sqlx::types::Json(snapshot.output_data.clone()))
            .bind(project_id)
            .bind(snapshot.step_number)
            .execute(&mut *tx)
            .await?;

            // Dropping the transaction rolls back the rows already written.
            if result.rows_affected() == 0 {
                return Err(FactoryError::Recovery(format!(
                    "checkpoint references step {} which does not exist for project {}",
                    snapshot.step_number, project_id
                )));
            }
            restored += 1;
        }
        sqlx::query("UPDATE projects SET updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(
            "🔄 Restored {} step(s) for project {} from {}",
            restored,
            project_id,
            checkpoint_path.display()
        );
        Ok(RestoreOutcome {
            restored_steps: restored,
        })
    }

    /// Marks an interrupted project runnable again and reports where work
    /// should continue. Finished steps are left alone; the billing already
    /// happened and their outputs are still on disk.
    pub async fn resume_interrupted_project(
        &self,
        project_id: &str,
    ) -> Result<ResumeOutcome, FactoryError> {
        let project = self.require_project(project_id).await?;
        if project.status == ProjectStatus::Completed {
            return Err(FactoryError::Validation(format!(
                "project {} is already completed and cannot be resumed",
                project_id
            )));
        }

        let steps = self.workflow.get_workflow_steps(project_id).await?;
        self.registry
            .update_project_status(project_id, ProjectStatus::Running)
            .await?;

        let current = current_step(&steps);
        let mut next_actions = Vec::new();
        match &current {
            Some(step) if step.status == StepStatus::Running => next_actions.push(format!(
                "step {} ({}) was mid-flight; re-run it, or fail and retry it if its output is suspect",
                step.step_number, step.step_name
            )),
            Some(step) => next_actions.push(format!(
                "continue execution at step {} ({})",
                step.step_number, step.step_name
            )),
            None => next_actions
                .push("no runnable step remains; review failed and skipped steps".to_string()),
        }
        let failed = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        if failed > 0 {
            next_actions.push(format!(
                "{} failed step(s) on record; check the recovery recommendations first",
                failed
            ));
        }
        if !steps.is_empty() && steps.iter().all(|s| s.status.is_terminal()) {
            next_actions.push("all steps already finished; mark the project completed".to_string());
        }

        info!(
            "🔄 Resumed project {} (current step: {})",
            project_id,
            current
                .as_ref()
                .map(|s| s.step_name.as_str())
                .unwrap_or("none")
        );
        Ok(ResumeOutcome {
            resumable: current.is_some(),
            current_step: current,
            next_actions,
        })
    }

    pub async fn find_interrupted_projects(&self) -> Result<Vec<Project>, FactoryError> {
        self.find_projects_by_status(ProjectStatus::Interrupted).await
    }

    /// Projects still marked running did not survive their orchestrator; flip
    /// them to interrupted so the resume path picks them up. Meant to run at
    /// startup, before any new work begins.
    pub async fn mark_stale_projects_interrupted(&self) -> Result<Vec<Project>, FactoryError> {
        let running = self.find_projects_by_status(ProjectStatus::Running).await?;
        let mut flipped = Vec::new();
        for project in running {
            self.registry
                .update_project_status(&project.id, ProjectStatus::Interrupted)
                .await?;
            if let Some(updated) = self.registry.get_project(&project.id).await? {
                flipped.push(updated);
            }
        }
        if !flipped.is_empty() {
            warn!(
                "⚠️ Marked {} stale running project(s) as interrupted",
                flipped.len()
            );
        }
        Ok(flipped)
    }

    async fn find_projects_by_status(
        &self,
        status: ProjectStatus,
    ) -> Result<Vec<Project>, FactoryError> {
        let rows = sqlx::query_as::<_, crate::models::ProjectRow>(
            r#"
            SELECT id, theme, status, config, target_length_minutes, created_at, updated_at
            FROM projects
            WHERE status = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_project()).collect()
    }

    /// Cross-checks the database against the project directory: dense step
    /// numbering, well-formed payloads, the fixed directory layout, and every
    /// file registered by a completed step.
    pub async fn verify_project_integrity(
        &self,
        project_id: &str,
    ) -> Result<IntegrityReport, FactoryError> {
        let mut issues = Vec::new();
        let mut database_ok = true;
        let mut filesystem_ok = true;

        let project = self.registry.get_project(project_id).await?;
        let steps = if project.is_some() {
            self.workflow.get_workflow_steps(project_id).await?
        } else {
            database_ok = false;
            issues.push(format!("project {} has no database row", project_id));
            Vec::new()
        };

        for (index, step) in steps.iter().enumerate() {
            let expected = index as i64 + 1;
            if step.step_number != expected {
                database_ok = false;
                issues.push(format!(
                    "step numbering is not dense: expected {} found {}",
                    expected, step.step_number
                ));
            }
            if let Err(e) = StepOutput::from_value(&step.output_data) {
                database_ok = false;
                issues.push(format!(
                    "step {} ({}) has a malformed output document: {}",
                    step.step_number, step.step_name, e
                ));
            }
        }

        let root = self.registry.project_dir(project_id);
        if !root.is_dir() {
            filesystem_ok = false;
            issues.push(format!("project directory missing: {}", root.display()));
        } else {
            for sub in PROJECT_SUBDIRS {
                let dir = root.join(sub);
                if !dir.is_dir() {
                    filesystem_ok = false;
                    issues.push(format!("required directory missing: {}", dir.display()));
                }
            }
            for relative in registered_files(&steps) {
                let path = root.join(&relative);
                if !path.is_file() {
                    filesystem_ok = false;
                    issues.push(format!("registered file missing: {}", path.display()));
                }
            }
        }

        if !issues.is_empty() {
            warn!(
                "⚠️ Integrity check found {} issue(s) for project {}",
                issues.len(),
                project_id
            );
        }
        Ok(IntegrityReport {
            is_valid: database_ok && filesystem_ok,
            database_consistency: database_ok,
            file_system_consistency: filesystem_ok,
            issues,
        })
    }

    /// Per-failed-step advice plus an overall priority that rises with the
    /// number of failures.
    pub async fn get_recovery_recommendations(
        &self,
        project_id: &str,
    ) -> Result<RecoveryRecommendations, FactoryError> {
        self.require_project(project_id).await?;
        let failed_steps = self.workflow.get_failed_steps(project_id).await?;

        let mut recommended_actions = Vec::new();
        for step in &failed_steps {
            let reason = step.error_message.as_deref().unwrap_or("unknown error");
            let action = if step.retry_count == 0 {
                format!(
                    "retry step {} ({}): first failure, likely transient: {}",
                    step.step_number, step.step_name, reason
                )
            } else if step.retry_count < 3 {
                format!(
                    "retry step {} ({}): {} retry attempt(s) so far: {}",
                    step.step_number, step.step_name, step.retry_count, reason
                )
            } else {
                format!(
                    "investigate step {} ({}): still failing after {} retries, consider skipping it: {}",
                    step.step_number, step.step_name, step.retry_count, reason
                )
            };
            recommended_actions.push(action);
        }

        Ok(RecoveryRecommendations {
            priority: RecoveryPriority::from_failure_count(failed_steps.len()),
            failed_steps,
            recommended_actions,
        })
    }
}

/// File paths recorded by completed steps, deduplicated in first-seen order.
/// Steps whose payload does not parse are skipped here; integrity checks
/// report them separately.
fn registered_files(steps: &[WorkflowStep]) -> Vec<String> {
    let mut files = Vec::new();
    for step in steps {
        if step.status != StepStatus::Completed {
            continue;
        }
        let Ok(output) = StepOutput::from_value(&step.output_data) else {
            continue;
        };
        for file in output.files {
            if !files.contains(&file) {
                files.push(file);
            }
        }
    }
    files
}

/// The step where execution should continue: the first running step, or the
/// first pending step past the furthest completed one.
fn current_step(steps: &[WorkflowStep]) -> Option<WorkflowStep> {
    if let Some(step) = steps.iter().find(|s| s.status == StepStatus::Running) {
        return Some(step.clone());
    }
    let last_completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| s.step_number)
        .max()
        .unwrap_or(0);
    steps
        .iter()
        .find(|s| s.status == StepStatus::Pending && s.step_number > last_completed)
        .cloned()
}
