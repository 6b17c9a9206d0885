// src/registry.rs
//! Project registry: owns project rows and the matching on-disk directory
//! tree. Creation treats the database row and the directory tree as one unit,
//! so a filesystem failure rolls the row back instead of leaving an orphan.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::FactoryError;
use crate::models::{Project, ProjectRow, ProjectStatus};

/// Fixed per-project directory layout. A missing entry is an integrity
/// violation, not a cue to lazily create it.
pub const PROJECT_SUBDIRS: [&str; 7] = [
    "files/audio",
    "files/video",
    "files/images",
    "files/scripts",
    "files/metadata",
    "logs",
    "cache",
];

#[derive(Clone)]
pub struct ProjectRegistry {
    pool: SqlitePool,
    projects_root: PathBuf,
}

impl ProjectRegistry {
    pub fn new(pool: SqlitePool, projects_root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            projects_root: projects_root.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Directory holding all files of one project.
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_root.join(project_id)
    }

    /// Creates a project row plus its directory tree, or neither.
    pub async fn create_project(
        &self,
        theme: &str,
        target_length_minutes: f64,
        config: serde_json::Value,
    ) -> Result<Project, FactoryError> {
        let theme = theme.trim();
        if theme.is_empty() {
            return Err(FactoryError::Validation(
                "project theme must not be empty".to_string(),
            ));
        }
        if !target_length_minutes.is_finite() || target_length_minutes <= 0.0 {
            return Err(FactoryError::Validation(format!(
                "target length must be a positive number of minutes, got {}",
                target_length_minutes
            )));
        }

        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            theme: theme.to_string(),
            status: ProjectStatus::Created,
            config,
            target_length_minutes,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO projects (id, theme, status, config, target_length_minutes, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&project.id)
        .bind(&project.theme)
        .bind(project.status.as_str())
        .bind(sqlx::types::Json(project.config.clone()))
        .bind(project.target_length_minutes)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await?;

        // Directory tree goes up while the insert is still uncommitted; if the
        // filesystem refuses, the row never becomes visible.
        let dir = self.project_dir(&project.id);
        if let Err(e) = create_project_tree(&dir) {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!("Rollback after directory failure also failed: {}", rollback_err);
            }
            if dir.exists() {
                if let Err(cleanup_err) = fs::remove_dir_all(&dir) {
                    tracing::warn!(
                        "Failed to remove partial project directory {}: {}",
                        dir.display(),
                        cleanup_err
                    );
                }
            }
            tracing::error!("❌ Could not create directories for project {}: {}", project.id, e);
            return Err(FactoryError::Io(e));
        }
        tx.commit().await?;

        tracing::info!("🎬 Created project {} (theme: {})", project.id, project.theme);
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, FactoryError> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, theme, status, config, target_length_minutes, created_at, updated_at
            FROM projects
            WHERE id = ?1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_project()).transpose()
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, FactoryError> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, theme, status, config, target_length_minutes, created_at, updated_at
            FROM projects
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_project()).collect()
    }

    pub async fn update_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<(), FactoryError> {
        let result = sqlx::query("UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(FactoryError::ProjectNotFound(project_id.to_string()));
        }

        tracing::debug!("📊 Project {} status -> {}", project_id, status);
        Ok(())
    }

    /// Removes the project row (steps cascade) and its directory tree. Both
    /// deletions are attempted regardless of the other's outcome, and partial
    /// failure is reported instead of hidden.
    pub async fn delete_project(&self, project_id: &str) -> Result<(), FactoryError> {
        let db_result = sqlx::query("DELETE FROM projects WHERE id = ?1")
            .bind(project_id)
            .execute(&self.pool)
            .await;

        let dir = self.project_dir(project_id);
        let fs_result = if dir.exists() {
            fs::remove_dir_all(&dir).map(|_| true)
        } else {
            Ok(false)
        };

        let mut removed_row = false;
        let mut removed_dir = false;
        let mut issues = Vec::new();
        match db_result {
            Ok(r) => removed_row = r.rows_affected() > 0,
            Err(e) => issues.push(format!("database delete failed: {}", e)),
        }
        match fs_result {
            Ok(r) => removed_dir = r,
            Err(e) => issues.push(format!(
                "directory delete failed for {}: {}",
                dir.display(),
                e
            )),
        }

        if !issues.is_empty() {
            return Err(FactoryError::Inconsistency(format!(
                "project {} deletion incomplete: {}",
                project_id,
                issues.join("; ")
            )));
        }
        if !removed_row && !removed_dir {
            return Err(FactoryError::ProjectNotFound(project_id.to_string()));
        }

        tracing::info!("🗑️ Deleted project {}", project_id);
        Ok(())
    }
}

fn create_project_tree(root: &Path) -> std::io::Result<()> {
    for sub in PROJECT_SUBDIRS {
        fs::create_dir_all(root.join(sub))?;
    }
    Ok(())
}
