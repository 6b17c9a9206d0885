// src/workflow/state_machine.rs
//! Per-step lifecycle of a project's pipeline.
//!
//! Transitions are guarded by status preconditions inside a transaction:
//! a compare-and-swap against the current row rather than a blind update.
//! One orchestrator drives a given project at a time; a racing caller loses
//! the guard check and gets an `InvalidTransition` instead of clobbering
//! state. Every mutation also bumps the owning project's `updated_at` so
//! staleness detection can rely on it.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::FactoryError;
use crate::models::{StepDefinition, StepRow, StepStatus, WorkflowStep};

/// Aggregate progress over one project's steps.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectProgress {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub running_steps: usize,
    pub pending_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub completion_percentage: f64,
    pub current_step: Option<WorkflowStep>,
}

#[derive(Clone)]
pub struct WorkflowStateMachine {
    pool: SqlitePool,
}

impl WorkflowStateMachine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts one pending row per definition, numbered densely from 1 in
    /// list order. Rejects empty definitions, duplicate names and projects
    /// that already have steps.
    pub async fn initialize_workflow_steps(
        &self,
        project_id: &str,
        definitions: &[StepDefinition],
    ) -> Result<Vec<WorkflowStep>, FactoryError> {
        if definitions.is_empty() {
            return Err(FactoryError::Validation(
                "workflow definition must contain at least one step".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for definition in definitions {
            if definition.name.trim().is_empty() {
                return Err(FactoryError::Validation(
                    "workflow step names must not be empty".to_string(),
                ));
            }
            if !seen.insert(definition.name.as_str()) {
                return Err(FactoryError::Validation(format!(
                    "duplicate step name '{}' in workflow definition",
                    definition.name
                )));
            }
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        touch_project(&mut tx, project_id, now).await?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workflow_steps WHERE project_id = ?1")
                .bind(project_id)
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            return Err(FactoryError::Validation(format!(
                "workflow steps already initialized for project {}",
                project_id
            )));
        }

        for (index, definition) in definitions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (project_id, step_number, step_name, status, retry_count, input_data, output_data)
                VALUES (?1, ?2, ?3, ?4, 0, '{}', '{}')
                "#,
            )
            .bind(project_id)
            .bind(index as i64 + 1)
            .bind(&definition.name)
            .bind(StepStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(
            "🧱 Initialized {} workflow steps for project {}",
            definitions.len(),
            project_id
        );
        self.get_workflow_steps(project_id).await
    }

    /// pending -> running. Records the input payload and the start time.
    pub async fn start_step(
        &self,
        project_id: &str,
        step_number: i64,
        input_data: serde_json::Value,
    ) -> Result<WorkflowStep, FactoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, project_id, step_number).await?;
        ensure_transition(&step, &[StepStatus::Pending], "start")?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?1, started_at = ?2, input_data = ?3
            WHERE project_id = ?4 AND step_number = ?5
            "#,
        )
        .bind(StepStatus::Running.as_str())
        .bind(now)
        .bind(sqlx::types::Json(input_data))
        .bind(project_id)
        .bind(step_number)
        .execute(&mut *tx)
        .await?;

        touch_project(&mut tx, project_id, now).await?;
        let updated = fetch_step(&mut tx, project_id, step_number).await?;
        tx.commit().await?;

        tracing::info!(
            "🚀 Step {} ({}) started for project {}",
            updated.step_number,
            updated.step_name,
            project_id
        );
        Ok(updated)
    }

    /// running -> completed. Records the output payload and the finish time.
    pub async fn complete_step(
        &self,
        project_id: &str,
        step_number: i64,
        output_data: serde_json::Value,
    ) -> Result<WorkflowStep, FactoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, project_id, step_number).await?;
        ensure_transition(&step, &[StepStatus::Running], "complete")?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?1, completed_at = ?2, output_data = ?3
            WHERE project_id = ?4 AND step_number = ?5
            "#,
        )
        .bind(StepStatus::Completed.as_str())
        .bind(now)
        .bind(sqlx::types::Json(output_data))
        .bind(project_id)
        .bind(step_number)
        .execute(&mut *tx)
        .await?;

        touch_project(&mut tx, project_id, now).await?;
        let updated = fetch_step(&mut tx, project_id, step_number).await?;
        tx.commit().await?;

        tracing::info!(
            "✅ Step {} ({}) completed for project {}",
            updated.step_number,
            updated.step_name,
            project_id
        );
        Ok(updated)
    }

    /// running -> failed. Keeps `started_at` so the attempt stays visible.
    pub async fn fail_step(
        &self,
        project_id: &str,
        step_number: i64,
        error: &str,
    ) -> Result<WorkflowStep, FactoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, project_id, step_number).await?;
        ensure_transition(&step, &[StepStatus::Running], "fail")?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?1, error_message = ?2
            WHERE project_id = ?3 AND step_number = ?4
            "#,
        )
        .bind(StepStatus::Failed.as_str())
        .bind(error)
        .bind(project_id)
        .bind(step_number)
        .execute(&mut *tx)
        .await?;

        touch_project(&mut tx, project_id, now).await?;
        let updated = fetch_step(&mut tx, project_id, step_number).await?;
        tx.commit().await?;

        tracing::warn!(
            "❌ Step {} ({}) failed for project {}: {}",
            updated.step_number,
            updated.step_name,
            project_id,
            error
        );
        Ok(updated)
    }

    /// failed -> running. Increments the retry counter, clears the previous
    /// error, replaces the input payload and refreshes `started_at`.
    pub async fn retry_step(
        &self,
        project_id: &str,
        step_number: i64,
        input_data: serde_json::Value,
    ) -> Result<WorkflowStep, FactoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, project_id, step_number).await?;
        ensure_transition(&step, &[StepStatus::Failed], "retry")?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?1, started_at = ?2, error_message = NULL,
                retry_count = retry_count + 1, input_data = ?3
            WHERE project_id = ?4 AND step_number = ?5
            "#,
        )
        .bind(StepStatus::Running.as_str())
        .bind(now)
        .bind(sqlx::types::Json(input_data))
        .bind(project_id)
        .bind(step_number)
        .execute(&mut *tx)
        .await?;

        touch_project(&mut tx, project_id, now).await?;
        let updated = fetch_step(&mut tx, project_id, step_number).await?;
        tx.commit().await?;

        tracing::info!(
            "🔄 Step {} ({}) retry #{} for project {}",
            updated.step_number,
            updated.step_name,
            updated.retry_count,
            project_id
        );
        Ok(updated)
    }

    /// pending|failed -> skipped. The reason lands in `error_message` and the
    /// skip moment in `completed_at`.
    pub async fn skip_step(
        &self,
        project_id: &str,
        step_number: i64,
        reason: &str,
    ) -> Result<WorkflowStep, FactoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, project_id, step_number).await?;
        ensure_transition(&step, &[StepStatus::Pending, StepStatus::Failed], "skip")?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?1, completed_at = ?2, error_message = ?3
            WHERE project_id = ?4 AND step_number = ?5
            "#,
        )
        .bind(StepStatus::Skipped.as_str())
        .bind(now)
        .bind(reason)
        .bind(project_id)
        .bind(step_number)
        .execute(&mut *tx)
        .await?;

        touch_project(&mut tx, project_id, now).await?;
        let updated = fetch_step(&mut tx, project_id, step_number).await?;
        tx.commit().await?;

        tracing::info!(
            "⏭️ Step {} ({}) skipped for project {}: {}",
            updated.step_number,
            updated.step_name,
            project_id,
            reason
        );
        Ok(updated)
    }

    /// any -> pending. Wipes timestamps, error, retry counter and payloads.
    pub async fn reset_step(
        &self,
        project_id: &str,
        step_number: i64,
    ) -> Result<WorkflowStep, FactoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        fetch_step(&mut tx, project_id, step_number).await?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?1, started_at = NULL, completed_at = NULL,
                error_message = NULL, retry_count = 0, input_data = '{}', output_data = '{}'
            WHERE project_id = ?2 AND step_number = ?3
            "#,
        )
        .bind(StepStatus::Pending.as_str())
        .bind(project_id)
        .bind(step_number)
        .execute(&mut *tx)
        .await?;

        touch_project(&mut tx, project_id, now).await?;
        let updated = fetch_step(&mut tx, project_id, step_number).await?;
        tx.commit().await?;

        tracing::info!(
            "🧹 Step {} ({}) reset for project {}",
            updated.step_number,
            updated.step_name,
            project_id
        );
        Ok(updated)
    }

    pub async fn get_step_by_number(
        &self,
        project_id: &str,
        step_number: i64,
    ) -> Result<Option<WorkflowStep>, FactoryError> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT project_id, step_number, step_name, status, started_at, completed_at,
                   error_message, retry_count, input_data, output_data
            FROM workflow_steps
            WHERE project_id = ?1 AND step_number = ?2
            "#,
        )
        .bind(project_id)
        .bind(step_number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_step()).transpose()
    }

    pub async fn get_step_by_name(
        &self,
        project_id: &str,
        step_name: &str,
    ) -> Result<Option<WorkflowStep>, FactoryError> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT project_id, step_number, step_name, status, started_at, completed_at,
                   error_message, retry_count, input_data, output_data
            FROM workflow_steps
            WHERE project_id = ?1 AND step_name = ?2
            "#,
        )
        .bind(project_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_step()).transpose()
    }

    /// All steps of a project in pipeline order.
    pub async fn get_workflow_steps(
        &self,
        project_id: &str,
    ) -> Result<Vec<WorkflowStep>, FactoryError> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT project_id, step_number, step_name, status, started_at, completed_at,
                   error_message, retry_count, input_data, output_data
            FROM workflow_steps
            WHERE project_id = ?1
            ORDER BY step_number ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_step()).collect()
    }

    pub async fn get_failed_steps(
        &self,
        project_id: &str,
    ) -> Result<Vec<WorkflowStep>, FactoryError> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT project_id, step_number, step_name, status, started_at, completed_at,
                   error_message, retry_count, input_data, output_data
            FROM workflow_steps
            WHERE project_id = ?1 AND status = ?2
            ORDER BY step_number ASC
            "#,
        )
        .bind(project_id)
        .bind(StepStatus::Failed.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_step()).collect()
    }

    /// Snapshot of step counts plus the first running step, if any.
    pub async fn get_project_progress(
        &self,
        project_id: &str,
    ) -> Result<ProjectProgress, FactoryError> {
        let steps = self.get_workflow_steps(project_id).await?;

        let mut progress = ProjectProgress {
            total_steps: steps.len(),
            completed_steps: 0,
            running_steps: 0,
            pending_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            completion_percentage: 0.0,
            current_step: None,
        };
        for step in &steps {
            match step.status {
                StepStatus::Pending => progress.pending_steps += 1,
                StepStatus::Running => progress.running_steps += 1,
                StepStatus::Completed => progress.completed_steps += 1,
                StepStatus::Failed => progress.failed_steps += 1,
                StepStatus::Skipped => progress.skipped_steps += 1,
            }
        }
        if progress.total_steps > 0 {
            progress.completion_percentage =
                progress.completed_steps as f64 * 100.0 / progress.total_steps as f64;
        }
        progress.current_step = steps
            .iter()
            .find(|s| s.status == StepStatus::Running)
            .cloned();

        Ok(progress)
    }

    /// Average duration of completed steps times the number of steps still to
    /// run. Zero when nothing completed yet or nothing remains.
    pub async fn calculate_estimated_remaining_time(
        &self,
        project_id: &str,
    ) -> Result<Duration, FactoryError> {
        let steps = self.get_workflow_steps(project_id).await?;

        let observed: Vec<Duration> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.duration())
            .collect();
        let remaining = steps
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Pending | StepStatus::Running | StepStatus::Failed
                )
            })
            .count();

        if observed.is_empty() || remaining == 0 {
            return Ok(Duration::zero());
        }

        let total = observed
            .iter()
            .fold(Duration::zero(), |acc, d| acc + *d);
        let average = total / observed.len() as i32;
        Ok(average * remaining as i32)
    }
}

async fn fetch_step(
    tx: &mut Transaction<'_, Sqlite>,
    project_id: &str,
    step_number: i64,
) -> Result<WorkflowStep, FactoryError> {
    let row = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT project_id, step_number, step_name, status, started_at, completed_at,
               error_message, retry_count, input_data, output_data
        FROM workflow_steps
        WHERE project_id = ?1 AND step_number = ?2
        "#,
    )
    .bind(project_id)
    .bind(step_number)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some(row) => row.into_step(),
        None => Err(FactoryError::StepNotFound {
            project_id: project_id.to_string(),
            step_number,
        }),
    }
}

/// Bumps the owning project's `updated_at`; doubles as an existence check.
async fn touch_project(
    tx: &mut Transaction<'_, Sqlite>,
    project_id: &str,
    now: DateTime<Utc>,
) -> Result<(), FactoryError> {
    let result = sqlx::query("UPDATE projects SET updated_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(project_id)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(FactoryError::ProjectNotFound(project_id.to_string()));
    }
    Ok(())
}

fn ensure_transition(
    step: &WorkflowStep,
    allowed: &[StepStatus],
    action: &'static str,
) -> Result<(), FactoryError> {
    if allowed.contains(&step.status) {
        return Ok(());
    }
    Err(FactoryError::InvalidTransition {
        project_id: step.project_id.clone(),
        step_number: step.step_number,
        from: step.status.to_string(),
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use crate::models::StepDefinition;
    use crate::registry::ProjectRegistry;
    use serde_json::json;

    fn three_steps() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new("theme_selection"),
            StepDefinition::new("script_generation"),
            StepDefinition::new("speech_synthesis"),
        ]
    }

    async fn setup() -> (tempfile::TempDir, ProjectRegistry, WorkflowStateMachine, String) {
        let (dir, pool) = temp_pool().await;
        let registry = ProjectRegistry::new(pool.clone(), dir.path().join("projects"));
        let workflow = WorkflowStateMachine::new(pool);
        let project = registry
            .create_project("deep sea creatures", 3.0, json!({}))
            .await
            .unwrap();
        (dir, registry, workflow, project.id)
    }

    #[tokio::test]
    async fn test_initialize_creates_dense_pending_rows() {
        let (_dir, _registry, workflow, project_id) = setup().await;

        let steps = workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        assert_eq!(steps.len(), 3);
        for (index, step) in steps.iter().enumerate() {
            assert_eq!(step.step_number, index as i64 + 1);
            assert_eq!(step.status, StepStatus::Pending);
            assert_eq!(step.retry_count, 0);
            assert_eq!(step.input_data, json!({}));
            assert_eq!(step.output_data, json!({}));
            assert!(step.started_at.is_none());
            assert!(step.completed_at.is_none());
        }
        assert_eq!(steps[0].step_name, "theme_selection");
        assert_eq!(steps[2].step_name, "speech_synthesis");
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_definitions() {
        let (_dir, _registry, workflow, project_id) = setup().await;

        assert!(matches!(
            workflow.initialize_workflow_steps(&project_id, &[]).await,
            Err(FactoryError::Validation(_))
        ));

        let duplicated = vec![
            StepDefinition::new("theme_selection"),
            StepDefinition::new("theme_selection"),
        ];
        assert!(matches!(
            workflow
                .initialize_workflow_steps(&project_id, &duplicated)
                .await,
            Err(FactoryError::Validation(_))
        ));

        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();
        assert!(matches!(
            workflow
                .initialize_workflow_steps(&project_id, &three_steps())
                .await,
            Err(FactoryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_initialize_unknown_project() {
        let (_dir, _registry, workflow, _project_id) = setup().await;
        let result = workflow
            .initialize_workflow_steps("missing", &three_steps())
            .await;
        assert!(matches!(result, Err(FactoryError::ProjectNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_and_complete_record_payloads_and_timestamps() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        let started = workflow
            .start_step(&project_id, 1, json!({ "theme_hint": "deep sea" }))
            .await
            .unwrap();
        assert_eq!(started.status, StepStatus::Running);
        assert!(started.started_at.is_some());
        assert_eq!(started.input_data, json!({ "theme_hint": "deep sea" }));

        let completed = workflow
            .complete_step(&project_id, 1, json!({ "files": [], "data": { "theme": "anglerfish" } }))
            .await
            .unwrap();
        assert_eq!(completed.status, StepStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert_eq!(
            completed.output_data,
            json!({ "files": [], "data": { "theme": "anglerfish" } })
        );
        assert!(completed.completed_at.unwrap() >= completed.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_transition_guards_reject_wrong_status() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        // complete before start
        assert!(matches!(
            workflow.complete_step(&project_id, 1, json!({})).await,
            Err(FactoryError::InvalidTransition { .. })
        ));
        // fail before start
        assert!(matches!(
            workflow.fail_step(&project_id, 1, "boom").await,
            Err(FactoryError::InvalidTransition { .. })
        ));
        // retry a step that never failed
        assert!(matches!(
            workflow.retry_step(&project_id, 1, json!({})).await,
            Err(FactoryError::InvalidTransition { .. })
        ));

        workflow.start_step(&project_id, 1, json!({})).await.unwrap();
        // double start
        assert!(matches!(
            workflow.start_step(&project_id, 1, json!({})).await,
            Err(FactoryError::InvalidTransition { .. })
        ));

        workflow.complete_step(&project_id, 1, json!({})).await.unwrap();
        // skip a completed step
        assert!(matches!(
            workflow.skip_step(&project_id, 1, "done anyway").await,
            Err(FactoryError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_and_retry_cycle() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        workflow
            .start_step(&project_id, 2, json!({ "attempt": 1 }))
            .await
            .unwrap();
        let failed = workflow
            .fail_step(&project_id, 2, "TTS quota exceeded")
            .await
            .unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("TTS quota exceeded"));
        assert_eq!(failed.retry_count, 0);
        assert!(failed.started_at.is_some());
        assert!(failed.completed_at.is_none());

        let retried = workflow
            .retry_step(&project_id, 2, json!({ "attempt": 2 }))
            .await
            .unwrap();
        assert_eq!(retried.status, StepStatus::Running);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error_message.is_none());
        assert_eq!(retried.input_data, json!({ "attempt": 2 }));
        assert!(retried.started_at.unwrap() >= failed.started_at.unwrap());

        workflow.fail_step(&project_id, 2, "again").await.unwrap();
        let retried = workflow
            .retry_step(&project_id, 2, json!({ "attempt": 3 }))
            .await
            .unwrap();
        assert_eq!(retried.retry_count, 2);
    }

    #[tokio::test]
    async fn test_skip_from_pending_and_failed() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        let skipped = workflow
            .skip_step(&project_id, 1, "operator provided the theme manually")
            .await
            .unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(skipped.completed_at.is_some());
        assert_eq!(
            skipped.error_message.as_deref(),
            Some("operator provided the theme manually")
        );

        workflow.start_step(&project_id, 2, json!({})).await.unwrap();
        workflow.fail_step(&project_id, 2, "boom").await.unwrap();
        let skipped = workflow
            .skip_step(&project_id, 2, "not worth retrying")
            .await
            .unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);

        workflow.start_step(&project_id, 3, json!({})).await.unwrap();
        assert!(matches!(
            workflow.skip_step(&project_id, 3, "mid-flight").await,
            Err(FactoryError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_restores_initial_row() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        workflow
            .start_step(&project_id, 1, json!({ "x": 1 }))
            .await
            .unwrap();
        workflow.fail_step(&project_id, 1, "nope").await.unwrap();
        workflow
            .retry_step(&project_id, 1, json!({ "x": 2 }))
            .await
            .unwrap();
        workflow
            .complete_step(&project_id, 1, json!({ "files": ["files/scripts/script.md"], "data": null }))
            .await
            .unwrap();

        let reset = workflow.reset_step(&project_id, 1).await.unwrap();
        assert_eq!(reset.status, StepStatus::Pending);
        assert!(reset.started_at.is_none());
        assert!(reset.completed_at.is_none());
        assert!(reset.error_message.is_none());
        assert_eq!(reset.retry_count, 0);
        assert_eq!(reset.input_data, json!({}));
        assert_eq!(reset.output_data, json!({}));
    }

    #[tokio::test]
    async fn test_step_not_found() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        let result = workflow.start_step(&project_id, 99, json!({})).await;
        assert!(matches!(result, Err(FactoryError::StepNotFound { .. })));
    }

    #[tokio::test]
    async fn test_step_mutations_bump_project_updated_at() {
        let (_dir, registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();
        let before = registry.get_project(&project_id).await.unwrap().unwrap();

        workflow.start_step(&project_id, 1, json!({})).await.unwrap();

        let after = registry.get_project(&project_id).await.unwrap().unwrap();
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn test_progress_counts_and_percentage() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        workflow.start_step(&project_id, 1, json!({})).await.unwrap();
        workflow.complete_step(&project_id, 1, json!({})).await.unwrap();
        workflow.start_step(&project_id, 2, json!({})).await.unwrap();

        let progress = workflow.get_project_progress(&project_id).await.unwrap();
        assert_eq!(progress.total_steps, 3);
        assert_eq!(progress.completed_steps, 1);
        assert_eq!(progress.running_steps, 1);
        assert_eq!(progress.pending_steps, 1);
        assert_eq!(progress.failed_steps, 0);
        assert!((progress.completion_percentage - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(progress.current_step.as_ref().map(|s| s.step_number), Some(2));
    }

    #[tokio::test]
    async fn test_progress_half_complete_is_exactly_fifty_percent() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(
                &project_id,
                &[
                    StepDefinition::new("theme_selection"),
                    StepDefinition::new("script_generation"),
                    StepDefinition::new("speech_synthesis"),
                    StepDefinition::new("upload"),
                ],
            )
            .await
            .unwrap();

        for number in [1, 2] {
            workflow.start_step(&project_id, number, json!({})).await.unwrap();
            workflow.complete_step(&project_id, number, json!({})).await.unwrap();
        }
        workflow.start_step(&project_id, 3, json!({})).await.unwrap();

        let progress = workflow.get_project_progress(&project_id).await.unwrap();
        assert_eq!(progress.completed_steps, 2);
        assert_eq!(progress.running_steps, 1);
        assert_eq!(progress.pending_steps, 1);
        assert_eq!(progress.completion_percentage, 50.0);
        assert_eq!(progress.current_step.unwrap().step_number, 3);
    }

    #[tokio::test]
    async fn test_progress_for_project_without_steps() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        let progress = workflow.get_project_progress(&project_id).await.unwrap();
        assert_eq!(progress.total_steps, 0);
        assert_eq!(progress.completion_percentage, 0.0);
        assert!(progress.current_step.is_none());
    }

    #[tokio::test]
    async fn test_estimated_remaining_time_uses_average_duration() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        // No completed steps yet: no estimate to give.
        let eta = workflow
            .calculate_estimated_remaining_time(&project_id)
            .await
            .unwrap();
        assert_eq!(eta, Duration::zero());

        workflow.start_step(&project_id, 1, json!({})).await.unwrap();
        workflow.complete_step(&project_id, 1, json!({})).await.unwrap();

        // Pin the first step to a known 30s duration.
        let base = Utc::now();
        sqlx::query(
            "UPDATE workflow_steps SET started_at = ?1, completed_at = ?2 WHERE project_id = ?3 AND step_number = 1",
        )
        .bind(base)
        .bind(base + Duration::seconds(30))
        .bind(&project_id)
        .execute(workflow.pool_for_tests())
        .await
        .unwrap();

        let eta = workflow
            .calculate_estimated_remaining_time(&project_id)
            .await
            .unwrap();
        assert_eq!(eta, Duration::seconds(60), "two remaining steps at 30s each");
    }

    #[tokio::test]
    async fn test_estimated_remaining_time_zero_when_done() {
        let (_dir, _registry, workflow, project_id) = setup().await;
        workflow
            .initialize_workflow_steps(&project_id, &three_steps())
            .await
            .unwrap();

        for number in 1..=3 {
            workflow.start_step(&project_id, number, json!({})).await.unwrap();
            workflow.complete_step(&project_id, number, json!({})).await.unwrap();
        }

        let eta = workflow
            .calculate_estimated_remaining_time(&project_id)
            .await
            .unwrap();
        assert_eq!(eta, Duration::zero());
    }
}

#[cfg(test)]
impl WorkflowStateMachine {
    pub(crate) fn pool_for_tests(&self) -> &SqlitePool {
        &self.pool
    }
}
