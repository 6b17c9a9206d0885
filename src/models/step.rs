// src/models/step.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::FactoryError;

/// Lifecycle status of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Terminal states need no further work before the project can finish.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = FactoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(FactoryError::Validation(format!(
                "unknown step status '{}'",
                other
            ))),
        }
    }
}

/// One workflow step of a project's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub project_id: String,
    pub step_number: i64,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub input_data: serde_json::Value,
    pub output_data: serde_json::Value,
}

impl WorkflowStep {
    /// Typed view over `output_data`; fails on malformed payloads.
    pub fn output(&self) -> Result<StepOutput, FactoryError> {
        StepOutput::from_value(&self.output_data)
    }

    /// Wall-clock duration, only known once both timestamps are set.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Raw database row; converted to [`WorkflowStep`] with status validation.
#[derive(Debug, FromRow)]
pub(crate) struct StepRow {
    pub project_id: String,
    pub step_number: i64,
    pub step_name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub input_data: sqlx::types::Json<serde_json::Value>,
    pub output_data: sqlx::types::Json<serde_json::Value>,
}

impl StepRow {
    pub(crate) fn into_step(self) -> Result<WorkflowStep, FactoryError> {
        Ok(WorkflowStep {
            project_id: self.project_id,
            step_number: self.step_number,
            step_name: self.step_name,
            status: self.status.parse()?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            retry_count: self.retry_count,
            input_data: self.input_data.0,
            output_data: self.output_data.0,
        })
    }
}

/// One entry of an ordered pipeline definition. Step numbers are assigned
/// from list position when the workflow is initialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Convention for step output documents: produced file paths (relative to the
/// project directory) plus a free-form data payload for downstream steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StepOutput {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, FactoryError> {
        serde_json::from_value(value.clone()).map_err(|e| {
            FactoryError::Validation(format!("malformed step output document: {}", e))
        })
    }

    // json! cannot fail, unlike serde_json::to_value.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "files": self.files, "data": self.data })
    }
}
