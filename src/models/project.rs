// src/models/project.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::FactoryError;

/// Lifecycle status of a project as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Created,
    Running,
    Interrupted,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::Running => "running",
            ProjectStatus::Interrupted => "interrupted",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = FactoryError;

    // Unknown labels are rejected rather than mapped to a default, so a
    // corrupted row surfaces at read time instead of silently changing state.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ProjectStatus::Created),
            "running" => Ok(ProjectStatus::Running),
            "interrupted" => Ok(ProjectStatus::Interrupted),
            "completed" => Ok(ProjectStatus::Completed),
            "failed" => Ok(ProjectStatus::Failed),
            other => Err(FactoryError::Validation(format!(
                "unknown project status '{}'",
                other
            ))),
        }
    }
}

/// A video production project: identity, status and creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub theme: String,
    pub status: ProjectStatus,
    pub config: serde_json::Value,
    pub target_length_minutes: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw database row; converted to [`Project`] with status validation.
#[derive(Debug, FromRow)]
pub(crate) struct ProjectRow {
    pub id: String,
    pub theme: String,
    pub status: String,
    pub config: sqlx::types::Json<serde_json::Value>,
    pub target_length_minutes: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRow {
    pub(crate) fn into_project(self) -> Result<Project, FactoryError> {
        Ok(Project {
            id: self.id,
            theme: self.theme,
            status: self.status.parse()?,
            config: self.config.0,
            target_length_minutes: self.target_length_minutes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_status_round_trip() {
        for status in [
            ProjectStatus::Created,
            ProjectStatus::Running,
            ProjectStatus::Interrupted,
            ProjectStatus::Completed,
            ProjectStatus::Failed,
        ] {
            let parsed: ProjectStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let result = "paused".parse::<ProjectStatus>();
        assert!(matches!(result, Err(FactoryError::Validation(_))));
    }
}
