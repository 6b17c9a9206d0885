// src/error.rs
//! Crate-wide error taxonomy.
//!
//! Infrastructure failures (database, filesystem, serialization) convert in
//! via `#[from]`; business-rule violations get their own variants so callers
//! can react to them without string matching.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid step transition: cannot {action} step {step_number} of project {project_id} from status '{from}'")]
    InvalidTransition {
        project_id: String,
        step_number: i64,
        from: String,
        action: &'static str,
    },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Step {step_number} not found for project {project_id}")]
    StepNotFound {
        project_id: String,
        step_number: i64,
    },

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Inconsistent state: {0}")]
    Inconsistency(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
