// src/config.rs
//! Environment-backed runtime configuration. Every knob has a default so a
//! bare environment still boots; `.env` files are loaded by the binary before
//! this is read.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string, e.g. `sqlite://video_factory.db`.
    pub database_url: String,
    /// Root directory holding one subdirectory per project.
    pub projects_root: PathBuf,
    /// Directory where checkpoint files are written.
    pub checkpoints_root: PathBuf,
    /// Checkpoints retained per project by cleanup sweeps.
    pub checkpoint_keep_count: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://video_factory.db".to_string());
        let projects_root = env::var("PROJECTS_ROOT")
            .unwrap_or_else(|_| "projects".to_string())
            .into();
        let checkpoints_root = env::var("CHECKPOINTS_ROOT")
            .unwrap_or_else(|_| "checkpoints".to_string())
            .into();
        let checkpoint_keep_count = env::var("CHECKPOINT_KEEP_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        Self {
            database_url,
            projects_root,
            checkpoints_root,
            checkpoint_keep_count,
        }
    }
}
