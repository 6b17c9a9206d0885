// src/engines.rs
//! Interfaces for the external generation services the pipeline calls out
//! to. The orchestration layer only sees these traits; concrete clients are
//! injected, and their failures are recorded on the failing step rather than
//! bubbling up as infrastructure errors.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of one generation call, carried into the step's `error_message`.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Output of a text generation call: raw content plus an optional structured
/// payload for engines that can return JSON directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextArtifact {
    pub content: String,
    pub structured: Option<serde_json::Value>,
}

/// A labeled position on the narration timeline, for subtitle alignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingMark {
    pub label: String,
    pub offset_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct SpeechArtifact {
    pub audio: Vec<u8>,
    pub timings: Vec<TimingMark>,
}

#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub image: Vec<u8>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub remote_id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        config: &serde_json::Value,
    ) -> Result<TextArtifact, EngineError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        speaker: &str,
        settings: &serde_json::Value,
    ) -> Result<SpeechArtifact, EngineError>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        settings: &serde_json::Value,
    ) -> Result<ImageArtifact, EngineError>;
}

/// Mixes, filters and concatenates media files on disk.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    async fn encode(
        &self,
        inputs: &[PathBuf],
        filter: &str,
        output: &Path,
    ) -> Result<PathBuf, EngineError>;
}

#[async_trait]
pub trait VideoPublisher: Send + Sync {
    async fn publish(
        &self,
        video: &Path,
        metadata: &PublishMetadata,
    ) -> Result<PublishReceipt, EngineError>;
}
