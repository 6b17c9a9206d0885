// src/pipeline/runner.rs
//! Sequential pipeline runner.
//!
//! Drives one project's steps in order through the injected engines. Steps
//! that are already completed or skipped are passed over without touching the
//! engines again, which is what makes a resumed run safe: finished API calls
//! are never re-billed. A step that exhausts its attempt budget parks the
//! whole project as interrupted; it stays failed until an operator retries,
//! resets or skips it explicitly.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::Stage;
use crate::engines::{
    EngineError, ImageGenerator, MediaEncoder, PublishMetadata, SpeechSynthesizer, TextGenerator,
    VideoPublisher,
};
use crate::error::FactoryError;
use crate::models::{Project, ProjectStatus, StepOutput, StepStatus, WorkflowStep};
use crate::recovery::RecoveryManager;
use crate::registry::ProjectRegistry;
use crate::workflow::state_machine::WorkflowStateMachine;

/// Engine handles injected into the runner.
#[derive(Clone)]
pub struct Engines {
    pub text: Arc<dyn TextGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub image: Arc<dyn ImageGenerator>,
    pub encoder: Arc<dyn MediaEncoder>,
    pub publisher: Arc<dyn VideoPublisher>,
}

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Total attempts per step, first run included.
    pub max_attempts_per_step: i64,
    /// Checkpoint after this many completed steps; 0 disables the cadence
    /// (a final checkpoint is still written).
    pub checkpoint_every_steps: usize,
    /// Checkpoints retained per project after each save.
    pub keep_checkpoints: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_step: 3,
            checkpoint_every_steps: 1,
            keep_checkpoints: 5,
        }
    }
}

/// What a single `run_project` pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunOutcome {
    Completed,
    Interrupted { step_number: i64, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project_id: String,
    /// Steps this pass drove to completion.
    pub executed_steps: usize,
    /// Steps already in a terminal state and passed over.
    pub passed_steps: usize,
    pub outcome: RunOutcome,
}

enum StepRun {
    Completed,
    Exhausted { error: String },
}

pub struct PipelineRunner {
    registry: ProjectRegistry,
    workflow: WorkflowStateMachine,
    recovery: RecoveryManager,
    engines: Engines,
    config: RunnerConfig,
}

impl PipelineRunner {
    pub fn new(
        registry: ProjectRegistry,
        workflow: WorkflowStateMachine,
        recovery: RecoveryManager,
        engines: Engines,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            workflow,
            recovery,
            engines,
            config,
        }
    }

    /// Runs the project's steps in order until every one is terminal or a
    /// step runs out of attempts.
    pub async fn run_project(&self, project_id: &str) -> Result<RunReport, FactoryError> {
        let project = self
            .registry
            .get_project(project_id)
            .await?
            .ok_or_else(|| FactoryError::ProjectNotFound(project_id.to_string()))?;

        let steps = self.workflow.get_workflow_steps(project_id).await?;
        if steps.is_empty() {
            return Err(FactoryError::Validation(format!(
                "project {} has no workflow steps; initialize the workflow first",
                project_id
            )));
        }

        self.registry
            .update_project_status(project_id, ProjectStatus::Running)
            .await?;
        info!("🚀 Running pipeline for project {} (theme: {})", project_id, project.theme);

        let mut executed = 0usize;
        let mut passed = 0usize;
        let mut since_checkpoint = 0usize;

        for step in steps {
            if step.status.is_terminal() {
                passed += 1;
                continue;
            }

            match self.execute_step(&project, &step).await? {
                StepRun::Completed => {
                    executed += 1;
                    since_checkpoint += 1;
                    if self.config.checkpoint_every_steps > 0
                        && since_checkpoint >= self.config.checkpoint_every_steps
                    {
                        self.save_progress_checkpoint(project_id).await;
                        since_checkpoint = 0;
                    }
                }
                StepRun::Exhausted { error } => {
                    self.registry
                        .update_project_status(project_id, ProjectStatus::Interrupted)
                        .await?;
                    self.save_progress_checkpoint(project_id).await;
                    warn!(
                        "⏸️ Project {} parked at step {} ({}): {}",
                        project_id, step.step_number, step.step_name, error
                    );
                    return Ok(RunReport {
                        project_id: project_id.to_string(),
                        executed_steps: executed,
                        passed_steps: passed,
                        outcome: RunOutcome::Interrupted {
                            step_number: step.step_number,
                            error,
                        },
                    });
                }
            }
        }

        self.registry
            .update_project_status(project_id, ProjectStatus::Completed)
            .await?;
        self.save_progress_checkpoint(project_id).await;
        info!(
            "✅ Pipeline completed for project {} ({} executed, {} already done)",
            project_id, executed, passed
        );
        Ok(RunReport {
            project_id: project_id.to_string(),
            executed_steps: executed,
            passed_steps: passed,
            outcome: RunOutcome::Completed,
        })
    }

    /// Checkpoints are progress insurance; a failure to write one is logged
    /// and the run carries on.
    async fn save_progress_checkpoint(&self, project_id: &str) {
        if let Err(e) = self.recovery.auto_save_checkpoint(project_id).await {
            warn!("Could not write checkpoint for {}: {}", project_id, e);
            return;
        }
        if let Err(e) = self
            .recovery
            .cleanup_old_checkpoints(project_id, self.config.keep_checkpoints)
        {
            warn!("Checkpoint cleanup failed for {}: {}", project_id, e);
        }
    }

    async fn execute_step(
        &self,
        project: &Project,
        step: &WorkflowStep,
    ) -> Result<StepRun, FactoryError> {
        let stage = Stage::from_name(&step.step_name).ok_or_else(|| {
            FactoryError::Validation(format!(
                "step {} has unknown stage name '{}'",
                step.step_number, step.step_name
            ))
        })?;

        // A step already running was left mid-flight by a dead process. The
        // upstream call may or may not have gone through, so re-running it
        // unprompted risks double billing; an operator has to decide.
        if step.status == StepStatus::Running {
            return Ok(StepRun::Exhausted {
                error: format!(
                    "step {} ({}) was already running when the pipeline picked it up; reset or fail it before resuming",
                    step.step_number, step.step_name
                ),
            });
        }

        let mut current = step.clone();
        loop {
            current = match current.status {
                StepStatus::Pending => {
                    let input = self.build_input(project, stage).await?;
                    self.workflow
                        .start_step(&project.id, current.step_number, input)
                        .await?
                }
                StepStatus::Failed => {
                    if current.retry_count + 1 >= self.config.max_attempts_per_step {
                        return Ok(StepRun::Exhausted {
                            error: current
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "step failed".to_string()),
                        });
                    }
                    let input = self.build_input(project, stage).await?;
                    self.workflow
                        .retry_step(&project.id, current.step_number, input)
                        .await?
                }
                other => {
                    return Err(FactoryError::Inconsistency(format!(
                        "step {} of project {} is {} mid-run",
                        current.step_number, project.id, other
                    )))
                }
            };

            match self.dispatch(project, &current, stage).await {
                Ok(output) => {
                    self.workflow
                        .complete_step(&project.id, current.step_number, output.to_value())
                        .await?;
                    return Ok(StepRun::Completed);
                }
                Err(engine_error) => {
                    current = self
                        .workflow
                        .fail_step(&project.id, current.step_number, &engine_error.to_string())
                        .await?;
                }
            }
        }
    }

    /// Assembles a stage's input payload from the project and the outputs of
    /// its upstream stages. Missing upstream data degrades to empty values;
    /// the stage may have been skipped on purpose.
    async fn build_input(
        &self,
        project: &Project,
        stage: Stage,
    ) -> Result<serde_json::Value, FactoryError> {
        let input = match stage {
            Stage::ThemeSelection => json!({
                "theme_hint": project.theme,
                "target_length_minutes": project.target_length_minutes,
            }),
            Stage::ScriptGeneration => {
                let theme = self
                    .stage_text(&project.id, Stage::ThemeSelection, "theme")
                    .await?
                    .unwrap_or_else(|| project.theme.clone());
                json!({
                    "theme": theme,
                    "target_length_minutes": project.target_length_minutes,
                })
            }
            Stage::TitleGeneration | Stage::DescriptionGeneration | Stage::TagsGeneration
            | Stage::ScenePlanning => {
                let script = self
                    .stage_text(&project.id, Stage::ScriptGeneration, "script")
                    .await?
                    .unwrap_or_default();
                json!({ "script": script })
            }
            Stage::ImageGeneration => {
                let plan = self
                    .stage_text(&project.id, Stage::ScenePlanning, "plan")
                    .await?
                    .unwrap_or_default();
                json!({ "plan": plan })
            }
            Stage::SpeechSynthesis => {
                let script = self
                    .stage_text(&project.id, Stage::ScriptGeneration, "script")
                    .await?
                    .unwrap_or_default();
                let speaker = project
                    .config
                    .get("speaker")
                    .and_then(|v| v.as_str())
                    .unwrap_or("narrator")
                    .to_string();
                let settings = project
                    .config
                    .get("voice_settings")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                json!({ "script": script, "speaker": speaker, "voice_settings": settings })
            }
            Stage::SubtitleGeneration => {
                let script = self
                    .stage_text(&project.id, Stage::ScriptGeneration, "script")
                    .await?
                    .unwrap_or_default();
                let timings = self
                    .stage_data(&project.id, Stage::SpeechSynthesis)
                    .await?
                    .and_then(|data| data.get("timings").cloned())
                    .unwrap_or_else(|| json!([]));
                json!({ "script": script, "timings": timings })
            }
            Stage::AudioMix => {
                let narration = self
                    .stage_text(&project.id, Stage::SpeechSynthesis, "audio_file")
                    .await?
                    .unwrap_or_default();
                json!({ "narration": narration })
            }
            Stage::VideoComposition => {
                let audio = self
                    .stage_text(&project.id, Stage::AudioMix, "audio_file")
                    .await?
                    .unwrap_or_default();
                let image = self
                    .stage_text(&project.id, Stage::ImageGeneration, "image_file")
                    .await?
                    .unwrap_or_default();
                json!({ "audio": audio, "image": image })
            }
            Stage::ThumbnailRender => {
                let title = self
                    .stage_text(&project.id, Stage::TitleGeneration, "title")
                    .await?
                    .unwrap_or_default();
                json!({ "title": title })
            }
            Stage::Upload => {
                let video = self
                    .stage_text(&project.id, Stage::VideoComposition, "video_file")
                    .await?
                    .unwrap_or_default();
                let title = self
                    .stage_text(&project.id, Stage::TitleGeneration, "title")
                    .await?
                    .unwrap_or_default();
                let description = self
                    .stage_text(&project.id, Stage::DescriptionGeneration, "description")
                    .await?
                    .unwrap_or_default();
                let tags = self
                    .stage_data(&project.id, Stage::TagsGeneration)
                    .await?
                    .and_then(|data| data.get("tags").cloned())
                    .unwrap_or_else(|| json!([]));
                json!({ "video": video, "title": title, "description": description, "tags": tags })
            }
        };
        Ok(input)
    }

    /// The `data` payload of an upstream stage, if it completed.
    async fn stage_data(
        &self,
        project_id: &str,
        stage: Stage,
    ) -> Result<Option<serde_json::Value>, FactoryError> {
        let Some(step) = self
            .workflow
            .get_step_by_name(project_id, stage.name())
            .await?
        else {
            return Ok(None);
        };
        if step.status != StepStatus::Completed {
            return Ok(None);
        }
        Ok(Some(step.output()?.data))
    }

    async fn stage_text(
        &self,
        project_id: &str,
        stage: Stage,
        key: &str,
    ) -> Result<Option<String>, FactoryError> {
        Ok(self
            .stage_data(project_id, stage)
            .await?
            .and_then(|data| data.get(key).and_then(|v| v.as_str()).map(str::to_string)))
    }

    async fn dispatch(
        &self,
        project: &Project,
        step: &WorkflowStep,
        stage: Stage,
    ) -> Result<StepOutput, EngineError> {
        let input = &step.input_data;
        match stage {
            Stage::ThemeSelection => {
                let prompt = format!(
                    "Pick one specific, concrete video theme for the topic: {}",
                    text_field(input, "theme_hint")
                );
                let artifact = self.engines.text.generate(&prompt, &project.config).await?;
                let theme = artifact
                    .structured
                    .as_ref()
                    .and_then(|v| v.get("theme"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(artifact.content.trim())
                    .to_string();
                Ok(StepOutput {
                    files: vec![],
                    data: json!({ "theme": theme }),
                })
            }
            Stage::ScriptGeneration => {
                let prompt = format!(
                    "Write a narration script of roughly {} minutes about: {}",
                    text_field(input, "target_length_minutes"),
                    text_field(input, "theme")
                );
                let artifact = self.engines.text.generate(&prompt, &project.config).await?;
                let file =
                    self.write_artifact(&project.id, "files/scripts/script.md", artifact.content.as_bytes())?;
                Ok(StepOutput {
                    files: vec![file],
                    data: json!({ "script": artifact.content }),
                })
            }
            Stage::TitleGeneration => {
                let prompt = format!(
                    "Write one click-worthy video title for this script:\n{}",
                    text_field(input, "script")
                );
                let artifact = self.engines.text.generate(&prompt, &project.config).await?;
                Ok(StepOutput {
                    files: vec![],
                    data: json!({ "title": artifact.content.trim() }),
                })
            }
            Stage::DescriptionGeneration => {
                let prompt = format!(
                    "Write a video description for this script:\n{}",
                    text_field(input, "script")
                );
                let artifact = self.engines.text.generate(&prompt, &project.config).await?;
                Ok(StepOutput {
                    files: vec![],
                    data: json!({ "description": artifact.content }),
                })
            }
            Stage::TagsGeneration => {
                let prompt = format!(
                    "List search tags, comma separated, for this script:\n{}",
                    text_field(input, "script")
                );
                let artifact = self.engines.text.generate(&prompt, &project.config).await?;
                let tags: Vec<String> = artifact
                    .content
                    .split(|c: char| c == ',' || c == '\n')
                    .map(|t| t.trim().trim_start_matches('#').to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                Ok(StepOutput {
                    files: vec![],
                    data: json!({ "tags": tags }),
                })
            }
            Stage::ScenePlanning => {
                let prompt = format!(
                    "Break this script into visual scenes with one image prompt each:\n{}",
                    text_field(input, "script")
                );
                let artifact = self.engines.text.generate(&prompt, &project.config).await?;
                Ok(StepOutput {
                    files: vec![],
                    data: json!({ "plan": artifact.content }),
                })
            }
            Stage::ImageGeneration => {
                let prompt = format!("Keyframe image: {}", text_field(input, "plan"));
                let artifact = self
                    .engines
                    .image
                    .generate(&prompt, &project.config)
                    .await?;
                let file =
                    self.write_artifact(&project.id, "files/images/keyframe.png", &artifact.image)?;
                Ok(StepOutput {
                    files: vec![file],
                    data: json!({ "image_file": "files/images/keyframe.png", "description": artifact.description }),
                })
            }
            Stage::SpeechSynthesis => {
                let settings = input.get("voice_settings").cloned().unwrap_or(json!({}));
                let artifact = self
                    .engines
                    .speech
                    .synthesize(
                        &text_field(input, "script"),
                        &text_field(input, "speaker"),
                        &settings,
                    )
                    .await?;
                let file =
                    self.write_artifact(&project.id, "files/audio/narration.wav", &artifact.audio)?;
                let timings = serde_json::to_value(&artifact.timings)
                    .map_err(|e| EngineError::new(format!("cannot encode timing marks: {}", e)))?;
                Ok(StepOutput {
                    files: vec![file],
                    data: json!({ "audio_file": "files/audio/narration.wav", "timings": timings }),
                })
            }
            Stage::SubtitleGeneration => {
                let prompt = format!(
                    "Produce SRT subtitles for this script using these timing marks:\nscript:\n{}\ntimings:\n{}",
                    text_field(input, "script"),
                    input.get("timings").cloned().unwrap_or(json!([]))
                );
                let artifact = self.engines.text.generate(&prompt, &project.config).await?;
                let file = self.write_artifact(
                    &project.id,
                    "files/scripts/subtitles.srt",
                    artifact.content.as_bytes(),
                )?;
                Ok(StepOutput {
                    files: vec![file],
                    data: json!({ "subtitle_file": "files/scripts/subtitles.srt" }),
                })
            }
            Stage::AudioMix => {
                let root = self.registry.project_dir(&project.id);
                let narration = text_field(input, "narration");
                let inputs: Vec<PathBuf> = [narration.as_str()]
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| root.join(p))
                    .collect();
                let output = root.join("files/audio/mixdown.wav");
                self.engines
                    .encoder
                    .encode(&inputs, "loudnorm", &output)
                    .await?;
                Ok(StepOutput {
                    files: vec!["files/audio/mixdown.wav".to_string()],
                    data: json!({ "audio_file": "files/audio/mixdown.wav" }),
                })
            }
            Stage::VideoComposition => {
                let root = self.registry.project_dir(&project.id);
                let audio = text_field(input, "audio");
                let image = text_field(input, "image");
                let inputs: Vec<PathBuf> = [audio.as_str(), image.as_str()]
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| root.join(p))
                    .collect();
                let output = root.join("files/video/final.mp4");
                self.engines
                    .encoder
                    .encode(&inputs, "scale=1920:1080,format=yuv420p", &output)
                    .await?;
                Ok(StepOutput {
                    files: vec!["files/video/final.mp4".to_string()],
                    data: json!({ "video_file": "files/video/final.mp4" }),
                })
            }
            Stage::ThumbnailRender => {
                let prompt = format!(
                    "Thumbnail with bold caption '{}'",
                    text_field(input, "title")
                );
                let artifact = self
                    .engines
                    .image
                    .generate(&prompt, &project.config)
                    .await?;
                let file = self.write_artifact(
                    &project.id,
                    "files/images/thumbnail.png",
                    &artifact.image,
                )?;
                Ok(StepOutput {
                    files: vec![file],
                    data: json!({ "image_file": "files/images/thumbnail.png" }),
                })
            }
            Stage::Upload => {
                let root = self.registry.project_dir(&project.id);
                let video = root.join(text_field(input, "video"));
                let metadata = PublishMetadata {
                    title: text_field(input, "title"),
                    description: text_field(input, "description"),
                    tags: list_field(input, "tags"),
                };
                let receipt = self.engines.publisher.publish(&video, &metadata).await?;
                Ok(StepOutput {
                    files: vec![],
                    data: json!({ "remote_id": receipt.remote_id, "url": receipt.url }),
                })
            }
        }
    }

    /// Writes step output bytes under the project directory and hands back
    /// the relative path for registration.
    fn write_artifact(
        &self,
        project_id: &str,
        relative: &str,
        bytes: &[u8],
    ) -> Result<String, EngineError> {
        let path = self.registry.project_dir(project_id).join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::new(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        fs::write(&path, bytes)
            .map_err(|e| EngineError::new(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(relative.to_string())
    }
}

fn text_field(value: &serde_json::Value, key: &str) -> String {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn list_field(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
