// src/pipeline/mod.rs
//! The canonical production pipeline: thirteen stages from theme selection
//! to upload, in dependency order.

pub mod runner;

use serde::{Deserialize, Serialize};

use crate::models::StepDefinition;

/// One stage of the standard pipeline. The wire name doubles as the
/// `step_name` stored on workflow rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ThemeSelection,
    ScriptGeneration,
    TitleGeneration,
    DescriptionGeneration,
    TagsGeneration,
    ScenePlanning,
    ImageGeneration,
    SpeechSynthesis,
    SubtitleGeneration,
    AudioMix,
    VideoComposition,
    ThumbnailRender,
    Upload,
}

impl Stage {
    /// Execution order. Metadata stages come right after the script so a late
    /// interruption still leaves enough for a manual upload.
    pub const ALL: [Stage; 13] = [
        Stage::ThemeSelection,
        Stage::ScriptGeneration,
        Stage::TitleGeneration,
        Stage::DescriptionGeneration,
        Stage::TagsGeneration,
        Stage::ScenePlanning,
        Stage::ImageGeneration,
        Stage::SpeechSynthesis,
        Stage::SubtitleGeneration,
        Stage::AudioMix,
        Stage::VideoComposition,
        Stage::ThumbnailRender,
        Stage::Upload,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::ThemeSelection => "theme_selection",
            Stage::ScriptGeneration => "script_generation",
            Stage::TitleGeneration => "title_generation",
            Stage::DescriptionGeneration => "description_generation",
            Stage::TagsGeneration => "tags_generation",
            Stage::ScenePlanning => "scene_planning",
            Stage::ImageGeneration => "image_generation",
            Stage::SpeechSynthesis => "speech_synthesis",
            Stage::SubtitleGeneration => "subtitle_generation",
            Stage::AudioMix => "audio_mix",
            Stage::VideoComposition => "video_composition",
            Stage::ThumbnailRender => "thumbnail_render",
            Stage::Upload => "upload",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.name() == name)
    }
}

/// Step definitions for a standard video project, ready for
/// `initialize_workflow_steps`.
pub fn standard_pipeline() -> Vec<StepDefinition> {
    Stage::ALL
        .iter()
        .map(|stage| StepDefinition::new(stage.name()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_pipeline_has_thirteen_unique_stages() {
        let definitions = standard_pipeline();
        assert_eq!(definitions.len(), 13);

        let mut names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        names.dedup();
        assert_eq!(names.len(), 13);

        assert_eq!(definitions[0].name, "theme_selection");
        assert_eq!(definitions[12].name, "upload");
    }

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_name(stage.name()), Some(stage));
        }
        assert_eq!(Stage::from_name("color_grading"), None);
    }
}
