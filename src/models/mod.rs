// src/models/mod.rs
pub mod project;
pub mod step;

pub use project::{Project, ProjectStatus};
pub use step::{StepDefinition, StepOutput, StepStatus, WorkflowStep};

pub(crate) use project::ProjectRow;
pub(crate) use step::StepRow;
