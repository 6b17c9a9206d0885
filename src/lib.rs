// src/lib.rs
//! Durable orchestration for an automated video production pipeline.
//!
//! A project moves through a fixed sequence of workflow steps (theme, script,
//! metadata, scenes, speech, composition, upload), each tracked as a database
//! row with status, timestamps, retry count and JSON payloads. The crate is
//! built around four pieces:
//!
//! - [`registry::ProjectRegistry`]: project rows plus their on-disk tree
//! - [`workflow::state_machine::WorkflowStateMachine`]: guarded step
//!   transitions, progress and time estimates
//! - [`recovery::RecoveryManager`]: checkpoint files, integrity checks and
//!   resume after a crash
//! - [`pipeline::runner::PipelineRunner`]: drives the standard stages through
//!   injected generation engines
//!
//! Everything is written so an interrupted run can continue where it stopped
//! without repeating finished (and billed) generation calls.

pub mod config;
pub mod db;
pub mod engines;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod registry;
pub mod workflow;
