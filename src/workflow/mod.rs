// src/workflow/mod.rs
pub mod state_machine;
