//! Shared data model for the job tester.
//!
//! `types` holds the serde view of manifests and job definitions,
//! `config` the repository layout and execution time bounds.

pub mod config;
pub mod types;
