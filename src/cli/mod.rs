//! CLI-specific functionality for the node agent
//!
//! This module contains argument parsing, configuration discovery and task
//! payload file handling.

pub mod args;
pub mod config;
pub mod tasks;

pub use args::{Args, CheckpointQuery, Commands, ExecutionMode, RunConfig};
pub use config::ConfigDiscovery;
pub use tasks::{FileError, TaskPayloadFile};
