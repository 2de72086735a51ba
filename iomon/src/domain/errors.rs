//! Structured error types for iomon
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Failed to load eBPF artifact {artifact}: {error}")]
    ArtifactLoad { artifact: String, error: String },

    #[error("Failed to load program {program}: {error}")]
    ProgramLoad { program: String, error: String },

    #[error("Failed to attach {program} to {hook}: {error}")]
    Attach { program: String, hook: String, error: String },

    #[error("Map {0} not found in eBPF artifact")]
    MapNotFound(&'static str),

    #[error("Error reading ring buffer: {0}")]
    Stream(String),

    #[error("Record has {actual} bytes, expected {expected}")]
    RecordSize { expected: usize, actual: usize },

    #[error("eBPF programs and maps already released")]
    Released,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
}

/// Why a sampling round was abandoned
#[derive(Error, Debug)]
pub enum RoundError {
    #[error("Sampling round exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("Sampling engine failed: {0}")]
    Engine(String),

    #[error("Malformed sampling report: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Sampling worker exited")]
    WorkerExited,
}
