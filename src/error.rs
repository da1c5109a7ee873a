// src/error.rs
//! Error kinds and caller-visible status types for the motion pipeline.

use thiserror::Error;

use crate::motion::axis::AxisMask;

/// Errors surfaced to the caller by the queueing API and the homing/probing
/// flows. Queue-full and zero-length moves are not errors, they are
/// [`QueueOutcome`] variants.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    #[error("target outside machine bounds on {axis}: {value:.3} not in [{min:.3}, {max:.3}]")]
    OutsideBounds {
        axis: char,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("target not reachable with the configured kinematics")]
    Unreachable,

    #[error("motion queue full")]
    QueueFull,

    #[error("homing move on {axis} finished without an endstop trigger")]
    HomingFailed { axis: char },

    #[error("probing move finished without an endstop trigger")]
    ProbeFailedToTrigger,
}

/// Result of a queueing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The move was appended to the queue.
    Queued,
    /// No slot free; retry after yielding to the pipeline.
    Blocked,
    /// Zero-length move, absorbed. Position was still updated.
    Empty,
}

/// One-shot status raised from tick/interrupt context and read by the
/// command loop once per iteration via `MotionSystem::take_alert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAlert {
    /// An endstop fired during a guarded move and the move was aborted.
    EndstopHit { axes: AxisMask },
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
