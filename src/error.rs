use thiserror::Error;

/// Errors surfaced while building or running a scenario.
///
/// Per-request problems never show up here: they are classified into a
/// [`crate::RequestResult`] and recorded in the metrics instead. Everything in
/// this enum is either a startup misconfiguration (fatal before any virtual
/// user spawns) or a file that could not be read or written.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid load shape: {0}")]
    InvalidShape(String),

    #[error("task '{name}' has weight 0; weights must be positive")]
    InvalidTaskWeight { name: String },

    #[error("no tasks registered")]
    NoTasks,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown load shape '{0}' (expected constant, stepped or spiked)")]
    UnknownShape(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
