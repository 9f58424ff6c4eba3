//! Error taxonomy for upscale jobs.
//!
//! Only [`UpscaleError::InvalidInput`] ever crosses the synchronous job-start
//! boundary. Everything else happens on a worker thread and reaches the
//! caller as a `Failed` event carrying the rendered message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpscaleError {
    /// Missing, blank or unreadable image reference. Rejected before a job exists.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to decode image {reference}: {reason}")]
    DecodeFailure { reference: String, reason: String },

    /// Accelerator context could not be constructed. Triggers fallback to
    /// baseline execution and is never surfaced to the job's caller.
    #[error("accelerator unavailable: {source:#}")]
    AcceleratorUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("inference failed on tile {tile}: {source:#}")]
    InferenceFailure {
        tile: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load model {path}: {source:#}")]
    ModelLoad {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to encode output image: {0}")]
    EncodeFailure(String),

    #[error("invalid tile profile: {0}")]
    InvalidProfile(String),

    #[error("buffer shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("failed to spawn job worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UpscaleError>;
