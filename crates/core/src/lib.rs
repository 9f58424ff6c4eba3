//! Core crate for tilescale: tiled super-resolution with an accelerated
//! inference path, a CPU fallback and cancellable background jobs.

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod geometry;
pub mod job;
pub mod logging;
pub mod ort_backend;
pub mod runtime;
pub mod server;
pub mod types;

#[cfg(test)]
mod test_support;

pub use backend::{FallbackExecutor, InferenceHandle, InferenceRuntime, ModelBlob, ModelSource};
pub use codec::{FsImageCodec, ImageCodec};
pub use error::{Result, UpscaleError};
pub use geometry::{TilePlan, TileProfile};
pub use job::{JobEvent, JobId, JobState, UpscaleManager, UpscaleSettings};
pub use types::{ImageBuffer, RgbCanvas};
