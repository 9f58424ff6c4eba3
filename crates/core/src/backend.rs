//! Inference backend contract and the accelerator → baseline fallback policy.
//!
//! A [`InferenceRuntime`] builds [`InferenceHandle`]s from a loaded
//! [`ModelBlob`]. The job worker never talks to handles directly; it goes
//! through [`FallbackExecutor`], which owns exactly one handle at a time and
//! drops it on every exit path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Result, UpscaleError};

/// Raw model bytes plus where they came from.
///
/// Cheap to clone; every handle built during a job reads the same bytes.
#[derive(Clone)]
pub struct ModelBlob {
    label: String,
    bytes: Arc<[u8]>,
}

impl ModelBlob {
    pub fn from_bytes(label: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            label: label.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a model file from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(|source| UpscaleError::ModelLoad {
                path: path.display().to_string(),
                source,
            })?;
        if bytes.is_empty() {
            return Err(UpscaleError::ModelLoad {
                path: path.display().to_string(),
                source: anyhow::anyhow!("model file is empty"),
            });
        }
        Ok(Self::from_bytes(path.display().to_string(), bytes))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex SHA-256 of the model bytes.
    pub fn sha256_hex(&self) -> String {
        let digest = Sha256::digest(&self.bytes);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ModelBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBlob")
            .field("label", &self.label)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One live inference engine instance.
///
/// `run` consumes an interleaved `context² × 3` tile (0–255) and fills an
/// interleaved `out_context² × 3` buffer. Dropping the handle releases the
/// engine and any accelerator context it holds.
pub trait InferenceHandle: Send {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> anyhow::Result<()>;

    fn is_accelerated(&self) -> bool;
}

pub trait InferenceRuntime: Send + Sync {
    fn load_model(&self, path: &Path) -> Result<ModelBlob> {
        ModelBlob::read(path)
    }

    /// Build a handle. With `prefer_accelerator` the runtime must either
    /// return an accelerated handle or fail; it must not silently hand back
    /// a baseline one.
    fn create(
        &self,
        model: &ModelBlob,
        prefer_accelerator: bool,
    ) -> anyhow::Result<Box<dyn InferenceHandle>>;
}

/// Thread count baseline execution asks for when none is configured.
pub fn baseline_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(2)
}

/// Where the model for a job comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    Path(PathBuf),
    Loaded(ModelBlob),
}

impl ModelSource {
    pub fn resolve(&self, runtime: &dyn InferenceRuntime) -> Result<ModelBlob> {
        match self {
            Self::Path(path) => runtime.load_model(path),
            Self::Loaded(blob) => Ok(blob.clone()),
        }
    }
}

/// Drives tiles through a handle, downgrading to baseline once if the
/// accelerator misbehaves.
pub struct FallbackExecutor<'a> {
    runtime: &'a dyn InferenceRuntime,
    model: &'a ModelBlob,
    handle: Option<Box<dyn InferenceHandle>>,
}

impl<'a> FallbackExecutor<'a> {
    /// Create the first handle: accelerated if requested and possible,
    /// baseline otherwise.
    pub fn open(
        runtime: &'a dyn InferenceRuntime,
        model: &'a ModelBlob,
        prefer_accelerator: bool,
    ) -> Result<Self> {
        let started = Instant::now();
        let handle = if prefer_accelerator {
            match runtime.create(model, true) {
                Ok(handle) => handle,
                Err(source) => {
                    let unavailable = UpscaleError::AcceleratorUnavailable { source };
                    warn!(
                        model = model.label(),
                        error = %unavailable,
                        "Falling back to baseline execution"
                    );
                    Self::create_baseline(runtime, model)?
                }
            }
        } else {
            Self::create_baseline(runtime, model)?
        };

        info!(
            model = model.label(),
            accelerated = handle.is_accelerated(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Inference handle ready"
        );

        Ok(Self {
            runtime,
            model,
            handle: Some(handle),
        })
    }

    fn create_baseline(
        runtime: &dyn InferenceRuntime,
        model: &ModelBlob,
    ) -> Result<Box<dyn InferenceHandle>> {
        runtime
            .create(model, false)
            .map_err(|source| UpscaleError::ModelLoad {
                path: model.label().to_string(),
                source: source.context("baseline session"),
            })
    }

    pub fn is_accelerated(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_accelerated())
    }

    /// Run one tile. An accelerated failure releases the handle, builds a
    /// baseline one and retries this tile once; baseline failures are final.
    pub fn run_tile(&mut self, tile: u32, input: &[f32], output: &mut [f32]) -> Result<()> {
        let handle = self.handle.as_mut().ok_or_else(|| UpscaleError::InferenceFailure {
            tile,
            source: anyhow::anyhow!("no inference handle"),
        })?;

        let error = match handle.run(input, output) {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        if !handle.is_accelerated() {
            return Err(UpscaleError::InferenceFailure {
                tile,
                source: error,
            });
        }

        warn!(
            tile,
            error = %format!("{error:#}"),
            "Accelerated inference failed; retrying tile on baseline"
        );

        // Release the accelerator context before building its replacement.
        self.handle = None;
        let baseline = self
            .runtime
            .create(self.model, false)
            .context("baseline session after accelerator failure")
            .map_err(|source| UpscaleError::InferenceFailure { tile, source })?;
        debug!(tile, "Baseline handle created");

        let handle = self.handle.insert(baseline);
        handle
            .run(input, output)
            .map_err(|source| UpscaleError::InferenceFailure { tile, source })
    }
}
