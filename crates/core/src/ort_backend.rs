//! ONNX Runtime implementation of [`InferenceRuntime`].
//!
//! Accelerated sessions register the CUDA execution provider (optionally
//! behind TensorRT) with `error_on_failure`, so a machine without a usable
//! GPU fails construction instead of quietly running on CPU. Baseline
//! sessions are CPU-only with an explicit intra-op thread count.
//!
//! The job worker always hands over interleaved 0–255 RGB; model-specific
//! value range and tensor layout are handled here.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayViewD};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{baseline_parallelism, InferenceHandle, InferenceRuntime, ModelBlob};
use crate::geometry::TileProfile;
use crate::types::CHANNELS;

/// Accelerator flavour used when acceleration is requested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

/// Value range the model expects on its input and produces on its output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputRange {
    /// 0–255
    #[default]
    Pixel,
    /// 0–1
    Unit,
}

impl InputRange {
    fn input_factor(self) -> f32 {
        match self {
            Self::Pixel => 1.0,
            Self::Unit => 1.0 / 255.0,
        }
    }

    fn output_factor(self) -> f32 {
        match self {
            Self::Pixel => 1.0,
            Self::Unit => 255.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`
    Nchw,
}

#[derive(Clone, Debug)]
pub struct OrtRuntimeConfig {
    pub accelerator: InferenceBackend,
    /// 0 picks [`baseline_parallelism`].
    pub baseline_threads: usize,
    pub trt_cache_dir: Option<PathBuf>,
    pub input_range: InputRange,
    pub layout: TensorLayout,
    pub profile: TileProfile,
}

impl OrtRuntimeConfig {
    fn baseline_threads(&self) -> usize {
        if self.baseline_threads == 0 {
            baseline_parallelism()
        } else {
            self.baseline_threads
        }
    }
}

pub struct OrtRuntime {
    config: OrtRuntimeConfig,
}

impl OrtRuntime {
    pub fn new(config: OrtRuntimeConfig) -> Self {
        Self { config }
    }

    fn build_accelerated_session(&self, model: &ModelBlob) -> Result<Session> {
        let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

        let cuda = CUDAExecutionProvider::default();
        if !cuda.is_available().unwrap_or(false) {
            bail!("CUDA execution provider is not available");
        }

        let session = match self.config.accelerator {
            InferenceBackend::Tensorrt => {
                let context = self.config.profile.context_size() as usize;
                let key = trt_cache_key(&model.sha256_hex(), context, context);
                let base = self
                    .config
                    .trt_cache_dir
                    .as_deref()
                    .unwrap_or_else(|| Path::new("trt_cache"));
                let cache_dir = resolve_trt_cache_dir(base, Some(&key));
                let cache_path = cache_dir.to_string_lossy().to_string();
                if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                    warn!(
                        dir = %cache_dir.display(),
                        error = %e,
                        "Failed to create TRT cache directory"
                    );
                }
                info!(
                    cache_dir = %cache_dir.display(),
                    "Initializing TensorRT session (first run may take several minutes)"
                );

                // TRT may be missing even when CUDA works; CUDA stays mandatory.
                builder
                    .with_execution_providers([
                        TensorRTExecutionProvider::default()
                            .with_engine_cache(true)
                            .with_engine_cache_path(&cache_path)
                            .with_fp16(true)
                            .with_device_id(0)
                            .build(),
                        CUDAExecutionProvider::default().build().error_on_failure(),
                    ])?
                    .commit_from_memory(model.bytes())
                    .with_context(|| format!("Failed to load ONNX model: {}", model.label()))?
            }
            InferenceBackend::Cuda => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_memory(model.bytes())
                .with_context(|| format!("Failed to load ONNX model: {}", model.label()))?,
        };

        Ok(session)
    }

    fn build_baseline_session(&self, model: &ModelBlob) -> Result<Session> {
        let threads = self.config.baseline_threads();
        debug!(threads, "Building CPU session");
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?
            .with_execution_providers([CPUExecutionProvider::default().build()])?
            .commit_from_memory(model.bytes())
            .with_context(|| format!("Failed to load ONNX model: {}", model.label()))?;
        Ok(session)
    }
}

impl InferenceRuntime for OrtRuntime {
    fn create(
        &self,
        model: &ModelBlob,
        prefer_accelerator: bool,
    ) -> Result<Box<dyn InferenceHandle>> {
        let started = Instant::now();
        let session = if prefer_accelerator {
            self.build_accelerated_session(model)?
        } else {
            self.build_baseline_session(model)?
        };

        let handle = OrtHandle::new(session, prefer_accelerator, &self.config)?;
        let backend = if prefer_accelerator {
            self.config.accelerator.to_string()
        } else {
            "cpu".to_string()
        };
        info!(
            model = model.label(),
            accelerated = prefer_accelerator,
            backend = %backend,
            fp16 = handle.is_fp16,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ONNX session ready"
        );
        Ok(Box::new(handle))
    }
}

struct OrtHandle {
    session: Session,
    accelerated: bool,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    range: InputRange,
    layout: TensorLayout,
    context: usize,
    out_context: usize,
}

impl OrtHandle {
    fn new(session: Session, accelerated: bool, config: &OrtRuntimeConfig) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .context("model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session,
            accelerated,
            input_name,
            output_name,
            is_fp16,
            range: config.input_range,
            layout: config.layout,
            context: config.profile.context_size() as usize,
            out_context: config.profile.out_context() as usize,
        })
    }
}

impl InferenceHandle for OrtHandle {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let tensor = interleaved_to_tensor(input, self.context, self.layout, self.range)?;

        if self.is_fp16 {
            let src = tensor
                .as_slice()
                .context("input tensor must be contiguous")?;
            let mut fp16_data = vec![f16::ZERO; src.len()];
            fp16_data.convert_from_f32_slice(src);
            let fp16_array = ndarray::ArrayD::from_shape_vec(tensor.shape().to_vec(), fp16_data)?;
            let input_tensor = Tensor::from_array(fp16_array)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            let widened = view.mapv(f32::from);
            tensor_to_interleaved(
                widened.view(),
                self.out_context,
                self.layout,
                self.range,
                output,
            )
        } else {
            let input_tensor = Tensor::from_array(tensor)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            tensor_to_interleaved(view, self.out_context, self.layout, self.range, output)
        }
    }

    fn is_accelerated(&self) -> bool {
        self.accelerated
    }
}

/// Interleaved `side × side × 3` (0–255) → model input tensor.
fn interleaved_to_tensor(
    input: &[f32],
    side: usize,
    layout: TensorLayout,
    range: InputRange,
) -> Result<Array4<f32>> {
    let expected = side * side * CHANNELS;
    if input.len() != expected {
        bail!(
            "input tile has {} values, expected {expected} ({side}x{side}x3)",
            input.len()
        );
    }
    let factor = range.input_factor();
    let tensor = match layout {
        TensorLayout::Nhwc => Array4::from_shape_vec(
            (1, side, side, CHANNELS),
            input.iter().map(|v| v * factor).collect(),
        )?,
        TensorLayout::Nchw => {
            let mut nchw = Array4::<f32>::zeros((1, CHANNELS, side, side));
            for (idx, px) in input.chunks_exact(CHANNELS).enumerate() {
                let (y, x) = (idx / side, idx % side);
                for (c, v) in px.iter().enumerate() {
                    nchw[[0, c, y, x]] = v * factor;
                }
            }
            nchw
        }
    };
    Ok(tensor)
}

/// Model output tensor → interleaved `side × side × 3` (0–255).
fn tensor_to_interleaved(
    view: ArrayViewD<'_, f32>,
    side: usize,
    layout: TensorLayout,
    range: InputRange,
    output: &mut [f32],
) -> Result<()> {
    let expected_shape = match layout {
        TensorLayout::Nhwc => [1, side, side, CHANNELS],
        TensorLayout::Nchw => [1, CHANNELS, side, side],
    };
    if view.shape() != expected_shape {
        bail!(
            "model output shape {:?} does not match expected {:?}",
            view.shape(),
            expected_shape
        );
    }
    if output.len() != side * side * CHANNELS {
        bail!(
            "output buffer has {} values, expected {}",
            output.len(),
            side * side * CHANNELS
        );
    }

    let factor = range.output_factor();
    let view = view.into_dimensionality::<ndarray::Ix4>()?;
    match layout {
        TensorLayout::Nhwc => {
            for (dst, src) in output.iter_mut().zip(view.iter()) {
                *dst = src * factor;
            }
        }
        TensorLayout::Nchw => {
            for (idx, px) in output.chunks_exact_mut(CHANNELS).enumerate() {
                let (y, x) = (idx / side, idx % side);
                for (c, v) in px.iter_mut().enumerate() {
                    *v = view[[0, c, y, x]] * factor;
                }
            }
        }
    }
    Ok(())
}

/// Format: `{model_hash_prefix}_{input_h}x{input_w}`
pub fn trt_cache_key(model_hash: &str, input_h: usize, input_w: usize) -> String {
    let prefix = &model_hash[..model_hash.len().min(16)];
    format!("{prefix}_{input_h}x{input_w}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}
