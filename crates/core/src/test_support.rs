//! In-process doubles for the inference runtime and the image codec.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::backend::{InferenceHandle, InferenceRuntime, ModelBlob};
use crate::codec::ImageCodec;
use crate::error::{Result, UpscaleError};
use crate::geometry::crop;
use crate::types::{ImageBuffer, RgbCanvas, CHANNELS};

/// Nearest-neighbour upscale of a square interleaved tile. Side and scale are
/// inferred from the buffer lengths.
pub fn nearest_fill(input: &[f32], output: &mut [f32]) -> anyhow::Result<()> {
    if input.is_empty() || input.len() % CHANNELS != 0 {
        bail!("input length {} is not a square RGB tile", input.len());
    }
    let side = ((input.len() / CHANNELS) as f64).sqrt() as usize;
    if side * side * CHANNELS != input.len() || output.len() % input.len() != 0 {
        bail!("unexpected shapes: in {} out {}", input.len(), output.len());
    }
    let scale = ((output.len() / input.len()) as f64).sqrt() as usize;
    if scale == 0 || scale * scale * input.len() != output.len() {
        bail!("output length {} is not a square multiple", output.len());
    }

    let out_side = side * scale;
    for oy in 0..out_side {
        for ox in 0..out_side {
            let src = ((oy / scale) * side + ox / scale) * CHANNELS;
            let dst = (oy * out_side + ox) * CHANNELS;
            output[dst..dst + CHANNELS].copy_from_slice(&input[src..src + CHANNELS]);
        }
    }
    Ok(())
}

/// Behaviour knobs for [`ScriptedRuntime`].
#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub accelerator_available: bool,
    pub baseline_available: bool,
    pub accelerated_run_fails: bool,
    pub baseline_run_fails: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            accelerator_available: true,
            baseline_available: true,
            accelerated_run_fails: false,
            baseline_run_fails: false,
        }
    }
}

#[derive(Default)]
struct Counters {
    accelerated_creates: AtomicUsize,
    baseline_creates: AtomicUsize,
    accelerated_runs: AtomicUsize,
    baseline_runs: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

/// Runtime whose handles upscale by nearest neighbour, fail on cue and count
/// everything that happens to them.
#[derive(Clone)]
pub struct ScriptedRuntime {
    script: Script,
    counters: Arc<Counters>,
    permits: Option<Arc<Mutex<Receiver<()>>>>,
    create_gate: Option<Arc<Mutex<Receiver<()>>>>,
}

impl ScriptedRuntime {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            counters: Arc::new(Counters::default()),
            permits: None,
            create_gate: None,
        }
    }

    pub fn nearest() -> Self {
        Self::new(Script::default())
    }

    /// Every `run` blocks until the returned sender delivers a permit.
    /// Dropping the sender lets all remaining runs through.
    pub fn gated(script: Script) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        let mut runtime = Self::new(script);
        runtime.permits = Some(Arc::new(Mutex::new(rx)));
        (runtime, tx)
    }

    /// Every successful `create` holds its new handle until the returned
    /// sender delivers a permit.
    pub fn gated_create(script: Script) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        let mut runtime = Self::new(script);
        runtime.create_gate = Some(Arc::new(Mutex::new(rx)));
        (runtime, tx)
    }

    pub fn accelerated_creates(&self) -> usize {
        self.counters.accelerated_creates.load(Ordering::SeqCst)
    }

    pub fn baseline_creates(&self) -> usize {
        self.counters.baseline_creates.load(Ordering::SeqCst)
    }

    pub fn accelerated_runs(&self) -> usize {
        self.counters.accelerated_runs.load(Ordering::SeqCst)
    }

    pub fn baseline_runs(&self) -> usize {
        self.counters.baseline_runs.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }
}

impl InferenceRuntime for ScriptedRuntime {
    fn create(
        &self,
        _model: &ModelBlob,
        prefer_accelerator: bool,
    ) -> anyhow::Result<Box<dyn InferenceHandle>> {
        if prefer_accelerator {
            self.counters
                .accelerated_creates
                .fetch_add(1, Ordering::SeqCst);
            if !self.script.accelerator_available {
                bail!("no accelerator device");
            }
        } else {
            self.counters.baseline_creates.fetch_add(1, Ordering::SeqCst);
            if !self.script.baseline_available {
                bail!("baseline engine refused the model");
            }
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        let handle = Box::new(ScriptedHandle {
            accelerated: prefer_accelerator,
            fails: if prefer_accelerator {
                self.script.accelerated_run_fails
            } else {
                self.script.baseline_run_fails
            },
            counters: Arc::clone(&self.counters),
            permits: self.permits.clone(),
        });
        if let Some(gate) = &self.create_gate {
            let rx = gate.lock().unwrap_or_else(|e| e.into_inner());
            let _ = rx.recv();
        }
        Ok(handle)
    }
}

struct ScriptedHandle {
    accelerated: bool,
    fails: bool,
    counters: Arc<Counters>,
    permits: Option<Arc<Mutex<Receiver<()>>>>,
}

impl InferenceHandle for ScriptedHandle {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> anyhow::Result<()> {
        if let Some(permits) = &self.permits {
            let rx = permits.lock().unwrap_or_else(|e| e.into_inner());
            let _ = rx.recv();
        }
        let counter = if self.accelerated {
            &self.counters.accelerated_runs
        } else {
            &self.counters.baseline_runs
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            bail!("scripted run failure");
        }
        nearest_fill(input, output)
    }

    fn is_accelerated(&self) -> bool {
        self.accelerated
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Codec backed by a map of named images. Encoded outputs are kept for
/// inspection and addressed as `memory://output/<n>`.
#[derive(Default)]
pub struct MemoryCodec {
    images: HashMap<String, ImageBuffer>,
    undecodable: Vec<String>,
    fail_encode: bool,
    outputs: Mutex<Vec<RgbCanvas>>,
    decode_gate: Option<Mutex<Receiver<()>>>,
}

impl MemoryCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, reference: &str, image: ImageBuffer) -> Self {
        self.images.insert(reference.to_string(), image);
        self
    }

    /// A reference that passes validation but fails to decode.
    pub fn with_undecodable(mut self, reference: &str) -> Self {
        self.undecodable.push(reference.to_string());
        self
    }

    pub fn failing_encode(mut self) -> Self {
        self.fail_encode = true;
        self
    }

    /// Block every decode until the returned sender delivers a permit.
    pub fn gated(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        self.decode_gate = Some(Mutex::new(rx));
        (self, tx)
    }

    pub fn outputs(&self) -> Vec<RgbCanvas> {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ImageCodec for MemoryCodec {
    fn validate_reference(&self, reference: &str) -> Result<()> {
        if self.images.contains_key(reference) || self.undecodable.iter().any(|r| r == reference)
        {
            Ok(())
        } else {
            Err(UpscaleError::InvalidInput(format!(
                "unknown image reference {reference}"
            )))
        }
    }

    fn decode(&self, reference: &str) -> Result<ImageBuffer> {
        if let Some(gate) = &self.decode_gate {
            let rx = gate.lock().unwrap_or_else(|e| e.into_inner());
            let _ = rx.recv();
        }
        self.images
            .get(reference)
            .cloned()
            .ok_or_else(|| UpscaleError::DecodeFailure {
                reference: reference.to_string(),
                reason: "corrupt data".to_string(),
            })
    }

    fn encode(&self, canvas: &RgbCanvas, crop_width: u32, crop_height: u32) -> Result<String> {
        if self.fail_encode {
            return Err(UpscaleError::EncodeFailure("disk full".to_string()));
        }
        let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        outputs.push(crop(canvas, crop_width, crop_height));
        Ok(format!("memory://output/{}", outputs.len() - 1))
    }
}

/// Deterministic RGB test pattern.
pub fn pattern(width: u32, height: u32) -> ImageBuffer {
    let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
    for y in 0..height {
        for x in 0..width {
            data.push(((x * 5 + y * 3) % 256) as f32);
            data.push(((x * 11 + 40) % 256) as f32);
            data.push(((y * 7 + 90) % 256) as f32);
        }
    }
    ImageBuffer::new(width, height, data).unwrap_or_else(|_| ImageBuffer::zeros(width, height))
}
