//! Upscale job orchestration.
//!
//! [`UpscaleManager`] issues job ids, spawns one worker thread per job and
//! reports everything that happens through a single [`JobEvent`] channel.
//! The registry of live jobs is the only state shared between callers and
//! workers; image buffers, tensors and inference handles stay on the
//! worker's stack.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{FallbackExecutor, InferenceRuntime, ModelSource};
use crate::codec::ImageCodec;
use crate::error::{Result, UpscaleError};
use crate::geometry::{composite_tile, extract_tile, prepare_tiles, TileProfile};
use crate::types::RgbCanvas;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for thread names and file names.
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        job_id: JobId,
        done: u32,
        total: u32,
        /// Fraction in `[0, 1]`.
        percent: f64,
        message: String,
    },
    Completed {
        job_id: JobId,
        output_uri: String,
        width: u32,
        height: u32,
    },
    Failed {
        job_id: JobId,
        message: String,
    },
    Cancelled {
        job_id: JobId,
        done: u32,
    },
}

impl JobEvent {
    pub fn progress(job_id: JobId, done: u32, total: u32) -> Self {
        let percent = if total == 0 {
            1.0
        } else {
            f64::from(done) / f64::from(total)
        };
        Self::Progress {
            job_id,
            done,
            total,
            percent,
            message: format!("{done}/{total} tiles"),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => *job_id,
        }
    }

    /// State the job is in once this event has been emitted.
    pub fn state(&self) -> JobState {
        match self {
            Self::Progress { .. } => JobState::Running,
            Self::Completed { .. } => JobState::Completed,
            Self::Failed { .. } => JobState::Failed,
            Self::Cancelled { .. } => JobState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Per-manager settings shared by every job it starts.
#[derive(Debug, Clone)]
pub struct UpscaleSettings {
    pub model: ModelSource,
    pub profile: TileProfile,
    pub prefer_accelerator: bool,
}

struct JobEntry {
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    runtime: Arc<dyn InferenceRuntime>,
    codec: Arc<dyn ImageCodec>,
    settings: UpscaleSettings,
    jobs: DashMap<JobId, JobEntry>,
    events: mpsc::UnboundedSender<JobEvent>,
}

enum Outcome {
    Completed {
        output_uri: String,
        width: u32,
        height: u32,
    },
    Cancelled {
        done: u32,
    },
}

/// Process-scoped job manager. Dropping it cancels every live job.
pub struct UpscaleManager {
    shared: Arc<Shared>,
}

impl UpscaleManager {
    /// Build a manager and the receiving end of its event stream.
    pub fn new(
        runtime: Arc<dyn InferenceRuntime>,
        codec: Arc<dyn ImageCodec>,
        settings: UpscaleSettings,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            runtime,
            codec,
            settings,
            jobs: DashMap::new(),
            events,
        });
        (Self { shared }, rx)
    }

    pub fn profile(&self) -> TileProfile {
        self.shared.settings.profile
    }

    /// Validate the reference and start a job on its own thread.
    ///
    /// Only validation failures are returned here; everything after the
    /// job exists arrives as a `Failed` event.
    pub fn start(&self, image_reference: &str) -> Result<JobId> {
        let reference = image_reference.trim();
        if reference.is_empty() {
            return Err(UpscaleError::InvalidInput(
                "image reference is required".to_string(),
            ));
        }
        self.shared
            .codec
            .validate_reference(reference)
            .map_err(|e| match e {
                UpscaleError::InvalidInput(_) => e,
                other => UpscaleError::InvalidInput(other.to_string()),
            })?;

        let id = JobId::new();
        let cancel = CancellationToken::new();

        // Register before spawning so a fast worker always finds its entry.
        self.shared.jobs.insert(
            id,
            JobEntry {
                cancel: cancel.clone(),
                worker: None,
            },
        );

        let shared = Arc::clone(&self.shared);
        let owned_reference = reference.to_string();
        let spawned = thread::Builder::new()
            .name(format!("upscale-{}", id.short()))
            .spawn(move || run_worker(shared, id, owned_reference, cancel));

        match spawned {
            Ok(handle) => {
                if let Some(mut entry) = self.shared.jobs.get_mut(&id) {
                    entry.worker = Some(handle);
                }
                info!(job_id = %id, reference, "Upscale job started");
                Ok(id)
            }
            Err(e) => {
                self.shared.jobs.remove(&id);
                error!(job_id = %id, error = %e, "Failed to spawn upscale worker");
                Err(UpscaleError::WorkerSpawn(e))
            }
        }
    }

    /// Request cancellation. Returns `true` if a live job was signalled;
    /// unknown and already-finished ids are a no-op.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.shared.jobs.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(job_id = %id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Signal every live job. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.shared.jobs.iter() {
            entry.cancel.cancel();
            count += 1;
        }
        count
    }

    pub fn is_active(&self, id: JobId) -> bool {
        self.shared.jobs.contains_key(&id)
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.shared.jobs.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Block until the given job's worker thread has exited. Returns `false`
    /// if the job is unknown or already reaped.
    pub fn join(&self, id: JobId) -> bool {
        let handle = self
            .shared
            .jobs
            .get_mut(&id)
            .and_then(|mut entry| entry.worker.take());
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    warn!(job_id = %id, "Upscale worker exited by panic");
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for UpscaleManager {
    fn drop(&mut self) {
        let signalled = self.cancel_all();
        if signalled > 0 {
            info!(jobs = signalled, "Cancelling upscale jobs on shutdown");
        }
    }
}

fn run_worker(shared: Arc<Shared>, id: JobId, reference: String, cancel: CancellationToken) {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_job(&shared, id, &reference, &cancel)
    }));

    let event = match outcome {
        Ok(Ok(Outcome::Completed {
            output_uri,
            width,
            height,
        })) => {
            info!(
                job_id = %id,
                width,
                height,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Upscale job completed"
            );
            JobEvent::Completed {
                job_id: id,
                output_uri,
                width,
                height,
            }
        }
        Ok(Ok(Outcome::Cancelled { done })) => {
            info!(job_id = %id, done, "Upscale job cancelled");
            JobEvent::Cancelled { job_id: id, done }
        }
        Ok(Err(err)) => {
            let message = err.to_string();
            error!(job_id = %id, error = %message, "Upscale job failed");
            JobEvent::Failed {
                job_id: id,
                message,
            }
        }
        Err(payload) => {
            let message = format!("worker panicked: {}", panic_message(payload.as_ref()));
            error!(job_id = %id, error = %message, "Upscale job failed");
            JobEvent::Failed {
                job_id: id,
                message,
            }
        }
    };

    // Deregister first: once a host sees the terminal event the id is gone.
    shared.jobs.remove(&id);
    if shared.events.send(event).is_err() {
        debug!(job_id = %id, "Event receiver dropped; terminal event discarded");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Decode, tile, infer, composite and encode one image. The inference
/// handle lives inside this frame and is dropped on every return path.
fn run_job(
    shared: &Shared,
    id: JobId,
    reference: &str,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let profile = shared.settings.profile;

    let image = shared.codec.decode(reference)?;
    let source = prepare_tiles(&image, profile)?;
    drop(image);

    let plan = source.plan;
    let total = plan.total_tiles();
    debug!(
        job_id = %id,
        width = plan.source_width,
        height = plan.source_height,
        aligned_width = plan.aligned_width(),
        aligned_height = plan.aligned_height(),
        tiles = total,
        "Tile plan ready"
    );

    if cancel.is_cancelled() {
        return Ok(Outcome::Cancelled { done: 0 });
    }

    let model = shared.settings.model.resolve(shared.runtime.as_ref())?;
    let mut executor = FallbackExecutor::open(
        shared.runtime.as_ref(),
        &model,
        shared.settings.prefer_accelerator,
    )?;

    let (canvas_w, canvas_h) = plan.canvas_size();
    let mut canvas = RgbCanvas::new(canvas_w, canvas_h);
    let context = profile.context_size();
    let mut input = vec![0.0f32; profile.input_len()];
    let mut output = vec![0.0f32; profile.output_len()];
    let mut done = 0u32;

    for (index, tile) in plan.tiles().enumerate() {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled { done });
        }

        let tile_started = Instant::now();
        extract_tile(&source.haloed, tile.x, tile.y, context, &mut input)?;
        executor.run_tile(index as u32, &input, &mut output)?;
        composite_tile(&mut canvas, &output, &profile, tile.x, tile.y)?;
        done += 1;

        debug!(
            job_id = %id,
            tile = index,
            accelerated = executor.is_accelerated(),
            elapsed_ms = tile_started.elapsed().as_millis() as u64,
            "Tile done"
        );
        let _ = shared.events.send(JobEvent::progress(id, done, total));
    }

    if cancel.is_cancelled() {
        return Ok(Outcome::Cancelled { done });
    }
    drop(executor);

    let (width, height) = plan.output_size();
    let output_uri = shared.codec.encode(&canvas, width, height)?;
    Ok(Outcome::Completed {
        output_uri,
        width,
        height,
    })
}
