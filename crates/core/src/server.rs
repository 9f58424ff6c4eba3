use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::UpscaleError;
use crate::job::{JobEvent, JobId, JobState, UpscaleManager};

const JOB_CHANNEL_CAPACITY: usize = 64;
/// Finished jobs whose final status stays queryable; older ones are forgotten.
pub const FINISHED_JOB_HISTORY: usize = 256;

/// Shared state behind every handler: the job manager plus one broadcast
/// channel per job that has a subscriber or has emitted an event.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: UpscaleManager,
    channels: DashMap<JobId, broadcast::Sender<JobEvent>>,
    latest: DashMap<JobId, JobEvent>,
    finished: Mutex<VecDeque<JobId>>,
    history: usize,
}

impl AppState {
    pub fn new(manager: UpscaleManager) -> Self {
        Self::with_history(manager, FINISHED_JOB_HISTORY)
    }

    /// Like [`AppState::new`], remembering at most `history` finished jobs.
    pub fn with_history(manager: UpscaleManager, history: usize) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                manager,
                channels: DashMap::new(),
                latest: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                history,
            }),
        }
    }

    pub fn manager(&self) -> &UpscaleManager {
        &self.inner.manager
    }

    /// Spawn the task that forwards manager events to per-job subscribers.
    /// Must be called from inside a tokio runtime.
    pub fn spawn_event_pump(&self, rx: mpsc::UnboundedReceiver<JobEvent>) -> JoinHandle<()> {
        tokio::spawn(pump_events(self.clone(), rx))
    }

    fn channel(&self, id: JobId) -> broadcast::Sender<JobEvent> {
        self.inner
            .channels
            .entry(id)
            .or_insert_with(|| broadcast::channel(JOB_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn latest(&self, id: JobId) -> Option<JobEvent> {
        self.inner.latest.get(&id).map(|e| e.clone())
    }

    fn publish(&self, event: JobEvent) {
        let id = event.job_id();
        self.inner.latest.insert(id, event.clone());
        if event.is_terminal() {
            self.remember_finished(id);
            if let Some((_, sender)) = self.inner.channels.remove(&id) {
                let _ = sender.send(event);
            }
        } else if let Some(sender) = self.inner.channels.get(&id) {
            // No receivers is fine: nobody is watching this job yet.
            let _ = sender.send(event);
        }
    }

    fn remember_finished(&self, id: JobId) {
        let mut finished = self
            .inner
            .finished
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        finished.push_back(id);
        while finished.len() > self.inner.history {
            if let Some(evicted) = finished.pop_front() {
                self.inner.latest.remove(&evicted);
            }
        }
    }
}

async fn pump_events(state: AppState, mut rx: mpsc::UnboundedReceiver<JobEvent>) {
    while let Some(event) = rx.recv().await {
        debug!(job_id = %event.job_id(), state = ?event.state(), "Forwarding job event");
        state.publish(event);
    }
    debug!("Job event stream closed");
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/api/jobs/{id}/ws", any(job_ws))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = app_router(state);
    let addr = format!("{host}:{port}");
    info!(%addr, "Starting tilescale server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_jobs: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_jobs: state.manager().active_jobs().len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub image_uri: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let job_id = state.manager().start(&req.image_uri)?;
    Ok((StatusCode::CREATED, Json(CreateJobResponse { job_id })))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub done: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobStatus {
    fn starting(job_id: JobId) -> Self {
        Self {
            job_id,
            state: JobState::Running,
            done: 0,
            total: 0,
            output_uri: None,
            message: None,
        }
    }

    fn from_event(event: &JobEvent) -> Self {
        let mut status = Self::starting(event.job_id());
        status.state = event.state();
        match event {
            JobEvent::Progress {
                done,
                total,
                message,
                ..
            } => {
                status.done = *done;
                status.total = *total;
                status.message = Some(message.clone());
            }
            JobEvent::Completed { output_uri, .. } => {
                status.output_uri = Some(output_uri.clone());
            }
            JobEvent::Failed { message, .. } => status.message = Some(message.clone()),
            JobEvent::Cancelled { done, .. } => status.done = *done,
        }
        status
    }
}

fn job_status(state: &AppState, id: JobId) -> Option<JobStatus> {
    match state.latest(id) {
        Some(event) => Some(JobStatus::from_event(&event)),
        None if state.manager().is_active(id) => Some(JobStatus::starting(id)),
        None => None,
    }
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobStatus>> {
    let jobs = state
        .manager()
        .active_jobs()
        .into_iter()
        .map(|id| {
            // An active job whose terminal event is already pumped is still
            // reported as running until its worker deregisters.
            match state.latest(id) {
                Some(event) if !event.is_terminal() => JobStatus::from_event(&event),
                _ => JobStatus::starting(id),
            }
        })
        .collect();
    Json(jobs)
}

fn parse_job_id(raw: &str) -> Result<JobId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid job id: {raw}")))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, AppError> {
    let id = parse_job_id(&id)?;
    job_status(&state, id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id} not found")))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_job_id(&id)?;
    if state.manager().cancel(id) {
        info!(job_id = %id, "Job cancellation requested via API");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn job_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_job_id(&id)?;

    if let Some(event) = state.latest(id).filter(JobEvent::is_terminal) {
        return Ok(ws.on_upgrade(move |socket| send_final(socket, event)));
    }
    if !state.manager().is_active(id) {
        return Err(AppError::NotFound(format!("job {id} not found")));
    }

    let rx = state.channel(id).subscribe();
    // The terminal event may have been pumped between the checks above and
    // the subscription; it would never reach this receiver.
    if let Some(event) = state.latest(id).filter(JobEvent::is_terminal) {
        state.inner.channels.remove(&id);
        return Ok(ws.on_upgrade(move |socket| send_final(socket, event)));
    }
    let snapshot = state.latest(id);

    Ok(ws.on_upgrade(move |socket| handle_ws(socket, snapshot, rx)))
}

fn event_message(event: &JobEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(error = %e, "Failed to serialize job event");
            None
        }
    }
}

async fn send_final(mut socket: WebSocket, event: JobEvent) {
    if let Some(msg) = event_message(&event) {
        let _ = socket.send(msg).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_ws(
    mut socket: WebSocket,
    snapshot: Option<JobEvent>,
    mut rx: broadcast::Receiver<JobEvent>,
) {
    if let Some(msg) = snapshot.as_ref().and_then(event_message) {
        if socket.send(msg).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        if let Some(msg) = event_message(&event) {
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                        if terminal {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "WebSocket client lagged behind job events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn api_route_not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("no API route for {}", uri.path()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<UpscaleError> for AppError {
    fn from(err: UpscaleError) -> Self {
        match err {
            UpscaleError::InvalidInput(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Sender;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::backend::{ModelBlob, ModelSource};
    use crate::geometry::TileProfile;
    use crate::job::UpscaleSettings;
    use crate::test_support::{pattern, MemoryCodec, ScriptedRuntime};

    const IMAGE: &str = "memory://input/a";

    fn settings() -> UpscaleSettings {
        UpscaleSettings {
            model: ModelSource::Loaded(ModelBlob::from_bytes("test-model", vec![0u8; 4])),
            profile: TileProfile::new(2, 4, 1).unwrap(),
            prefer_accelerator: false,
        }
    }

    /// State over a gated codec: jobs stay active until a permit is sent.
    fn gated_state() -> (AppState, mpsc::UnboundedReceiver<JobEvent>, Sender<()>) {
        let (codec, gate) = MemoryCodec::new().with_image(IMAGE, pattern(10, 6)).gated();
        let (manager, rx) = UpscaleManager::new(
            Arc::new(ScriptedRuntime::nearest()),
            Arc::new(codec),
            settings(),
        );
        (AppState::new(manager), rx, gate)
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_job(image_uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "image_uri": image_uri }).to_string(),
            ))
            .unwrap()
    }

    async fn wait_inactive(state: &AppState, id: JobId) {
        for _ in 0..500 {
            if !state.manager().is_active(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, _rx, _gate) = gated_state();
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            Request::get("/api/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: HealthResponse = body_json(resp).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.active_jobs, 0);
    }

    #[tokio::test]
    async fn create_job_returns_created_and_lists_it() {
        let (state, _rx, gate) = gated_state();
        let mut app = app_router(state.clone());

        let resp = send_request(&mut app, post_job(IMAGE)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: CreateJobResponse = body_json(resp).await;

        let resp = send_request(
            &mut app,
            Request::get("/api/jobs").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let jobs: Vec<JobStatus> = body_json(resp).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, created.job_id);
        assert_eq!(jobs[0].state, JobState::Running);

        gate.send(()).unwrap();
        wait_inactive(&state, created.job_id).await;
    }

    #[tokio::test]
    async fn create_job_rejects_blank_and_unknown_references() {
        let (state, _rx, _gate) = gated_state();
        let mut app = app_router(state.clone());

        for uri in ["   ", "memory://input/missing"] {
            let resp = send_request(&mut app, post_job(uri)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "uri {uri:?}");
            let body: ErrorResponse = body_json(resp).await;
            assert!(!body.error.is_empty());
        }
        assert!(state.manager().active_jobs().is_empty());
    }

    #[tokio::test]
    async fn delete_cancels_job_and_is_idempotent() {
        let (state, rx, gate) = gated_state();
        state.spawn_event_pump(rx);
        let mut app = app_router(state.clone());

        let resp = send_request(&mut app, post_job(IMAGE)).await;
        let created: CreateJobResponse = body_json(resp).await;
        let uri = format!("/api/jobs/{}", created.job_id);

        for _ in 0..2 {
            let resp = send_request(
                &mut app,
                Request::delete(uri.as_str()).body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }

        gate.send(()).unwrap();
        wait_inactive(&state, created.job_id).await;

        let mut status = None;
        for _ in 0..500 {
            let resp = send_request(
                &mut app,
                Request::get(uri.as_str()).body(Body::empty()).unwrap(),
            )
            .await;
            let current: JobStatus = body_json(resp).await;
            if current.state.is_terminal() {
                status = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = status.expect("terminal status");
        assert_eq!(status.state, JobState::Cancelled);
        assert_eq!(status.done, 0);

        let resp = send_request(
            &mut app,
            Request::delete(uri.as_str()).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn delete_with_malformed_id_is_bad_request() {
        let (state, _rx, _gate) = gated_state();
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            Request::delete("/api/jobs/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_and_route_are_not_found() {
        let (state, _rx, _gate) = gated_state();
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            Request::get(format!("/api/jobs/{}", JobId::new()).as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send_request(
            &mut app,
            Request::get("/api/nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: ErrorResponse = body_json(resp).await;
        assert!(body.error.contains("/api/nope"));
    }

    #[tokio::test]
    async fn pump_fans_out_to_subscribers_and_drops_channel_on_terminal() {
        let (state, rx, gate) = gated_state();
        state.spawn_event_pump(rx);

        let id = state.manager().start(IMAGE).unwrap();
        let mut sub = state.channel(id).subscribe();
        gate.send(()).unwrap();

        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("event before timeout")
                .expect("channel open");
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }

        // 10x6 with 4px tiles is a 3x2 grid.
        let progress: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress { done, .. } => Some(*done),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1, 2, 3, 4, 5, 6]);
        assert!(matches!(events.last(), Some(JobEvent::Completed { .. })));
        assert!(!state.inner.channels.contains_key(&id));
        assert_eq!(
            job_status(&state, id).map(|s| s.state),
            Some(JobState::Completed)
        );
    }

    #[tokio::test]
    async fn finished_job_history_is_bounded() {
        let (codec, gate) = MemoryCodec::new().with_image(IMAGE, pattern(4, 4)).gated();
        let (manager, rx) = UpscaleManager::new(
            Arc::new(ScriptedRuntime::nearest()),
            Arc::new(codec),
            settings(),
        );
        let state = AppState::with_history(manager, 2);
        state.spawn_event_pump(rx);
        let mut app = app_router(state.clone());

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = state.manager().start(IMAGE).unwrap();
            gate.send(()).unwrap();
            let mut finished = false;
            for _ in 0..500 {
                if job_status(&state, id).is_some_and(|s| s.state.is_terminal()) {
                    finished = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(finished, "job {id} did not finish");
            ids.push(id);
        }
        wait_inactive(&state, ids[4]).await;

        assert_eq!(state.inner.latest.len(), 2);
        for id in &ids[..3] {
            assert_eq!(job_status(&state, *id), None);
        }
        for id in &ids[3..] {
            assert_eq!(
                job_status(&state, *id).map(|s| s.state),
                Some(JobState::Completed)
            );
        }

        let resp = send_request(
            &mut app,
            Request::get(format!("/api/jobs/{}", ids[0]).as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn job_status_from_events() {
        let id = JobId::new();
        let progress = JobStatus::from_event(&JobEvent::progress(id, 2, 8));
        assert_eq!(progress.state, JobState::Running);
        assert_eq!((progress.done, progress.total), (2, 8));
        assert_eq!(progress.message.as_deref(), Some("2/8 tiles"));

        let failed = JobStatus::from_event(&JobEvent::Failed {
            job_id: id,
            message: "boom".to_string(),
        });
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.message.as_deref(), Some("boom"));

        let json = serde_json::to_value(&failed).unwrap();
        assert!(json.get("output_uri").is_none());
    }

    #[test]
    fn upscale_errors_map_to_status_codes() {
        let resp = AppError::from(UpscaleError::InvalidInput("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = AppError::from(UpscaleError::EncodeFailure("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
