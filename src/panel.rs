use std::{
    convert::Infallible,
    fs,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::{Instant, SystemTime},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::Harness;
use crate::config::JobKind;
use crate::history::JobEvent;
use crate::process::{
    JobStartOutcome, JobStatus, JobStopOutcome, ProcessManager, StartAction, StopAction,
};
use crate::snapshot::{FamilyWindow, MetricFamily, MetricsSnapshot, MetricsSource};
use crate::telemetry::ServiceTelemetry;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "webm", "mkv", "gif"];
const DEFAULT_DOWNLOAD_MB: u64 = 10;
const MAX_DOWNLOAD_MB: u64 = 100;
const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 2000;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;
const CHUNK_SIZE: usize = 64 * 1024;

static ZEROS: [u8; CHUNK_SIZE] = [0; CHUNK_SIZE];

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>Infrastructure Test Harness</title>
  <style>
    body { font-family: sans-serif; margin: 2rem; }
    section { margin-bottom: 1.5rem; }
    pre { background: #f4f4f4; padding: 0.75rem; max-height: 24rem; overflow: auto; }
  </style>
</head>
<body>
  <h1>Test Control Panel</h1>
  <section id="jobs"></section>
  <section>
    <h2>Latest samples</h2>
    <pre id="metrics">waiting for data...</pre>
  </section>
  <section>
    <h2>Generated videos</h2>
    <ul id="videos"></ul>
  </section>
  <script>
    async function call(kind, action) {
      await fetch(`/api/jobs/${kind}/${action}`, { method: 'POST' });
      refreshJobs();
    }
    async function refreshJobs() {
      const jobs = await (await fetch('/api/jobs')).json();
      document.getElementById('jobs').innerHTML = jobs.map(job =>
        `<div><h2>${job.label}</h2>` +
        `<p>${job.running ? 'running, pid ' + job.pid : 'idle'}</p>` +
        `<button onclick="call('${job.kind}', 'start')">Start</button> ` +
        `<button onclick="call('${job.kind}', 'stop')">Stop</button></div>`
      ).join('');
    }
    function latest(window) {
      if (!window) return null;
      const last = window.timestamps.length - 1;
      const row = { timestamp: window.timestamps[last] };
      for (const [column, values] of Object.entries(window.data)) row[column] = values[last];
      return row;
    }
    async function refreshMetrics() {
      const snapshot = await (await fetch('/api/metrics?samples=1')).json();
      const view = {
        cpu: latest(snapshot.cpu),
        memory: latest(snapshot.memory),
        disk: latest(snapshot.disk),
        gpu: snapshot.gpu.map(group => ({ index: group.index, ...latest(group) })),
      };
      document.getElementById('metrics').textContent = JSON.stringify(view, null, 2);
    }
    async function refreshVideos() {
      const videos = await (await fetch('/api/videos')).json();
      document.getElementById('videos').innerHTML = videos.map(video =>
        `<li><a href="${video.url}">${video.name}</a> (${video.size_bytes} bytes)</li>`
      ).join('');
    }
    function tick() { refreshJobs(); refreshMetrics(); refreshVideos(); }
    tick();
    setInterval(tick, 5000);
  </script>
</body>
</html>
"#;

/// Prometheus counters exported at `/metrics`.
pub struct PanelMetrics {
    registry: Registry,
    metrics_requests_total: IntCounter,
    metric_families_missing_total: IntCounter,
    job_starts_total: IntCounter,
    job_start_rejections_total: IntCounter,
    job_stops_total: IntCounter,
    speedtest_bytes_total: IntCounter,
    errors_total: IntCounterVec,
}

impl PanelMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            metrics_requests_total: counter(
                "harness_metrics_requests_total",
                "Number of metrics snapshot and family requests served",
            )?,
            metric_families_missing_total: counter(
                "harness_metric_families_missing_total",
                "Number of metric families that had no data when requested",
            )?,
            job_starts_total: counter(
                "harness_job_starts_total",
                "Number of jobs launched by the panel",
            )?,
            job_start_rejections_total: counter(
                "harness_job_start_rejections_total",
                "Number of start requests rejected because the job was already running",
            )?,
            job_stops_total: counter(
                "harness_job_stops_total",
                "Number of running jobs stopped on request",
            )?,
            speedtest_bytes_total: counter(
                "harness_speedtest_bytes_total",
                "Bytes transferred by speed-test downloads and uploads",
            )?,
            errors_total: {
                let errors = IntCounterVec::new(
                    Opts::new("harness_errors_total", "Number of failed panel operations"),
                    &["type"],
                )?;
                registry.register(Box::new(errors.clone()))?;
                errors
            },
            registry,
        })
    }

    fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Shared state handed to every panel handler.
#[derive(Clone)]
pub struct PanelState {
    source: MetricsSource,
    processes: Arc<ProcessManager>,
    videos_dir: PathBuf,
    counters: Arc<PanelMetrics>,
    telemetry: ServiceTelemetry,
    upload_limit: u64,
    started_at: Instant,
}

impl PanelState {
    pub fn from_harness(harness: &Harness, telemetry: ServiceTelemetry) -> Result<Self> {
        Ok(Self {
            source: harness.source().clone(),
            processes: harness.processes(),
            videos_dir: harness.settings().resolve_videos_dir()?,
            counters: Arc::new(PanelMetrics::new().context("Failed to register panel metrics")?),
            telemetry,
            upload_limit: harness.settings().panel.max_upload_bytes,
            started_at: Instant::now(),
        })
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn payload_too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Run `work` on the blocking pool, mapping a panicked task to a 500.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work).await.map_err(|err| {
        error!(?err, "blocking task panicked");
        ApiError::internal("worker task failed")
    })
}

fn parse_kind(raw: &str) -> Result<JobKind, ApiError> {
    JobKind::from_slug(raw).ok_or_else(|| {
        let known: Vec<&str> = JobKind::ALL.iter().map(JobKind::slug).collect();
        ApiError::bad_request(format!(
            "unknown job kind '{raw}'; expected one of {}",
            known.join(", ")
        ))
    })
}

pub fn create_router(state: PanelState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(prometheus_handler))
        .route("/api/metrics", get(metrics_snapshot_handler))
        .route("/api/metrics/:family", get(metric_family_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/:kind", get(job_status_handler))
        .route("/api/jobs/:kind/start", post(start_job_handler))
        .route("/api/jobs/:kind/stop", post(stop_job_handler))
        .route("/api/jobs/:kind/log", get(job_log_handler))
        .route("/api/start-video-test", get(start_video_test_handler))
        .route("/api/start-iperf", get(start_iperf_handler))
        .route("/api/history", get(history_handler))
        .route("/api/videos", get(videos_handler))
        .route("/videos/:name", get(video_file_handler))
        .route("/api/speedtest/ping", get(ping_handler))
        .route("/api/speedtest/download", get(download_handler))
        .route("/api/speedtest/upload", post(upload_handler))
        .with_state(state)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler(State(state): State<PanelState>) -> Result<Json<Value>, ApiError> {
    let processes = Arc::clone(&state.processes);
    let jobs = blocking(move || processes.statuses()).await?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "jobs": jobs,
    })))
}

async fn prometheus_handler(State(state): State<PanelState>) -> Response {
    match state.counters.render() {
        Ok(buffer) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE))],
            buffer,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to render panel metrics");
            state.counters.record_error("metrics_render");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SamplesQuery {
    samples: Option<usize>,
}

async fn metrics_snapshot_handler(
    State(state): State<PanelState>,
    Query(query): Query<SamplesQuery>,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    state.counters.metrics_requests_total.inc();
    let samples = state.source.settings().clamp_samples(query.samples);
    let windows = state.source.read_all(samples).await;

    let missing = windows.missing_families();
    if !missing.is_empty() {
        state
            .counters
            .metric_families_missing_total
            .inc_by(missing.len() as u64);
        debug!(?missing, samples, "metrics snapshot is partial");
    }

    let processes = Arc::clone(&state.processes);
    let jobs = blocking(move || processes.statuses()).await?;
    Ok(Json(MetricsSnapshot::new(windows, &jobs)))
}

async fn metric_family_handler(
    State(state): State<PanelState>,
    Path(family): Path<String>,
    Query(query): Query<SamplesQuery>,
) -> Result<Json<FamilyWindow>, ApiError> {
    let family = MetricFamily::from_slug(&family)
        .ok_or_else(|| ApiError::not_found(format!("unknown metric family '{family}'")))?;
    state.counters.metrics_requests_total.inc();

    let samples = state.source.settings().clamp_samples(query.samples);
    let window = state.source.read_async(family, samples).await;
    if window.is_missing() {
        state.counters.metric_families_missing_total.inc();
    }
    Ok(Json(window))
}

async fn jobs_handler(State(state): State<PanelState>) -> Result<Json<Vec<JobStatus>>, ApiError> {
    let processes = Arc::clone(&state.processes);
    Ok(Json(blocking(move || processes.statuses()).await?))
}

async fn job_status_handler(
    State(state): State<PanelState>,
    Path(kind): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let kind = parse_kind(&kind)?;
    let processes = Arc::clone(&state.processes);
    Ok(Json(blocking(move || processes.status(kind)).await?))
}

async fn start_job_handler(
    State(state): State<PanelState>,
    Path(kind): Path<String>,
) -> Result<(StatusCode, Json<JobStartOutcome>), ApiError> {
    let kind = parse_kind(&kind)?;
    start_job(state, kind).await
}

async fn start_video_test_handler(
    State(state): State<PanelState>,
) -> Result<(StatusCode, Json<JobStartOutcome>), ApiError> {
    start_job(state, JobKind::VideoTest).await
}

async fn start_iperf_handler(
    State(state): State<PanelState>,
) -> Result<(StatusCode, Json<JobStartOutcome>), ApiError> {
    start_job(state, JobKind::NetworkTest).await
}

async fn start_job(
    state: PanelState,
    kind: JobKind,
) -> Result<(StatusCode, Json<JobStartOutcome>), ApiError> {
    let processes = Arc::clone(&state.processes);
    let telemetry = state.telemetry.clone();
    let outcome = blocking(move || {
        let outcome = processes.start(kind);
        match &outcome {
            Ok(started) if started.action == StartAction::Started => telemetry.record_metric(
                "job_started",
                json!({ "kind": kind, "pid": started.status.pid }),
            ),
            Ok(_) => {}
            Err(err) => telemetry.record_error(err),
        }
        outcome
    })
    .await?
    .map_err(|err| {
        error!(kind = %kind, error = %format!("{err:#}"), "failed to start job");
        state.counters.record_error("job_start");
        ApiError::internal(format!("{err:#}"))
    })?;

    match outcome.action {
        StartAction::Started => {
            state.counters.job_starts_total.inc();
            Ok((StatusCode::OK, Json(outcome)))
        }
        StartAction::AlreadyRunning => {
            state.counters.job_start_rejections_total.inc();
            Ok((StatusCode::CONFLICT, Json(outcome)))
        }
    }
}

async fn stop_job_handler(
    State(state): State<PanelState>,
    Path(kind): Path<String>,
) -> Result<Json<JobStopOutcome>, ApiError> {
    let kind = parse_kind(&kind)?;
    let processes = Arc::clone(&state.processes);
    let telemetry = state.telemetry.clone();
    let outcome = blocking(move || {
        let outcome = processes.stop(kind);
        match &outcome {
            Ok(stopped) if stopped.action == StopAction::Stopped => {
                telemetry.record_metric("job_stopped", json!({ "kind": kind }))
            }
            Ok(_) => {}
            Err(err) => telemetry.record_error(err),
        }
        outcome
    })
    .await?
    .map_err(|err| {
        error!(kind = %kind, error = %format!("{err:#}"), "failed to stop job");
        state.counters.record_error("job_stop");
        ApiError::internal(format!("{err:#}"))
    })?;

    if outcome.action == StopAction::Stopped {
        state.counters.job_stops_total.inc();
    }
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    lines: Option<usize>,
}

async fn job_log_handler(
    State(state): State<PanelState>,
    Path(kind): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(&kind)?;
    let lines = query
        .lines
        .unwrap_or(DEFAULT_LOG_LINES)
        .min(MAX_LOG_LINES);
    let processes = Arc::clone(&state.processes);

    let tail = blocking(move || processes.log_tail(kind, lines))
        .await?
        .map_err(|err| {
            warn!(kind = %kind, error = %err, "failed to read job log");
            state.counters.record_error("job_log");
            ApiError::internal("failed to read job log")
        })?
        .ok_or_else(|| ApiError::not_found(format!("no log recorded for {kind}")))?;

    Ok(Json(json!({ "kind": kind, "lines": tail })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history_handler(
    State(state): State<PanelState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<JobEvent>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let history = state.processes.history().clone();

    let events = blocking(move || history.read_events(limit))
        .await?
        .map_err(|err| {
            warn!(error = %err, "failed to read job history");
            state.counters.record_error("history");
            ApiError::internal("failed to read job history")
        })?;
    Ok(Json(events))
}

/// A generated video available for download.
#[derive(Debug, Clone, Serialize)]
pub struct VideoEntry {
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    pub url: String,
}

fn is_video_name(name: &str) -> bool {
    FsPath::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Videos in `dir`, newest first. A missing directory is an empty list.
pub fn list_videos(dir: &FsPath) -> Result<Vec<VideoEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<(SystemTime, VideoEntry)> = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read videos directory {}", dir.display()))?
    {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_video_name(&name) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().ok();
        entries.push((
            modified.unwrap_or(SystemTime::UNIX_EPOCH),
            VideoEntry {
                url: format!("/videos/{name}"),
                name,
                size_bytes: metadata.len(),
                modified: modified.map(DateTime::<Utc>::from),
            },
        ));
    }

    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    Ok(entries.into_iter().map(|(_, entry)| entry).collect())
}

async fn videos_handler(
    State(state): State<PanelState>,
) -> Result<Json<Vec<VideoEntry>>, ApiError> {
    let dir = state.videos_dir.clone();
    let videos = blocking(move || list_videos(&dir)).await?.map_err(|err| {
        warn!(error = %err, "failed to list videos");
        state.counters.record_error("video_list");
        ApiError::internal("failed to list videos")
    })?;
    Ok(Json(videos))
}

async fn video_file_handler(
    State(state): State<PanelState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let traversal = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..");
    if traversal || !is_video_name(&name) {
        return Err(ApiError::bad_request(format!("invalid video name '{name}'")));
    }

    let path = state.videos_dir.join(&name);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!("video '{name}' not found")));
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "failed to read video");
            state.counters.record_error("video_read");
            return Err(ApiError::internal("failed to read video"));
        }
    };

    let mime = infer::get(&bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream");
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

async fn ping_handler() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(json!({ "pong": true, "server_time": Utc::now() })),
    )
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    size_mb: Option<u64>,
}

async fn download_handler(
    State(state): State<PanelState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let size_mb = query
        .size_mb
        .unwrap_or(DEFAULT_DOWNLOAD_MB)
        .clamp(1, MAX_DOWNLOAD_MB);
    let total = (size_mb * 1024 * 1024) as usize;
    state.counters.speedtest_bytes_total.inc_by(total as u64);

    let chunks = total.div_ceil(CHUNK_SIZE);
    let stream = tokio_stream::iter((0..chunks).map(move |idx| {
        let len = (total - idx * CHUNK_SIZE).min(CHUNK_SIZE);
        Ok::<_, Infallible>(Bytes::from_static(&ZEROS[..len]))
    }));

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, total.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn upload_handler(
    State(state): State<PanelState>,
    body: Body,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let limit = state.upload_limit;
    let mut stream = body.into_data_stream();
    let mut bytes: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            warn!(error = %err, received = bytes, "speed-test upload aborted");
            state.counters.record_error("upload");
            ApiError::bad_request(format!("upload failed: {err}"))
        })?;
        bytes += chunk.len() as u64;
        if bytes > limit {
            warn!(received = bytes, limit, "speed-test upload exceeded size limit");
            state.counters.speedtest_bytes_total.inc_by(bytes);
            state.counters.record_error("upload_too_large");
            return Err(ApiError::payload_too_large(format!(
                "upload exceeds {limit} bytes"
            )));
        }
    }

    let elapsed = started.elapsed();
    state.counters.speedtest_bytes_total.inc_by(bytes);
    let seconds = elapsed.as_secs_f64().max(0.001);
    let mbps = (bytes as f64 * 8.0) / seconds / 1_000_000.0;
    info!(bytes, duration_ms = elapsed.as_millis() as u64, mbps, "speed-test upload finished");

    Ok(Json(json!({
        "bytes": bytes,
        "duration_ms": elapsed.as_millis() as u64,
        "mbps": mbps,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HarnessSettings, TelemetrySettings};
    use crate::process::tests::shell_settings;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        _temp: TempDir,
        router: Router,
        state: PanelState,
        metrics_dir: PathBuf,
        videos_dir: PathBuf,
    }

    fn fixture_with(configure: impl FnOnce(&mut HarnessSettings)) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut settings = shell_settings(temp.path(), "echo collecting\nsleep 30\n");
        configure(&mut settings);
        let metrics_dir = settings.resolve_metrics_dir().unwrap();
        let videos_dir = settings.resolve_videos_dir().unwrap();
        fs::create_dir_all(&metrics_dir).unwrap();

        let harness = Harness::new(settings).unwrap();
        let telemetry = ServiceTelemetry::new("harness-panel", &TelemetrySettings::default());
        let state = PanelState::from_harness(&harness, telemetry).unwrap();
        Fixture {
            router: create_router(state.clone()),
            state,
            metrics_dir,
            videos_dir,
            _temp: temp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_lists_jobs() {
        let fx = fixture();
        let (status, body) = send(&fx.router, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["jobs"].as_array().unwrap().len(), JobKind::ALL.len());
    }

    #[tokio::test]
    async fn index_serves_control_page() {
        let fx = fixture();
        let response = fx.router.clone().oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("/api/jobs"));
    }

    #[tokio::test]
    async fn metrics_snapshot_is_partial_without_files() {
        let fx = fixture();
        fs::write(
            fx.metrics_dir.join("cpu.csv"),
            "timestamp,%user,%system,%idle\nt1,10,5,85\nt2,12,4,84\n",
        )
        .unwrap();

        let (status, body) = send(&fx.router, get_request("/api/metrics?samples=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cpu"]["timestamps"], json!(["t1", "t2"]));
        assert_eq!(body["cpu"]["data"]["user"], json!([10.0, 12.0]));
        assert_eq!(body["cpu"]["data"]["idle"], json!([85.0, 84.0]));
        assert!(body["memory"].is_null());
        assert!(body["disk"].is_null());
        assert_eq!(body["gpu"], json!([]));
        assert_eq!(body["video_test_active"], false);
    }

    #[tokio::test]
    async fn samples_are_clamped() {
        let fx = fixture();
        let rows: String = (0..30).map(|idx| format!("t{idx},1\n")).collect();
        fs::write(fx.metrics_dir.join("memory.csv"), format!("timestamp,memused\n{rows}")).unwrap();

        let (_, body) = send(&fx.router, get_request("/api/metrics/memory?samples=0")).await;
        assert_eq!(body["timestamps"], json!(["t29"]));

        let (_, body) = send(&fx.router, get_request("/api/metrics/memory")).await;
        assert_eq!(body["timestamps"].as_array().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn gpu_family_groups_by_index() {
        let fx = fixture();
        fs::write(
            fx.metrics_dir.join("gpu.csv"),
            "timestamp,index,utilization\nt1,0,10\nt1,1,20\nt2,0,30\nt2,1,40\n",
        )
        .unwrap();

        let (status, body) = send(&fx.router, get_request("/api/metrics/gpu?samples=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["index"], 0);
        assert_eq!(body[0]["data"]["utilization"], json!([30.0]));
        assert_eq!(body[1]["timestamps"], json!(["t2"]));
    }

    #[tokio::test]
    async fn unknown_family_and_kind_are_rejected() {
        let fx = fixture();
        let (status, body) = send(&fx.router, get_request("/api/metrics/network")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("network"));

        let (status, _) = send(&fx.router, get_request("/api/metrics/cpu")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&fx.router, get_request("/api/jobs/grafana")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("video-test"));
    }

    #[tokio::test]
    async fn start_twice_conflicts_then_stop() {
        let fx = fixture();
        let (status, body) = send(&fx.router, post_request("/api/jobs/collector/start")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "started");
        assert_eq!(body["status"]["running"], true);

        let (status, body) = send(&fx.router, post_request("/api/jobs/collector/start")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["action"], "already_running");

        let (_, body) = send(&fx.router, get_request("/api/metrics")).await;
        assert_eq!(body["collector_active"], true);

        let (status, body) = send(&fx.router, post_request("/api/jobs/collector/stop")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "stopped");
        assert_eq!(body["status"]["running"], false);

        let (_, body) = send(&fx.router, get_request("/api/history?limit=10")).await;
        let phases: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|event| event["phase"].as_str().unwrap())
            .collect();
        assert_eq!(phases, vec!["launch", "stop"]);

        let (status, body) = send(&fx.router, get_request("/api/jobs/collector/log")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "collector");

        let response = fx
            .router
            .clone()
            .oneshot(get_request("/metrics"))
            .await
            .unwrap();
        let text = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("harness_job_starts_total 1"));
        assert!(text.contains("harness_job_start_rejections_total 1"));
    }

    #[tokio::test]
    async fn legacy_start_reports_spawn_failure() {
        let fx = fixture_with(|settings| {
            settings.jobs.network.binary_path = Some(PathBuf::from("/nonexistent/iperf3"));
        });
        let (status, body) = send(&fx.router, get_request("/api/start-iperf")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("Failed to spawn"));
        assert!(!fx.state.processes().is_running(JobKind::NetworkTest));

        let response = fx
            .router
            .clone()
            .oneshot(get_request("/metrics"))
            .await
            .unwrap();
        let text = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&text).contains(r#"harness_errors_total{type="job_start"} 1"#));
    }

    #[tokio::test]
    async fn log_before_first_run_is_not_found() {
        let fx = fixture();
        let (status, _) = send(&fx.router, get_request("/api/jobs/video-test/log")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn videos_are_listed_and_served() {
        let fx = fixture();
        fs::create_dir_all(&fx.videos_dir).unwrap();
        let gif = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";
        fs::write(fx.videos_dir.join("clip.gif"), gif).unwrap();
        fs::write(fx.videos_dir.join("notes.txt"), "not a video").unwrap();

        let (status, body) = send(&fx.router, get_request("/api/videos")).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|video| video["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["clip.gif"]);
        assert_eq!(body[0]["url"], "/videos/clip.gif");

        let response = fx
            .router
            .clone()
            .oneshot(get_request("/videos/clip.gif"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");

        let (status, _) = send(&fx.router, get_request("/videos/..%2Fconfig.mp4")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&fx.router, get_request("/videos/notes.txt")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&fx.router, get_request("/videos/missing.mp4")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_videos_dir_is_empty_list() {
        let fx = fixture();
        let (status, body) = send(&fx.router, get_request("/api/videos")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn ping_is_not_cached() {
        let fx = fixture();
        let response = fx
            .router
            .clone()
            .oneshot(get_request("/api/speedtest/ping"))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["pong"], true);
    }

    #[tokio::test]
    async fn download_streams_requested_size() {
        let fx = fixture();
        let response = fx
            .router
            .clone()
            .oneshot(get_request("/api/speedtest/download?size_mb=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 1024 * 1024);
        assert!(body.iter().all(|byte| *byte == 0));

        let capped = fx
            .router
            .clone()
            .oneshot(get_request("/api/speedtest/download?size_mb=5000"))
            .await
            .unwrap();
        assert_eq!(
            capped.headers()[header::CONTENT_LENGTH],
            (MAX_DOWNLOAD_MB * 1024 * 1024).to_string()
        );
    }

    #[tokio::test]
    async fn upload_counts_bytes() {
        let fx = fixture();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/speedtest/upload")
            .body(Body::from(vec![7u8; 3000]))
            .unwrap();
        let (status, body) = send(&fx.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bytes"], 3000);
        assert!(body["mbps"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let fx = fixture_with(|settings| settings.panel.max_upload_bytes = 1024);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/speedtest/upload")
            .body(Body::from(vec![7u8; 3000]))
            .unwrap();
        let (status, body) = send(&fx.router, request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].as_str().unwrap().contains("1024"));

        let at_limit = Request::builder()
            .method(Method::POST)
            .uri("/api/speedtest/upload")
            .body(Body::from(vec![7u8; 1024]))
            .unwrap();
        let (status, body) = send(&fx.router, at_limit).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bytes"], 1024);

        let response = fx
            .router
            .clone()
            .oneshot(get_request("/metrics"))
            .await
            .unwrap();
        let text = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&text)
            .contains(r#"harness_errors_total{type="upload_too_large"} 1"#));
    }
}
