use std::cmp::Reverse;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client as BlockingClient;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{Subscriber, subscriber, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::{TelemetrySettings, TraceSettings, project_dirs};

const TRACE_SUFFIX: &str = ".trace.jsonl";

static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_TRACE_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Trace export state, reported by `harness diagnostics`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    pub active_file: Option<PathBuf>,
    pub recent_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryDiagnostics {
    pub enabled: bool,
    pub collector_url: Option<String>,
    pub buffer_dir: Option<PathBuf>,
    pub max_buffer_bytes: Option<u64>,
    pub trace: TraceReport,
}

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the global subscriber: console output filtered by `RUST_LOG`
/// (default `infra_harness=info`) plus an optional JSON trace file.
pub fn init_tracing(service: &str, verbose: bool, telemetry: &TelemetrySettings) -> Result<()> {
    let default_level = if verbose {
        "infra_harness=debug"
    } else {
        "infra_harness=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = fmt::layer().with_target(false);

    match build_trace_file_layer(service, &telemetry.traces)? {
        Some((writer, guard, path)) => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG),
                );
            let _ = TRACE_GUARD.set(guard);
            let _ = ACTIVE_TRACE_FILE.set(path);
            install_subscriber(subscriber)
        }
        None => install_subscriber(tracing_subscriber::registry().with(env_filter).with(console)),
    }
}

pub fn trace_report(settings: &TelemetrySettings) -> Result<TraceReport> {
    let directory = if settings.traces.enabled {
        Some(resolve_trace_directory(&settings.traces)?)
    } else {
        resolve_trace_directory(&settings.traces).ok()
    };

    let recent_files = match directory.as_deref() {
        Some(dir) => list_trace_files(dir)?
            .into_iter()
            .take(settings.traces.max_files.saturating_add(2))
            .collect(),
        None => Vec::new(),
    };

    Ok(TraceReport {
        enabled: settings.traces.enabled,
        directory,
        active_file: ACTIVE_TRACE_FILE.get().cloned(),
        recent_files,
    })
}

pub fn telemetry_report(settings: &TelemetrySettings) -> Result<TelemetryDiagnostics> {
    Ok(TelemetryDiagnostics {
        enabled: settings.enabled,
        collector_url: settings.collector_url.clone(),
        buffer_dir: settings.buffer_dir.clone(),
        max_buffer_bytes: settings.max_buffer_bytes,
        trace: trace_report(settings)?,
    })
}

fn build_trace_file_layer(
    service: &str,
    settings: &TraceSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = resolve_trace_directory(settings)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create trace directory {}", directory.display()))?;

    let (file, path) = create_trace_file(service, &directory)?;
    prune_old_traces(&directory, settings.max_files, &path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, guard, path)))
}

fn resolve_trace_directory(settings: &TraceSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.directory {
        return Ok(dir.clone());
    }
    Ok(project_dirs()?.cache_dir().join("traces"))
}

fn create_trace_file(service: &str, directory: &Path) -> Result<(fs::File, PathBuf)> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut candidate = directory.join(format!("{service}-{timestamp}{TRACE_SUFFIX}"));
    let mut counter = 0;
    while candidate.exists() {
        counter += 1;
        candidate = directory.join(format!("{service}-{timestamp}-{counter}{TRACE_SUFFIX}"));
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&candidate)
        .with_context(|| format!("Failed to open trace file {}", candidate.display()))?;
    Ok((file, candidate))
}

/// Trace files in `directory`, newest first.
fn list_trace_files(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("Failed to read trace directory {}", directory.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let is_trace = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(TRACE_SUFFIX));
        if !is_trace || !path.is_file() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        entries.push((modified, path));
    }

    entries.sort_by_key(|(modified, _)| Reverse(*modified));
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

/// Keep at most `max_files` traces including `keep`. Zero disables pruning.
fn prune_old_traces(directory: &Path, max_files: usize, keep: &Path) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }
    let retain = max_files.saturating_sub(1);
    for path in list_trace_files(directory)?
        .into_iter()
        .filter(|path| path != keep)
        .skip(retain)
    {
        let _ = fs::remove_file(&path);
    }
    Ok(())
}

/// Opt-in JSON-L event buffer for long-running harness services.
#[derive(Debug, Clone)]
pub struct ServiceTelemetry {
    service: String,
    settings: TelemetrySettings,
}

impl ServiceTelemetry {
    pub fn new(service: impl Into<String>, settings: &TelemetrySettings) -> Self {
        Self {
            service: sanitize_service(service.into()),
            settings: settings.clone(),
        }
    }

    pub fn record_startup(&self) {
        self.record(ServiceEventKind::Startup, Some("service started".into()), None, None);
    }

    pub fn record_shutdown(&self) {
        self.record(ServiceEventKind::Shutdown, Some("service stopped".into()), None, None);
    }

    /// Record a named measurement or state change, e.g. a job start.
    pub fn record_metric(&self, event: impl Into<String>, details: Value) {
        self.record(ServiceEventKind::Metric, Some(event.into()), None, Some(details));
    }

    pub fn record_error<E>(&self, error: &E)
    where
        E: std::fmt::Display + std::fmt::Debug,
    {
        let debug = format!("{error:?}");
        let details = Some(json!({ "debug": debug }));
        self.record(
            ServiceEventKind::Error,
            Some(error.to_string()),
            Some(debug),
            details,
        );
    }

    fn record(
        &self,
        kind: ServiceEventKind,
        message: Option<String>,
        error: Option<String>,
        details: Option<Value>,
    ) {
        if !self.settings.enabled {
            return;
        }

        let event = ServiceEvent {
            service: self.service.clone(),
            kind,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            message,
            error,
            details,
        };
        if let Err(err) = self.write(&event) {
            warn!(service = %self.service, error = %err, "failed to write telemetry event");
        }
    }

    fn write(&self, event: &ServiceEvent) -> Result<()> {
        let path = self.buffer_path()?;
        if let Some(limit) = self.settings.max_buffer_bytes {
            rotate_if_full(&path, limit)?;
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open telemetry buffer {}", path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("Failed to append telemetry event to {}", path.display()))?;

        forward_to_collector(event, &self.settings);
        Ok(())
    }

    fn buffer_path(&self) -> Result<PathBuf> {
        let base = match &self.settings.buffer_dir {
            Some(dir) => dir.clone(),
            None => project_dirs()?.data_dir().join("telemetry"),
        };
        fs::create_dir_all(&base)
            .with_context(|| format!("Failed to create telemetry directory {}", base.display()))?;
        Ok(base.join(format!("{}.jsonl", self.service)))
    }
}

#[derive(Clone, Serialize)]
struct ServiceEvent {
    service: String,
    kind: ServiceEventKind,
    timestamp: DateTime<Utc>,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum ServiceEventKind {
    Startup,
    Shutdown,
    Metric,
    Error,
}

fn rotate_if_full(path: &Path, limit: u64) -> Result<()> {
    let Ok(metadata) = fs::metadata(path) else {
        return Ok(());
    };
    if metadata.len() < limit {
        return Ok(());
    }

    let mut rotated = path.as_os_str().to_owned();
    rotated.push(format!(".{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
    let rotated = PathBuf::from(rotated);
    fs::rename(path, &rotated).with_context(|| {
        format!(
            "Failed to rotate telemetry buffer {} to {}",
            path.display(),
            rotated.display()
        )
    })
}

fn forward_to_collector(event: &ServiceEvent, settings: &TelemetrySettings) {
    let Some(url) = settings.collector_url.clone() else {
        return;
    };

    let payload = match serde_json::to_value(event) {
        Ok(value) => value,
        Err(err) => {
            warn!(service = %event.service, error = %err, "failed to serialise telemetry payload");
            return;
        }
    };
    let api_key = settings
        .api_key_env
        .as_ref()
        .and_then(|key| env::var(key).ok());

    thread::spawn(move || {
        if let Err(err) = send_payload(&url, api_key, payload) {
            warn!(url = %url, error = %err, "telemetry collector request failed");
        }
    });
}

fn send_payload(url: &str, api_key: Option<String>, payload: Value) -> Result<()> {
    let client = BlockingClient::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build telemetry HTTP client")?;

    let mut request = client.post(url).json(&payload);
    if let Some(token) = api_key {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .with_context(|| format!("Failed to send telemetry event to {url}"))?;
    if !response.status().is_success() {
        bail!("Telemetry collector responded with status {}", response.status());
    }
    Ok(())
}

fn sanitize_service(service: String) -> String {
    service
        .chars()
        .map(|ch| match ch {
            'a'..='z' | '0'..='9' | '-' | '_' => ch,
            'A'..='Z' => ch.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}
