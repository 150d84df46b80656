pub mod cli;
pub mod config;
pub mod history;
pub mod jobs;
pub mod panel;
pub mod process;
pub mod snapshot;
pub mod telemetry;
pub mod window;

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::config::{HarnessSettings, JobKind, default_config_path};
use crate::history::{JobEvent, JobHistory};
use crate::process::ProcessManager;
use crate::snapshot::{MetricFamily, MetricsSource};
use crate::telemetry::TelemetryDiagnostics;

/// Wires settings to the metrics source and the process manager shared by
/// the CLI and the panel.
pub struct Harness {
    settings: HarnessSettings,
    config_path: Option<PathBuf>,
    source: MetricsSource,
    processes: Arc<ProcessManager>,
}

impl Harness {
    pub fn new(settings: HarnessSettings) -> Result<Self> {
        let source = MetricsSource::from_settings(&settings)?;
        let processes = Arc::new(ProcessManager::new(&settings)?);
        Ok(Self {
            settings,
            config_path: None,
            source,
            processes,
        })
    }

    /// Load configuration (writing defaults on first run) and build the harness.
    pub fn bootstrap(config_path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => path,
            None => default_config_path()?,
        };
        let settings = HarnessSettings::load_or_default(&config_path)?;
        info!(path = %config_path.display(), "loaded harness settings");

        let mut harness = Self::new(settings)?;
        harness.config_path = Some(config_path);
        Ok(harness)
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    pub fn source(&self) -> &MetricsSource {
        &self.source
    }

    pub fn processes(&self) -> Arc<ProcessManager> {
        Arc::clone(&self.processes)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<JobEvent>> {
        self.history().read_events(limit)
    }

    pub fn history(&self) -> &JobHistory {
        self.processes.history()
    }

    /// Report resolved paths, job binaries and trace state without side effects.
    pub fn diagnostics(&self) -> Result<DiagnosticsReport> {
        let metric_files = MetricFamily::ALL
            .into_iter()
            .map(|family| {
                let path = self.source.path(family);
                let size_bytes = fs::metadata(&path).map(|meta| meta.len()).ok();
                MetricFileHealth {
                    family,
                    exists: size_bytes.is_some(),
                    path,
                    size_bytes,
                }
            })
            .collect();

        let registry = self.processes.registry();
        let jobs = registry
            .kinds()
            .map(|kind| match registry.get(kind) {
                Some(driver) => match driver.build_command() {
                    Ok(command) => JobHealth {
                        kind,
                        label: driver.label(),
                        binary: Some(command.binary().clone()),
                        command: Some(command.describe()),
                        error: None,
                    },
                    Err(err) => JobHealth {
                        kind,
                        label: driver.label(),
                        binary: None,
                        command: None,
                        error: Some(err.to_string()),
                    },
                },
                None => JobHealth {
                    kind,
                    label: "(unregistered)",
                    binary: None,
                    command: None,
                    error: Some("Job driver not available".into()),
                },
            })
            .collect();

        Ok(DiagnosticsReport {
            config_path: self.config_path.clone(),
            listen_addr: self.settings.panel.listen_addr.clone(),
            metrics_dir: self.settings.resolve_metrics_dir()?,
            videos_dir: self.settings.resolve_videos_dir()?,
            log_dir: self.settings.resolve_log_dir()?,
            history_log: self.history().log_path().clone(),
            metric_files,
            jobs,
            telemetry: telemetry::telemetry_report(&self.settings.telemetry)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub config_path: Option<PathBuf>,
    pub listen_addr: String,
    pub metrics_dir: PathBuf,
    pub videos_dir: PathBuf,
    pub log_dir: PathBuf,
    pub history_log: PathBuf,
    pub metric_files: Vec<MetricFileHealth>,
    pub jobs: Vec<JobHealth>,
    pub telemetry: TelemetryDiagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricFileHealth {
    pub family: MetricFamily,
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: Option<u64>,
}

/// Per-job diagnostics entry.
#[derive(Debug, Clone, Serialize)]
pub struct JobHealth {
    pub kind: JobKind,
    pub label: &'static str,
    pub binary: Option<PathBuf>,
    pub command: Option<String>,
    pub error: Option<String>,
}
