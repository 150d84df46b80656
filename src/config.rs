use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Long-running processes the harness knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Text-to-video generation benchmark.
    VideoTest,
    /// iperf3 network throughput run.
    NetworkTest,
    /// Script appending system metrics to the CSV files.
    Collector,
    /// fio sequential write then read pass.
    StorageTest,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::VideoTest,
        JobKind::NetworkTest,
        JobKind::Collector,
        JobKind::StorageTest,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            JobKind::VideoTest => "video-test",
            JobKind::NetworkTest => "network-test",
            JobKind::Collector => "collector",
            JobKind::StorageTest => "storage-test",
        }
    }

    /// Parse the slug used in URLs and log file names.
    pub fn from_slug(value: &str) -> Option<Self> {
        let needle = value.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.slug().eq_ignore_ascii_case(needle))
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.slug())
    }
}

/// User configuration for the harness panel and CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    #[serde(default)]
    pub panel: PanelSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    /// Optional override for where job stdout/stderr logs are written.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Optional override for the JSON-L job history location.
    #[serde(default)]
    pub history_log: Option<PathBuf>,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            panel: PanelSettings::default(),
            metrics: MetricsSettings::default(),
            jobs: JobSettings::default(),
            log_dir: None,
            history_log: None,
            telemetry: TelemetrySettings::default(),
        }
    }
}

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "infra-harness", "InfraHarness")
        .context("Unable to resolve platform data directory")
}

impl HarnessSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if let Some(parsed) = Self::load_existing(path)? {
            return Ok(parsed);
        }
        let settings = Self::default();
        settings.save(path)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Directory the collector writes its CSV files into.
    pub fn resolve_metrics_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.metrics.data_dir {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("metrics"))
    }

    /// Directory scanned for generated videos.
    pub fn resolve_videos_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.panel.videos_dir {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("videos"))
    }

    pub fn resolve_log_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.log_dir {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("logs"))
    }

    /// Resolve path to JSON-L job history file.
    pub fn resolve_history_log(&self) -> Result<PathBuf> {
        if let Some(path) = &self.history_log {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("history").join("jobs.jsonl"))
    }

    /// Scratch directory fio reads and writes its test files in.
    pub fn resolve_storage_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.jobs.fio.directory {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("storage"))
    }

    /// Retrieve job-specific configuration by kind.
    pub fn job_config(&self, kind: JobKind) -> &JobSpecificConfig {
        match kind {
            JobKind::VideoTest => &self.jobs.video,
            JobKind::NetworkTest => &self.jobs.network,
            JobKind::Collector => &self.jobs.collector,
            JobKind::StorageTest => &self.jobs.storage,
        }
    }
}

/// HTTP control panel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelSettings {
    #[serde(default = "PanelSettings::default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub videos_dir: Option<PathBuf>,
    /// Largest speed-test upload body accepted before answering 413.
    #[serde(default = "PanelSettings::default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl PanelSettings {
    fn default_listen_addr() -> String {
        "127.0.0.1:8080".into()
    }

    const fn default_max_upload_bytes() -> u64 {
        256 * 1024 * 1024
    }
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            videos_dir: None,
            max_upload_bytes: Self::default_max_upload_bytes(),
        }
    }
}

/// Locations and window sizes for the collector CSV files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "MetricsSettings::default_cpu_file")]
    pub cpu_file: String,
    #[serde(default = "MetricsSettings::default_memory_file")]
    pub memory_file: String,
    #[serde(default = "MetricsSettings::default_disk_file")]
    pub disk_file: String,
    #[serde(default = "MetricsSettings::default_gpu_file")]
    pub gpu_file: String,
    /// Column identifying which GPU a row belongs to.
    #[serde(default = "MetricsSettings::default_gpu_index_column")]
    pub gpu_index_column: String,
    #[serde(default = "MetricsSettings::default_samples")]
    pub default_samples: usize,
    /// Upper bound accepted from `?samples=` query parameters.
    #[serde(default = "MetricsSettings::default_max_samples")]
    pub max_samples: usize,
}

impl MetricsSettings {
    fn default_cpu_file() -> String {
        "cpu.csv".into()
    }

    fn default_memory_file() -> String {
        "memory.csv".into()
    }

    fn default_disk_file() -> String {
        "disk.csv".into()
    }

    fn default_gpu_file() -> String {
        "gpu.csv".into()
    }

    fn default_gpu_index_column() -> String {
        "index".into()
    }

    const fn default_samples() -> usize {
        20
    }

    const fn default_max_samples() -> usize {
        1200
    }

    /// Clamp a caller-provided sample count into `1..=max_samples`.
    pub fn clamp_samples(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_samples)
            .clamp(1, self.max_samples.max(1))
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            cpu_file: Self::default_cpu_file(),
            memory_file: Self::default_memory_file(),
            disk_file: Self::default_disk_file(),
            gpu_file: Self::default_gpu_file(),
            gpu_index_column: Self::default_gpu_index_column(),
            default_samples: Self::default_samples(),
            max_samples: Self::default_max_samples(),
        }
    }
}

/// Per-job launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "JobSpecificConfig::video_defaults")]
    pub video: JobSpecificConfig,
    #[serde(default = "JobSpecificConfig::network_defaults")]
    pub network: JobSpecificConfig,
    #[serde(default)]
    pub collector: JobSpecificConfig,
    #[serde(default = "JobSettings::default_video_script")]
    pub video_script: PathBuf,
    #[serde(default = "JobSettings::default_collector_script")]
    pub collector_script: PathBuf,
    #[serde(default)]
    pub iperf: IperfSettings,
    #[serde(default)]
    pub storage: JobSpecificConfig,
    #[serde(default)]
    pub fio: FioSettings,
}

impl JobSettings {
    fn default_video_script() -> PathBuf {
        PathBuf::from("scripts/video_generation_test.py")
    }

    fn default_collector_script() -> PathBuf {
        PathBuf::from("scripts/collect_metrics.sh")
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            video: JobSpecificConfig::video_defaults(),
            network: JobSpecificConfig::network_defaults(),
            collector: JobSpecificConfig::default(),
            video_script: Self::default_video_script(),
            collector_script: Self::default_collector_script(),
            iperf: IperfSettings::default(),
            storage: JobSpecificConfig::default(),
            fio: FioSettings::default(),
        }
    }
}

/// Target of the iperf3 client run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IperfSettings {
    #[serde(default = "IperfSettings::default_server")]
    pub server: String,
    #[serde(default = "IperfSettings::default_port")]
    pub port: u16,
    #[serde(default = "IperfSettings::default_duration_secs")]
    pub duration_secs: u32,
}

impl IperfSettings {
    fn default_server() -> String {
        "127.0.0.1".into()
    }

    const fn default_port() -> u16 {
        5201
    }

    const fn default_duration_secs() -> u32 {
        60
    }
}

impl Default for IperfSettings {
    fn default() -> Self {
        Self {
            server: Self::default_server(),
            port: Self::default_port(),
            duration_secs: Self::default_duration_secs(),
        }
    }
}

/// Parameters of the fio storage benchmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FioSettings {
    /// Where the test files live; defaults under the data directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "FioSettings::default_size")]
    pub size: String,
    #[serde(default = "FioSettings::default_block_size")]
    pub block_size: String,
    #[serde(default = "FioSettings::default_ioengine")]
    pub ioengine: String,
    /// Bypass the page cache (`--direct=1`).
    #[serde(default = "FioSettings::default_direct")]
    pub direct: bool,
}

impl FioSettings {
    fn default_size() -> String {
        "1G".into()
    }

    fn default_block_size() -> String {
        "4M".into()
    }

    fn default_ioengine() -> String {
        "libaio".into()
    }

    const fn default_direct() -> bool {
        true
    }
}

impl Default for FioSettings {
    fn default() -> Self {
        Self {
            directory: None,
            size: Self::default_size(),
            block_size: Self::default_block_size(),
            ioengine: Self::default_ioengine(),
            direct: Self::default_direct(),
        }
    }
}

/// Job-specific tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpecificConfig {
    /// Optional explicit binary path.
    pub binary_path: Option<PathBuf>,
    /// Additional CLI arguments to append.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Custom environment variable overrides.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl JobSpecificConfig {
    fn video_defaults() -> Self {
        Self {
            binary_path: None,
            extra_args: vec![],
            env: vec![EnvVar {
                key: "PYTHONUNBUFFERED".into(),
                value: "1".into(),
            }],
        }
    }

    fn network_defaults() -> Self {
        Self {
            binary_path: None,
            extra_args: vec!["--get-server-output".into()],
            env: vec![],
        }
    }
}

impl Default for JobSpecificConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            extra_args: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// Key-value environment variable pair persisted in config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Opt-in telemetry configuration for the panel service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub collector_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub buffer_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_buffer_bytes: Option<u64>,
    #[serde(default)]
    pub traces: TraceSettings,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            collector_url: None,
            api_key_env: None,
            buffer_dir: None,
            max_buffer_bytes: Some(512 * 1024),
            traces: TraceSettings::default(),
        }
    }
}

/// Controls structured JSON trace export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// Compute the default path to the harness configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

/// Result of writing a settings file.
#[derive(Debug, Clone)]
pub struct ConfigWriteOutcome {
    pub path: PathBuf,
    pub action: ConfigWriteAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWriteAction {
    Created,
    Updated,
    Skipped,
}

impl HarnessSettings {
    /// Write the fully populated settings to `path`. An existing file is
    /// only replaced with `overwrite`, and never when already identical.
    pub fn write_template(&self, path: &Path, overwrite: bool) -> Result<ConfigWriteOutcome> {
        let rendered = serde_json::to_string_pretty(self)?;
        let action = if path.exists() {
            let current = fs::read_to_string(path).unwrap_or_default();
            if !overwrite || current == rendered {
                return Ok(ConfigWriteOutcome {
                    path: path.to_path_buf(),
                    action: ConfigWriteAction::Skipped,
                });
            }
            ConfigWriteAction::Updated
        } else {
            ConfigWriteAction::Created
        };

        self.save(path)?;
        Ok(ConfigWriteOutcome {
            path: path.to_path_buf(),
            action,
        })
    }

    /// Parse `path` when present without writing anything.
    pub fn load_existing(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config at {}", path.display()))?;
        let parsed = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed config at {}", path.display()))?;
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn job_kind_slug_round_trips() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::from_slug(kind.slug()), Some(kind));
        }
        assert_eq!(JobKind::from_slug(" Video-Test "), Some(JobKind::VideoTest));
        assert_eq!(JobKind::from_slug("storage-test"), Some(JobKind::StorageTest));
        assert_eq!(JobKind::from_slug("grafana"), None);
    }

    #[test]
    fn load_or_default_writes_defaults() {
        let dir = tempdir().expect("temp directory");
        let path = dir.path().join("nested").join("config.json");

        let settings = HarnessSettings::load_or_default(&path).expect("defaults");
        assert!(path.exists());
        assert_eq!(settings.panel.listen_addr, "127.0.0.1:8080");
        assert_eq!(settings.metrics.gpu_index_column, "index");

        let reloaded = HarnessSettings::load_or_default(&path).expect("reload");
        assert_eq!(reloaded.metrics.default_samples, settings.metrics.default_samples);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempdir().expect("temp directory");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "metrics": { "data_dir": "/srv/metrics", "default_samples": 5 } }"#,
        )
        .unwrap();

        let settings = HarnessSettings::load_or_default(&path).expect("parse");
        assert_eq!(
            settings.resolve_metrics_dir().unwrap(),
            PathBuf::from("/srv/metrics")
        );
        assert_eq!(settings.metrics.default_samples, 5);
        assert_eq!(settings.metrics.cpu_file, "cpu.csv");
        assert_eq!(settings.jobs.iperf.port, 5201);
        assert_eq!(settings.jobs.fio.size, "1G");
        assert!(settings.jobs.fio.direct);
        assert_eq!(settings.panel.max_upload_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn write_template_respects_overwrite() {
        let dir = tempdir().expect("temp directory");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "panel": { "listen_addr": "0.0.0.0:9000" } }"#).unwrap();

        let settings = HarnessSettings::load_existing(&path).unwrap().expect("parsed");
        let skipped = settings.write_template(&path, false).unwrap();
        assert_eq!(skipped.action, ConfigWriteAction::Skipped);

        let updated = settings.write_template(&path, true).unwrap();
        assert_eq!(updated.action, ConfigWriteAction::Updated);
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("0.0.0.0:9000"));
        assert!(written.contains("gpu_index_column"));

        let unchanged = settings.write_template(&path, true).unwrap();
        assert_eq!(unchanged.action, ConfigWriteAction::Skipped);

        let fresh = dir.path().join("fresh.json");
        let created = HarnessSettings::default().write_template(&fresh, false).unwrap();
        assert_eq!(created.action, ConfigWriteAction::Created);
    }

    #[test]
    fn clamp_samples_respects_bounds() {
        let metrics = MetricsSettings {
            default_samples: 20,
            max_samples: 100,
            ..MetricsSettings::default()
        };
        assert_eq!(metrics.clamp_samples(None), 20);
        assert_eq!(metrics.clamp_samples(Some(0)), 1);
        assert_eq!(metrics.clamp_samples(Some(5000)), 100);
    }
}
