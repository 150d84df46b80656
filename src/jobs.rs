use std::{collections::HashMap, env, fs, path::PathBuf, process::Command};

use anyhow::{Context, Result, bail};

use crate::config::{FioSettings, HarnessSettings, IperfSettings, JobKind, JobSpecificConfig};

/// Materialised command specification ready to be spawned or logged.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    binary: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(binary: PathBuf, args: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self { binary, args, env }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        // own process group so stop reaches everything the job forks
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }

    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            return self.binary.display().to_string();
        }
        format!("{} {}", self.binary.display(), self.args.join(" "))
    }
}

/// Turns persisted settings into a spawnable command for one job kind.
pub trait JobDriver: Send + Sync {
    fn kind(&self) -> JobKind;
    fn label(&self) -> &'static str;
    fn locate_binary(&self) -> Result<PathBuf>;
    fn build_command(&self) -> Result<CommandSpec>;

    /// Filesystem setup that must exist before the command is spawned.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }
}

fn resolve_binary(
    config: &JobSpecificConfig,
    env_var: &str,
    candidates: &[&str],
    config_key: &str,
) -> Result<PathBuf> {
    if let Some(path) = &config.binary_path {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var(env_var) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    for candidate in candidates {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }
    bail!(
        "none of [{}] found on PATH; set {env_var} or configure jobs.{config_key}.binary_path",
        candidates.join(", ")
    )
}

fn config_env(config: &JobSpecificConfig) -> impl Iterator<Item = (String, String)> + '_ {
    config
        .env
        .iter()
        .map(|pair| (pair.key.clone(), pair.value.clone()))
}

struct VideoJob {
    config: JobSpecificConfig,
    script: PathBuf,
    output_dir: PathBuf,
}

impl JobDriver for VideoJob {
    fn kind(&self) -> JobKind {
        JobKind::VideoTest
    }

    fn label(&self) -> &'static str {
        "Video generation benchmark"
    }

    fn locate_binary(&self) -> Result<PathBuf> {
        resolve_binary(
            &self.config,
            "HARNESS_VIDEO_BINARY",
            &["python3", "python"],
            "video",
        )
    }

    fn build_command(&self) -> Result<CommandSpec> {
        let binary = self.locate_binary()?;
        let args = vec![self.script.to_string_lossy().into_owned()];

        let mut env_pairs = vec![(
            "HARNESS_OUTPUT_DIR".to_string(),
            self.output_dir.to_string_lossy().into_owned(),
        )];
        env_pairs.extend(config_env(&self.config));

        let args = merge_args(args, self.config.extra_args.clone());
        Ok(CommandSpec::new(binary, args, merge_env(env_pairs)))
    }
}

struct NetworkJob {
    config: JobSpecificConfig,
    iperf: IperfSettings,
}

impl JobDriver for NetworkJob {
    fn kind(&self) -> JobKind {
        JobKind::NetworkTest
    }

    fn label(&self) -> &'static str {
        "iperf3 throughput test"
    }

    fn locate_binary(&self) -> Result<PathBuf> {
        resolve_binary(&self.config, "HARNESS_IPERF_BINARY", &["iperf3"], "network")
    }

    fn build_command(&self) -> Result<CommandSpec> {
        if self.iperf.server.trim().is_empty() {
            bail!("jobs.iperf.server must not be empty");
        }
        let binary = self.locate_binary()?;
        let args = vec![
            "-c".to_string(),
            self.iperf.server.trim().to_string(),
            "-p".to_string(),
            self.iperf.port.to_string(),
            "-t".to_string(),
            self.iperf.duration_secs.to_string(),
            "-i".to_string(),
            "1".to_string(),
            "--forceflush".to_string(),
        ];
        let args = merge_args(args, self.config.extra_args.clone());
        let env = merge_env(config_env(&self.config).collect());
        Ok(CommandSpec::new(binary, args, env))
    }
}

struct CollectorJob {
    config: JobSpecificConfig,
    script: PathBuf,
    metrics_dir: PathBuf,
}

impl JobDriver for CollectorJob {
    fn kind(&self) -> JobKind {
        JobKind::Collector
    }

    fn label(&self) -> &'static str {
        "System metrics collector"
    }

    fn locate_binary(&self) -> Result<PathBuf> {
        resolve_binary(
            &self.config,
            "HARNESS_COLLECTOR_BINARY",
            &["bash", "sh"],
            "collector",
        )
    }

    fn build_command(&self) -> Result<CommandSpec> {
        let binary = self.locate_binary()?;
        let metrics_dir = self.metrics_dir.to_string_lossy().into_owned();
        let args = vec![self.script.to_string_lossy().into_owned(), metrics_dir.clone()];

        let mut env_pairs = vec![("HARNESS_METRICS_DIR".to_string(), metrics_dir)];
        env_pairs.extend(config_env(&self.config));

        let args = merge_args(args, self.config.extra_args.clone());
        Ok(CommandSpec::new(binary, args, merge_env(env_pairs)))
    }
}

struct StorageJob {
    config: JobSpecificConfig,
    fio: FioSettings,
    directory: PathBuf,
}

impl JobDriver for StorageJob {
    fn kind(&self) -> JobKind {
        JobKind::StorageTest
    }

    fn label(&self) -> &'static str {
        "fio storage throughput test"
    }

    fn locate_binary(&self) -> Result<PathBuf> {
        resolve_binary(&self.config, "HARNESS_FIO_BINARY", &["fio"], "storage")
    }

    fn build_command(&self) -> Result<CommandSpec> {
        if self.fio.size.trim().is_empty() || self.fio.block_size.trim().is_empty() {
            bail!("jobs.fio.size and jobs.fio.block_size must not be empty");
        }
        let binary = self.locate_binary()?;
        let globals = vec![
            "--output-format=json".to_string(),
            format!("--directory={}", self.directory.display()),
            format!("--size={}", self.fio.size.trim()),
            format!("--bs={}", self.fio.block_size.trim()),
            format!("--ioengine={}", self.fio.ioengine.trim()),
            format!("--direct={}", u8::from(self.fio.direct)),
        ];
        // extras are global options, so they go before the first --name
        let mut args = merge_args(globals, self.config.extra_args.clone());
        args.extend(
            ["--name=write_test", "--rw=write", "--name=read_test", "--rw=read", "--stonewall"]
                .map(String::from),
        );
        let env = merge_env(config_env(&self.config).collect());
        Ok(CommandSpec::new(binary, args, env))
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.directory).with_context(|| {
            format!(
                "Unable to create storage test directory {}",
                self.directory.display()
            )
        })
    }
}

/// Append extra arguments, skipping `--flags` already present in the base.
fn merge_args(base: Vec<String>, extras: Vec<String>) -> Vec<String> {
    let mut merged = base;
    for arg in extras {
        if arg.starts_with("--") && merged.contains(&arg) {
            continue;
        }
        merged.push(arg);
    }
    merged
}

/// Deduplicate by key; the last occurrence wins but keeps its position.
fn merge_env(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for (key, value) in pairs.into_iter().rev() {
        if seen.insert(key.clone()) {
            merged.push((key, value));
        }
    }
    merged.reverse();
    merged
}

/// Registry of available job drivers.
pub struct JobRegistry {
    drivers: HashMap<JobKind, Box<dyn JobDriver>>,
}

impl JobRegistry {
    pub fn new(settings: &HarnessSettings) -> Result<Self> {
        let mut drivers: HashMap<JobKind, Box<dyn JobDriver>> = HashMap::new();
        drivers.insert(
            JobKind::VideoTest,
            Box::new(VideoJob {
                config: settings.job_config(JobKind::VideoTest).clone(),
                script: settings.jobs.video_script.clone(),
                output_dir: settings.resolve_videos_dir()?,
            }),
        );
        drivers.insert(
            JobKind::NetworkTest,
            Box::new(NetworkJob {
                config: settings.job_config(JobKind::NetworkTest).clone(),
                iperf: settings.jobs.iperf.clone(),
            }),
        );
        drivers.insert(
            JobKind::Collector,
            Box::new(CollectorJob {
                config: settings.job_config(JobKind::Collector).clone(),
                script: settings.jobs.collector_script.clone(),
                metrics_dir: settings.resolve_metrics_dir()?,
            }),
        );
        drivers.insert(
            JobKind::StorageTest,
            Box::new(StorageJob {
                config: settings.job_config(JobKind::StorageTest).clone(),
                fio: settings.jobs.fio.clone(),
                directory: settings.resolve_storage_dir()?,
            }),
        );
        Ok(Self { drivers })
    }

    pub fn get(&self, kind: JobKind) -> Option<&dyn JobDriver> {
        self.drivers.get(&kind).map(|driver| driver.as_ref())
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.drivers.contains_key(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvVar;

    fn pinned(binary: &str) -> JobSpecificConfig {
        JobSpecificConfig {
            binary_path: Some(PathBuf::from(binary)),
            extra_args: vec![],
            env: vec![],
        }
    }

    #[test]
    fn network_command_targets_configured_server() {
        let job = NetworkJob {
            config: JobSpecificConfig {
                extra_args: vec!["--forceflush".into(), "-R".into()],
                ..pinned("/usr/bin/iperf3")
            },
            iperf: IperfSettings {
                server: "10.0.0.5".into(),
                port: 5202,
                duration_secs: 1,
            },
        };

        let command = job.build_command().expect("command");
        assert_eq!(command.binary(), &PathBuf::from("/usr/bin/iperf3"));
        assert_eq!(
            command.args(),
            &[
                "-c",
                "10.0.0.5",
                "-p",
                "5202",
                "-t",
                "1",
                "-i",
                "1",
                "--forceflush",
                "-R"
            ]
        );
        assert!(command.describe().starts_with("/usr/bin/iperf3 -c 10.0.0.5"));
    }

    #[test]
    fn network_command_rejects_blank_server() {
        let job = NetworkJob {
            config: pinned("/usr/bin/iperf3"),
            iperf: IperfSettings {
                server: "  ".into(),
                ..IperfSettings::default()
            },
        };
        assert!(job.build_command().is_err());
    }

    #[test]
    fn video_command_exports_output_dir_and_config_env() {
        let job = VideoJob {
            config: JobSpecificConfig {
                env: vec![
                    EnvVar {
                        key: "CUDA_VISIBLE_DEVICES".into(),
                        value: "0,1".into(),
                    },
                    EnvVar {
                        key: "HARNESS_OUTPUT_DIR".into(),
                        value: "/override".into(),
                    },
                ],
                extra_args: vec!["--size".into(), "832*480".into()],
                ..pinned("/opt/venv/bin/python")
            },
            script: PathBuf::from("/srv/video_generation_test.py"),
            output_dir: PathBuf::from("/srv/videos"),
        };

        let command = job.build_command().expect("command");
        assert_eq!(
            command.args(),
            &["/srv/video_generation_test.py", "--size", "832*480"]
        );
        assert_eq!(
            command.env(),
            &[
                ("CUDA_VISIBLE_DEVICES".to_string(), "0,1".to_string()),
                ("HARNESS_OUTPUT_DIR".to_string(), "/override".to_string()),
            ]
        );
    }

    #[test]
    fn collector_command_passes_metrics_dir() {
        let job = CollectorJob {
            config: pinned("/bin/bash"),
            script: PathBuf::from("collect.sh"),
            metrics_dir: PathBuf::from("/tmp/metrics"),
        };

        let command = job.build_command().expect("command");
        assert_eq!(command.args(), &["collect.sh", "/tmp/metrics"]);
        assert_eq!(
            command.env(),
            &[("HARNESS_METRICS_DIR".to_string(), "/tmp/metrics".to_string())]
        );
    }

    #[test]
    fn storage_command_runs_write_then_read_pass() {
        let temp = tempfile::tempdir().unwrap();
        let directory = temp.path().join("scratch");
        let job = StorageJob {
            config: JobSpecificConfig {
                extra_args: vec!["--runtime=30".into(), "--output-format=json".into()],
                ..pinned("/usr/bin/fio")
            },
            fio: FioSettings {
                size: "64M".into(),
                ..FioSettings::default()
            },
            directory: directory.clone(),
        };

        let command = job.build_command().expect("command");
        let directory_arg = format!("--directory={}", directory.display());
        assert_eq!(
            command.args(),
            &[
                "--output-format=json",
                directory_arg.as_str(),
                "--size=64M",
                "--bs=4M",
                "--ioengine=libaio",
                "--direct=1",
                "--runtime=30",
                "--name=write_test",
                "--rw=write",
                "--name=read_test",
                "--rw=read",
                "--stonewall",
            ]
        );

        assert!(!directory.exists());
        job.prepare().expect("prepare");
        assert!(directory.is_dir());
    }

    #[test]
    fn storage_command_rejects_blank_size() {
        let job = StorageJob {
            config: pinned("/usr/bin/fio"),
            fio: FioSettings {
                size: " ".into(),
                ..FioSettings::default()
            },
            directory: PathBuf::from("/tmp/storage"),
        };
        assert!(job.build_command().is_err());
    }

    #[test]
    fn unresolvable_binary_reports_hint() {
        let err = resolve_binary(
            &JobSpecificConfig::default(),
            "HARNESS_TEST_BINARY_THAT_IS_NEVER_SET",
            &["infra-harness-missing-binary"],
            "video",
        )
        .unwrap_err();
        assert!(err.to_string().contains("jobs.video.binary_path"));
    }

    #[test]
    fn merge_env_keeps_last_value() {
        let merged = merge_env(vec![
            ("A".into(), "1".into()),
            ("B".into(), "2".into()),
            ("A".into(), "3".into()),
        ]);
        assert_eq!(
            merged,
            vec![("B".to_string(), "2".to_string()), ("A".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn registry_covers_every_kind() {
        let mut settings = HarnessSettings {
            metrics: crate::config::MetricsSettings {
                data_dir: Some(PathBuf::from("/tmp/metrics")),
                ..Default::default()
            },
            panel: crate::config::PanelSettings {
                videos_dir: Some(PathBuf::from("/tmp/videos")),
                ..Default::default()
            },
            ..HarnessSettings::default()
        };
        settings.jobs.fio.directory = Some(PathBuf::from("/tmp/storage"));
        let registry = JobRegistry::new(&settings).expect("registry");
        let kinds: Vec<JobKind> = registry.kinds().collect();
        assert_eq!(kinds, JobKind::ALL.to_vec());
        assert_eq!(
            registry.get(JobKind::NetworkTest).map(|driver| driver.kind()),
            Some(JobKind::NetworkTest)
        );
        assert_eq!(
            registry.get(JobKind::StorageTest).map(|driver| driver.label()),
            Some("fio storage throughput test")
        );
    }
}
