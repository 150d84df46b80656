use std::{fmt, path::PathBuf};

use anyhow::Result;
use serde::Serialize;
use tokio::task;
use tracing::error;

use crate::config::{HarnessSettings, JobKind, MetricsSettings};
use crate::process::JobStatus;
use crate::window::{self, GroupedWindow, MetricsWindow};

/// CSV files the collector writes, one per metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFamily {
    Cpu,
    Memory,
    Disk,
    Gpu,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 4] = [
        MetricFamily::Cpu,
        MetricFamily::Memory,
        MetricFamily::Disk,
        MetricFamily::Gpu,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            MetricFamily::Cpu => "cpu",
            MetricFamily::Memory => "memory",
            MetricFamily::Disk => "disk",
            MetricFamily::Gpu => "gpu",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| family.slug().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.slug())
    }
}

/// Extracted view of one family. GPU files are grouped by device index.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FamilyWindow {
    Single(Option<MetricsWindow>),
    Grouped(Vec<GroupedWindow>),
}

impl FamilyWindow {
    fn empty(family: MetricFamily) -> Self {
        match family {
            MetricFamily::Gpu => FamilyWindow::Grouped(Vec::new()),
            _ => FamilyWindow::Single(None),
        }
    }

    pub fn is_missing(&self) -> bool {
        match self {
            FamilyWindow::Single(window) => window.is_none(),
            FamilyWindow::Grouped(groups) => groups.is_empty(),
        }
    }

    fn into_single(self) -> Option<MetricsWindow> {
        match self {
            FamilyWindow::Single(window) => window,
            FamilyWindow::Grouped(_) => None,
        }
    }

    fn into_grouped(self) -> Vec<GroupedWindow> {
        match self {
            FamilyWindow::Grouped(groups) => groups,
            FamilyWindow::Single(_) => Vec::new(),
        }
    }
}

/// Resolves family files under the metrics directory and reads them.
#[derive(Debug, Clone)]
pub struct MetricsSource {
    dir: PathBuf,
    settings: MetricsSettings,
}

impl MetricsSource {
    pub fn new(dir: PathBuf, settings: MetricsSettings) -> Self {
        Self { dir, settings }
    }

    pub fn from_settings(settings: &HarnessSettings) -> Result<Self> {
        Ok(Self::new(
            settings.resolve_metrics_dir()?,
            settings.metrics.clone(),
        ))
    }

    pub fn settings(&self) -> &MetricsSettings {
        &self.settings
    }

    pub fn path(&self, family: MetricFamily) -> PathBuf {
        let file = match family {
            MetricFamily::Cpu => &self.settings.cpu_file,
            MetricFamily::Memory => &self.settings.memory_file,
            MetricFamily::Disk => &self.settings.disk_file,
            MetricFamily::Gpu => &self.settings.gpu_file,
        };
        self.dir.join(file)
    }

    /// Blocking read of one family.
    pub fn read(&self, family: MetricFamily, samples: usize) -> FamilyWindow {
        let path = self.path(family);
        match family {
            MetricFamily::Gpu => FamilyWindow::Grouped(window::extract_grouped(
                &path,
                &self.settings.gpu_index_column,
                samples,
            )),
            _ => FamilyWindow::Single(window::extract_window(&path, samples)),
        }
    }

    /// Read one family on the blocking pool. A panicked read is reported
    /// as missing data so sibling families are unaffected.
    pub async fn read_async(&self, family: MetricFamily, samples: usize) -> FamilyWindow {
        let source = self.clone();
        match task::spawn_blocking(move || source.read(family, samples)).await {
            Ok(window) => window,
            Err(err) => {
                error!(family = %family, error = %err, "metrics read task failed");
                FamilyWindow::empty(family)
            }
        }
    }

    pub async fn read_all(&self, samples: usize) -> FamilyWindows {
        let (cpu, memory, disk, gpu) = tokio::join!(
            self.read_async(MetricFamily::Cpu, samples),
            self.read_async(MetricFamily::Memory, samples),
            self.read_async(MetricFamily::Disk, samples),
            self.read_async(MetricFamily::Gpu, samples),
        );
        FamilyWindows {
            cpu: cpu.into_single(),
            memory: memory.into_single(),
            disk: disk.into_single(),
            gpu: gpu.into_grouped(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FamilyWindows {
    pub cpu: Option<MetricsWindow>,
    pub memory: Option<MetricsWindow>,
    pub disk: Option<MetricsWindow>,
    pub gpu: Vec<GroupedWindow>,
}

impl FamilyWindows {
    pub fn missing_families(&self) -> Vec<MetricFamily> {
        let mut missing = Vec::new();
        if self.cpu.is_none() {
            missing.push(MetricFamily::Cpu);
        }
        if self.memory.is_none() {
            missing.push(MetricFamily::Memory);
        }
        if self.disk.is_none() {
            missing.push(MetricFamily::Disk);
        }
        if self.gpu.is_empty() {
            missing.push(MetricFamily::Gpu);
        }
        missing
    }
}

/// Payload of `/api/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cpu: Option<MetricsWindow>,
    pub memory: Option<MetricsWindow>,
    pub disk: Option<MetricsWindow>,
    pub gpu: Vec<GroupedWindow>,
    pub video_test_active: bool,
    pub network_test_active: bool,
    pub collector_active: bool,
    pub storage_test_active: bool,
}

impl MetricsSnapshot {
    pub fn new(windows: FamilyWindows, jobs: &[JobStatus]) -> Self {
        let active = |kind: JobKind| jobs.iter().any(|job| job.kind == kind && job.running);
        Self {
            cpu: windows.cpu,
            memory: windows.memory,
            disk: windows.disk,
            gpu: windows.gpu,
            video_test_active: active(JobKind::VideoTest),
            network_test_active: active(JobKind::NetworkTest),
            collector_active: active(JobKind::Collector),
            storage_test_active: active(JobKind::StorageTest),
        }
    }
}
