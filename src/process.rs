use std::{
    collections::{HashMap, VecDeque},
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::PathBuf,
    process::{Child, ExitStatus, Stdio},
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{HarnessSettings, JobKind};
use crate::history::{JobEvent, JobHistory, JobOutcome, JobPhase};
use crate::jobs::{CommandSpec, JobRegistry};

/// How long a stopped job gets to exit on SIGTERM before its group is killed.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Owns the child process for each job kind. At most one live child per kind.
pub struct ProcessManager {
    registry: JobRegistry,
    log_dir: PathBuf,
    history: JobHistory,
    slots: Mutex<HashMap<JobKind, JobSlot>>,
}

#[derive(Default)]
struct JobSlot {
    running: Option<RunningJob>,
    last_exit: Option<ExitSummary>,
    last_log: Option<PathBuf>,
}

struct RunningJob {
    session_id: Uuid,
    child: Child,
    pid: u32,
    command: CommandSpec,
    started_at: DateTime<Utc>,
    log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitSummary {
    pub session_id: Uuid,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stopped: bool,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub kind: JobKind,
    pub label: &'static str,
    pub running: bool,
    pub pid: Option<u32>,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub command: Option<String>,
    pub log_path: Option<PathBuf>,
    pub last_exit: Option<ExitSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAction {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStartOutcome {
    pub action: StartAction,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStopOutcome {
    pub action: StopAction,
    pub status: JobStatus,
}

impl ProcessManager {
    pub fn new(settings: &HarnessSettings) -> Result<Self> {
        Ok(Self::with_parts(
            JobRegistry::new(settings)?,
            settings.resolve_log_dir()?,
            JobHistory::new(settings.resolve_history_log()?),
        ))
    }

    pub fn with_parts(registry: JobRegistry, log_dir: PathBuf, history: JobHistory) -> Self {
        Self {
            registry,
            log_dir,
            history,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<JobKind, JobSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, kind: JobKind) -> Result<JobStartOutcome> {
        let mut slots = self.lock_slots();
        let slot = slots.entry(kind).or_default();
        self.reap(kind, slot);

        if slot.running.is_some() {
            info!(kind = %kind, "job already running; start rejected");
            return Ok(JobStartOutcome {
                action: StartAction::AlreadyRunning,
                status: self.snapshot(kind, slot),
            });
        }

        let driver = self
            .registry
            .get(kind)
            .with_context(|| format!("No driver registered for {kind}"))?;
        let command = driver.build_command()?;
        driver.prepare()?;

        fs::create_dir_all(&self.log_dir).with_context(|| {
            format!("Unable to create log directory {}", self.log_dir.display())
        })?;
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let session_tag = session_id.simple().to_string();
        let log_path = self.log_dir.join(format!(
            "{}-{}-{}.log",
            kind.slug(),
            started_at.format("%Y%m%dT%H%M%SZ"),
            &session_tag[..8]
        ));
        let stdout = File::create(&log_path)
            .with_context(|| format!("Failed to create job log {}", log_path.display()))?;
        let stderr = stdout.try_clone()?;

        let mut process = command.to_command();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        let child = process
            .spawn()
            .with_context(|| format!("Failed to spawn {}", command.describe()))?;
        let pid = child.id();

        if let Err(err) = self
            .history
            .append_event(&JobEvent::launch(session_id, kind, &command, pid))
        {
            warn!(kind = %kind, pid, error = %err, "failed to record launch event");
        }
        info!(
            kind = %kind,
            pid,
            session = %session_id,
            command = %command.describe(),
            log = %log_path.display(),
            "job started"
        );

        slot.last_log = Some(log_path.clone());
        slot.running = Some(RunningJob {
            session_id,
            child,
            pid,
            command,
            started_at,
            log_path,
        });

        Ok(JobStartOutcome {
            action: StartAction::Started,
            status: self.snapshot(kind, slot),
        })
    }

    pub fn status(&self, kind: JobKind) -> JobStatus {
        let mut slots = self.lock_slots();
        let slot = slots.entry(kind).or_default();
        self.reap(kind, slot);
        self.snapshot(kind, slot)
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        let mut slots = self.lock_slots();
        self.registry
            .kinds()
            .map(|kind| {
                let slot = slots.entry(kind).or_default();
                self.reap(kind, slot);
                self.snapshot(kind, slot)
            })
            .collect()
    }

    pub fn is_running(&self, kind: JobKind) -> bool {
        self.status(kind).running
    }

    pub fn stop(&self, kind: JobKind) -> Result<JobStopOutcome> {
        let mut slots = self.lock_slots();
        let slot = slots.entry(kind).or_default();
        self.reap(kind, slot);

        let Some(mut job) = slot.running.take() else {
            return Ok(JobStopOutcome {
                action: StopAction::NotRunning,
                status: self.snapshot(kind, slot),
            });
        };

        if let Err(err) = terminate(&mut job) {
            let message = format!("Failed to kill {kind} (pid {})", job.pid);
            slot.running = Some(job);
            return Err(anyhow::Error::new(err).context(message));
        }
        let status = job
            .child
            .wait()
            .map_err(|err| format!("wait failed: {err}"));
        let summary = self.finish(kind, &job, JobPhase::Stop, status);
        info!(kind = %kind, pid = job.pid, session = %job.session_id, "job stopped");
        slot.last_exit = Some(summary);

        Ok(JobStopOutcome {
            action: StopAction::Stopped,
            status: self.snapshot(kind, slot),
        })
    }

    pub fn stop_all(&self) -> Vec<JobStopOutcome> {
        let mut outcomes = Vec::new();
        for kind in JobKind::ALL {
            match self.stop(kind) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(kind = %kind, error = %err, "failed to stop job"),
            }
        }
        outcomes
    }

    /// Last `lines` lines of the current or most recent log for `kind`.
    pub fn log_tail(&self, kind: JobKind, lines: usize) -> Result<Option<Vec<String>>> {
        let path = {
            let slots = self.lock_slots();
            slots.get(&kind).and_then(|slot| slot.last_log.clone())
        };
        let Some(path) = path else {
            return Ok(None);
        };
        if lines == 0 {
            return Ok(Some(Vec::new()));
        }

        let file = File::open(&path)
            .with_context(|| format!("Failed to open job log {}", path.display()))?;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(lines.min(1024));
        for line in BufReader::new(file).lines() {
            let line = line?;
            if tail.len() == lines {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Ok(Some(tail.into_iter().collect()))
    }

    fn reap(&self, kind: JobKind, slot: &mut JobSlot) {
        let Some(job) = slot.running.as_mut() else {
            return;
        };
        match job.child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                if let Some(job) = slot.running.take() {
                    let summary = self.finish(kind, &job, JobPhase::Exit, Ok(status));
                    info!(
                        kind = %kind,
                        pid = job.pid,
                        exit_code = summary.exit_code,
                        success = summary.success,
                        duration_ms = summary.duration_ms,
                        "job exited"
                    );
                    slot.last_exit = Some(summary);
                }
            }
            Err(err) => {
                warn!(kind = %kind, pid = job.pid, error = %err, "failed to poll job");
            }
        }
    }

    fn finish(
        &self,
        kind: JobKind,
        job: &RunningJob,
        phase: JobPhase,
        status: std::result::Result<ExitStatus, String>,
    ) -> ExitSummary {
        let finished_at = Utc::now();
        let duration_ms = finished_at
            .signed_duration_since(job.started_at)
            .num_milliseconds()
            .max(0) as u64;
        let (exit_code, success, error) = match &status {
            Ok(status) => (status.code(), status.success(), None),
            Err(err) => (None, false, Some(err.clone())),
        };

        let event = JobEvent::finished(
            phase,
            job.session_id,
            kind,
            &job.command,
            job.pid,
            JobOutcome {
                exit_status: exit_code,
                success: Some(success),
                duration_ms,
                error,
            },
        );
        if let Err(err) = self.history.append_event(&event) {
            warn!(kind = %kind, pid = job.pid, error = %err, "failed to record exit event");
        }

        ExitSummary {
            session_id: job.session_id,
            exit_code,
            success,
            stopped: phase == JobPhase::Stop,
            finished_at,
            duration_ms,
        }
    }

    fn snapshot(&self, kind: JobKind, slot: &JobSlot) -> JobStatus {
        let label = self
            .registry
            .get(kind)
            .map(|driver| driver.label())
            .unwrap_or("unregistered");
        let running = slot.running.as_ref();
        JobStatus {
            kind,
            label,
            running: running.is_some(),
            pid: running.map(|job| job.pid),
            session_id: running.map(|job| job.session_id),
            started_at: running.map(|job| job.started_at),
            command: running.map(|job| job.command.describe()),
            log_path: running
                .map(|job| job.log_path.clone())
                .or_else(|| slot.last_log.clone()),
            last_exit: slot.last_exit.clone(),
        }
    }
}

/// SIGTERM the job's process group, wait up to `STOP_GRACE` for the leader,
/// then SIGKILL whatever is still in the group.
#[cfg(unix)]
fn terminate(job: &mut RunningJob) -> io::Result<()> {
    let pgid = job.pid as libc::pid_t;
    signal_group(pgid, libc::SIGTERM)?;

    let deadline = Instant::now() + STOP_GRACE;
    while Instant::now() < deadline {
        match job.child.try_wait() {
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Ok(Some(_)) | Err(_) => break,
        }
    }
    signal_group(pgid, libc::SIGKILL)
}

#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::killpg(pgid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // ESRCH: every member of the group is already gone
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn terminate(job: &mut RunningJob) -> io::Result<()> {
    // kill fails with InvalidInput once the child has already exited
    match job.child.kill() {
        Err(err) if err.kind() != io::ErrorKind::InvalidInput => Err(err),
        _ => Ok(()),
    }
}
