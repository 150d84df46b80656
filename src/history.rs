use std::{
    collections::VecDeque,
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::JobKind;
use crate::jobs::CommandSpec;

/// Append-only JSON-L record of job launches and exits.
#[derive(Debug, Clone)]
pub struct JobHistory {
    log_path: PathBuf,
}

impl JobHistory {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    pub fn append_event(&self, event: &JobEvent) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Unable to create history directory {}", parent.display())
            })?;
        }

        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open job history {}", self.log_path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Read the most recent `limit` events, oldest first. Lines that do not
    /// parse are skipped so a torn write never hides the rest of the log.
    pub fn read_events(&self, limit: usize) -> Result<Vec<JobEvent>> {
        if limit == 0 || !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.log_path)
            .with_context(|| format!("Failed to open job history {}", self.log_path.display()))?;
        let reader = BufReader::new(file);

        let mut buffer: VecDeque<JobEvent> = VecDeque::with_capacity(limit.min(1024));
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: JobEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        path = %self.log_path.display(),
                        line = idx + 1,
                        error = %err,
                        "skipping malformed history entry"
                    );
                    continue;
                }
            };
            if buffer.len() == limit {
                buffer.pop_front();
            }
            buffer.push_back(event);
        }

        Ok(buffer.into_iter().collect())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobEvent {
    pub timestamp: DateTime<Utc>,
    pub phase: JobPhase,
    pub session_id: Uuid,
    pub kind: JobKind,
    pub binary: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub exit_status: Option<i32>,
    pub success: Option<bool>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl JobEvent {
    pub fn launch(session_id: Uuid, kind: JobKind, spec: &CommandSpec, pid: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            phase: JobPhase::Launch,
            session_id,
            kind,
            binary: spec.binary().to_string_lossy().into(),
            args: spec.args().to_vec(),
            pid: Some(pid),
            exit_status: None,
            success: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Terminal event for a session; `phase` is `Exit` when the process ended
    /// on its own and `Stop` when it was killed on request.
    pub fn finished(
        phase: JobPhase,
        session_id: Uuid,
        kind: JobKind,
        spec: &CommandSpec,
        pid: u32,
        outcome: JobOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            session_id,
            kind,
            binary: spec.binary().to_string_lossy().into(),
            args: spec.args().to_vec(),
            pid: Some(pid),
            exit_status: outcome.exit_status,
            success: outcome.success,
            duration_ms: Some(outcome.duration_ms),
            error: outcome.error,
        }
    }
}

/// How a job session ended.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub exit_status: Option<i32>,
    pub success: Option<bool>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Launch,
    Exit,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec() -> CommandSpec {
        CommandSpec::new(
            PathBuf::from("/usr/bin/iperf3"),
            vec!["-c".into(), "10.0.0.5".into()],
            vec![],
        )
    }

    #[test]
    fn launch_event_sets_pid() {
        let event = JobEvent::launch(Uuid::nil(), JobKind::NetworkTest, &spec(), 1234);
        assert_eq!(event.phase, JobPhase::Launch);
        assert_eq!(event.pid, Some(1234));
        assert_eq!(event.args, vec!["-c", "10.0.0.5"]);
        assert!(event.exit_status.is_none());
    }

    #[test]
    fn stop_event_carries_outcome() {
        let event = JobEvent::finished(
            JobPhase::Stop,
            Uuid::nil(),
            JobKind::Collector,
            &spec(),
            55,
            JobOutcome {
                exit_status: None,
                success: Some(false),
                duration_ms: 1000,
                error: None,
            },
        );
        assert_eq!(event.phase, JobPhase::Stop);
        assert_eq!(event.duration_ms, Some(1000));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["phase"], "stop");
        assert_eq!(json["kind"], "collector");
    }

    #[test]
    fn read_events_returns_recent_entries() {
        let temp = tempdir().unwrap();
        let log_path = temp.path().join("history").join("jobs.jsonl");
        let history = JobHistory::new(log_path.clone());

        for idx in 0..5u32 {
            let event = JobEvent::launch(Uuid::nil(), JobKind::VideoTest, &spec(), 1000 + idx);
            history.append_event(&event).unwrap();
        }

        let events = history.read_events(3).unwrap();
        let pids: Vec<_> = events.iter().map(|event| event.pid).collect();
        assert_eq!(pids, vec![Some(1002), Some(1003), Some(1004)]);

        assert_eq!(history.read_events(10).unwrap().len(), 5);
        assert!(history.read_events(0).unwrap().is_empty());

        fs::remove_file(log_path).unwrap();
        assert!(history.read_events(5).unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let temp = tempdir().unwrap();
        let log_path = temp.path().join("jobs.jsonl");
        let history = JobHistory::new(log_path.clone());

        history
            .append_event(&JobEvent::launch(Uuid::nil(), JobKind::Collector, &spec(), 1))
            .unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
            writeln!(file, "{{\"timestamp\": truncated").unwrap();
        }
        history
            .append_event(&JobEvent::launch(Uuid::nil(), JobKind::Collector, &spec(), 2))
            .unwrap();

        let events = history.read_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].pid, Some(2));
    }
}
