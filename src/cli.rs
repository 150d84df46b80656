use std::path::{Path, PathBuf};

use crate::{
    DiagnosticsReport, Harness,
    config::{ConfigWriteAction, ConfigWriteOutcome, HarnessSettings, default_config_path},
    history::JobPhase,
    window,
};
use anyhow::{Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_WINDOW_SAMPLES: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "harness", version, about = "Inspect infrastructure harness metrics, jobs and settings", long_about = None)]
pub struct Cli {
    /// Custom config path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the most recent samples of a CSV metrics file as JSON.
    Window {
        path: PathBuf,

        /// Number of rows to keep (per group with --group-by).
        #[arg(long, default_value_t = DEFAULT_WINDOW_SAMPLES)]
        samples: usize,

        /// Split rows into per-device windows using this integer column.
        #[arg(long, value_name = "COLUMN")]
        group_by: Option<String>,
    },

    /// Show recent job launch and exit events.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Report resolved paths, job binaries and trace state.
    Diagnostics {
        /// Emit the report as JSON.
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },

    /// Write the fully populated settings file.
    WriteConfig {
        /// Overwrite an existing file.
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "infra_harness=debug"
    } else {
        "infra_harness=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Render a window (or grouped windows) of `path` as pretty JSON.
pub fn render_window(path: &Path, samples: usize, group_by: Option<&str>) -> Result<String> {
    let rendered = match group_by {
        Some(column) => {
            serde_json::to_string_pretty(&window::extract_grouped(path, column, samples))?
        }
        None => serde_json::to_string_pretty(&window::extract_window(path, samples))?,
    };
    Ok(rendered)
}

fn print_history(harness: &Harness, limit: usize) -> Result<()> {
    let log_path = harness.history().log_path().clone();
    let events = harness.recent_events(limit)?;

    if events.is_empty() {
        println!("No job events recorded yet. Log file: {}", log_path.display());
        return Ok(());
    }

    println!(
        "Recent {} event(s) (showing up to {} requested) from {}",
        events.len(),
        limit,
        log_path.display()
    );
    for event in events.iter().rev() {
        let phase = match event.phase {
            JobPhase::Launch => "launch",
            JobPhase::Exit => "exit",
            JobPhase::Stop => "stop",
        };
        let pid = event
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into());
        let exit = event
            .exit_status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".into());
        let status = match event.success {
            Some(true) => "ok",
            Some(false) => "fail",
            None => "-",
        };
        let duration = event
            .duration_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_else(|| "-".into());

        println!(
            "  {} [{phase}] {} pid={pid} exit={exit} status={status} dur={duration}",
            event.timestamp.to_rfc3339(),
            event.kind,
        );
        if !event.args.is_empty() {
            println!("      cmd: {} {}", event.binary, event.args.join(" "));
        } else {
            println!("      cmd: {}", event.binary);
        }
        if let Some(error) = &event.error {
            println!("      error: {error}");
        }
    }
    Ok(())
}

fn print_diagnostics(report: &DiagnosticsReport) {
    println!("Harness diagnostics");
    match &report.config_path {
        Some(path) => println!("  Config      : {}", path.display()),
        None => println!("  Config      : (defaults)"),
    }
    println!("  Listen      : {}", report.listen_addr);
    println!("  Metrics dir : {}", report.metrics_dir.display());
    println!("  Videos dir  : {}", report.videos_dir.display());
    println!("  Job logs    : {}", report.log_dir.display());
    println!("  History     : {}", report.history_log.display());

    println!("  Metric files:");
    for file in &report.metric_files {
        match file.size_bytes {
            Some(bytes) => println!(
                "    - {:<7} {} ({})",
                file.family,
                file.path.display(),
                format_bytes(bytes)
            ),
            None => println!("    - {:<7} (missing) {}", file.family, file.path.display()),
        }
    }

    println!("  Jobs        :");
    for job in &report.jobs {
        match (&job.command, &job.error) {
            (Some(command), _) => {
                println!("    - {:<13} {:<28} => {command}", job.kind, job.label)
            }
            (None, Some(err)) => {
                println!("    - {:<13} {:<28} => (unavailable) {err}", job.kind, job.label)
            }
            (None, None) => println!("    - {:<13} {}", job.kind, job.label),
        }
    }

    let telemetry = &report.telemetry;
    println!(
        "  Telemetry   : {}",
        if telemetry.enabled { "enabled" } else { "disabled" }
    );
    if let Some(url) = &telemetry.collector_url {
        println!("    collector : {url}");
    }
    let trace = &telemetry.trace;
    match (&trace.directory, trace.enabled) {
        (Some(dir), true) => println!("  Traces      : enabled ({})", dir.display()),
        (Some(dir), false) => println!("  Traces      : disabled ({})", dir.display()),
        (None, _) => println!("  Traces      : disabled"),
    }
    for path in &trace.recent_files {
        println!("    - {}", path.display());
    }
}

fn report_config_action(outcome: &ConfigWriteOutcome, forced: bool) {
    let action = match outcome.action {
        ConfigWriteAction::Created => "created",
        ConfigWriteAction::Updated => "updated",
        ConfigWriteAction::Skipped => "skipped",
    };
    println!("Harness config {action} at {}", outcome.path.display());
    if outcome.action == ConfigWriteAction::Skipped {
        if forced {
            println!("  (no changes detected; existing file already complete)");
        } else {
            println!("  (existing file preserved; pass --force to fill in missing fields)");
        }
    }
}

fn write_config(config: Option<PathBuf>, force: bool) -> Result<ConfigWriteOutcome> {
    let path = match config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let settings = HarnessSettings::load_existing(&path)?.unwrap_or_default();
    settings.write_template(&path, force)
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Window {
            path,
            samples,
            group_by,
        } => {
            if !path.exists() {
                bail!("Metrics file {} does not exist", path.display());
            }
            println!("{}", render_window(&path, samples, group_by.as_deref())?);
        }
        Command::History { limit } => {
            let harness = Harness::bootstrap(cli.config)?;
            print_history(&harness, limit)?;
        }
        Command::Diagnostics { json } => {
            let harness = Harness::bootstrap(cli.config)?;
            let report = harness.diagnostics()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_diagnostics(&report);
            }
        }
        Command::WriteConfig { force } => {
            let outcome = write_config(cli.config, force)?;
            report_config_action(&outcome, force);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_window_subcommand() {
        let cli = Cli::try_parse_from([
            "harness",
            "window",
            "/tmp/gpu.csv",
            "--samples",
            "5",
            "--group-by",
            "index",
            "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Window {
                path,
                samples,
                group_by,
            } => {
                assert_eq!(path, PathBuf::from("/tmp/gpu.csv"));
                assert_eq!(samples, 5);
                assert_eq!(group_by.as_deref(), Some("index"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn history_limit_defaults_to_ten() {
        let cli = Cli::try_parse_from(["harness", "history"]).unwrap();
        assert!(matches!(cli.command, Command::History { limit: 10 }));
        assert!(Cli::try_parse_from(["harness"]).is_err());
    }

    #[test]
    fn render_window_outputs_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cpu.csv");
        fs::write(&path, "timestamp,%user\nt1,10\nt2,12\nt3,14\n").unwrap();

        let rendered: Value = serde_json::from_str(&render_window(&path, 2, None).unwrap()).unwrap();
        assert_eq!(rendered["timestamps"], serde_json::json!(["t2", "t3"]));

        let missing = dir.path().join("absent.csv");
        assert_eq!(render_window(&missing, 2, None).unwrap(), "null");
        assert_eq!(render_window(&missing, 2, Some("index")).unwrap(), "[]");
    }

    #[test]
    fn write_config_fills_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "jobs": { "iperf": { "server": "10.1.1.1" } } }"#).unwrap();

        let skipped = write_config(Some(path.clone()), false).unwrap();
        assert_eq!(skipped.action, ConfigWriteAction::Skipped);

        let updated = write_config(Some(path.clone()), true).unwrap();
        assert_eq!(updated.action, ConfigWriteAction::Updated);
        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["jobs"]["iperf"]["server"], "10.1.1.1");
        assert_eq!(written["jobs"]["iperf"]["port"], 5201);
    }

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }
}
