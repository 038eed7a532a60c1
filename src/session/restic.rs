// restic driven as a subprocess.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::repository::Repository;
use super::{
    BackupOptions, DumpOptions, FileStats, RepositoryStats, RetentionPolicy, Scheduling,
    SessionResult, SnapshotSession, SnapshotStats,
};
use crate::command::DumpCommand;
use crate::errors::{AppError, Result};
use crate::utils::find_executable;

pub const RESTIC: &str = "restic";

/// Lines of captured stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BackupSummary {
    message_type: String,
    files_new: u64,
    files_changed: u64,
    files_unmodified: u64,
    total_files_processed: u64,
    data_added: u64,
    total_bytes_processed: u64,
    total_duration: f64,
    snapshot_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ForgetGroup {
    remove: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RepoStats {
    total_size: u64,
}

/// Picks the `summary` message out of `restic backup --json` output.
fn parse_backup_summary(output: &[u8], file_name: &str) -> Result<SnapshotStats> {
    let text = String::from_utf8_lossy(output);
    let summary = text
        .lines()
        .filter(|l| l.trim_start().starts_with('{'))
        .filter_map(|l| serde_json::from_str::<BackupSummary>(l).ok())
        .find(|m| m.message_type == "summary")
        .ok_or_else(|| AppError::Backend("restic backup produced no summary".to_string()))?;

    Ok(SnapshotStats {
        snapshot_id: summary.snapshot_id,
        file_name: file_name.to_string(),
        total_size_bytes: summary.total_bytes_processed,
        uploaded_bytes: summary.data_added,
        processing_time_seconds: summary.total_duration,
        files: FileStats {
            total: summary.total_files_processed,
            new: summary.files_new,
            modified: summary.files_changed,
            unmodified: summary.files_unmodified,
        },
    })
}

/// Number of snapshots `restic forget --json` removed.
fn parse_forget_removed(output: &[u8]) -> Result<u64> {
    let text = String::from_utf8_lossy(output);
    let Some(line) = text.lines().find(|l| l.trim_start().starts_with('[')) else {
        return Ok(0);
    };
    let groups: Vec<ForgetGroup> = serde_json::from_str(line)?;
    Ok(groups
        .iter()
        .map(|g| g.remove.as_ref().map_or(0, |r| r.len() as u64))
        .sum())
}

fn parse_snapshot_count(output: &[u8]) -> Result<u64> {
    let snapshots: Vec<serde_json::Value> = serde_json::from_slice(output)?;
    Ok(snapshots.len() as u64)
}

fn parse_repository_size(output: &[u8]) -> Result<u64> {
    let stats: RepoStats = serde_json::from_slice(output)?;
    Ok(stats.total_size)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// One side of a pipe, named for error messages.
pub(crate) struct Stage {
    name: String,
    command: Command,
}

impl Stage {
    pub(crate) fn new(name: impl Into<String>, command: Command) -> Self {
        Stage {
            name: name.into(),
            command,
        }
    }
}

/// Runs `producer | consumer` and returns whatever the consumer wrote to
/// `consumer_stdout` when it is piped. Either side exiting non-zero fails the
/// pipe; a failed consumer is reported first and takes the producer down with it.
pub(crate) fn pipe(producer: Stage, consumer: Stage, consumer_stdout: Stdio) -> Result<Vec<u8>> {
    let Stage {
        name: producer_name,
        command: mut producer,
    } = producer;
    let Stage {
        name: consumer_name,
        command: mut consumer,
    } = consumer;

    let mut upstream = producer
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| AppError::Backend(format!("failed to start {}: {}", producer_name, e)))?;
    drop(producer);
    let stdout = match upstream.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = upstream.kill();
            let _ = upstream.wait();
            return Err(AppError::Backend(format!(
                "failed to capture stdout of {}",
                producer_name
            )));
        }
    };

    let downstream = consumer
        .stdin(Stdio::from(stdout))
        .stdout(consumer_stdout)
        .stderr(Stdio::piped())
        .spawn();
    // The consumer command holds the read end of the pipe until dropped.
    drop(consumer);
    let downstream = match downstream {
        Ok(child) => child,
        Err(e) => {
            let _ = upstream.kill();
            let _ = upstream.wait();
            return Err(AppError::Backend(format!(
                "failed to start {}: {}",
                consumer_name, e
            )));
        }
    };

    let output = downstream.wait_with_output()?;
    if !output.status.success() {
        let _ = upstream.kill();
        let _ = upstream.wait();
        return Err(AppError::Backend(format!(
            "{} exited with {}: {}",
            consumer_name,
            output.status,
            stderr_tail(&output.stderr)
        )));
    }

    let status = upstream.wait()?;
    if !status.success() {
        return Err(AppError::Backend(format!(
            "{} exited with {}",
            producer_name, status
        )));
    }
    Ok(output.stdout)
}

/// Snapshot session backed by a restic repository.
#[derive(Clone)]
pub struct ResticSession {
    program: PathBuf,
    global_args: Vec<String>,
    env: BTreeMap<String, String>,
    tool_env: BTreeMap<String, String>,
    scheduling: Scheduling,
}

impl ResticSession {
    pub fn new(repository: &Repository) -> Result<Self> {
        Ok(Self::with_program(find_executable(RESTIC)?, repository))
    }

    pub fn with_program(program: impl Into<PathBuf>, repository: &Repository) -> Self {
        ResticSession {
            program: program.into(),
            global_args: repository.global_args.clone(),
            env: repository.env.clone(),
            tool_env: BTreeMap::new(),
            scheduling: Scheduling::default(),
        }
    }

    /// Runs restic and the database tools under `scheduling`.
    pub fn with_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// restic with the repository credentials in its environment.
    fn restic(&self, args: &[&str]) -> Command {
        let mut cmd = self.scheduling.command(&self.program);
        cmd.args(args).args(&self.global_args).envs(&self.env);
        cmd
    }

    /// The database tool only sees the variables handed to `set_env`.
    fn tool(&self, command: &DumpCommand) -> Command {
        let mut cmd = self.scheduling.command(&command.executable);
        cmd.args(&command.args).envs(&self.tool_env);
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(args = ?args, "running restic");
        let output = self
            .restic(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| AppError::Backend(format!("failed to start {}: {}", RESTIC, e)))?;
        if !output.status.success() {
            return Err(AppError::Backend(format!(
                "restic {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }

    fn ensure_repository(&self) -> Result<()> {
        let status = self
            .restic(&["cat", "config"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| AppError::Backend(format!("failed to start {}: {}", RESTIC, e)))?;
        if status.success() {
            return Ok(());
        }
        info!("Initializing restic repository");
        self.run(&["init"]).map(|_| ())
    }

    fn check_integrity(&self) -> bool {
        match self.run(&["check"]) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Repository integrity check failed");
                false
            }
        }
    }

    fn forget(&self, host: &str, policy: &RetentionPolicy) -> Result<u64> {
        if policy.is_empty() {
            return Ok(0);
        }
        let mut args: Vec<String> = vec!["forget".into(), "--json".into(), "--host".into(), host.into()];
        let counts = [
            ("--keep-last", policy.keep_last),
            ("--keep-hourly", policy.keep_hourly),
            ("--keep-daily", policy.keep_daily),
            ("--keep-weekly", policy.keep_weekly),
            ("--keep-monthly", policy.keep_monthly),
            ("--keep-yearly", policy.keep_yearly),
        ];
        for (flag, value) in counts {
            if let Some(n) = value {
                args.push(flag.to_string());
                args.push(n.to_string());
            }
        }
        for tag in &policy.keep_tags {
            args.push("--keep-tag".to_string());
            args.push(tag.clone());
        }
        if policy.prune {
            args.push("--prune".to_string());
        }
        if policy.dry_run {
            args.push("--dry-run".to_string());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let removed = parse_forget_removed(&self.run(&args)?)?;
        info!(removed, "Applied retention policy");
        Ok(removed)
    }

    fn backup_blocking(&self, command: &DumpCommand, options: &BackupOptions) -> Result<SessionResult> {
        let started = Instant::now();
        self.ensure_repository()?;

        info!(command = %command, host = %options.host, "Starting backup");
        let output = pipe(
            Stage::new(&command.executable, self.tool(command)),
            Stage::new(
                "restic backup",
                self.restic(&[
                    "backup",
                    "--stdin",
                    "--stdin-filename",
                    &options.stdin_file_name,
                    "--host",
                    &options.host,
                    "--json",
                ]),
            ),
            Stdio::piped(),
        )?;
        let snapshot = parse_backup_summary(&output, &options.stdin_file_name)?;
        info!(snapshot = %snapshot.snapshot_id, "Snapshot stored");

        let integrity = self.check_integrity();
        let removed = self.forget(&options.host, &options.retention)?;
        let snapshot_count = parse_snapshot_count(&self.run(&["snapshots", "--json"])?)?;
        let size_bytes = parse_repository_size(&self.run(&["stats", "--json", "--mode", "raw-data"])?)?;

        let mut result = SessionResult::succeeded(&options.host, started.elapsed().as_secs_f64());
        result.snapshot_stats = Some(snapshot);
        result.repository_stats = Some(RepositoryStats {
            integrity,
            size_bytes,
            snapshot_count,
            snapshots_removed_on_last_cleanup: removed,
        });
        Ok(result)
    }

    fn dump_blocking(&self, command: &DumpCommand, options: &DumpOptions) -> Result<SessionResult> {
        let started = Instant::now();
        let file = format!("/{}", options.file_name.trim_start_matches('/'));
        info!(
            command = %command,
            snapshot = %options.snapshot,
            source_host = %options.source_host,
            "Starting restore"
        );
        pipe(
            Stage::new(
                "restic dump",
                self.restic(&["dump", "--host", &options.source_host, &options.snapshot, &file]),
            ),
            Stage::new(&command.executable, self.tool(command)),
            Stdio::null(),
        )?;
        Ok(SessionResult::succeeded(&options.host, started.elapsed().as_secs_f64()))
    }
}

fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError::Backend(format!("snapshot task failed: {}", e))
}

impl SnapshotSession for ResticSession {
    fn set_env(&mut self, key: &str, value: &str) {
        self.tool_env.insert(key.to_string(), value.to_string());
    }

    async fn run_backup(&self, command: &DumpCommand, options: &BackupOptions) -> Result<SessionResult> {
        let session = self.clone();
        let command = command.clone();
        let options = options.clone();
        tokio::task::spawn_blocking(move || session.backup_blocking(&command, &options))
            .await
            .map_err(join_error)?
    }

    async fn dump(&self, command: &DumpCommand, options: &DumpOptions) -> Result<SessionResult> {
        let session = self.clone();
        let command = command.clone();
        let options = options.clone();
        tokio::task::spawn_blocking(move || session.dump_blocking(&command, &options))
            .await
            .map_err(join_error)?
    }
}
