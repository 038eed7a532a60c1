//! Snapshot session
//!
//! A snapshot session stores the output of a dump command in a backup
//! repository, or streams a stored snapshot back into a restore command.
//! The flows only talk to the `SnapshotSession` trait; `restic::ResticSession`
//! is the implementation used in production.

pub(crate) mod repository;
pub(crate) mod restic;

use std::ffi::OsStr;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::command::DumpCommand;
use crate::errors::Result;

pub const DEFAULT_HOST: &str = "host-0";
pub const DUMP_FILE_NAME: &str = "dumpfile.sql";
pub const LATEST_SNAPSHOT: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub total: u64,
    pub new: u64,
    pub modified: u64,
    pub unmodified: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub snapshot_id: String,
    pub file_name: String,
    pub total_size_bytes: u64,
    pub uploaded_bytes: u64,
    pub processing_time_seconds: f64,
    pub files: FileStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub integrity: bool,
    pub size_bytes: u64,
    pub snapshot_count: u64,
    pub snapshots_removed_on_last_cleanup: u64,
}

/// Outcome of one backup or restore invocation. This is what ends up in `output.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub hostname: String,
    pub phase: Phase,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_stats: Option<SnapshotStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_stats: Option<RepositoryStats>,
}

impl SessionResult {
    pub fn succeeded(hostname: &str, duration_seconds: f64) -> Self {
        SessionResult {
            hostname: hostname.to_string(),
            phase: Phase::Succeeded,
            duration_seconds,
            error: None,
            snapshot_stats: None,
            repository_stats: None,
        }
    }

    pub fn failed(hostname: &str, duration_seconds: f64, error: String) -> Self {
        SessionResult {
            hostname: hostname.to_string(),
            phase: Phase::Failed,
            duration_seconds,
            error: Some(error),
            snapshot_stats: None,
            repository_stats: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.phase == Phase::Succeeded
    }
}

/// Keep/prune rules forwarded to the snapshot engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    pub keep_tags: Vec<String>,
    pub prune: bool,
    pub dry_run: bool,
}

impl RetentionPolicy {
    /// True when no keep rule is set, in which case nothing is forgotten.
    pub fn is_empty(&self) -> bool {
        self.keep_last.is_none()
            && self.keep_hourly.is_none()
            && self.keep_daily.is_none()
            && self.keep_weekly.is_none()
            && self.keep_monthly.is_none()
            && self.keep_yearly.is_none()
            && self.keep_tags.is_empty()
    }
}

/// CPU and IO priority applied to every process of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scheduling {
    pub nice_adjustment: Option<i32>,
    pub ionice_class: Option<u8>,
    pub ionice_class_data: Option<u8>,
}

impl Scheduling {
    /// `nice -n N` and/or `ionice -c C -n D`, to be placed in front of a program.
    pub fn prefix(&self) -> Vec<String> {
        let mut prefix = Vec::new();
        if let Some(n) = self.nice_adjustment {
            prefix.extend(["nice".to_string(), "-n".to_string(), n.to_string()]);
        }
        if self.ionice_class.is_some() || self.ionice_class_data.is_some() {
            prefix.push("ionice".to_string());
            if let Some(class) = self.ionice_class {
                prefix.extend(["-c".to_string(), class.to_string()]);
            }
            if let Some(data) = self.ionice_class_data {
                prefix.extend(["-n".to_string(), data.to_string()]);
            }
        }
        prefix
    }

    /// A command running `program` under this scheduling.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let prefix = self.prefix();
        match prefix.split_first() {
            None => Command::new(program),
            Some((wrapper, wrapper_args)) => {
                let mut cmd = Command::new(wrapper);
                cmd.args(wrapper_args).arg(program);
                cmd
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    pub host: String,
    pub stdin_file_name: String,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOptions {
    pub host: String,
    pub source_host: String,
    pub snapshot: String,
    pub file_name: String,
}

#[allow(async_fn_in_trait)]
pub trait SnapshotSession {
    /// Adds a variable to the environment of every process the session starts.
    fn set_env(&mut self, key: &str, value: &str);

    /// Runs `command` and stores its stdout as a new snapshot.
    async fn run_backup(&self, command: &DumpCommand, options: &BackupOptions) -> Result<SessionResult>;

    /// Streams a stored snapshot into the stdin of `command`.
    async fn dump(&self, command: &DumpCommand, options: &DumpOptions) -> Result<SessionResult>;
}
