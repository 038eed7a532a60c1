// Builder for the pg_dump / pg_dumpall / psql invocation handed to the snapshot session.
use std::fmt;
use std::str::FromStr;

use crate::connection::ConnectionInfo;
use crate::errors::{AppError, Result};

pub const PG_DUMP: &str = "pg_dump";
pub const PG_DUMPALL: &str = "pg_dumpall";
pub const PSQL: &str = "psql";

/// Tools allowed for `backup-pg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTool {
    PgDump,
    PgDumpall,
}

/// Tools allowed for `restore-pg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreTool {
    Psql,
}

impl BackupTool {
    pub fn executable(&self) -> &'static str {
        match self {
            BackupTool::PgDump => PG_DUMP,
            BackupTool::PgDumpall => PG_DUMPALL,
        }
    }
}

impl RestoreTool {
    pub fn executable(&self) -> &'static str {
        match self {
            RestoreTool::Psql => PSQL,
        }
    }
}

impl FromStr for BackupTool {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            PG_DUMP => Ok(BackupTool::PgDump),
            PG_DUMPALL => Ok(BackupTool::PgDumpall),
            other => Err(AppError::Config(format!(
                "invalid pg backup command: expected {} or {}, but instead got {}",
                PG_DUMP, PG_DUMPALL, other
            ))),
        }
    }
}

impl FromStr for RestoreTool {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            PSQL => Ok(RestoreTool::Psql),
            other => Err(AppError::Config(format!(
                "invalid pg restore command: expected {}, but instead got {}",
                PSQL, other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpCommand {
    pub executable: String,
    pub args: Vec<String>,
}

impl DumpCommand {
    /// Connection flags first, then every whitespace separated token of
    /// `extra_args` as its own argv entry. Nothing is shell-interpreted.
    pub fn build(executable: &str, conn: &ConnectionInfo, extra_args: &str) -> Self {
        let mut args = connection_args(conn);
        args.extend(extra_args.split_whitespace().map(str::to_string));
        DumpCommand {
            executable: executable.to_string(),
            args,
        }
    }

    pub fn for_backup(tool: BackupTool, conn: &ConnectionInfo, extra_args: &str) -> Self {
        Self::build(tool.executable(), conn, extra_args)
    }

    pub fn for_restore(tool: RestoreTool, conn: &ConnectionInfo, extra_args: &str) -> Self {
        Self::build(tool.executable(), conn, extra_args)
    }
}

impl fmt::Display for DumpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// `--host`, `--port` and `--username` in that order. Shared with the readiness check.
pub fn connection_args(conn: &ConnectionInfo) -> Vec<String> {
    vec![
        format!("--host={}", conn.host),
        format!("--port={}", conn.port),
        format!("--username={}", conn.username),
    ]
}
