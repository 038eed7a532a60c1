// Waits for the database to accept connections using pg_isready.
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::command::connection_args;
use crate::connection::ConnectionInfo;
use crate::errors::{AppError, Result};

pub const PG_ISREADY: &str = "pg_isready";

#[derive(Debug, Clone)]
pub struct ReadinessWaiter {
    program: PathBuf,
    timeout_secs: u32,
}

impl ReadinessWaiter {
    pub fn new(timeout_secs: u32) -> Self {
        Self::with_program(PG_ISREADY, timeout_secs)
    }

    pub fn with_program(program: impl Into<PathBuf>, timeout_secs: u32) -> Self {
        ReadinessWaiter {
            program: program.into(),
            timeout_secs,
        }
    }

    pub fn args(&self, conn: &ConnectionInfo) -> Vec<String> {
        let mut args = connection_args(conn);
        args.push(format!("--timeout={}", self.timeout_secs));
        args
    }

    /// Blocks until pg_isready exits. It enforces the timeout itself, a
    /// non-zero exit is returned as `AppError::Unavailable` and never retried.
    pub async fn wait(&self, conn: &ConnectionInfo, scratch_dir: &Path) -> Result<()> {
        info!(
            host = %conn.host,
            port = conn.port,
            timeout_secs = self.timeout_secs,
            "Waiting for the database to be ready"
        );
        let output = Command::new(&self.program)
            .args(self.args(conn))
            .envs(conn.child_env(scratch_dir))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                AppError::Unavailable(format!(
                    "failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stdout);
            return Err(AppError::Unavailable(format!(
                "{}:{} did not accept connections within {}s ({}): {}",
                conn.host,
                conn.port,
                self.timeout_secs,
                output.status,
                detail.trim()
            )));
        }
        info!(host = %conn.host, "Database is ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            host: "pg.demo.svc".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: Some("pw".to_string()),
            ssl_mode: None,
            client_tls: None,
            ca_bundle: None,
        }
    }

    #[test]
    fn test_readiness_args_never_include_password() {
        let args = ReadinessWaiter::new(5).args(&conn());
        assert_eq!(
            args,
            vec![
                "--host=pg.demo.svc",
                "--port=5432",
                "--username=postgres",
                "--timeout=5"
            ]
        );
        assert!(args.iter().all(|a| !a.contains("pw")));
    }

    #[tokio::test]
    async fn test_successful_readiness_check() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        ReadinessWaiter::with_program("true", 5)
            .wait(&conn(), dir.path())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_readiness_check_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadinessWaiter::with_program("false", 5)
            .wait(&conn(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_password_reaches_pg_isready_via_env() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("pg_isready.sh");
        std::fs::write(&script, "#!/bin/sh\n[ \"$PGPASSWORD\" = \"pw\" ]\n")?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        ReadinessWaiter::with_program(&script, 5)
            .wait(&conn(), dir.path())
            .await?;
        Ok(())
    }
}
