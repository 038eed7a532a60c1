use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::command::DumpCommand;
use crate::config::{AppConfig, BackupConfig};
use crate::connection::ConnectionInfo;
use crate::errors::{AppError, Result};
use crate::report::{self, SessionKind, Target};
use crate::session::{BackupOptions, DUMP_FILE_NAME, SessionResult, SnapshotSession};
use crate::utils::readiness::ReadinessWaiter;

async fn take_backup<S: SnapshotSession>(
    backup_config: &BackupConfig,
    hostname: &str,
    scratch_dir: &Path,
    conn: &ConnectionInfo,
    waiter: &ReadinessWaiter,
    session: &mut S,
) -> Result<SessionResult> {
    waiter.wait(conn, scratch_dir).await?;

    for (key, value) in conn.child_env(scratch_dir) {
        session.set_env(key, &value);
    }
    let command = DumpCommand::for_backup(backup_config.tool, conn, &backup_config.pg_args);
    let options = BackupOptions {
        host: hostname.to_string(),
        stdin_file_name: DUMP_FILE_NAME.to_string(),
        retention: backup_config.retention.clone(),
    };
    session.run_backup(&command, &options).await
}

/// Waits for the database, streams the dump into the snapshot session and
/// reports the outcome. A failed session is still reported before the
/// error is returned.
pub async fn perform_backup_orchestration<S: SnapshotSession>(
    app_config: &AppConfig,
    backup_config: &BackupConfig,
    conn: &ConnectionInfo,
    waiter: &ReadinessWaiter,
    mut session: S,
    target: &Target,
) -> Result<SessionResult> {
    let started = Instant::now();
    let hostname = &app_config.report.hostname;

    let outcome = take_backup(
        backup_config,
        hostname,
        &app_config.storage.scratch_dir,
        conn,
        waiter,
        &mut session,
    )
    .await;
    let result = report::finalize(outcome, hostname, started);
    report::publish(&result, &app_config.report, SessionKind::Backup, target).await?;

    match &result.error {
        None => {
            info!(
                hostname = %result.hostname,
                duration_seconds = result.duration_seconds,
                "Backup completed"
            );
            Ok(result)
        }
        Some(message) => Err(AppError::SessionFailed {
            operation: SessionKind::Backup.operation(),
            message: message.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::BackupTool;
    use crate::config::tests::backup_args;
    use crate::config::{OperationConfig, load_backup_config};
    use crate::report::OUTPUT_FILE_NAME;
    use crate::session::Phase;
    use crate::session::tests::FakeSession;

    fn setup(output_dir: &Path) -> anyhow::Result<(AppConfig, BackupConfig)> {
        let mut args = backup_args();
        args.output_dir = Some(output_dir.to_path_buf());
        args.storage.scratch_dir = output_dir.join("scratch");
        args.pg_args = "--clean".to_string();
        let config = load_backup_config(args)?;
        let backup = match &config.operation {
            OperationConfig::Backup(b) => b.clone(),
            other => anyhow::bail!("unexpected operation {:?}", other),
        };
        Ok((config, backup))
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            host: "sample-postgres.demo.svc".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: Some("pw".to_string()),
            ssl_mode: None,
            client_tls: None,
            ca_bundle: None,
        }
    }

    fn target() -> Target {
        Target {
            name: "sample-postgres".to_string(),
            namespace: "demo".to_string(),
        }
    }

    fn read_output(dir: &Path) -> anyhow::Result<SessionResult> {
        Ok(serde_json::from_slice(&std::fs::read(dir.join(OUTPUT_FILE_NAME))?)?)
    }

    #[tokio::test]
    async fn test_successful_backup_writes_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (config, backup) = setup(dir.path())?;
        let session = FakeSession::default();
        let waiter = ReadinessWaiter::with_program("true", 5);

        let result =
            perform_backup_orchestration(&config, &backup, &conn(), &waiter, session, &target())
                .await?;
        assert!(result.is_success());

        let written = read_output(dir.path())?;
        assert_eq!(written.phase, Phase::Succeeded);
        assert_eq!(written.hostname, "host-0");
        assert_eq!(written.snapshot_stats.map(|s| s.snapshot_id).as_deref(), Some("abc123"));
        assert!(written.repository_stats.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_session_receives_command_and_env() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (_, backup) = setup(dir.path())?;
        let mut session = FakeSession::default();
        let waiter = ReadinessWaiter::with_program("true", 5);

        let result = take_backup(
            &backup,
            "host-0",
            dir.path(),
            &conn(),
            &waiter,
            &mut session,
        )
        .await?;
        assert!(result.is_success());
        assert_eq!(session.env.get("PGPASSWORD").map(String::as_str), Some("pw"));

        let commands = session.commands.borrow();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].executable, BackupTool::PgDumpall.executable());
        assert_eq!(commands[0].args.last().map(String::as_str), Some("--clean"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_database_never_starts_session() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (config, backup) = setup(dir.path())?;
        let mut session = FakeSession::default();
        let waiter = ReadinessWaiter::with_program("false", 1);

        let outcome =
            take_backup(&backup, "host-0", dir.path(), &conn(), &waiter, &mut session).await;
        assert!(matches!(outcome, Err(AppError::Unavailable(_))));
        assert!(session.commands.borrow().is_empty());

        let err = perform_backup_orchestration(
            &config,
            &backup,
            &conn(),
            &waiter,
            FakeSession::default(),
            &target(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::SessionFailed { operation: "backup", .. }));

        let written = read_output(dir.path())?;
        assert_eq!(written.phase, Phase::Failed);
        assert!(written.error.unwrap().starts_with("database is not ready"));
        assert!(written.snapshot_stats.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (config, backup) = setup(dir.path())?;
        let session = FakeSession {
            fail_with: Some("restic backup exited with exit status: 1".to_string()),
            ..Default::default()
        };
        let waiter = ReadinessWaiter::with_program("true", 5);

        let err =
            perform_backup_orchestration(&config, &backup, &conn(), &waiter, session, &target())
                .await
                .unwrap_err();
        assert_eq!(
            err.to_string(),
            "backup session failed: restic backup exited with exit status: 1"
        );
        let written = read_output(dir.path())?;
        assert_eq!(written.phase, Phase::Failed);
        assert!(written.repository_stats.is_none());
        Ok(())
    }
}
