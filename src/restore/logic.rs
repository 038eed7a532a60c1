use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::command::DumpCommand;
use crate::config::{AppConfig, RestoreConfig};
use crate::connection::ConnectionInfo;
use crate::errors::{AppError, Result};
use crate::report::{self, SessionKind, Target};
use crate::session::{DUMP_FILE_NAME, DumpOptions, SessionResult, SnapshotSession};
use crate::utils::readiness::ReadinessWaiter;

async fn restore_snapshot<S: SnapshotSession>(
    restore_config: &RestoreConfig,
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
    let command = DumpCommand::for_restore(restore_config.tool, conn, &restore_config.pg_args);
    let options = DumpOptions {
        host: hostname.to_string(),
        source_host: restore_config.source_host.clone(),
        snapshot: restore_config.snapshot.clone(),
        file_name: DUMP_FILE_NAME.to_string(),
    };
    session.dump(&command, &options).await
}

/// Waits for the database, streams the snapshot into psql and reports the outcome.
pub async fn perform_restore_orchestration<S: SnapshotSession>(
    app_config: &AppConfig,
    restore_config: &RestoreConfig,
    conn: &ConnectionInfo,
    waiter: &ReadinessWaiter,
    mut session: S,
    target: &Target,
) -> Result<SessionResult> {
    let started = Instant::now();
    let hostname = &app_config.report.hostname;

    let outcome = restore_snapshot(
        restore_config,
        hostname,
        &app_config.storage.scratch_dir,
        conn,
        waiter,
        &mut session,
    )
    .await;
    let result = report::finalize(outcome, hostname, started);
    report::publish(&result, &app_config.report, SessionKind::Restore, target).await?;

    if let Some(message) = &result.error {
        return Err(AppError::SessionFailed {
            operation: SessionKind::Restore.operation(),
            message: message.clone(),
        });
    }
    info!(
        snapshot = %restore_config.snapshot,
        source_host = %restore_config.source_host,
        duration_seconds = result.duration_seconds,
        "Restore completed"
    );
    Ok(result)
}
