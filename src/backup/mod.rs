mod logic;

use crate::config::{AppConfig, OperationConfig};
use crate::errors::{AppError, Result};
use crate::session::SessionResult;
use crate::utils::readiness::ReadinessWaiter;
use crate::utils::setup::prepare;

/// Public entry point for `backup-pg`.
/// Reads the cluster, then hands the resolved connection and restic session to the orchestration.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<SessionResult> {
    let backup_config = match &app_config.operation {
        OperationConfig::Backup(cfg) => cfg,
        _ => {
            return Err(AppError::Config(
                "backup-pg was invoked without a backup configuration".to_string(),
            ));
        }
    };

    let prepared = prepare(app_config, backup_config.tls_username.as_deref()).await?;
    let waiter = ReadinessWaiter::new(backup_config.wait_timeout);

    logic::perform_backup_orchestration(
        app_config,
        backup_config,
        &prepared.conn,
        &waiter,
        prepared.session,
        &prepared.target,
    )
    .await
}
