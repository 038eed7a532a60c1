mod logic;

use crate::config::{AppConfig, OperationConfig};
use crate::errors::{AppError, Result};
use crate::session::SessionResult;
use crate::utils::readiness::ReadinessWaiter;
use crate::utils::setup::prepare;

/// Public entry point for `restore-pg`.
pub async fn run_restore_flow(app_config: &AppConfig) -> Result<SessionResult> {
    let restore_config = match &app_config.operation {
        OperationConfig::Restore(cfg) => cfg,
        _ => {
            return Err(AppError::Config(
                "restore-pg was invoked without a restore configuration".to_string(),
            ));
        }
    };

    let prepared = prepare(app_config, restore_config.tls_username.as_deref()).await?;
    let waiter = ReadinessWaiter::new(restore_config.wait_timeout);

    logic::perform_restore_orchestration(
        app_config,
        restore_config,
        &prepared.conn,
        &waiter,
        prepared.session,
        &prepared.target,
    )
    .await
}
