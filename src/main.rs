//! PostgreSQL backup/restore plugin for Stash
//!
//! Provides the `backup-pg` and `restore-pg` commands run inside Stash backup
//! and restore jobs.

mod backup;
mod command;
mod config;
mod connection;
mod errors;
mod report;
mod restore;
mod session;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::{Level, error, info};

use config::{BackupArgs, RestoreArgs, load_backup_config, load_restore_config};
use session::SessionResult;

#[derive(Parser)]
#[command(name = "stash-postgres")]
#[command(about = "PostgreSQL backup & restore plugin for Stash")]
#[command(version)]
struct Cli {
    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Takes a logical backup of a PostgreSQL database using restic
    BackupPg(BackupArgs),

    /// Restores a logical backup of a PostgreSQL database using restic
    RestorePg(RestoreArgs),
}

/// Main entry point for the backup/restore plugin
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = utils::logger::init_logger(cli.log_level) {
        eprintln!("failed to initialise logging: {}", e);
    }

    match run_app(cli.command).await {
        Ok(result) => {
            info!(
                hostname = %result.hostname,
                phase = ?result.phase,
                "Operation completed successfully"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(command: Commands) -> Result<SessionResult> {
    match command {
        Commands::BackupPg(args) => {
            let app_config =
                load_backup_config(args).context("Invalid backup-pg configuration")?;
            info!(
                appbinding = %app_config.cluster.appbinding,
                namespace = %app_config.cluster.appbinding_namespace,
                "Starting Backup Process"
            );
            backup::run_backup_flow(&app_config)
                .await
                .context("Backup process failed")
        }
        Commands::RestorePg(args) => {
            let app_config =
                load_restore_config(args).context("Invalid restore-pg configuration")?;
            info!(
                appbinding = %app_config.cluster.appbinding,
                namespace = %app_config.cluster.appbinding_namespace,
                "Starting Restore Process"
            );
            restore::run_restore_flow(&app_config)
                .await
                .context("Restore process failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "stash-postgres",
            "backup-pg",
            "--appbinding=sample-postgres",
            "--namespace=demo",
            "--provider=s3",
            "--bucket=stash",
            "--secret-dir=/etc/repository/secret",
            "--backup-cmd=pg_dump",
            "--pg-args=-d app --clean",
            "--retention-keep-last=5",
            "--retention-keep-tags=a,b",
            "--retention-prune",
            "--metrics-enabled",
            "--metrics-labels=env=prod,team=db",
            "--log-level=debug",
        ])?;
        assert_eq!(cli.log_level, Level::DEBUG);
        let Commands::BackupPg(args) = cli.command else {
            anyhow::bail!("expected backup-pg");
        };
        assert_eq!(args.backup_cmd, "pg_dump");
        assert_eq!(args.pg_args, "-d app --clean");
        assert_eq!(args.wait_timeout, 300);
        assert_eq!(args.hostname, "host-0");
        assert_eq!(args.storage.scratch_dir, std::path::PathBuf::from("/tmp"));
        assert_eq!(args.retention.keep_tags, vec!["a", "b"]);
        assert_eq!(args.metrics.labels, vec!["env=prod", "team=db"]);
        Ok(())
    }

    #[test]
    fn test_restore_accepts_backup_cmd_alias() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "stash-postgres",
            "restore-pg",
            "--appbinding=sample-postgres",
            "--provider=local",
            "--path=/repo",
            "--secret-dir=/etc/repository/secret",
            "--backup-cmd=psql",
        ])?;
        let Commands::RestorePg(args) = cli.command else {
            anyhow::bail!("expected restore-pg");
        };
        assert_eq!(args.restore_cmd, "psql");
        assert_eq!(args.snapshot, "latest");
        Ok(())
    }

    #[test]
    fn test_scheduling_flags() -> anyhow::Result<()> {
        let base = [
            "stash-postgres",
            "backup-pg",
            "--appbinding=sample-postgres",
            "--provider=local",
            "--path=/repo",
            "--secret-dir=/etc/repository/secret",
        ];
        let cli = Cli::try_parse_from(
            base.iter()
                .copied()
                .chain(["--nice-adjustment=-5", "--ionice-class=2", "--ionice-class-data=7"]),
        )?;
        let Commands::BackupPg(args) = cli.command else {
            anyhow::bail!("expected backup-pg");
        };
        assert_eq!(args.scheduling.nice_adjustment, Some(-5));
        assert_eq!(args.scheduling.ionice_class, Some(2));
        assert_eq!(args.scheduling.ionice_class_data, Some(7));

        assert!(Cli::try_parse_from(base.iter().copied().chain(["--ionice-class=4"])).is_err());
        assert!(Cli::try_parse_from(base.iter().copied().chain(["--nice-adjustment=25"])).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_backup_cmd_fails_without_cluster() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output_flag = format!("--output-dir={}", dir.path().display());
        let cli = Cli::try_parse_from([
            "stash-postgres",
            "backup-pg",
            "--appbinding=sample-postgres",
            "--provider=s3",
            "--bucket=stash",
            "--secret-dir=/etc/repository/secret",
            "--backup-cmd=dropdb",
            output_flag.as_str(),
        ])?;
        let err = run_app(cli.command).await.unwrap_err();
        assert!(
            format!("{:#}", err)
                .contains("invalid pg backup command: expected pg_dump or pg_dumpall, but instead got dropdb")
        );
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
