// stash-postgres/src/config/mod.rs
use clap::Args;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::command::{BackupTool, RestoreTool};
use crate::errors::{AppError, Result};
use crate::session::{DEFAULT_HOST, LATEST_SNAPSHOT, RetentionPolicy, Scheduling};

pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";
pub const DEFAULT_WAIT_TIMEOUT_SECS: u32 = 300;

// Command line argument groups, flattened into the backup-pg / restore-pg subcommands.

#[derive(Debug, Clone, Args)]
pub struct ClusterArgs {
    /// The address of the Kubernetes API server (overrides any value in kubeconfig)
    #[arg(long)]
    pub master: Option<String>,

    /// Path to kubeconfig file with authorization information
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace of the Backup/Restore session
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Name of the AppBinding of the target database
    #[arg(long)]
    pub appbinding: String,

    /// Namespace of the AppBinding (defaults to --namespace)
    #[arg(long)]
    pub appbinding_namespace: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct StorageArgs {
    /// Backend provider (i.e. local, s3, gcs, azure, swift, b2, rest)
    #[arg(long)]
    pub provider: String,

    /// Name of the cloud bucket/container (keep empty for local backend)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Endpoint for s3/s3 compatible backend or REST server URL
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Region for s3/s3 compatible backend
    #[arg(long)]
    pub region: Option<String>,

    /// Directory inside the bucket where backup will be stored
    #[arg(long)]
    pub path: Option<String>,

    /// Directory where storage secret has been mounted
    #[arg(long)]
    pub secret_dir: Option<PathBuf>,

    /// Name of the storage secret (alternative to --secret-dir)
    #[arg(long)]
    pub storage_secret_name: Option<String>,

    /// Namespace of the storage secret (defaults to --namespace)
    #[arg(long)]
    pub storage_secret_namespace: Option<String>,

    /// Temporary directory
    #[arg(long, default_value = DEFAULT_SCRATCH_DIR)]
    pub scratch_dir: PathBuf,

    /// Specify whether to enable caching for restic
    #[arg(long)]
    pub enable_cache: bool,

    /// Specify maximum concurrent connections for GCS, Azure and B2 backend
    #[arg(long)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct RetentionArgs {
    #[arg(long = "retention-keep-last")]
    pub keep_last: Option<u32>,
    #[arg(long = "retention-keep-hourly")]
    pub keep_hourly: Option<u32>,
    #[arg(long = "retention-keep-daily")]
    pub keep_daily: Option<u32>,
    #[arg(long = "retention-keep-weekly")]
    pub keep_weekly: Option<u32>,
    #[arg(long = "retention-keep-monthly")]
    pub keep_monthly: Option<u32>,
    #[arg(long = "retention-keep-yearly")]
    pub keep_yearly: Option<u32>,
    #[arg(long = "retention-keep-tags", value_delimiter = ',')]
    pub keep_tags: Vec<String>,
    /// Specify whether to prune old snapshot data
    #[arg(long = "retention-prune")]
    pub prune: bool,
    /// Specify whether to test retention policy without deleting actual data
    #[arg(long = "retention-dry-run")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct MetricsArgs {
    /// Specify whether to export Prometheus metrics
    #[arg(long = "metrics-enabled")]
    pub enabled: bool,

    /// Pushgateway URL where the metrics will be pushed
    #[arg(long = "metrics-pushgateway-url")]
    pub pushgateway_url: Option<String>,

    /// Directory where to write metric.prom file
    #[arg(long = "metrics-dir")]
    pub dir: Option<PathBuf>,

    /// Labels to apply in exported metrics (key=value, comma separated)
    #[arg(long = "metrics-labels", value_delimiter = ',')]
    pub labels: Vec<String>,
}

/// CPU/IO priority of restic and the database tools. Usually injected by the
/// operator through the environment.
#[derive(Debug, Clone, Default, Args)]
pub struct SchedulingArgs {
    /// Niceness adjustment (-20 to 19)
    #[arg(
        long = "nice-adjustment",
        env = "NICE_ADJUSTMENT",
        allow_hyphen_values = true,
        value_parser = clap::value_parser!(i32).range(-20..=19)
    )]
    pub nice_adjustment: Option<i32>,

    /// IO scheduling class (0 none, 1 realtime, 2 best-effort, 3 idle)
    #[arg(long = "ionice-class", env = "IONICE_CLASS", value_parser = clap::value_parser!(u8).range(0..=3))]
    pub ionice_class: Option<u8>,

    /// IO scheduling class data (0 to 7)
    #[arg(long = "ionice-class-data", env = "IONICE_CLASS_DATA", value_parser = clap::value_parser!(u8).range(0..=7))]
    pub ionice_class_data: Option<u8>,
}

#[derive(Debug, Clone, Args)]
pub struct BackupArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    #[command(flatten)]
    pub storage: StorageArgs,
    #[command(flatten)]
    pub retention: RetentionArgs,
    #[command(flatten)]
    pub metrics: MetricsArgs,
    #[command(flatten)]
    pub scheduling: SchedulingArgs,

    /// Backup command to take a database dump (can only be pg_dumpall or pg_dump)
    #[arg(long, default_value = "pg_dumpall")]
    pub backup_cmd: String,

    /// Additional arguments
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub pg_args: String,

    /// Time limit in seconds to wait for the database to be ready
    #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT_SECS)]
    pub wait_timeout: u32,

    /// User for certificate based authentication
    #[arg(long)]
    pub tls_username: Option<String>,

    /// Name of the host machine
    #[arg(long, default_value = DEFAULT_HOST)]
    pub hostname: String,

    /// Directory where output.json file will be written (keep empty if you don't need to write output in file)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    #[command(flatten)]
    pub storage: StorageArgs,
    #[command(flatten)]
    pub metrics: MetricsArgs,
    #[command(flatten)]
    pub scheduling: SchedulingArgs,

    /// Restore command to load the dump (can only be psql)
    #[arg(long, alias = "backup-cmd", default_value = "psql")]
    pub restore_cmd: String,

    /// Additional arguments
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub pg_args: String,

    /// Time limit in seconds to wait for the database to be ready
    #[arg(long, default_value_t = DEFAULT_WAIT_TIMEOUT_SECS)]
    pub wait_timeout: u32,

    /// User for certificate based authentication
    #[arg(long)]
    pub tls_username: Option<String>,

    /// Name of the host machine
    #[arg(long, default_value = DEFAULT_HOST)]
    pub hostname: String,

    /// Name of the host whose backup will be restored (defaults to --hostname)
    #[arg(long)]
    pub source_hostname: Option<String>,

    /// Snapshot to restore
    #[arg(long, default_value = LATEST_SNAPSHOT)]
    pub snapshot: String,

    /// Directory where output.json file will be written (keep empty if you don't need to write output in file)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

// Application's internal configuration structs

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Local,
    S3,
    Gcs,
    Azure,
    Swift,
    B2,
    Rest,
}

impl FromStr for Provider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Provider::Local),
            "s3" => Ok(Provider::S3),
            "gcs" => Ok(Provider::Gcs),
            "azure" => Ok(Provider::Azure),
            "swift" => Ok(Provider::Swift),
            "b2" => Ok(Provider::B2),
            "rest" => Ok(Provider::Rest),
            other => Err(AppError::Config(format!(
                "unsupported backend provider {:?}: expected one of local, s3, gcs, azure, swift, b2, rest",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Dir(PathBuf),
    Secret { name: String, namespace: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub provider: Provider,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub path: String,
    pub scratch_dir: PathBuf,
    pub enable_cache: bool,
    pub max_connections: Option<u32>,
    pub credentials: CredentialSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub master: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub namespace: String,
    pub appbinding: String,
    pub appbinding_namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsOptions {
    pub enabled: bool,
    pub pushgateway_url: Option<String>,
    pub dir: Option<PathBuf>,
    pub labels: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub hostname: String,
    pub output_dir: Option<PathBuf>,
    pub metrics: MetricsOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub tool: BackupTool,
    pub pg_args: String,
    pub wait_timeout: u32,
    pub tls_username: Option<String>,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfig {
    pub tool: RestoreTool,
    pub pg_args: String,
    pub wait_timeout: u32,
    pub tls_username: Option<String>,
    pub source_host: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationConfig {
    Backup(BackupConfig),
    Restore(RestoreConfig),
}

/// Everything one invocation needs, validated before any cluster call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub report: ReportConfig,
    pub scheduling: Scheduling,
    pub operation: OperationConfig,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn cluster_config(args: ClusterArgs) -> Result<ClusterConfig> {
    if args.appbinding.trim().is_empty() {
        return Err(AppError::Config("--appbinding must not be empty".to_string()));
    }
    let appbinding_namespace =
        non_empty(args.appbinding_namespace).unwrap_or_else(|| args.namespace.clone());
    Ok(ClusterConfig {
        master: non_empty(args.master),
        kubeconfig: args.kubeconfig,
        namespace: args.namespace,
        appbinding: args.appbinding,
        appbinding_namespace,
    })
}

fn storage_config(args: StorageArgs, namespace: &str) -> Result<StorageConfig> {
    let provider: Provider = args.provider.parse()?;
    let bucket = non_empty(args.bucket).unwrap_or_default();
    let endpoint = non_empty(args.endpoint);

    match provider {
        Provider::Local if non_empty(args.path.clone()).is_none() && bucket.is_empty() => {
            return Err(AppError::Config(
                "local backend requires --path (or --bucket) pointing at the repository directory"
                    .to_string(),
            ));
        }
        Provider::Rest if endpoint.is_none() => {
            return Err(AppError::Config("rest backend requires --endpoint".to_string()));
        }
        Provider::S3 | Provider::Gcs | Provider::Azure | Provider::Swift | Provider::B2
            if bucket.is_empty() =>
        {
            return Err(AppError::Config(format!(
                "{:?} backend requires --bucket",
                provider
            )));
        }
        _ => {}
    }

    let credentials = match (args.secret_dir, non_empty(args.storage_secret_name)) {
        (Some(_), Some(_)) => {
            return Err(AppError::Config(
                "--secret-dir and --storage-secret-name are mutually exclusive".to_string(),
            ));
        }
        (Some(dir), None) => CredentialSource::Dir(dir),
        (None, Some(name)) => CredentialSource::Secret {
            name,
            namespace: non_empty(args.storage_secret_namespace)
                .unwrap_or_else(|| namespace.to_string()),
        },
        (None, None) => {
            return Err(AppError::Config(
                "one of --secret-dir or --storage-secret-name is required".to_string(),
            ));
        }
    };

    Ok(StorageConfig {
        provider,
        bucket,
        endpoint,
        region: non_empty(args.region),
        path: non_empty(args.path).unwrap_or_default(),
        scratch_dir: args.scratch_dir,
        enable_cache: args.enable_cache,
        max_connections: args.max_connections.filter(|n| *n > 0),
        credentials,
    })
}

/// Parses `key=value` label pairs. Malformed entries are skipped.
pub fn parse_metric_labels(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split('=').collect();
            match parts.as_slice() {
                [key, value] if !key.trim().is_empty() => {
                    Some((key.trim().to_string(), value.trim().to_string()))
                }
                _ => {
                    warn!(label = %entry, "Ignoring malformed metrics label");
                    None
                }
            }
        })
        .collect()
}

fn metrics_options(args: MetricsArgs) -> MetricsOptions {
    let options = MetricsOptions {
        enabled: args.enabled,
        pushgateway_url: non_empty(args.pushgateway_url),
        dir: args.dir,
        labels: parse_metric_labels(&args.labels),
    };
    if options.enabled && options.pushgateway_url.is_none() && options.dir.is_none() {
        warn!("Metrics are enabled but neither --metrics-pushgateway-url nor --metrics-dir is set");
    }
    options
}

impl From<SchedulingArgs> for Scheduling {
    fn from(args: SchedulingArgs) -> Self {
        Scheduling {
            nice_adjustment: args.nice_adjustment,
            ionice_class: args.ionice_class,
            ionice_class_data: args.ionice_class_data,
        }
    }
}

impl From<RetentionArgs> for RetentionPolicy {
    fn from(args: RetentionArgs) -> Self {
        RetentionPolicy {
            keep_last: args.keep_last,
            keep_hourly: args.keep_hourly,
            keep_daily: args.keep_daily,
            keep_weekly: args.keep_weekly,
            keep_monthly: args.keep_monthly,
            keep_yearly: args.keep_yearly,
            keep_tags: args
                .keep_tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            prune: args.prune,
            dry_run: args.dry_run,
        }
    }
}

pub fn load_backup_config(args: BackupArgs) -> Result<AppConfig> {
    let tool: BackupTool = args.backup_cmd.trim().parse()?;
    let cluster = cluster_config(args.cluster)?;
    let storage = storage_config(args.storage, &cluster.namespace)?;

    Ok(AppConfig {
        storage,
        report: ReportConfig {
            hostname: args.hostname,
            output_dir: args.output_dir,
            metrics: metrics_options(args.metrics),
        },
        scheduling: args.scheduling.into(),
        operation: OperationConfig::Backup(BackupConfig {
            tool,
            pg_args: args.pg_args,
            wait_timeout: args.wait_timeout,
            tls_username: non_empty(args.tls_username),
            retention: args.retention.into(),
        }),
        cluster,
    })
}

pub fn load_restore_config(args: RestoreArgs) -> Result<AppConfig> {
    let tool: RestoreTool = args.restore_cmd.trim().parse()?;
    let cluster = cluster_config(args.cluster)?;
    let storage = storage_config(args.storage, &cluster.namespace)?;
    let source_host = non_empty(args.source_hostname).unwrap_or_else(|| args.hostname.clone());
    let snapshot = non_empty(Some(args.snapshot)).unwrap_or_else(|| LATEST_SNAPSHOT.to_string());

    Ok(AppConfig {
        storage,
        report: ReportConfig {
            hostname: args.hostname,
            output_dir: args.output_dir,
            metrics: metrics_options(args.metrics),
        },
        scheduling: args.scheduling.into(),
        operation: OperationConfig::Restore(RestoreConfig {
            tool,
            pg_args: args.pg_args,
            wait_timeout: args.wait_timeout,
            tls_username: non_empty(args.tls_username),
            source_host,
            snapshot,
        }),
        cluster,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn backup_args() -> BackupArgs {
        BackupArgs {
            cluster: ClusterArgs {
                master: None,
                kubeconfig: None,
                namespace: "demo".to_string(),
                appbinding: "sample-postgres".to_string(),
                appbinding_namespace: None,
            },
            storage: StorageArgs {
                provider: "s3".to_string(),
                bucket: Some("stash-backup".to_string()),
                endpoint: None,
                region: Some("us-east-1".to_string()),
                path: Some("pg/demo".to_string()),
                secret_dir: Some(PathBuf::from("/etc/repository/secret")),
                storage_secret_name: None,
                storage_secret_namespace: None,
                scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
                enable_cache: false,
                max_connections: None,
            },
            retention: RetentionArgs::default(),
            metrics: MetricsArgs::default(),
            scheduling: SchedulingArgs::default(),
            backup_cmd: "pg_dumpall".to_string(),
            pg_args: String::new(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT_SECS,
            tls_username: None,
            hostname: DEFAULT_HOST.to_string(),
            output_dir: None,
        }
    }

    pub(crate) fn restore_args() -> RestoreArgs {
        let backup = backup_args();
        RestoreArgs {
            cluster: backup.cluster,
            storage: backup.storage,
            metrics: MetricsArgs::default(),
            scheduling: SchedulingArgs::default(),
            restore_cmd: "psql".to_string(),
            pg_args: String::new(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT_SECS,
            tls_username: None,
            hostname: DEFAULT_HOST.to_string(),
            source_hostname: None,
            snapshot: LATEST_SNAPSHOT.to_string(),
            output_dir: None,
        }
    }

    #[test]
    fn test_load_restore_config() -> anyhow::Result<()> {
        let mut args = restore_args();
        args.hostname = "host-1".to_string();
        let config = load_restore_config(args)?;
        match config.operation {
            OperationConfig::Restore(restore) => {
                assert_eq!(restore.tool, RestoreTool::Psql);
                assert_eq!(restore.source_host, "host-1");
                assert_eq!(restore.snapshot, "latest");
            }
            other => panic!("unexpected operation {:?}", other),
        }

        let mut args = restore_args();
        args.source_hostname = Some("host-0".to_string());
        args.snapshot = " ".to_string();
        let config = load_restore_config(args)?;
        let OperationConfig::Restore(restore) = config.operation else {
            panic!("expected restore operation");
        };
        assert_eq!(restore.source_host, "host-0");
        assert_eq!(restore.snapshot, LATEST_SNAPSHOT);

        let mut args = restore_args();
        args.restore_cmd = "pg_restore".to_string();
        assert_eq!(
            load_restore_config(args).unwrap_err().to_string(),
            "invalid pg restore command: expected psql, but instead got pg_restore"
        );
        Ok(())
    }

    #[test]
    fn test_load_backup_config() -> anyhow::Result<()> {
        let mut args = backup_args();
        args.retention.keep_last = Some(5);
        args.retention.keep_tags = vec![" nightly ".to_string(), "".to_string()];
        let config = load_backup_config(args)?;

        assert_eq!(config.cluster.appbinding_namespace, "demo");
        assert_eq!(config.storage.provider, Provider::S3);
        assert_eq!(
            config.storage.credentials,
            CredentialSource::Dir(PathBuf::from("/etc/repository/secret"))
        );
        match config.operation {
            OperationConfig::Backup(backup) => {
                assert_eq!(backup.tool, BackupTool::PgDumpall);
                assert_eq!(backup.retention.keep_last, Some(5));
                assert_eq!(backup.retention.keep_tags, vec!["nightly"]);
            }
            other => panic!("unexpected operation {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_invalid_backup_cmd_fails_before_anything_else() {
        let mut args = backup_args();
        args.backup_cmd = "dropdb".to_string();
        // Storage is broken too, the tool error must win.
        args.storage.provider = "ftp".to_string();
        let err = load_backup_config(args).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(
            err.to_string(),
            "invalid pg backup command: expected pg_dump or pg_dumpall, but instead got dropdb"
        );
    }

    #[test]
    fn test_storage_validation() {
        let mut args = backup_args();
        args.storage.bucket = None;
        assert!(matches!(load_backup_config(args), Err(AppError::Config(_))));

        let mut args = backup_args();
        args.storage.secret_dir = None;
        assert!(matches!(load_backup_config(args), Err(AppError::Config(_))));

        let mut args = backup_args();
        args.storage.storage_secret_name = Some("repo-secret".to_string());
        assert!(matches!(load_backup_config(args), Err(AppError::Config(_))));

        let mut args = backup_args();
        args.storage.provider = "rest".to_string();
        assert!(matches!(load_backup_config(args), Err(AppError::Config(_))));
    }

    #[test]
    fn test_storage_secret_defaults_to_session_namespace() -> anyhow::Result<()> {
        let mut args = backup_args();
        args.storage.secret_dir = None;
        args.storage.storage_secret_name = Some("repo-secret".to_string());
        let config = load_backup_config(args)?;
        assert_eq!(
            config.storage.credentials,
            CredentialSource::Secret {
                name: "repo-secret".to_string(),
                namespace: "demo".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn test_scheduling_carried_into_config() -> anyhow::Result<()> {
        let config = load_backup_config(backup_args())?;
        assert_eq!(config.scheduling, Scheduling::default());

        let mut args = restore_args();
        args.scheduling = SchedulingArgs {
            nice_adjustment: Some(-5),
            ionice_class: Some(2),
            ionice_class_data: Some(7),
        };
        let config = load_restore_config(args)?;
        assert_eq!(config.scheduling.prefix(), vec!["nice", "-n", "-5", "ionice", "-c", "2", "-n", "7"]);
        Ok(())
    }

    #[test]
    fn test_parse_metric_labels() {
        let labels = parse_metric_labels(&[
            "env=prod".to_string(),
            "broken".to_string(),
            "a=b=c".to_string(),
            " team = db ".to_string(),
        ]);
        assert_eq!(
            labels,
            vec![
                ("env".to_string(), "prod".to_string()),
                ("team".to_string(), "db".to_string())
            ]
        );
    }
}
