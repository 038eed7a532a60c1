//! Prometheus metrics for backup and restore sessions
//!
//! Every invocation builds a fresh registry of gauges from its `SessionResult`
//! and hands it to a Pushgateway and/or a text file that a node exporter can
//! pick up.
//!
//! ## Backup gauges
//! - `stash_backup_host_backup_success`
//! - `stash_backup_host_backup_duration_seconds`
//! - `stash_backup_host_data_{size_bytes,uploaded_bytes,processing_time_seconds}`
//! - `stash_backup_host_files_{total,new,modified,unmodified}`
//! - `stash_repository_{integrity,size_bytes,snapshot_count,snapshot_cleaned}`
//! - `stash_backup_last_success_time_seconds` (successful sessions only)
//!
//! ## Restore gauges
//! - `stash_restore_host_restore_success`
//! - `stash_restore_host_restore_duration_seconds`

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use reqwest::header::CONTENT_TYPE;
use tracing::info;

use crate::config::MetricsOptions;
use crate::errors::{AppError, Result};
use crate::session::SessionResult;

pub const NAMESPACE: &str = "stash";
pub const METRICS_FILE_NAME: &str = "metric.prom";
pub const TARGET_KIND: &str = "AppBinding";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Backup,
    Restore,
}

impl SessionKind {
    /// Pushgateway job name.
    pub fn job(&self) -> &'static str {
        match self {
            SessionKind::Backup => "stash-postgres-backup",
            SessionKind::Restore => "stash-postgres-restore",
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            SessionKind::Backup => "backup",
            SessionKind::Restore => "restore",
        }
    }
}

/// The object the session worked on, used for metric labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub namespace: String,
}

fn const_labels(
    options: &MetricsOptions,
    hostname: &str,
    target: &Target,
) -> HashMap<String, String> {
    let mut labels: HashMap<String, String> = options.labels.iter().cloned().collect();
    labels.insert("hostname".to_string(), hostname.to_string());
    labels.insert("kind".to_string(), TARGET_KIND.to_string());
    labels.insert("name".to_string(), target.name.clone());
    labels.insert("namespace".to_string(), target.namespace.clone());
    labels
}

struct GaugeSet<'a> {
    registry: Registry,
    labels: &'a HashMap<String, String>,
}

impl GaugeSet<'_> {
    fn set(&self, subsystem: &str, name: &str, help: &str, value: f64) -> Result<()> {
        let opts = Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem)
            .const_labels(self.labels.clone());
        let gauge = Gauge::with_opts(opts)?;
        gauge.set(value);
        self.registry.register(Box::new(gauge))?;
        Ok(())
    }
}

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

pub fn build_registry(
    result: &SessionResult,
    kind: SessionKind,
    options: &MetricsOptions,
    target: &Target,
) -> Result<Registry> {
    let labels = const_labels(options, &result.hostname, target);
    let gauges = GaugeSet {
        registry: Registry::new(),
        labels: &labels,
    };

    match kind {
        SessionKind::Backup => {
            gauges.set(
                "backup",
                "host_backup_success",
                "Indicates whether the entire backup was taken successfully",
                flag(result.is_success()),
            )?;
            gauges.set(
                "backup",
                "host_backup_duration_seconds",
                "Time taken to complete the backup process",
                result.duration_seconds,
            )?;
            if let Some(snapshot) = &result.snapshot_stats {
                gauges.set(
                    "backup",
                    "host_data_size_bytes",
                    "Total size of the dump",
                    snapshot.total_size_bytes as f64,
                )?;
                gauges.set(
                    "backup",
                    "host_data_uploaded_bytes",
                    "Amount of data uploaded in the last backup",
                    snapshot.uploaded_bytes as f64,
                )?;
                gauges.set(
                    "backup",
                    "host_data_processing_time_seconds",
                    "Time spent storing the dump in the repository",
                    snapshot.processing_time_seconds,
                )?;
                gauges.set("backup", "host_files_total", "Total files in the snapshot", snapshot.files.total as f64)?;
                gauges.set("backup", "host_files_new", "New files in the snapshot", snapshot.files.new as f64)?;
                gauges.set(
                    "backup",
                    "host_files_modified",
                    "Files modified since the previous snapshot",
                    snapshot.files.modified as f64,
                )?;
                gauges.set(
                    "backup",
                    "host_files_unmodified",
                    "Files unchanged since the previous snapshot",
                    snapshot.files.unmodified as f64,
                )?;
            }
            if let Some(repo) = &result.repository_stats {
                gauges.set(
                    "repository",
                    "integrity",
                    "Result of the repository integrity check after the last backup",
                    flag(repo.integrity),
                )?;
                gauges.set("repository", "size_bytes", "Total size of the repository", repo.size_bytes as f64)?;
                gauges.set(
                    "repository",
                    "snapshot_count",
                    "Number of snapshots stored in the repository",
                    repo.snapshot_count as f64,
                )?;
                gauges.set(
                    "repository",
                    "snapshot_cleaned",
                    "Number of snapshots removed by the last retention run",
                    repo.snapshots_removed_on_last_cleanup as f64,
                )?;
            }
            if result.is_success() {
                gauges.set(
                    "backup",
                    "last_success_time_seconds",
                    "Unix time of the last successful backup",
                    chrono::Utc::now().timestamp() as f64,
                )?;
            }
        }
        SessionKind::Restore => {
            gauges.set(
                "restore",
                "host_restore_success",
                "Indicates whether the restore succeeded",
                flag(result.is_success()),
            )?;
            gauges.set(
                "restore",
                "host_restore_duration_seconds",
                "Time taken to complete the restore process",
                result.duration_seconds,
            )?;
        }
    }
    Ok(gauges.registry)
}

/// Text exposition format of everything in `registry`.
pub fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| AppError::Backend(format!("metrics are not valid UTF-8: {}", e)))
}

async fn push(url: &str, job: &str, body: String) -> Result<()> {
    let endpoint = format!("{}/metrics/job/{}", url.trim_end_matches('/'), job);
    reqwest::Client::new()
        .put(&endpoint)
        .header(CONTENT_TYPE, TextEncoder::new().format_type())
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    info!(url = %endpoint, "Pushed metrics");
    Ok(())
}

/// Pushes the registry to the Pushgateway and writes `metric.prom`, whichever
/// of the two is configured. Returns the path of the written file.
pub async fn send(registry: &Registry, options: &MetricsOptions, job: &str) -> Result<Option<PathBuf>> {
    let body = render(registry)?;
    if let Some(url) = &options.pushgateway_url {
        push(url, job, body.clone()).await?;
    }
    match &options.dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(METRICS_FILE_NAME);
            fs::write(&path, body)?;
            info!(path = %path.display(), "Wrote metrics file");
            Ok(Some(path))
        }
        None => Ok(None),
    }
}
