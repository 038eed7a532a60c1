// Session reporting: output.json and metrics.
pub mod metrics;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info};

use crate::config::ReportConfig;
use crate::errors::Result;
use crate::session::SessionResult;

pub use metrics::{SessionKind, Target};

pub const OUTPUT_FILE_NAME: &str = "output.json";

/// Turns the outcome of a session into the result that gets reported.
/// Errors become a `Failed` result carrying the error text and no stats.
pub fn finalize(outcome: Result<SessionResult>, hostname: &str, started: Instant) -> SessionResult {
    match outcome {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Session failed");
            SessionResult::failed(hostname, started.elapsed().as_secs_f64(), e.to_string())
        }
    }
}

pub fn write_output(dir: &Path, result: &SessionResult) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(OUTPUT_FILE_NAME);
    fs::write(&path, serde_json::to_vec_pretty(result)?)?;
    info!(path = %path.display(), phase = ?result.phase, "Wrote session output");
    Ok(path)
}

/// Writes `output.json` first, then metrics, so a metrics failure never
/// loses the output file.
pub async fn publish(
    result: &SessionResult,
    report: &ReportConfig,
    kind: SessionKind,
    target: &Target,
) -> Result<()> {
    if let Some(dir) = &report.output_dir {
        write_output(dir, result)?;
    }
    if report.metrics.enabled {
        let registry = metrics::build_registry(result, kind, &report.metrics, target)?;
        metrics::send(&registry, &report.metrics, kind.job()).await?;
    }
    Ok(())
}
