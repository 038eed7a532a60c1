use std::io;

use tracing::Level;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_subscriber::{layer::SubscriberExt, registry};

/// Installs the global subscriber. Logs go to stderr so stdout stays free for
/// the tools being piped.
pub fn init_logger(level: Level) -> Result<(), SetGlobalDefaultError> {
    let filter = tracing_subscriber::filter::Targets::new()
        .with_default(level)
        // kube and hyper are chatty at debug
        .with_target("kube_client", Level::WARN.min(level))
        .with_target("hyper_util", Level::WARN.min(level));

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    set_global_default(registry().with(layer).with(filter))
}
