use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid or missing configuration. The message is surfaced verbatim.
    #[error("{0}")]
    Config(String),

    #[error("database is not ready: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubernetes client configuration error: {0}")]
    KubeConfig(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("{operation} session failed: {message}")]
    SessionFailed { operation: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_message_is_not_prefixed() {
        let err = AppError::Config("invalid pg backup command".to_string());
        assert_eq!(err.to_string(), "invalid pg backup command");
    }

    #[test]
    fn unavailable_and_session_messages() {
        let err = AppError::Unavailable("timeout".into());
        assert_eq!(err.to_string(), "database is not ready: timeout");
        let err = AppError::SessionFailed {
            operation: "backup",
            message: "restic exited with 1".into(),
        };
        assert_eq!(err.to_string(), "backup session failed: restic exited with 1");
    }
}
