//! Error types for imgflow.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing or malformed configuration. Always raised before a stage does work.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Source archive could not be fetched.
    #[error("download error: {0}")]
    Download(String),

    /// Archive is corrupt or in an unsupported format.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Dataset is unusable for training or evaluation.
    #[error("training error: {0}")]
    Training(String),

    /// Metrics sink transport unreachable. Never escapes the sink.
    #[error("metrics sink unavailable: {0}")]
    SinkUnavailable(String),

    /// A stage's declared input is absent from the artifact store.
    #[error("dependency error: stage `{stage}` requires {artifact} at {path:?}")]
    Dependency {
        stage: String,
        artifact: String,
        path: PathBuf,
    },

    /// A persisted model artifact is unreadable or inconsistent.
    #[error("model error: {0}")]
    Model(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a configuration error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable name of the error kind, printed by the CLI on failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "ConfigurationError",
            Self::Download(_) => "DownloadError",
            Self::Extraction(_) => "ExtractionError",
            Self::Training(_) => "TrainingError",
            Self::SinkUnavailable(_) => "SinkUnavailableError",
            Self::Dependency { .. } => "DependencyError",
            Self::Model(_) => "ModelError",
            Self::Io { .. } => "IoError",
        }
    }

    /// Whether the error is handled where it occurs instead of aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SinkUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PipelineError::config("missing key `classes`");
        assert_eq!(err.to_string(), "configuration error: missing key `classes`");

        let err = PipelineError::Training("dataset directory is empty".into());
        assert!(err.to_string().contains("dataset directory is empty"));
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(PipelineError::config("x").kind(), "ConfigurationError");
        assert_eq!(PipelineError::Download("x".into()).kind(), "DownloadError");
        assert_eq!(PipelineError::Extraction("x".into()).kind(), "ExtractionError");
        assert_eq!(PipelineError::Training("x".into()).kind(), "TrainingError");
        assert_eq!(
            PipelineError::SinkUnavailable("x".into()).kind(),
            "SinkUnavailableError"
        );
    }

    #[test]
    fn only_sink_errors_are_recoverable() {
        assert!(PipelineError::SinkUnavailable("down".into()).is_recoverable());
        assert!(!PipelineError::Download("down".into()).is_recoverable());
        assert!(!PipelineError::config("bad").is_recoverable());
    }
}
