use thiserror::Error;

use crate::RunLog;

/// Error taxonomy for the experiment-execution core.
///
/// Only `Execution` represents an external-process fault and is the expected
/// retry point (redo setup+run). `Configuration`, `Setup` and
/// `MeasureExtraction` indicate a caller or interface mismatch and must not
/// be silently retried.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unrecognized parameter '{name}' is not declared in scope '{scope}'")]
    Configuration { scope: String, name: String },

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("core model execution failed: {reason}")]
    Execution { reason: String, log: RunLog },

    #[error("measure '{measure}' missing from model output")]
    MeasureExtraction { measure: String },

    #[error("{operation} requires phase {required} but model is at {actual}")]
    Phase {
        operation: &'static str,
        required: &'static str,
        actual: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Short stable tag used in design reports and persisted run records.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::Configuration { .. } => "configuration",
            ModelError::Setup(_) => "setup",
            ModelError::Execution { .. } => "execution",
            ModelError::MeasureExtraction { .. } => "measure_extraction",
            ModelError::Phase { .. } => "phase",
            ModelError::Store(_) => "store",
            ModelError::Io(_) => "io",
            ModelError::Yaml(_) => "yaml",
            ModelError::Json(_) => "json",
        }
    }

    /// Whether a caller may reasonably retry by redoing setup+run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Execution { .. })
    }
}
