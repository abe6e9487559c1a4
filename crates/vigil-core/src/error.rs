use thiserror::Error;

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("not initialized: run 'vigil init'")]
    NotInitialized,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("alert not found: {0}")]
    AlertNotFound(String),

    #[error("control not found: {0}")]
    ControlNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("unknown integration: {0}")]
    UnknownIntegration(String),

    #[error("invalid frequency '{0}': expected hourly, daily, weekly, or 'every <n><s|m|h|d>'")]
    InvalidFrequency(String),

    #[error("invalid id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidId(String),

    #[error("unknown error category '{0}'")]
    UnknownCategory(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VigilError>;
