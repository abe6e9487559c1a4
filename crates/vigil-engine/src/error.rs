use thiserror::Error;
use vigil_core::VigilError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] VigilError),

    #[error("no provider registered for integration '{0}'")]
    UnknownProvider(String),

    #[error("owner for integration '{0}' has stopped")]
    OwnerGone(String),

    #[error("alert delivery via {notifier} failed: {reason}")]
    Delivery {
        notifier: &'static str,
        reason: String,
    },

    #[error("invalid provider config for '{integration}': {reason}")]
    InvalidProvider { integration: String, reason: String },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
