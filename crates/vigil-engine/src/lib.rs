//! Async runtime for vigil: scheduler, executor, per-integration owners,
//! alerting, and the daemon that ties them together.

pub mod alerting;
pub mod bus;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod notifier;
pub mod owner;
pub mod provider;
pub mod scheduler;
pub mod state;

pub use error::{EngineError, Result};
pub use state::EngineState;
