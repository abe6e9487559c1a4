pub mod alert;
pub mod attempt;
pub mod backoff;
pub mod breaker;
pub mod classifier;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod freshness;
pub mod health;
pub mod io;
pub mod paths;
pub mod retry;
pub mod store;
pub mod task;

pub use error::{Result, VigilError};
