pub mod alert;
pub mod attempts;
pub mod classify;
pub mod config;
pub mod control;
pub mod freshness;
pub mod health;
pub mod init;
pub mod run;
pub mod task;
pub mod tick;

use anyhow::Context;
use std::path::Path;
use vigil_core::{config::Config, paths, store::Store};
use vigil_engine::{provider::ProviderRegistry, EngineState};

pub(crate) fn open_store(root: &Path) -> anyhow::Result<Store> {
    let path = paths::db_path(root);
    if !path.exists() {
        anyhow::bail!("no store at {}; run `vigil init` first", path.display());
    }
    Store::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

pub(crate) fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).context("failed to load .vigil/config.yaml")
}

/// Store, config, and provider adapters wired for the engine.
pub(crate) fn engine_state(root: &Path) -> anyhow::Result<EngineState> {
    let config = load_config(root)?;
    let providers = ProviderRegistry::from_config(&config).context("invalid provider config")?;
    let store = open_store(root)?;
    Ok(EngineState::new(store, config, providers))
}
