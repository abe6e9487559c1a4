use crate::bus::Bus;
use crate::error::Result;
use crate::owner::{OwnerHandle, OwnerSettings};
use crate::provider::ProviderRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use vigil_core::config::Config;
use vigil_core::store::Store;

/// Shared runtime state handed to the scheduler, executor, and services.
#[derive(Clone)]
pub struct EngineState {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub providers: Arc<ProviderRegistry>,
    pub bus: Bus,
    owners: Arc<Mutex<HashMap<String, OwnerHandle>>>,
}

impl EngineState {
    pub fn new(store: Store, config: Config, providers: ProviderRegistry) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
            providers: Arc::new(providers),
            bus: Bus::default(),
            owners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The owner for `integration_id`, spawning it on first use.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn owner(&self, integration_id: &str) -> OwnerHandle {
        let mut owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = owners.get(integration_id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let settings = OwnerSettings::from_config(&self.config, integration_id);
        let handle = OwnerHandle::spawn(
            integration_id.to_string(),
            settings,
            self.store.clone(),
            self.bus.clone(),
        );
        owners.insert(integration_id.to_string(), handle.clone());
        handle
    }

    /// Ids of every owner spawned so far.
    pub fn owner_ids(&self) -> Vec<String> {
        let owners = self.owners.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = owners.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run a store operation on the blocking pool.
    pub async fn with_store<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> vigil_core::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        blocking(&self.store, f).await
    }
}

pub(crate) async fn blocking<R, F>(store: &Arc<Store>, f: F) -> Result<R>
where
    F: FnOnce(&Store) -> vigil_core::Result<R> + Send + 'static,
    R: Send + 'static,
{
    let store = store.clone();
    let out = tokio::task::spawn_blocking(move || f(&store)).await??;
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::ProviderAdapter;
    use tempfile::TempDir;
    use vigil_core::paths;

    pub(crate) fn engine_with(
        config: Config,
        adapters: Vec<(&str, Arc<dyn ProviderAdapter>)>,
    ) -> (TempDir, EngineState) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&paths::db_path(dir.path())).unwrap();
        let mut providers = ProviderRegistry::default();
        for (id, adapter) in adapters {
            providers.insert(id, adapter);
        }
        (dir, EngineState::new(store, config, providers))
    }

    #[tokio::test]
    async fn owners_are_reused_per_integration() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        let a = state.owner("github");
        let b = state.owner("github");
        state.owner("jira");
        assert!(a.same_channel(&b));
        assert_eq!(state.owner_ids(), vec!["github", "jira"]);
    }
}
