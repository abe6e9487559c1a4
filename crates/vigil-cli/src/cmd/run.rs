use super::engine_state;
use std::path::Path;
use std::sync::Arc;
use vigil_engine::{daemon, notifier::FanOut};

pub fn run(root: &Path) -> anyhow::Result<()> {
    let state = engine_state(root)?;
    let notifier = Arc::new(FanOut::from_webhook(state.config.alerting.webhook_url.as_deref()));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        };
        daemon::run(state, notifier, shutdown).await
    })?;
    Ok(())
}
