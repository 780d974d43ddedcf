use std::sync::Arc;

use tracing::{info, warn};
use tvbridge_core::{server, BridgeState};

use crate::{AppContext, Result};

pub async fn execute(context: AppContext) -> Result<()> {
    context.engine.recover_cache().await?;
    let reconciled = context.store.recalculate_series_aggregates()?;
    info!(reconciled, "series aggregates reconciled");

    let state = BridgeState {
        store: context.store.clone(),
        engine: Arc::clone(&context.engine),
        pool: Arc::clone(&context.pool),
        guide: Arc::clone(&context.guide),
        discovery: Arc::clone(&context.discovery),
        sync: Arc::clone(&context.sync),
    };

    // Initial discovery and catalog sync are best-effort; the appliances may
    // still be booting when we are.
    match state.discovery.discover().await {
        Ok(appliances) => {
            state.pool.register_appliances(&appliances).await;
            if let Err(err) = state.sync.sync_all().await {
                warn!(error = %err, "initial catalog sync failed");
            }
        }
        Err(err) => warn!(error = %err, "initial discovery failed"),
    }

    server::spawn_background_tasks(&state);

    let listen_addr = context.config.server.listen_addr.clone();
    tokio::select! {
        result = server::run(state.clone(), &listen_addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            state.engine.shutdown().await;
            state.pool.shutdown().await;
        }
    }
    Ok(())
}
