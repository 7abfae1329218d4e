//! HTTP server and background tasks

use crate::config::ServerConfig;
use crate::exit_node::HttpExitNodeClient;
use crate::outbox::OutboxWorker;
use crate::registry::Registry;
use crate::routes::{router, AppState};
use fossorial_common::Database;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Open the database, start the outbox worker and serve the API until ctrl-c
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let db = Database::open(&config.db_path)?;
    info!("Database opened at {}", config.db_path.display());

    let client = Arc::new(HttpExitNodeClient::new(
        Registry::new(db.clone()),
        &config.exit_node,
        &config.newt,
    )?);
    let state = Arc::new(AppState::new(db, &config, client));

    let worker = OutboxWorker::new(state.reconciler.clone());
    let worker_handle = tokio::spawn(worker.run());

    let app = router(state).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Fossorial API listening on http://{}/api/v1", config.listen);

    let server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = worker_handle => {
            if let Err(e) = result {
                error!("Outbox worker error: {}", e);
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}
