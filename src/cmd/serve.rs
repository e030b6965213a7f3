//! HTTP server command: `conductor serve`.

use anyhow::{Context, Result};
use conductor::config::ConductorConfig;
use conductor::http::HttpServer;
use std::sync::Arc;

use super::build_engine;

pub async fn cmd_serve(config: ConductorConfig, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let engine = Arc::new(build_engine(&config));
    if engine.action_count() == 0 {
        tracing::warn!("no actions registered; every request will be answered with 404");
    }

    let _dispatcher = engine
        .start()
        .context("Failed to start the action dispatcher")?;
    let mut server = HttpServer::new(engine);
    let addr = server.start(&bind).await?;
    println!("Listening on http://{}", addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    server.stop();
    Ok(())
}
