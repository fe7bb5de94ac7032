/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FerroDB - MongoDB wire-compatible proxy for PostgreSQL
 * Built with Rust for superior performance and reliability
 *
 * @file main.rs
 * @brief FerroDB server entry point
 */

use std::path::Path;
use std::sync::Arc;

use ferrodb::logger::init_tracing;
use ferrodb::server::verify_backend;
use ferrodb::shutdown::shutdown_channel;
use ferrodb::{Config, PostgresBackend, Server};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = Config::load_layered(config_path.as_deref().map(Path::new))?;

    init_tracing(&config.logging.level);

    info!("FerroDB {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        address = config.listen_addr().as_str(),
        pool_size = config.postgresql.pool_size,
        "configuration loaded"
    );

    let backend = PostgresBackend::connect(&config.postgresql).await?;
    verify_backend(&backend).await?;
    info!("PostgreSQL backend reachable");

    let (shutdown_handle, shutdown) = shutdown_channel();
    shutdown_handle.trigger_on_ctrl_c();

    let server = Server::new(config, Arc::new(backend));
    server.run(shutdown).await?;

    info!("server stopped");
    Ok(())
}
