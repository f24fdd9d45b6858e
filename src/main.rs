// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

use busgate::config;
use busgate::engine;
use busgate::identity::StaticIdentityResolver;
use busgate::proxy;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "busgate", about = "OpenAI-compatible gateway over a session API and realtime bus")]
struct Cli {
    /// Path to the busgate.yaml config file
    #[arg(long, default_value = "busgate.yaml", env = "BUSGATE_CONFIG")]
    config: String,

    /// Port to listen on (overrides server.port)
    #[arg(long, env = "BUSGATE_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let source = config::FileSource {
        path: std::path::PathBuf::from(cli.config),
    };
    let config = match config::load_config(&source) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = %config.version,
        environment = %config.environment,
        identities = config.identities.len(),
        models = config.models.len(),
        config_hash = %config.config_hash,
        "config loaded"
    );

    let port = cli.port.unwrap_or(config.server.port);
    let addr = SocketAddr::from((proxy::BIND_HOST, port));

    let engine = Arc::new(engine::build_engine(config.clone()));
    let pool = engine.pool().clone();
    pool.start();

    let identities = Arc::new(StaticIdentityResolver::new(config.identities.clone()));
    let app = proxy::build_router(engine, identities);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(%addr, "failed to bind: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "busgate listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("server error: {e}");
    }

    pool.stop().await;
    tracing::info!("busgate stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
