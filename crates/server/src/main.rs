// crates/server/src/main.rs
//! History index server binary.
//!
//! Loads the index, starts the directory watcher, then serves the HTTP API
//! until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use history_index_core::SessionRepository;
use history_index_server::config::Config;
use history_index_server::live::bus::EventBus;
use history_index_server::live::gateway::ChangeGateway;
use history_index_server::live::refresh::register_refresh;
use history_index_server::live::watcher::DirectoryWatcher;
use history_index_server::{create_app, init_metrics, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Quiet by default; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .compact()
        .init();

    let config = Config::parse().resolve()?;
    init_metrics();

    eprintln!("\n\u{1f50d} history-index v{}\n", env!("CARGO_PKG_VERSION"));

    let startup = Instant::now();
    let repository = Arc::new(SessionRepository::new(
        &config.history_path,
        &config.projects_dir,
    ));
    // Watcher events land on `bus`; clients hear about them on `relay`
    // after the index has been refreshed.
    let bus = EventBus::new();
    let relay = EventBus::new();
    register_refresh(&bus, Arc::clone(&repository), relay.clone());

    let snapshot = repository.load_all().await;
    let stats = snapshot.stats();
    tracing::info!(
        sessions = stats.entity_count,
        projects = stats.container_count,
        elapsed_ms = startup.elapsed().as_millis() as u64,
        "Initial index loaded"
    );

    let mut watcher = DirectoryWatcher::new(bus.clone(), config.debounce);
    if config.watch {
        watcher
            .start(&config.projects_dir)
            .with_context(|| format!("failed to watch {}", config.projects_dir.display()))?;
    }

    let gateway = ChangeGateway::new(relay, config.heartbeat);
    let state = AppState::new(repository, bus, gateway);
    let app = create_app(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    eprintln!(
        "  \u{2713} Ready: {} sessions in {} projects",
        stats.entity_count, stats.container_count
    );
    eprintln!("  \u{2192} http://localhost:{}\n", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher.stop();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
