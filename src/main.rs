//! OrgLoop engine - main entry point.
//!
//! Loads the engine configuration from the JSON file named by
//! `ORGLOOP_CONFIG` (default `./orgloop.json`), starts the engine with an
//! empty connector registry plus the tracing observer, and runs until
//! SIGINT/SIGTERM. Connector crates embed the engine as a library and
//! register their sources and actors instead of using this binary directly.

use std::path::PathBuf;
use std::sync::Arc;

use orgloop::config::EngineConfig;
use orgloop::connector::Registry;
use orgloop::engine::Engine;
use orgloop::observe::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn config_path() -> PathBuf {
    std::env::var("ORGLOOP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./orgloop.json"))
}

fn load_config(path: &PathBuf) -> EngineConfig {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("invalid config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %path.display(),
                "no config file found, starting with defaults (no sources or routes)"
            );
            EngineConfig {
                data_dir: PathBuf::from("./data"),
                ..serde_json::from_str("{}").expect("empty config deserializes")
            }
        }
        Err(e) => {
            eprintln!("cannot read config {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orgloop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = config_path();
    let config = load_config(&path);

    tracing::info!(
        config = %path.display(),
        data_dir = %config.data_dir.display(),
        listen = %config.listener.addr,
        sources = config.sources.len(),
        routes = config.routes.len(),
        "starting orgloop"
    );

    let registry = Registry::new();
    let engine = match Engine::start(config, registry, vec![Arc::new(TracingLogger)]).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("engine failed to start: {e}");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    engine.shutdown().await;
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
