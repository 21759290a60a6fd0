//! RaptGen job server.

use std::path::PathBuf;
use std::sync::Arc;

use raptgen_core::RaptgenConfig;
use raptgen_runtime::Orchestrator;
use raptgen_server::{build_router, AppState};
use raptgen_store::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn resolve_data_dir() -> PathBuf {
    std::env::var("RAPTGEN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--help" | "-h" | "help" => {
                println!("RaptGen job server");
                println!();
                println!("Usage: raptgen");
                println!();
                println!("Environment:");
                println!("  RAPTGEN_DATA_DIR           Data directory (default: data)");
                println!("  PORT                       HTTP port (default: 8000)");
                println!("  RAPTGEN_GATE_CAPACITY      Concurrent units per device (default: 2)");
                println!("  RAPTGEN_GATE_CAPACITIES    Per-device overrides, e.g. CPU=4,CUDA:0=1");
                println!("  RAPTGEN_WAIT_TIMEOUT_SECS  Suspend/resume deadline (default: 600)");
                println!("  RAPTGEN_TRAINER_SCRIPT     Trainer worker script");
                println!("  RAPTGEN_PYTHON             Interpreter for the worker script");
                return Ok(());
            }
            other => {
                eprintln!("Unknown command: {}. Use 'raptgen help' for usage.", other);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = RaptgenConfig::from_env(&data_dir)?;
    let port = config.port;

    let store = SqliteStore::open(&config.data_paths.db)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    let orchestrator = Orchestrator::from_config(Arc::new(store), &config);

    // The task queue does not survive a restart
    orchestrator.recover_stranded()?;

    let state = Arc::new(AppState::new(orchestrator));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("RaptGen server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
