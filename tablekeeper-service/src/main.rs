use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod batch;
mod config;
mod context;
mod db;
mod error;
mod i18n;
mod llm;
mod service;
mod session;
mod tool_bridge;
mod tools;
mod websocket;

use crate::config::{RuntimeConfig, load_static_config};
use crate::db::Database;
use crate::llm::ClaudeClient;
use crate::service::TablekeeperService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting Tablekeeper service v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Static config first; it says where the database lives
    let static_config = load_static_config()?;
    info!(
        host = %static_config.server.host,
        port = static_config.server.port,
        "Static configuration loaded"
    );

    std::fs::create_dir_all(&static_config.storage.data_dir)?;

    let db_path = static_config.storage.data_dir.join("tablekeeper.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let runtime_config = Arc::new(RuntimeConfig::load(static_config, &db)?);
    info!(
        model = %runtime_config.dynamic().llm.model,
        "Runtime configuration loaded with DB settings"
    );

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder, /metrics disabled");
            None
        }
    };

    let llm = Arc::new(ClaudeClient::new(runtime_config.clone())?);
    let service = Arc::new(TablekeeperService::new(db, runtime_config.clone(), llm));

    let app = api::router(service, metrics);

    let addr = format!(
        "{}:{}",
        runtime_config.static_config.server.host, runtime_config.static_config.server.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tablekeeper_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
