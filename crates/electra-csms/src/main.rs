mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use csms_api::create_app;
use csms_engine::{Engine, EventSink, TracingSink};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::config::CsmsConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Command line arguments for the electra-csms server
#[derive(Parser, Debug)]
#[command(name = "electra-csms")]
#[command(about = "Electra Charging Station Management System")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Port to bind the server to, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind the server to, overrides the configuration file
    #[arg(short, long)]
    bind: Option<String>,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = CsmsConfig::load(&args.config).await?;
    tracing::info!(
        path = %args.config.display(),
        stations = config.stations.len(),
        groups = config.groups.len(),
        profiles = config.profiles.len(),
        "Loaded configuration"
    );

    let store = Arc::new(config.build_store());
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let engine = Engine::start(config.engine_config(), store, sink);
    let app = create_app(engine.clone());

    let bind = args.bind.unwrap_or(config.server.bind);
    let port = args.port.unwrap_or(config.server.port);
    let bind_addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    tracing::info!(%bind_addr, "Starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    engine.shutdown();
    Ok(())
}
