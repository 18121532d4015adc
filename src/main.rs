use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wscom::{AppState, Config, ConnectionRegistry, HandlerTable, StatusHandler};

#[derive(Parser, Debug)]
#[command(name = "wscom", about = "WebSocket request-multiplexing server")]
struct Cli {
    /// Address to bind (overrides config file).
    #[arg(long, env = "WSCOM_BIND")]
    bind: Option<SocketAddr>,

    /// Path to a TOML config file.
    #[arg(long, env = "WSCOM_CONFIG", default_value = "wscom.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wscom=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config)? {
        Some(config) => {
            tracing::info!(path = %cli.config.display(), "loaded config");
            config
        }
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let registry = ConnectionRegistry::new();
    let mut handlers = HandlerTable::new();
    handlers.register("sys", Arc::new(StatusHandler::new(registry.clone())))?;

    let state = AppState::with_registry(handlers, registry, config);
    wscom::server::serve(state).await
}
