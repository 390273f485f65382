use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod http;
mod timing;

/// HTTP facade for the HydroChat conversational agent.
#[derive(Parser)]
#[command(name = "hydrochat-gateway")]
struct Cli {
    /// Path to a TOML config file (HYDRO_* env vars override it).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hydrochat_gateway=info,hydrochat=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var("HYDRO_CONFIG").ok());
    let config = hydrochat_core::config::HydroConfig::load(config_path.as_deref())?;

    if let Some(token) = &config.auth_token {
        hydrochat_core::logfmt::register_bearer_token(token);
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(config));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("HydroChat gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
