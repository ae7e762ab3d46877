use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use stingbot_core::GatewayConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

mod http;
mod state;
mod ws;

pub use state::AppState;

/// Real-time bridge between WebSocket clients and the mission executor.
#[derive(Debug, Default, Parser)]
#[command(name = "stingbot-gateway", version)]
pub struct Cli {
    /// TOML config file. Defaults to `stingbot.toml` in the current directory
    /// when that file exists.
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<IpAddr>,

    /// Port to listen on.
    #[arg(long = "port", short = 'p', value_name = "PORT")]
    pub port: Option<u16>,

    /// Executor program launched for each mission.
    #[arg(long = "executor", value_name = "PROGRAM")]
    pub executor: Option<PathBuf>,

    /// Working directory of the executor.
    #[arg(long = "working-dir", value_name = "DIR")]
    pub working_dir: Option<PathBuf>,
}

impl Cli {
    /// Loads the config file and applies flag overrides on top of it.
    pub fn resolve_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = GatewayConfig::load(self.config.as_deref())?;
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(program) = &self.executor {
            config.executor.program = program.clone();
        }
        if let Some(dir) = &self.working_dir {
            config.executor.working_dir = dir.clone();
        }
        config.validate()?;
        config.resolve_working_dir()?;
        Ok(config)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/api/health", get(http::health))
        .route("/api/status", get(http::status))
        .with_state(state)
}

/// Serves on `listener` until `shutdown` resolves, then tears down every
/// session.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = state.shutdown.clone();
    let app = router(Arc::clone(&state));
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            token.cancel();
        })
        .await;
    state.shutdown.cancel();
    state.registry.shutdown();
    result.context("gateway server failed")
}

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let config = cli.resolve_config()?;
    let addr = config.server.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        executor = %config.executor.program.display(),
        working_dir = %config.executor.working_dir.display(),
        "stingbot gateway listening"
    );

    let state = AppState::new(config.bridge(), CancellationToken::new());
    serve(listener, state, shutdown_signal()).await?;
    info!("stingbot gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        // Without a signal handler the gateway runs until killed.
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
