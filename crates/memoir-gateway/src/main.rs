use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use memoir_agents::AgentContext;
use memoir_core::config::MemoirConfig;
use memoir_llm::{HttpBackend, LlmGateway};
use memoir_narration::NarrationManager;
use memoir_scheduler::TaskLanes;
use memoir_store::{ConfigCache, Store};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod app;
mod http;
mod voice;
mod ws;

#[derive(Parser)]
#[command(name = "memoir-gateway", about = "Memoir narration gateway")]
struct Cli {
    /// Path to memoir.toml (default: ~/.memoir/memoir.toml).
    #[arg(long)]
    config: Option<String>,
    /// Override the bind address from the config file.
    #[arg(long)]
    bind: Option<String>,
    /// Override the port from the config file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memoir_gateway=info,memoir_agents=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = MemoirConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    // Each subsystem holds its own connection to the shared database file;
    // WAL mode and the busy timeout are set by open().
    if let Some(dir) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store_conn = memoir_store::db::open(&config.database.path)?;
    memoir_store::db::init_db(&store_conn)?;
    let store = Arc::new(Store::new(store_conn));

    let narration_conn = memoir_store::db::open(&config.database.path)?;
    memoir_narration::db::init_db(&narration_conn)?;
    let narration = Arc::new(NarrationManager::new(narration_conn));

    let settings_conn = memoir_store::db::open(&config.database.path)?;
    let settings = Arc::new(ConfigCache::new(settings_conn));

    let backend = HttpBackend::new(
        config.provider.api_key.clone(),
        config.provider.base_url.clone(),
    );
    let llm = Arc::new(LlmGateway::new(
        Box::new(backend),
        store.clone(),
        settings.clone(),
    ));

    let shutdown = CancellationToken::new();
    let lanes = Arc::new(TaskLanes::new(shutdown.clone()));
    let agents = Arc::new(AgentContext {
        store,
        narration,
        llm,
        settings,
        lanes,
        shutdown: shutdown.clone(),
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState {
        config,
        agents,
        tts: None,
        asr: None,
        blobs: None,
        shutdown: shutdown.clone(),
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("memoir gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
