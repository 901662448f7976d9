use std::sync::Arc;

use axum::{routing::get, Router};
use memoir_agents::AgentContext;
use memoir_core::config::MemoirConfig;
use tokio_util::sync::CancellationToken;

use crate::voice::{AsrEngine, BlobStore, TtsEngine};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    #[allow(dead_code)]
    pub config: MemoirConfig,
    pub agents: Arc<AgentContext>,
    /// Speech synthesis for assistant replies. None runs text-only.
    pub tts: Option<Arc<dyn TtsEngine>>,
    /// Speech recognition for client audio. None expects pre-transcribed turns.
    #[allow(dead_code)]
    pub asr: Option<Arc<dyn AsrEngine>>,
    /// Object store for voice clips. None skips audio persistence.
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub shutdown: CancellationToken,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
