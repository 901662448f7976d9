use std::sync::Arc;

use memoir_llm::LlmGateway;
use memoir_narration::{NarrationManager, SessionBudget};
use memoir_scheduler::TaskLanes;
use memoir_store::types::RoleTunables;
use memoir_store::{ConfigCache, Store};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything the three engines share. The engines never call each other —
/// triggers are messages posted to the per-user lanes, which is the one
/// serialization point for all background work.
pub struct AgentContext {
    pub store: Arc<Store>,
    pub narration: Arc<NarrationManager>,
    pub llm: Arc<LlmGateway>,
    pub settings: Arc<ConfigCache>,
    pub lanes: Arc<TaskLanes>,
    pub shutdown: CancellationToken,
}

impl AgentContext {
    /// Queue a Stenographer run behind any in-flight background work for
    /// this user. Called when the cache pool crosses its threshold.
    pub fn enqueue_stenographer(self: &Arc<Self>, user_id: &str) {
        let ctx = self.clone();
        let user = user_id.to_string();
        self.lanes.submit(user_id, "stenographer", async move {
            if let Err(e) = crate::stenographer::run(&ctx, &user).await {
                warn!(user_id = %user, error = %e, "stenographer run failed");
            }
        });
    }

    /// Queue a Director run. Called after each successful extraction.
    pub fn enqueue_director(self: &Arc<Self>, user_id: &str) {
        let ctx = self.clone();
        let user = user_id.to_string();
        self.lanes.submit(user_id, "director", async move {
            if let Err(e) = crate::director::run(&ctx, &user).await {
                warn!(user_id = %user, error = %e, "director run failed");
            }
        });
    }
}

/// The session budget an agent's validity check runs against.
pub(crate) fn budget_of(tunables: &RoleTunables) -> SessionBudget {
    SessionBudget {
        word_limit: tunables.word_limit,
        expire_duration_secs: tunables.expire_duration_secs,
        expire_buffer_secs: tunables.expire_buffer_secs,
    }
}
