use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use memoir_core::AgentRole;
use memoir_store::types::{LlmCallRecord, ModelEntry, RoleTunables};
use memoir_store::{ConfigCache, Store};
use tokio::sync::mpsc;
use tracing::info;

use crate::api::{InputMessage, ResponseBackend, ResponseRequest, Usage};
use crate::error::LlmError;
use crate::stream::StreamEvent;

/// Uniform call surface over the Responses API, one entry point per agent.
///
/// Each call records one telemetry row (token counts broken out into total /
/// prompt / completion / cached, plus a catalog-priced cost). Telemetry is
/// off the hot path: a failed write is logged inside the store and dropped.
pub struct LlmGateway {
    backend: Box<dyn ResponseBackend>,
    store: Arc<Store>,
    settings: Arc<ConfigCache>,
}

/// Result of a completed non-streaming call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub response_id: String,
    pub content: String,
    pub usage: Usage,
}

/// Result of a completed streaming call. The text itself was delivered
/// through the caller's event channel.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub response_id: String,
    pub usage: Usage,
}

impl LlmGateway {
    pub fn new(
        backend: Box<dyn ResponseBackend>,
        store: Arc<Store>,
        settings: Arc<ConfigCache>,
    ) -> Self {
        Self {
            backend,
            store,
            settings,
        }
    }

    /// Foreground streaming call for the Interviewer.
    ///
    /// When the global caching toggle is off the call is stateless from the
    /// provider's perspective: the previous response id is not forwarded and
    /// the caller is expected to rebuild context in the input itself.
    pub async fn interviewer_stream(
        &self,
        user_id: &str,
        tunables: &RoleTunables,
        input: Vec<InputMessage>,
        previous_response_id: Option<String>,
        expire_at: DateTime<Utc>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamSummary, LlmError> {
        let caching = self.settings.llm_caching_enabled();
        let req = ResponseRequest {
            model: tunables.model.api_model_id.clone(),
            input,
            temperature: tunables.temperature,
            stream: true,
            expire_at: expire_at.timestamp(),
            previous_response_id: if caching { previous_response_id } else { None },
            json_output: false,
            caching,
        };
        self.run_stream(AgentRole::Interviewer, user_id, &tunables.model, req, tx)
            .await
    }

    /// Background extraction call for the Stenographer: JSON output is
    /// forced and the hosted response cache is never used, but the session
    /// chain (previous response id) is kept.
    pub async fn stenographer_call(
        &self,
        user_id: &str,
        tunables: &RoleTunables,
        input: Vec<InputMessage>,
        previous_response_id: Option<String>,
        expire_at: DateTime<Utc>,
    ) -> Result<CallOutcome, LlmError> {
        let req = ResponseRequest {
            model: tunables.model.api_model_id.clone(),
            input,
            temperature: tunables.temperature,
            stream: false,
            expire_at: expire_at.timestamp(),
            previous_response_id,
            json_output: true,
            caching: false,
        };
        self.run_call(AgentRole::Stenographer, user_id, &tunables.model, req)
            .await
    }

    /// Background advisory call for the Director. Caching follows the same
    /// global toggle as the Interviewer.
    pub async fn director_call(
        &self,
        user_id: &str,
        tunables: &RoleTunables,
        input: Vec<InputMessage>,
        previous_response_id: Option<String>,
        expire_at: DateTime<Utc>,
    ) -> Result<CallOutcome, LlmError> {
        let caching = self.settings.llm_caching_enabled();
        let req = ResponseRequest {
            model: tunables.model.api_model_id.clone(),
            input,
            temperature: tunables.temperature,
            stream: false,
            expire_at: expire_at.timestamp(),
            previous_response_id: if caching { previous_response_id } else { None },
            json_output: false,
            caching,
        };
        self.run_call(AgentRole::Director, user_id, &tunables.model, req)
            .await
    }

    // -------------------------------------------------------------------------

    async fn run_call(
        &self,
        role: AgentRole,
        user_id: &str,
        model: &ModelEntry,
        req: ResponseRequest,
    ) -> Result<CallOutcome, LlmError> {
        let deadline = self.settings.llm_timeout_secs();
        let started = Instant::now();

        let result = match tokio::time::timeout(
            Duration::from_secs(deadline),
            self.backend.create(&req),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(LlmError::Deadline { secs: deadline }),
        };

        let out = result?;
        let duration_ms = started.elapsed().as_millis() as i64;
        info!(
            agent = %role, user_id, model = %model.api_model_id,
            duration_ms, total_tokens = out.usage.total_tokens, "LLM call completed"
        );
        self.record(role, user_id, model, duration_ms, &out.usage);

        Ok(CallOutcome {
            response_id: out.response_id,
            content: out.content,
            usage: out.usage,
        })
    }

    async fn run_stream(
        &self,
        role: AgentRole,
        user_id: &str,
        model: &ModelEntry,
        req: ResponseRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamSummary, LlmError> {
        let deadline = self.settings.llm_timeout_secs();
        let started = Instant::now();

        let (inner_tx, mut inner_rx) = mpsc::channel::<StreamEvent>(32);
        let call = self.backend.create_stream(&req, inner_tx);

        // Relay events to the caller while capturing the response id, usage,
        // and any mid-stream failure. The relay ends when the backend drops
        // its sender.
        let relay = async {
            let mut response_id: Option<String> = None;
            let mut usage = Usage::default();
            let mut failure: Option<String> = None;
            while let Some(event) = inner_rx.recv().await {
                match &event {
                    StreamEvent::ResponseId { id } => response_id = Some(id.clone()),
                    StreamEvent::Done {
                        response_id: done_id,
                        usage: done_usage,
                    } => {
                        if response_id.is_none() {
                            response_id = done_id.clone();
                        }
                        usage = done_usage.clone();
                    }
                    StreamEvent::Error { message } => failure = Some(message.clone()),
                    StreamEvent::TextDelta { .. } => {}
                }
                // The caller dropping its receiver just stops delivery; the
                // provider stream is still drained so usage can be recorded.
                let _ = tx.send(event).await;
            }
            (response_id, usage, failure)
        };

        let joined = tokio::time::timeout(Duration::from_secs(deadline), async {
            tokio::join!(call, relay)
        })
        .await;

        let (call_result, (response_id, usage, failure)) = match joined {
            Ok(parts) => parts,
            Err(_) => return Err(LlmError::Deadline { secs: deadline }),
        };
        call_result?;
        if let Some(message) = failure {
            return Err(LlmError::Stream(message));
        }
        let Some(response_id) = response_id else {
            return Err(LlmError::Stream(
                "stream ended without a response id".to_string(),
            ));
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        info!(
            agent = %role, user_id, model = %model.api_model_id,
            duration_ms, total_tokens = usage.total_tokens, "LLM stream completed"
        );
        self.record(role, user_id, model, duration_ms, &usage);

        Ok(StreamSummary { response_id, usage })
    }

    fn record(
        &self,
        role: AgentRole,
        user_id: &str,
        model: &ModelEntry,
        duration_ms: i64,
        usage: &Usage,
    ) {
        self.store.record_llm_call(&LlmCallRecord {
            user_id: Some(user_id.to_string()),
            agent: role,
            model_id: Some(model.model_id),
            api_model_id: model.api_model_id.clone(),
            duration_ms,
            cost: compute_cost(model, usage),
            total_tokens: usage.total_tokens,
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            cached_tokens: usage.input_tokens_details.cached_tokens,
        });
    }
}

/// Catalog prices are per 1K tokens; provider-cached prompt tokens are
/// billed at the discounted input rate.
fn compute_cost(model: &ModelEntry, usage: &Usage) -> f64 {
    let cached = usage.input_tokens_details.cached_tokens as f64;
    let fresh = (usage.input_tokens as f64 - cached).max(0.0);
    let completion = usage.output_tokens as f64;
    (fresh * model.price_in + cached * model.price_in * model.cache_discount
        + completion * model.price_out)
        / 1000.0
}
