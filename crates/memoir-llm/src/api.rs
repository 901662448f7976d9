use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::stream::StreamEvent;

/// One role-tagged message in a Responses-API `input` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: String,
    pub content: String,
}

impl InputMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Request to the provider's Responses API.
///
/// `store` is always on — provider-side context retention is what makes a
/// session out of a chain of `previous_response_id`s. `expire_at` bounds how
/// long the provider keeps that context.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    pub model: String,
    pub input: Vec<InputMessage>,
    pub temperature: f64,
    pub stream: bool,
    /// Unix seconds after which the provider may drop the stored context.
    pub expire_at: i64,
    pub previous_response_id: Option<String>,
    /// Force a JSON-object response body (Stenographer extraction calls).
    pub json_output: bool,
    /// Ask the provider to serve repeated prefixes from its hosted cache.
    pub caching: bool,
}

/// Token accounting as reported by the provider.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub input_tokens_details: TokenDetails,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TokenDetails {
    #[serde(default)]
    pub cached_tokens: i64,
}

/// A complete non-streaming response.
#[derive(Debug, Clone)]
pub struct ResponseOutput {
    pub response_id: String,
    pub content: String,
    pub usage: Usage,
}

/// Provider seam for the Responses API. The HTTP implementation lives in
/// [`crate::http::HttpBackend`]; tests substitute a stub.
#[async_trait]
pub trait ResponseBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Issue a non-streaming call and wait for the full response.
    async fn create(&self, req: &ResponseRequest) -> Result<ResponseOutput, LlmError>;

    /// Issue a streaming call, emitting events through the channel. The
    /// terminal event is always `Done` (carrying usage when the provider
    /// reported it) or `Error`.
    async fn create_stream(
        &self,
        req: &ResponseRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError>;
}
