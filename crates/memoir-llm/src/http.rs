use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ResponseBackend, ResponseOutput, ResponseRequest, Usage};
use crate::error::LlmError;
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Responses-API client over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl HttpBackend {
    /// `base_url` should NOT include a trailing slash; `/responses` is
    /// appended per call.
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl ResponseBackend for HttpBackend {
    fn name(&self) -> &str {
        "responses-http"
    }

    async fn create(&self, req: &ResponseRequest) -> Result<ResponseOutput, LlmError> {
        let body = build_request_body(req, false);
        let url = format!("{}/responses", self.base_url);

        debug!(model = %req.model, json = req.json_output, "sending response request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider API error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Format(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn create_stream(
        &self,
        req: &ResponseRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let body = build_request_body(req, true);
        let url = format!("{}/responses", self.base_url);

        debug!(model = %req.model, "sending streaming response request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider streaming API error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        process_response_stream(resp, tx).await;
        Ok(())
    }
}

pub(crate) fn build_request_body(req: &ResponseRequest, stream: bool) -> serde_json::Value {
    let input: Vec<serde_json::Value> = req
        .input
        .iter()
        .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "input": input,
        "temperature": req.temperature,
        "stream": stream,
        "store": true,
        "expire_at": req.expire_at,
        "thinking": { "type": "disabled" },
    });

    if req.json_output {
        body["text"] = serde_json::json!({ "format": { "type": "json_object" } });
    }
    if let Some(ref prev) = req.previous_response_id {
        body["previous_response_id"] = serde_json::json!(prev);
    }
    if req.caching {
        body["caching"] = serde_json::json!({ "type": "enabled" });
    }

    body
}

fn parse_response(resp: ApiResponse) -> ResponseOutput {
    // Reply text is the concatenation of every output_text block across the
    // output messages.
    let content: String = resp
        .output
        .iter()
        .flat_map(|item| item.content.iter())
        .filter(|block| block.kind == "output_text")
        .map(|block| block.text.as_str())
        .collect();

    ResponseOutput {
        response_id: resp.id,
        content,
        usage: resp.usage.unwrap_or_default(),
    }
}

/// Drive the provider's SSE stream and emit StreamEvents.
///
/// Each data line carries a JSON event object discriminated by `type`;
/// `response.completed` is the terminal event and carries usage.
async fn process_response_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut response_id: Option<String> = None;
    let mut usage = Usage::default();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break 'outer;
            }
            let Ok(event) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };

            match event.kind.as_str() {
                "response.created" => {
                    if response_id.is_none() {
                        if let Some(id) = event.response.as_ref().and_then(|r| r.id.clone()) {
                            response_id = Some(id.clone());
                            if tx.send(StreamEvent::ResponseId { id }).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                    }
                }
                "response.output_text.delta" => {
                    if let Some(delta) = event.delta.filter(|d| !d.is_empty()) {
                        debug!(len = delta.len(), "stream text delta");
                        if tx.send(StreamEvent::TextDelta { text: delta }).await.is_err() {
                            return;
                        }
                    }
                }
                "response.completed" => {
                    if let Some(r) = event.response {
                        if response_id.is_none() {
                            response_id = r.id;
                        }
                        if let Some(u) = r.usage {
                            usage = u;
                        }
                    }
                    break 'outer;
                }
                "response.failed" | "error" => {
                    let message = event
                        .message
                        .unwrap_or_else(|| "provider reported stream failure".to_string());
                    let _ = tx.send(StreamEvent::Error { message }).await;
                    return;
                }
                _ => {}
            }
        }

        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done {
            response_id,
            usage,
        })
        .await;
}

// Provider response types.

#[derive(Deserialize)]
struct ApiResponse {
    id: String,
    #[serde(default)]
    output: Vec<OutputItem>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    response: Option<StreamResponse>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}
