use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use memoir_agents::{run_turn, TurnEvent};
use memoir_core::config::{MAX_PAYLOAD_BYTES, SENTENCE_CHANNEL_CAPACITY};
use memoir_core::Speaker;
use memoir_protocol::{ServerFrame, TurnRequest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::AppState;

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

/// Per-connection task — lives for the entire dialogue session.
///
/// Turns are handled strictly one at a time: the transport is the
/// serialization point that keeps at most one Interviewer turn in flight
/// per user. A dedicated writer task owns the sink so the turn pipeline and
/// the TTS pump can both push frames.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "dialogue connection opened");

    let (mut sink, mut rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sink.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    // Issued at most once per connection, before any turn.
    if frame_tx
        .send(ServerFrame::SessionId {
            session_id: conn_id.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = rx.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_PAYLOAD_BYTES {
                    warn!(conn_id, size = text.len(), "payload too large, closing");
                    break;
                }
                let req: TurnRequest = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(conn_id, error = %e, "malformed turn frame");
                        let _ = frame_tx
                            .send(ServerFrame::Error {
                                message: format!("malformed turn: {e}"),
                            })
                            .await;
                        continue;
                    }
                };
                if handle_turn(&state, &req, &frame_tx).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(conn_id, error = %e, "socket read failed");
                break;
            }
            _ => {}
        }
    }

    drop(frame_tx);
    let _ = writer.await;
    info!(conn_id = %conn_id, "dialogue connection closed");
}

/// Drive one turn end to end. Err means the client channel is gone and the
/// connection should close; turn-level failures are reported as an error
/// frame and Ok is returned so the dialogue can continue.
async fn handle_turn(
    state: &Arc<AppState>,
    req: &TurnRequest,
    frames: &mpsc::Sender<ServerFrame>,
) -> Result<(), ()> {
    let (event_tx, mut event_rx) = mpsc::channel::<TurnEvent>(64);
    let (sentence_tx, sentence_rx) = mpsc::channel::<String>(SENTENCE_CHANNEL_CAPACITY);

    // Turn events → client frames. Text delivery is independent of the TTS
    // pump and never throttled by it.
    let forward_frames = frames.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let frame = match event {
                TurnEvent::UserTextId { text_id } => ServerFrame::UserTextId { text_id },
                TurnEvent::Start => ServerFrame::Start,
                TurnEvent::Delta { text } => ServerFrame::Text { content: text },
            };
            if forward_frames.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Sentences → audio frames, in flush order.
    let pump_state = state.clone();
    let pump_frames = frames.clone();
    let pump = tokio::spawn(async move {
        crate::voice::synthesize_stream(
            pump_state.tts.as_deref(),
            &pump_state.agents.store,
            sentence_rx,
            pump_frames,
        )
        .await
    });

    let outcome = run_turn(
        &state.agents,
        &req.user_id,
        &req.text,
        req.has_voice,
        &event_tx,
        &sentence_tx,
    )
    .await;

    // Close the per-turn channels so both helpers run to completion, then
    // hold the finish frame until every audio frame is queued.
    drop(event_tx);
    drop(sentence_tx);
    let _ = forwarder.await;
    let audio = pump.await.unwrap_or_default();

    match outcome {
        Ok(result) => {
            if let (Some(blobs), Some(utterance_id), false) =
                (state.blobs.as_ref(), result.assistant_utterance_id, audio.is_empty())
            {
                persist_voice_clip(state, blobs.as_ref(), &req.user_id, utterance_id, &audio).await;
            }
            frames.send(ServerFrame::TextFinish).await.map_err(|_| ())
        }
        Err(e) => {
            warn!(user_id = %req.user_id, error = %e, "turn failed");
            frames
                .send(ServerFrame::Error {
                    message: e.to_string(),
                })
                .await
                .map_err(|_| ())
        }
    }
}

/// Off the text critical path: upload the reply audio and link it to the
/// assistant utterance. Failures are logged only.
async fn persist_voice_clip(
    state: &Arc<AppState>,
    blobs: &dyn crate::voice::BlobStore,
    user_id: &str,
    utterance_id: i64,
    audio: &[u8],
) {
    let key = format!("voice/{user_id}/{utterance_id}");
    match blobs.put(&key, audio).await {
        Ok(url) => {
            if let Err(e) = state.agents.store.insert_voice_clip(
                user_id,
                Speaker::Assistant,
                Some(utterance_id),
                &url,
            ) {
                warn!(user_id, utterance_id, error = %e, "voice clip row not recorded");
            }
        }
        Err(e) => warn!(user_id, utterance_id, error = %e, "voice clip upload failed"),
    }
}
