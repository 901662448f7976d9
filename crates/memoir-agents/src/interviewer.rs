//! The Interviewer — the foreground streaming agent that talks to the user.

use std::sync::Arc;

use chrono::Utc;
use memoir_core::{AgentRole, Speaker};
use memoir_llm::{InputMessage, StreamEvent};
use memoir_store::types::Hint;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::{budget_of, AgentContext};
use crate::error::{AgentError, Result};
use crate::sentence::SentenceSplitter;

/// How many utterance rows feed the rolling-summary rebuild, and how many of
/// the newest rows are skipped (the user half just persisted).
const REBUILD_WINDOW: usize = 9;
const REBUILD_SKIP: usize = 1;

/// Events pushed to the transport while a turn runs. Terminal success or
/// failure is the function's return value; the transport renders it.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The persisted id of the user utterance.
    UserTextId { text_id: i64 },
    /// The reply stream begins.
    Start,
    /// One reply text delta, in provider order.
    Delta { text: String },
}

/// What a completed turn left behind.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user_utterance_id: i64,
    pub assistant_utterance_id: Option<i64>,
    pub reply: String,
}

/// Run one full turn: persist the user half, feed the cache pool, pick a
/// session (reusing or rebuilding), fold in a fresh hint, stream the reply,
/// then persist the assistant half and advance the session state.
///
/// Text deltas go to `events`; completed sentences go to `sentences` for
/// speech synthesis. The sentence channel is bounded — when the synthesizer
/// falls behind, this function blocks on the flush, which backpressures the
/// provider stream. `events` delivery failures abort the turn (the client is
/// gone); `sentences` delivery failures are logged and ignored.
pub async fn run_turn(
    ctx: &Arc<AgentContext>,
    user_id: &str,
    text: &str,
    has_voice: bool,
    events: &mpsc::Sender<TurnEvent>,
    sentences: &mpsc::Sender<String>,
) -> Result<TurnOutcome> {
    // The user half is durable before anything else happens.
    let user_utterance_id = ctx
        .store
        .insert_utterance(user_id, Speaker::User, has_voice, text)?;
    if events
        .send(TurnEvent::UserTextId {
            text_id: user_utterance_id,
        })
        .await
        .is_err()
    {
        return Err(AgentError::ChannelClosed);
    }

    // Feed the pool; a threshold crossing on the user half triggers the
    // Stenographer immediately, not after the reply.
    let pool_limit = ctx.settings.cache_pool_limit();
    let pool_len = ctx
        .narration
        .append_cache_pool(user_id, Speaker::User, text)?;
    if pool_len >= pool_limit {
        info!(user_id, pool_len, pool_limit, "cache pool threshold crossed");
        ctx.enqueue_stenographer(user_id);
    }

    // Session choice. With provider caching globally off every turn is
    // stateless and context is rebuilt into the input instead.
    let tunables = ctx.settings.tunables(AgentRole::Interviewer)?;
    let budget = budget_of(&tunables);
    let stateless = !ctx.settings.llm_caching_enabled();
    let state = ctx.narration.get_or_create(user_id)?;
    let continuing = !stateless && state.intv.is_valid(&budget, Utc::now());

    let previous_content = if continuing {
        state.previous_content.clone().unwrap_or_default()
    } else {
        let window = ctx
            .store
            .recent_dialogue(user_id, REBUILD_WINDOW, REBUILD_SKIP)?;
        let rebuilt = window
            .iter()
            .map(|u| format!("{}:{}", u.speaker.tag(), u.text))
            .collect::<Vec<_>>()
            .join(" ");
        ctx.narration.set_previous_content(user_id, &rebuilt)?;
        ctx.narration
            .reset(user_id, AgentRole::Interviewer, &budget)?;
        debug!(user_id, chars = rebuilt.chars().count(), "session rebuilt from transcript");
        rebuilt
    };

    // A hint is only consumed once the turn it was used in completes.
    let fresh_hint: Option<Hint> = match ctx.store.latest_hint(user_id)? {
        Some(h) => {
            if ctx.narration.hint_updated(user_id, Some(h.hint_id))? {
                Some(h)
            } else {
                None
            }
        }
        None => None,
    };

    // Assemble the input.
    let mut user_content = format!("ot:{text}");
    if let Some(ref hint) = fresh_hint {
        user_content.push_str(&format!(";hc:{}", hint.hint_content));
    }
    let input = if continuing {
        vec![InputMessage::user(user_content)]
    } else {
        let mut messages = vec![InputMessage::system(
            ctx.settings.active_prompt(AgentRole::Interviewer)?,
        )];
        if !previous_content.is_empty() {
            messages.push(InputMessage::assistant(format!("pc:{previous_content}")));
        }
        messages.push(InputMessage::user(user_content));
        messages
    };

    // Re-read after the potential reset so the forwarded expiry matches the
    // window the provider is asked to keep.
    let state = ctx.narration.get_or_create(user_id)?;
    let expire_at = state
        .intv
        .expire_at
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(budget.expire_duration_secs));
    let previous_response_id = if continuing {
        state.intv.previous_response_id.clone()
    } else {
        None
    };

    if events.send(TurnEvent::Start).await.is_err() {
        return Err(AgentError::ChannelClosed);
    }

    // Stream the reply: every delta is forwarded to the transport as it
    // arrives and accumulated for persistence; completed sentences flush to
    // the synthesis channel.
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(32);
    let call = ctx.llm.interviewer_stream(
        user_id,
        &tunables,
        input,
        previous_response_id,
        expire_at,
        tx,
    );
    let consume = async {
        let mut reply = String::new();
        let mut splitter = SentenceSplitter::new();
        let mut client_gone = false;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::TextDelta { text } = event {
                reply.push_str(&text);
                if !client_gone
                    && events
                        .send(TurnEvent::Delta { text: text.clone() })
                        .await
                        .is_err()
                {
                    // Keep draining so session accounting stays correct.
                    client_gone = true;
                }
                for sentence in splitter.push(&text) {
                    if sentences.send(sentence).await.is_err() {
                        warn!(user_id, "sentence channel closed, speech dropped");
                    }
                }
            }
        }
        if let Some(rest) = splitter.finish() {
            if sentences.send(rest).await.is_err() {
                warn!(user_id, "sentence channel closed, speech dropped");
            }
        }
        (reply, client_gone)
    };
    let (summary, (reply, client_gone)) = tokio::join!(call, consume);

    // On stream failure nothing advances and the hint stays unconsumed.
    let summary = summary?;
    if client_gone {
        return Err(AgentError::ChannelClosed);
    }

    // Persist the assistant half and advance state.
    let assistant_utterance_id = if reply.is_empty() {
        None
    } else {
        let id = ctx
            .store
            .insert_utterance(user_id, Speaker::Assistant, false, &reply)?;
        let pool_len = ctx
            .narration
            .append_cache_pool(user_id, Speaker::Assistant, &reply)?;
        if pool_len >= pool_limit {
            info!(user_id, pool_len, pool_limit, "cache pool threshold crossed");
            ctx.enqueue_stenographer(user_id);
        }
        Some(id)
    };

    let word_delta = (text.chars().count() + reply.chars().count()) as i64;
    ctx.narration.advance(
        user_id,
        AgentRole::Interviewer,
        &summary.response_id,
        word_delta,
    )?;

    let mut rolled = previous_content;
    if !rolled.is_empty() {
        rolled.push(' ');
    }
    rolled.push_str(&format!("U:{text}"));
    if !reply.is_empty() {
        rolled.push_str(&format!(" I:{reply}"));
    }
    ctx.narration.set_previous_content(user_id, &rolled)?;

    if let Some(hint) = fresh_hint {
        ctx.narration.consume_hint(user_id, hint.hint_id)?;
        debug!(user_id, hint_id = hint.hint_id, "hint consumed");
    }

    Ok(TurnOutcome {
        user_utterance_id,
        assistant_utterance_id,
        reply,
    })
}
