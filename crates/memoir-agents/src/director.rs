//! The Director — reads fresh storyboard entries and writes one advisory
//! hint that steers the Interviewer's next questions.

use std::sync::Arc;

use chrono::Utc;
use memoir_core::AgentRole;
use memoir_llm::InputMessage;
use tracing::{debug, info, warn};

use crate::context::{budget_of, AgentContext};
use crate::error::Result;

/// One advisory run. Writes at most one hint.
pub async fn run(ctx: &Arc<AgentContext>, user_id: &str) -> Result<()> {
    // 1-2. Context mode mirrors the Stenographer: cursor rows on a valid
    //      session, the latest rows after a rebuild.
    let tunables = ctx.settings.tunables(AgentRole::Director)?;
    let budget = budget_of(&tunables);
    let state = ctx.narration.get_or_create(user_id)?;
    let continuing = state.dir.is_valid(&budget, Utc::now());

    let rows = if continuing {
        ctx.store.unprocessed_storyboard(user_id, AgentRole::Director)?
    } else {
        ctx.narration.reset(user_id, AgentRole::Director, &budget)?;
        ctx.store
            .latest_storyboard(user_id, ctx.settings.max_sb_context())?
    };
    if rows.is_empty() {
        debug!(user_id, "no storyboard entries to advise on");
        return Ok(());
    }
    let max_read = rows.last().map(|row| row.story_id);

    // 3. Input: the rendered graph deltas, with the system prompt only when
    //    a fresh provider session is being opened.
    let joined = rows
        .iter()
        .map(|row| row.story_content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let input = if continuing {
        vec![InputMessage::user(joined)]
    } else {
        vec![
            InputMessage::system(ctx.settings.active_prompt(AgentRole::Director)?),
            InputMessage::user(joined),
        ]
    };

    let state = ctx.narration.get_or_create(user_id)?;
    let expire_at = state
        .dir
        .expire_at
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(budget.expire_duration_secs));
    let previous_response_id = if continuing {
        state.dir.previous_response_id.clone()
    } else {
        None
    };

    // 4. The call. On failure the rows stay unprocessed and the next
    //    extraction completion retries them.
    let outcome = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            info!(user_id, "shutdown during advisory call");
            return Ok(());
        }
        result = ctx.llm.director_call(
            user_id,
            &tunables,
            input,
            previous_response_id,
            expire_at,
        ) => match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(user_id, error = %e, "advisory call failed, rows left unprocessed");
                return Ok(());
            }
        }
    };

    // 5-7. An empty reply advances the session but writes no hint and flips
    //      nothing, so the same rows are offered again. Otherwise the hint
    //      and the cursor flip commit together.
    let content = outcome.content.trim();
    if content.is_empty() {
        debug!(user_id, "empty advisory reply, no hint written");
    } else {
        let hint_id = ctx
            .store
            .insert_hint_and_mark(user_id, content, max_read)?;
        info!(user_id, hint_id, rows = rows.len(), "hint written");
    }

    ctx.narration.advance(
        user_id,
        AgentRole::Director,
        &outcome.response_id,
        content.chars().count() as i64,
    )?;
    Ok(())
}
