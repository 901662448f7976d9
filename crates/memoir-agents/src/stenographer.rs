//! The Stenographer — background extraction of the memoir graph.

use std::sync::Arc;

use chrono::Utc;
use memoir_core::AgentRole;
use memoir_llm::InputMessage;
use tracing::{debug, info, warn};

use crate::context::{budget_of, AgentContext};
use crate::error::{AgentError, Result};
use crate::extraction::parse_extraction;

/// One extraction run. Runs inside the user's lane, so at most one is in
/// flight per user and runs observe submission order.
///
/// The snapshot itself stows the pool into the unprocessed overflow, so any
/// failure after this point — provider, parse, or crash — leaves the input
/// durable for the next trigger. Only a fully materialized run clears it.
pub async fn run(ctx: &Arc<AgentContext>, user_id: &str) -> Result<()> {
    // 1. Nothing new since the last snapshot: nothing to do.
    let Some((batch, pool_chars)) = ctx.narration.take_cache_pool(user_id)? else {
        debug!(user_id, "cache pool empty, extraction skipped");
        return Ok(());
    };

    // 2. Context mode: a valid session reads forward from the cursor; a
    //    rebuilt one gets the latest rows as cold-start context instead.
    let tunables = ctx.settings.tunables(AgentRole::Stenographer)?;
    let budget = budget_of(&tunables);
    let state = ctx.narration.get_or_create(user_id)?;
    let continuing = state.stn.is_valid(&budget, Utc::now());

    let context_rows = if continuing {
        ctx.store
            .unprocessed_storyboard(user_id, AgentRole::Stenographer)?
    } else {
        ctx.narration
            .reset(user_id, AgentRole::Stenographer, &budget)?;
        ctx.store
            .latest_storyboard(user_id, ctx.settings.max_sb_context())?
    };
    // Captured before this run inserts rows of its own; only the cursor path
    // may flip.
    let flip_up_to = if continuing {
        context_rows.last().map(|row| row.story_id)
    } else {
        None
    };

    // 3-4. Compose the input from journal context plus the stowed dialogue.
    let sb_context = context_rows
        .iter()
        .map(|row| row.story_content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let input = vec![
        InputMessage::system(ctx.settings.active_prompt(AgentRole::Stenographer)?),
        InputMessage::user(format!("sb:{sb_context}; cp:{batch}")),
    ];

    let state = ctx.narration.get_or_create(user_id)?;
    let expire_at = state
        .stn
        .expire_at
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(budget.expire_duration_secs));
    let previous_response_id = if continuing {
        state.stn.previous_response_id.clone()
    } else {
        None
    };

    // 5. The call, cancellable at shutdown. Failures return cleanly: the
    //    batch is already stowed and the cursor untouched, so the next
    //    trigger retries with overflow + new pool.
    let outcome = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            info!(user_id, "shutdown during extraction call, batch preserved");
            return Ok(());
        }
        result = ctx.llm.stenographer_call(
            user_id,
            &tunables,
            input,
            previous_response_id,
            expire_at,
        ) => match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(user_id, error = %e, "extraction call failed, batch preserved");
                return Ok(());
            }
        }
    };

    // 6. Parse failures are handled like provider failures.
    let delta = match parse_extraction(&outcome.content) {
        Ok(delta) => delta,
        Err(AgentError::Malformed(reason)) => {
            warn!(user_id, reason = %reason, "extraction reply unparseable, batch preserved");
            return Ok(());
        }
        Err(other) => return Err(other),
    };

    // 7-8. Materialize graph rows, journal rows, and the cursor flip in one
    //      transaction. A store error propagates: no flip, no state advance,
    //      and the overflow still holds the batch.
    let report = ctx.store.apply_extraction(user_id, &delta, flip_up_to)?;
    info!(
        user_id,
        inserted = report.inserted,
        updated = report.updated,
        linked = report.linked,
        skipped = report.skipped,
        "extraction materialized"
    );

    // 9. The run is complete: advance the session by the dialogue the pool
    //    contributed and drop the stowed batch.
    ctx.narration.advance(
        user_id,
        AgentRole::Stenographer,
        &outcome.response_id,
        pool_chars,
    )?;
    ctx.narration.clear_overflow(user_id)?;

    // 10. Let the Director read what just landed.
    ctx.enqueue_director(user_id);
    Ok(())
}
