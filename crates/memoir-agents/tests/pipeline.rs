// End-to-end pipeline behavior against a scripted provider backend:
// cold-start turns, threshold triggers, extraction failure recovery, hint
// consumption, and session expiry rebuilds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use memoir_agents::{director, run_turn, stenographer, AgentContext, TurnEvent};
use memoir_core::{AgentRole, Speaker};
use memoir_llm::{
    LlmError, LlmGateway, ResponseBackend, ResponseOutput, ResponseRequest, StreamEvent, Usage,
};
use memoir_narration::NarrationManager;
use memoir_scheduler::TaskLanes;
use memoir_store::{ConfigCache, Store};
use rusqlite::Connection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum StreamScript {
    Deltas(Vec<&'static str>),
    Fail(u16),
}

#[derive(Clone)]
enum CallScript {
    Reply(&'static str),
    Fail(u16),
}

struct ScriptedBackend {
    streams: Arc<Mutex<VecDeque<StreamScript>>>,
    /// Extraction (JSON-mode) call scripts.
    stn_calls: Arc<Mutex<VecDeque<CallScript>>>,
    /// Advisory call scripts.
    dir_calls: Arc<Mutex<VecDeque<CallScript>>>,
    requests: Arc<Mutex<Vec<ResponseRequest>>>,
    next_id: AtomicUsize,
}

impl ScriptedBackend {
    fn assign_id(&self) -> String {
        format!("resp-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ResponseBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, req: &ResponseRequest) -> Result<ResponseOutput, LlmError> {
        self.requests.lock().unwrap().push(req.clone());
        let queue = if req.json_output {
            &self.stn_calls
        } else {
            &self.dir_calls
        };
        match queue.lock().unwrap().pop_front() {
            Some(CallScript::Reply(content)) => Ok(ResponseOutput {
                response_id: self.assign_id(),
                content: content.to_string(),
                usage: Usage::default(),
            }),
            Some(CallScript::Fail(status)) => Err(LlmError::Api {
                status,
                message: "scripted failure".into(),
            }),
            None => Err(LlmError::Stream("call script exhausted".into())),
        }
    }

    async fn create_stream(
        &self,
        req: &ResponseRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        self.requests.lock().unwrap().push(req.clone());
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            Some(StreamScript::Deltas(deltas)) => {
                let id = self.assign_id();
                let _ = tx.send(StreamEvent::ResponseId { id: id.clone() }).await;
                for delta in deltas {
                    let _ = tx
                        .send(StreamEvent::TextDelta {
                            text: delta.to_string(),
                        })
                        .await;
                }
                let _ = tx
                    .send(StreamEvent::Done {
                        response_id: Some(id),
                        usage: Usage::default(),
                    })
                    .await;
                Ok(())
            }
            Some(StreamScript::Fail(status)) => Err(LlmError::Api {
                status,
                message: "scripted failure".into(),
            }),
            None => Err(LlmError::Stream("stream script exhausted".into())),
        }
    }
}

struct Harness {
    ctx: Arc<AgentContext>,
    streams: Arc<Mutex<VecDeque<StreamScript>>>,
    stn_calls: Arc<Mutex<VecDeque<CallScript>>>,
    dir_calls: Arc<Mutex<VecDeque<CallScript>>>,
    requests: Arc<Mutex<Vec<ResponseRequest>>>,
}

fn harness(extra_settings: &str) -> Harness {
    let store_conn = Connection::open_in_memory().unwrap();
    memoir_store::db::init_db(&store_conn).unwrap();
    let store = Arc::new(Store::new(store_conn));

    let narration_conn = Connection::open_in_memory().unwrap();
    memoir_narration::db::init_db(&narration_conn).unwrap();
    let narration = Arc::new(NarrationManager::new(narration_conn));

    let settings_conn = Connection::open_in_memory().unwrap();
    memoir_store::db::init_db(&settings_conn).unwrap();
    settings_conn
        .execute_batch(&format!(
            "INSERT INTO model_catalog (name, api_model_id, price_in, price_out, cache_discount)
             VALUES ('测试模型', 'doubao-test', 0.002, 0.008, 0.5);
             INSERT INTO settings (key, value, kind) VALUES
                ('intv_llm_model', '1', 'select'),
                ('stn_llm_model', '1', 'select'),
                ('dir_llm_model', '1', 'select')
                {extra_settings};
             INSERT INTO prompts (role, content, active) VALUES
                (0, '你是一位温和的口述史访谈员。', 1),
                (1, '把对话整理成回忆结构，只输出 JSON。', 1),
                (2, '根据新增回忆提出下一步追问建议。', 1);"
        ))
        .unwrap();
    let settings = Arc::new(ConfigCache::new(settings_conn));

    let streams = Arc::new(Mutex::new(VecDeque::new()));
    let stn_calls = Arc::new(Mutex::new(VecDeque::new()));
    let dir_calls = Arc::new(Mutex::new(VecDeque::new()));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let backend = ScriptedBackend {
        streams: streams.clone(),
        stn_calls: stn_calls.clone(),
        dir_calls: dir_calls.clone(),
        requests: requests.clone(),
        next_id: AtomicUsize::new(0),
    };

    let llm = Arc::new(LlmGateway::new(
        Box::new(backend),
        store.clone(),
        settings.clone(),
    ));
    let shutdown = CancellationToken::new();
    let lanes = Arc::new(TaskLanes::new(shutdown.clone()));

    Harness {
        ctx: Arc::new(AgentContext {
            store,
            narration,
            llm,
            settings,
            lanes,
            shutdown,
        }),
        streams,
        stn_calls,
        dir_calls,
        requests,
    }
}

fn collectors() -> (
    mpsc::Sender<TurnEvent>,
    tokio::task::JoinHandle<Vec<TurnEvent>>,
    mpsc::Sender<String>,
    tokio::task::JoinHandle<Vec<String>>,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<TurnEvent>(64);
    let events = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(e) = event_rx.recv().await {
            out.push(e);
        }
        out
    });
    let (sentence_tx, mut sentence_rx) = mpsc::channel::<String>(64);
    let sentences = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(s) = sentence_rx.recv().await {
            out.push(s);
        }
        out
    });
    (event_tx, events, sentence_tx, sentences)
}

#[tokio::test]
async fn cold_start_turn_below_threshold() {
    let h = harness(",('cache_pool_limit', '500', 'number')");
    h.streams
        .lock()
        .unwrap()
        .push_back(StreamScript::Deltas(vec!["很高兴认识你。", "想聊聊吗？"]));

    let (event_tx, events, sentence_tx, sentences) = collectors();
    let outcome = run_turn(&h.ctx, "u-1", "你好", false, &event_tx, &sentence_tx)
        .await
        .unwrap();
    drop(event_tx);
    drop(sentence_tx);

    assert_eq!(outcome.reply, "很高兴认识你。想聊聊吗？");
    assert!(outcome.assistant_utterance_id.is_some());

    // Both turn halves persisted, assistant strictly after the user half.
    let transcript = h.ctx.store.recent_dialogue("u-1", 10, 0).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].speaker, Speaker::User);
    assert_eq!(transcript[1].speaker, Speaker::Assistant);

    // Pool holds both halves; the threshold was never crossed.
    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert_eq!(
        state.cache_pool.as_deref(),
        Some("U:你好 I:很高兴认识你。想聊聊吗？ ")
    );
    assert!(h.ctx.store.latest_storyboard("u-1", 10).unwrap().is_empty());

    // A provider session was opened and recorded.
    assert_eq!(state.intv.session_id.as_deref(), Some("resp-1"));
    assert_eq!(state.intv.word_count, "你好很高兴认识你。想聊聊吗？".chars().count() as i64);

    // Frame ordering: id, start, then deltas in provider order.
    let events = events.await.unwrap();
    assert!(matches!(events[0], TurnEvent::UserTextId { .. }));
    assert_eq!(events[1], TurnEvent::Start);
    assert_eq!(
        events[2],
        TurnEvent::Delta {
            text: "很高兴认识你。".into()
        }
    );

    // Sentences flushed at delimiters, remainder at stream end.
    let sentences = sentences.await.unwrap();
    assert_eq!(sentences, vec!["很高兴认识你。", "想聊聊吗？"]);
}

#[tokio::test]
async fn empty_replies_leave_no_assistant_rows() {
    let h = harness(",('cache_pool_limit', '500', 'number')");
    for _ in 0..2 {
        h.streams
            .lock()
            .unwrap()
            .push_back(StreamScript::Deltas(vec![]));
    }

    for text in ["第一句", "第二句"] {
        let (event_tx, _events, sentence_tx, _sentences) = collectors();
        let outcome = run_turn(&h.ctx, "u-1", text, false, &event_tx, &sentence_tx)
            .await
            .unwrap();
        assert!(outcome.assistant_utterance_id.is_none());
    }

    let transcript = h.ctx.store.recent_dialogue("u-1", 10, 0).unwrap();
    assert_eq!(transcript.len(), 2);
    assert!(transcript.iter().all(|u| u.speaker == Speaker::User));

    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert_eq!(state.cache_pool.as_deref(), Some("U:第一句 U:第二句 "));
    assert!(h.ctx.store.latest_storyboard("u-1", 10).unwrap().is_empty());
}

#[tokio::test]
async fn user_half_threshold_triggers_extraction_immediately() {
    // "U:我小时候住在北京的四合院 " is 15 chars — over an 8-char limit
    // before the assistant half even exists.
    let h = harness(",('cache_pool_limit', '8', 'number')");
    h.streams
        .lock()
        .unwrap()
        .push_back(StreamScript::Deltas(vec!["那一定很有意思。"]));
    h.stn_calls.lock().unwrap().push_back(CallScript::Reply(
        r#"{"S":[{"pt":"n","tid":"s1","title":"童年"}]}"#,
    ));
    // The extraction completion enqueues the Director.
    h.dir_calls
        .lock()
        .unwrap()
        .push_back(CallScript::Reply("可以追问四合院里的邻居。"));

    let (event_tx, _events, sentence_tx, _sentences) = collectors();
    run_turn(
        &h.ctx,
        "u-1",
        "我小时候住在北京的四合院",
        false,
        &event_tx,
        &sentence_tx,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    // The extraction call went out and its input carried the user half.
    let requests = h.requests.lock().unwrap();
    let stn_req = requests
        .iter()
        .find(|r| r.json_output)
        .expect("no extraction call made");
    let user_msg = &stn_req.input.last().unwrap().content;
    assert!(user_msg.starts_with("sb:"));
    assert!(user_msg.contains("cp:"));
    assert!(user_msg.contains("我小时候住在北京的四合院"));
    drop(requests);

    // Graph row landed and the Director followed up with a hint.
    assert_eq!(h.ctx.store.latest_storyboard("u-1", 10).unwrap().len(), 1);
    let hint = h.ctx.store.latest_hint("u-1").unwrap().unwrap();
    assert_eq!(hint.hint_content, "可以追问四合院里的邻居。");
}

#[tokio::test]
async fn failed_extraction_preserves_the_batch() {
    let h = harness("");
    h.ctx
        .narration
        .append_cache_pool("u-1", Speaker::User, "重要的回忆")
        .unwrap();
    h.stn_calls.lock().unwrap().push_back(CallScript::Fail(500));

    stenographer::run(&h.ctx, "u-1").await.unwrap();

    // Pool cleared at snapshot; the batch lives on in the overflow.
    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert!(state.cache_pool.is_none());
    assert_eq!(state.unprocessed_overflow.as_deref(), Some("U:重要的回忆 "));
    assert!(h.ctx.store.latest_storyboard("u-1", 10).unwrap().is_empty());
    // The failed call advanced nothing.
    assert!(state.stn.session_id.is_none());

    // Next trigger feeds overflow + new pool, and success clears the stow.
    h.ctx
        .narration
        .append_cache_pool("u-1", Speaker::Assistant, "后来呢")
        .unwrap();
    h.stn_calls
        .lock()
        .unwrap()
        .push_back(CallScript::Reply(r#"{"O":[{"pt":"n","title":"回忆"}]}"#));
    stenographer::run(&h.ctx, "u-1").await.unwrap();

    let stn_req = h
        .requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.json_output)
        .next_back()
        .unwrap()
        .clone();
    assert!(stn_req
        .input
        .last()
        .unwrap()
        .content
        .contains("cp:U:重要的回忆 I:后来呢 "));

    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert!(state.unprocessed_overflow.is_none());
    assert_eq!(state.stn.session_id.as_deref(), Some("resp-1"));
}

#[tokio::test]
async fn unparseable_extraction_reply_is_treated_like_a_failure() {
    let h = harness("");
    h.ctx
        .narration
        .append_cache_pool("u-1", Speaker::User, "一段话")
        .unwrap();
    h.stn_calls
        .lock()
        .unwrap()
        .push_back(CallScript::Reply("抱歉，这不是 JSON。"));

    stenographer::run(&h.ctx, "u-1").await.unwrap();

    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert_eq!(state.unprocessed_overflow.as_deref(), Some("U:一段话 "));
    assert!(h.ctx.store.latest_storyboard("u-1", 10).unwrap().is_empty());
}

#[tokio::test]
async fn empty_pool_skips_extraction_entirely() {
    let h = harness("");
    stenographer::run(&h.ctx, "u-1").await.unwrap();
    assert!(h.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn hint_is_consumed_exactly_once() {
    let h = harness(",('cache_pool_limit', '500', 'number')");
    let hint_id = h
        .ctx
        .store
        .insert_hint_and_mark("u-1", "问问他的小学老师", None)
        .unwrap();

    h.streams
        .lock()
        .unwrap()
        .push_back(StreamScript::Deltas(vec!["你的小学老师是怎样的人？"]));
    let (event_tx, _e1, sentence_tx, _s1) = collectors();
    run_turn(&h.ctx, "u-1", "我上学了", false, &event_tx, &sentence_tx)
        .await
        .unwrap();

    // Turn 1 folded the hint in and consumed it on completion.
    {
        let requests = h.requests.lock().unwrap();
        let content = &requests[0].input.last().unwrap().content;
        assert_eq!(content, "ot:我上学了;hc:问问他的小学老师");
    }
    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert_eq!(state.consumed_hint_id, Some(hint_id));

    // Turn 2 (no new hint) omits the hint clause.
    h.streams
        .lock()
        .unwrap()
        .push_back(StreamScript::Deltas(vec!["后来呢？"]));
    let (event_tx, _e2, sentence_tx, _s2) = collectors();
    run_turn(&h.ctx, "u-1", "老师很严厉", false, &event_tx, &sentence_tx)
        .await
        .unwrap();

    let requests = h.requests.lock().unwrap();
    let content = &requests[1].input.last().unwrap().content;
    assert_eq!(content, "ot:老师很严厉");
}

#[tokio::test]
async fn failed_turn_leaves_the_hint_unconsumed() {
    let h = harness(",('cache_pool_limit', '500', 'number')");
    h.ctx
        .store
        .insert_hint_and_mark("u-1", "追问童年玩伴", None)
        .unwrap();
    h.streams.lock().unwrap().push_back(StreamScript::Fail(500));

    let (event_tx, _e, sentence_tx, _s) = collectors();
    let err = run_turn(&h.ctx, "u-1", "你好", false, &event_tx, &sentence_tx)
        .await
        .unwrap_err();
    assert!(matches!(err, memoir_agents::AgentError::Llm(_)));

    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert!(state.consumed_hint_id.is_none());
    // No advance either: the session slot is still empty.
    assert!(state.intv.session_id.is_none());
    // But the user half and its pool entry are durable.
    assert_eq!(h.ctx.store.recent_dialogue("u-1", 10, 0).unwrap().len(), 1);
}

#[tokio::test]
async fn expired_session_rebuilds_context_from_the_transcript() {
    // Expiry window shorter than the safety buffer: every turn opens a
    // fresh provider session and rebuilds the rolling summary.
    let h = harness(
        ",('cache_pool_limit', '500', 'number'),
          ('intv_llm_session_expire_duration', '200', 'number'),
          ('intv_llm_session_expire_buf', '300', 'number')",
    );

    h.streams
        .lock()
        .unwrap()
        .push_back(StreamScript::Deltas(vec!["你好呀。"]));
    let (event_tx, _e1, sentence_tx, _s1) = collectors();
    run_turn(&h.ctx, "u-1", "你好", false, &event_tx, &sentence_tx)
        .await
        .unwrap();

    h.streams
        .lock()
        .unwrap()
        .push_back(StreamScript::Deltas(vec!["北京的哪里？"]));
    let (event_tx, _e2, sentence_tx, _s2) = collectors();
    run_turn(&h.ctx, "u-1", "我住在北京", false, &event_tx, &sentence_tx)
        .await
        .unwrap();

    let requests = h.requests.lock().unwrap();
    let second = &requests[1];
    // Fresh call: no chain, system prompt first, prior dialogue as "pc:".
    assert!(second.previous_response_id.is_none());
    assert_eq!(second.input[0].role, "system");
    assert_eq!(second.input[1].role, "assistant");
    assert_eq!(second.input[1].content, "pc:U:你好 I:你好呀。");
    assert_eq!(second.input[2].content, "ot:我住在北京");
    drop(requests);

    // A new session id was assigned on success.
    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert_eq!(state.intv.session_id.as_deref(), Some("resp-2"));
}

#[tokio::test]
async fn director_cold_start_reads_latest_rows_and_flips() {
    let h = harness("");
    // Two graph rows via extraction (no cursor flip — cold session).
    h.ctx
        .narration
        .append_cache_pool("u-1", Speaker::User, "童年在胡同里")
        .unwrap();
    h.stn_calls.lock().unwrap().push_back(CallScript::Reply(
        r#"{"S":[{"pt":"n","tid":"s1","title":"童年"}],"T":[{"pt":"n","parent":"s1","title":"胡同"}]}"#,
    ));
    stenographer::run(&h.ctx, "u-1").await.unwrap();

    h.dir_calls
        .lock()
        .unwrap()
        .push_back(CallScript::Reply("先聊聊胡同里的邻居。"));
    director::run(&h.ctx, "u-1").await.unwrap();

    // One hint per run, and the rows it read are acknowledged.
    let hint = h.ctx.store.latest_hint("u-1").unwrap().unwrap();
    assert_eq!(hint.hint_content, "先聊聊胡同里的邻居。");
    assert!(h
        .ctx
        .store
        .unprocessed_storyboard("u-1", AgentRole::Director)
        .unwrap()
        .is_empty());

    // The advisory input was the rendered journal lines.
    let requests = h.requests.lock().unwrap();
    let dir_req = requests.last().unwrap();
    assert_eq!(dir_req.input[0].role, "system");
    let joined = &dir_req.input.last().unwrap().content;
    assert!(joined.contains("[S:"));
    assert!(joined.contains("[T:"));
}

#[tokio::test]
async fn empty_advisory_reply_writes_no_hint_and_flips_nothing() {
    let h = harness("");
    h.ctx
        .narration
        .append_cache_pool("u-1", Speaker::User, "一个故事")
        .unwrap();
    h.stn_calls
        .lock()
        .unwrap()
        .push_back(CallScript::Reply(r#"{"O":[{"pt":"n","title":"故事"}]}"#));
    stenographer::run(&h.ctx, "u-1").await.unwrap();

    h.dir_calls.lock().unwrap().push_back(CallScript::Reply("  "));
    director::run(&h.ctx, "u-1").await.unwrap();

    assert!(h.ctx.store.latest_hint("u-1").unwrap().is_none());
    assert_eq!(
        h.ctx
            .store
            .unprocessed_storyboard("u-1", AgentRole::Director)
            .unwrap()
            .len(),
        1
    );
    // The session still advanced — the call itself succeeded.
    let state = h.ctx.narration.get("u-1").unwrap().unwrap();
    assert!(state.dir.session_id.is_some());
}

#[tokio::test]
async fn director_with_nothing_unread_makes_no_call() {
    let h = harness("");
    // Valid session, empty cursor: return without calling the provider.
    h.ctx.narration.get_or_create("u-1").unwrap();
    let budget = memoir_narration::SessionBudget {
        word_limit: 5_000,
        expire_duration_secs: 3_600,
        expire_buffer_secs: 300,
    };
    h.ctx
        .narration
        .reset("u-1", AgentRole::Director, &budget)
        .unwrap();
    h.ctx
        .narration
        .advance("u-1", AgentRole::Director, "resp-seed", 1)
        .unwrap();

    director::run(&h.ctx, "u-1").await.unwrap();
    assert!(h.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stenographer_valid_session_flips_only_prior_rows() {
    let h = harness("");
    // Open a valid Stn session first.
    h.ctx
        .narration
        .append_cache_pool("u-1", Speaker::User, "第一段回忆")
        .unwrap();
    h.stn_calls
        .lock()
        .unwrap()
        .push_back(CallScript::Reply(r#"{"S":[{"pt":"n","title":"童年"}]}"#));
    stenographer::run(&h.ctx, "u-1").await.unwrap();

    // Second run sees the first run's row via the cursor, acknowledges it,
    // and leaves its own new row unacknowledged.
    h.ctx
        .narration
        .append_cache_pool("u-1", Speaker::User, "第二段回忆")
        .unwrap();
    h.stn_calls
        .lock()
        .unwrap()
        .push_back(CallScript::Reply(r#"{"T":[{"pt":"n","title":"上学"}]}"#));
    stenographer::run(&h.ctx, "u-1").await.unwrap();

    let unprocessed = h
        .ctx
        .store
        .unprocessed_storyboard("u-1", AgentRole::Stenographer)
        .unwrap();
    assert_eq!(unprocessed.len(), 1);
    assert!(unprocessed[0].story_content.contains("上学"));

    // The second request's journal context was the cursor rows.
    let requests = h.requests.lock().unwrap();
    let second = requests.iter().filter(|r| r.json_output).nth(1).unwrap();
    assert!(second.input.last().unwrap().content.contains("[S:"));
    assert_eq!(second.previous_response_id.as_deref(), Some("resp-1"));
}
