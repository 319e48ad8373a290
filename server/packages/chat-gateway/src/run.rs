use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chat_gateway_error::GatewayError;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{AgentConfig, AgentDriver, AgentEvent, AgentEventStream};
use crate::events::{InputEvent, OutboundEvent};
use crate::input_stream::InputStreamController;
use crate::registry::{ActiveSession, ActiveSessions};
use crate::store::SessionStore;

/// How long a run may sit with an empty input queue after finishing a turn
/// before its input stream is ended and the agent winds down.
pub const RUN_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Re-armable one-shot that ends a run's input stream after a quiet period.
/// Arming replaces any previous timer; an injected message cancels it.
#[derive(Debug, Default)]
pub struct IdleTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer only while the input queue is empty and the stream is
    /// still open. The pending check and the arm happen under the timer
    /// lock, so a concurrent [`IdleTimer::disarm_then`] cannot slip a push
    /// in between.
    pub fn arm_if_idle(&self, timeout: Duration, input: &InputStreamController) {
        let mut handle = self.handle.lock();
        if input.pending_count() > 0 || input.is_ended() {
            return;
        }
        let input = input.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::debug!("idle timeout reached, ending input stream");
            input.end_if_idle();
        });
        if let Some(previous) = handle.replace(task) {
            previous.abort();
        }
    }

    /// Disarms the timer and runs `f` before releasing the timer lock, so an
    /// in-flight arm cannot observe the state between the two steps.
    pub fn disarm_then<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut handle = self.handle.lock();
        if let Some(task) = handle.take() {
            task.abort();
        }
        f()
    }

    pub fn cancel(&self) {
        if let Some(task) = self.handle.lock().take() {
            task.abort();
        }
    }
}

/// Splits delta text into word and whitespace pieces. Concatenating the
/// pieces reproduces the input exactly.
pub fn split_text(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_is_ws = None;
    for ch in text.chars() {
        let is_ws = ch.is_whitespace();
        if current_is_ws != Some(is_ws) && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        current_is_ws = Some(is_ws);
        current.push(ch);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Canonicalized form of a working directory for storage and comparison.
/// Paths that no longer resolve are compared as given.
fn resolve_cwd(cwd: &str) -> String {
    std::fs::canonicalize(cwd)
        .map(|path| path.display().to_string())
        .unwrap_or_else(|_| cwd.to_string())
}

const TITLE_MAX_CHARS: usize = 30;

/// Session title from its first message: trimmed, truncated to 30 characters
/// with an ellipsis, or a placeholder when the message is blank.
pub fn derive_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "New session".to_string();
    }
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", truncated.trim_end())
}

/// Breadth-first search for a session id anywhere in an upstream payload.
/// At each level the snake_case key wins over the camelCase one.
pub fn find_session_id(value: &Value) -> Option<String> {
    let mut queue = VecDeque::from([value]);
    while let Some(current) = queue.pop_front() {
        match current {
            Value::Object(map) => {
                for key in ["session_id", "sessionId"] {
                    if let Some(id) = map.get(key).and_then(Value::as_str) {
                        if !id.is_empty() {
                            return Some(id.to_string());
                        }
                    }
                }
                queue.extend(map.values());
            }
            Value::Array(items) => queue.extend(items),
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ChatParams {
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub message: String,
    pub permission_mode: String,
    pub system_prompt: Option<Value>,
}

/// Handle returned to the transport layer: the run id for the response
/// header, a preface replayed before live events when attaching to an
/// already-running session, and the live event feed.
#[derive(Debug)]
pub struct ChatStream {
    pub run_id: String,
    pub preface: Vec<OutboundEvent>,
    pub events: mpsc::UnboundedReceiver<OutboundEvent>,
}

/// Orchestrates runs: validates chat requests, starts or joins runs, drives
/// agent events onto session sinks, and persists session metadata.
pub struct SessionManager {
    registry: ActiveSessions,
    store: Arc<SessionStore>,
    driver: Arc<dyn AgentDriver>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(store: Arc<SessionStore>, driver: Arc<dyn AgentDriver>) -> Self {
        Self::with_idle_timeout(store, driver, RUN_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        store: Arc<SessionStore>,
        driver: Arc<dyn AgentDriver>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry: ActiveSessions::new(),
            store,
            driver,
            idle_timeout,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.registry.lookup(session_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Starts a new run, or injects into the live run when the named session
    /// already has one. Either way the caller gets an event feed attached to
    /// the session's broadcast.
    pub fn chat(self: &Arc<Self>, params: ChatParams) -> Result<ChatStream, GatewayError> {
        if let Some(session_key) = params.session_id.as_deref() {
            if let Some(active) = self.registry.lookup(session_key) {
                return self.join_run(active, params);
            }
        }
        self.start_run(params)
    }

    /// Requests cancellation of a run. The stopped event arrives on the
    /// session's sinks once the agent has actually wound down.
    pub fn stop(&self, run_id: &str) -> Result<(), GatewayError> {
        self.registry.cancel_run(run_id)
    }

    fn join_run(
        &self,
        active: Arc<ActiveSession>,
        params: ChatParams,
    ) -> Result<ChatStream, GatewayError> {
        if let Some(requested) = params.cwd.as_deref() {
            if resolve_cwd(requested) != resolve_cwd(&active.cwd) {
                return Err(GatewayError::CwdMismatch {
                    session_id: active.session_id().unwrap_or_else(|| active.run_id.clone()),
                    requested: requested.to_string(),
                });
            }
        }

        active
            .idle
            .disarm_then(|| active.input.push(InputEvent::new(params.message)))?;
        tracing::info!(run_id = %active.run_id, "injected message into live run");

        let (_sink_id, rx) = active.sinks.attach();
        let mut preface = vec![OutboundEvent::Run {
            run_id: active.run_id.clone(),
        }];
        if let Some(session_id) = active.session_id() {
            preface.push(OutboundEvent::Session {
                session_id,
                cwd: active.cwd.clone(),
                is_new: false,
            });
        }
        Ok(ChatStream {
            run_id: active.run_id.clone(),
            preface,
            events: rx,
        })
    }

    fn start_run(self: &Arc<Self>, params: ChatParams) -> Result<ChatStream, GatewayError> {
        let (cwd, title, is_new) = match params.session_id.as_deref() {
            Some(session_id) => {
                let row = self.store.get_session(session_id)?.ok_or_else(|| {
                    GatewayError::SessionNotFound {
                        session_id: session_id.to_string(),
                    }
                })?;
                if let Some(requested) = params.cwd.as_deref() {
                    if resolve_cwd(requested) != resolve_cwd(&row.cwd) {
                        return Err(GatewayError::CwdMismatch {
                            session_id: session_id.to_string(),
                            requested: requested.to_string(),
                        });
                    }
                }
                (row.cwd, row.title, false)
            }
            None => {
                let requested = params.cwd.clone().ok_or_else(|| {
                    GatewayError::invalid_request("cwd is required for a new session")
                })?;
                let resolved = std::fs::canonicalize(&requested)
                    .ok()
                    .filter(|path| path.is_dir())
                    .ok_or_else(|| {
                        GatewayError::invalid_request(format!(
                            "cwd is not a directory: {requested}"
                        ))
                    })?;
                (
                    resolved.display().to_string(),
                    derive_title(&params.message),
                    true,
                )
            }
        };

        let run_id = Uuid::new_v4().to_string();
        let provisional_key = params
            .session_id
            .clone()
            .unwrap_or_else(|| run_id.clone());

        let (input, receiver) = InputStreamController::channel();
        input.push(InputEvent::new(params.message.clone()))?;

        let session = Arc::new(ActiveSession::new(
            run_id.clone(),
            cwd.clone(),
            is_new,
            Utc::now(),
            params.permission_mode.clone(),
            params.system_prompt.clone(),
            title,
            params.session_id.clone(),
            input,
        ));

        if let Err(existing) = self.registry.register(&provisional_key, session.clone()) {
            tracing::debug!(key = %provisional_key, "session went live concurrently, joining its run");
            return self.join_run(existing, params);
        }
        self.registry.register_run(&run_id, session.cancel.clone());

        let (_sink_id, rx) = session.sinks.attach();

        let config = AgentConfig {
            resume: params.session_id,
            cwd,
            permission_mode: params.permission_mode,
            system_prompt: params.system_prompt,
            cancel: session.cancel.clone(),
        };
        let stream = self.driver.run(receiver, config);

        tracing::info!(run_id = %run_id, key = %provisional_key, new = is_new, "starting run");
        let manager = self.clone();
        tokio::spawn(async move {
            drive(manager, session, provisional_key, stream).await;
        });

        Ok(ChatStream {
            run_id,
            preface: Vec::new(),
            events: rx,
        })
    }

    /// Moves the registry entry to a newly reported session id without
    /// announcing it; `message` events carry the id from here on.
    fn record_session_id(&self, session: &Arc<ActiveSession>, key: &mut String, new_id: &str) {
        self.registry.rebind(key, new_id, session.clone());
        *key = new_id.to_string();
        session.set_session_id(new_id.to_string());
    }

    /// Records a newly reported session id, persists the session, and
    /// announces it on the sinks.
    fn adopt_session_id(&self, session: &Arc<ActiveSession>, key: &mut String, new_id: &str) {
        self.record_session_id(session, key, new_id);

        if let Err(err) = self.store.upsert_session(
            new_id,
            &session.title,
            &session.cwd,
            session.started_at,
            Utc::now(),
        ) {
            tracing::warn!(session_id = new_id, error = %err, "failed to persist session");
        }

        session.sinks.publish(&OutboundEvent::Session {
            session_id: new_id.to_string(),
            cwd: session.cwd.clone(),
            is_new: session.is_new,
        });
    }
}

/// Consumes the agent's event stream for one run and fans gateway events out
/// to the session's sinks until the run reaches a terminal state.
async fn drive(
    manager: Arc<SessionManager>,
    session: Arc<ActiveSession>,
    provisional_key: String,
    mut stream: AgentEventStream,
) {
    let run_id = session.run_id.clone();
    let mut key = provisional_key.clone();
    let mut length = 0usize;
    let mut saw_text_this_turn = false;
    let mut failure = None;

    session.sinks.publish(&OutboundEvent::Run {
        run_id: run_id.clone(),
    });

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                failure = Some(err);
                break;
            }
        };

        match &event {
            AgentEvent::Init { session_id, .. } => {
                if session.session_id().as_deref() != Some(session_id.as_str()) {
                    manager.adopt_session_id(&session, &mut key, session_id);
                } else {
                    // id already known: resumed run, or a later init
                    session.sinks.publish(&OutboundEvent::Session {
                        session_id: session_id.clone(),
                        cwd: session.cwd.clone(),
                        is_new: false,
                    });
                }
            }
            AgentEvent::AssistantDelta { texts, .. } => {
                for text in texts {
                    saw_text_this_turn = true;
                    emit_tokens(&session, text, &mut length);
                }
            }
            AgentEvent::Result {
                text, session_id, ..
            } => {
                if session.session_id().is_none() {
                    let reported = session_id
                        .clone()
                        .or_else(|| find_session_id(event.raw()));
                    if let Some(id) = reported {
                        manager.adopt_session_id(&session, &mut key, &id);
                    }
                }
                // Turns that streamed no deltas still surface their summary.
                if !saw_text_this_turn {
                    if let Some(text) = text {
                        emit_tokens(&session, text, &mut length);
                    }
                }
                saw_text_this_turn = false;
                session
                    .idle
                    .arm_if_idle(manager.idle_timeout, &session.input);
            }
            AgentEvent::Other { raw } => {
                // ids surfacing in passthrough payloads are recorded quietly;
                // only init/result adoption announces a session event
                if session.session_id().is_none() {
                    if let Some(id) = find_session_id(raw) {
                        manager.record_session_id(&session, &mut key, &id);
                    }
                }
            }
        }

        session.sinks.publish(&OutboundEvent::Message {
            session_id: find_session_id(event.raw()).or_else(|| session.session_id()),
            payload: event.raw().clone(),
        });
    }

    let session_id = session.session_id();
    match failure {
        None => match session_id {
            Some(session_id) => {
                if let Err(err) = manager.store.upsert_session(
                    &session_id,
                    &session.title,
                    &session.cwd,
                    session.started_at,
                    Utc::now(),
                ) {
                    tracing::warn!(session_id = %session_id, error = %err, "failed to persist session");
                }
                tracing::info!(run_id = %run_id, session_id = %session_id, length, "run completed");
                session.sinks.publish(&OutboundEvent::Done {
                    session_id,
                    cwd: session.cwd.clone(),
                    length,
                });
            }
            None => {
                tracing::warn!(run_id = %run_id, "run ended without a session id");
                session.sinks.publish(&OutboundEvent::Error {
                    message: "agent did not report a session id".to_string(),
                });
            }
        },
        Some(_) if session.cancel.is_cancelled() => {
            tracing::info!(run_id = %run_id, "run stopped");
            session.sinks.publish(&OutboundEvent::Stopped {
                run_id: run_id.clone(),
                session_id,
            });
        }
        Some(err) => {
            tracing::error!(run_id = %run_id, error = %err, "run failed");
            session.sinks.publish(&OutboundEvent::Error {
                message: err.to_string(),
            });
        }
    }

    session.idle.cancel();
    session.input.end();
    manager.registry.remove(&key);
    manager.registry.remove(&provisional_key);
    manager.registry.remove_run(&run_id);
    session.sinks.close_all();
}

fn emit_tokens(session: &ActiveSession, text: &str, length: &mut usize) {
    let session_id = session.session_id();
    for piece in split_text(text) {
        *length += piece.chars().count();
        session.sinks.publish(&OutboundEvent::Token {
            session_id: session_id.clone(),
            text: piece,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockDriver;
    use crate::input_stream::InputReceiver;
    use serde_json::json;

    #[test]
    fn split_text_is_lossless() {
        let text = "hello  world\n  next";
        let pieces = split_text(text);
        assert_eq!(pieces, vec!["hello", "  ", "world", "\n  ", "next"]);
        assert_eq!(pieces.concat(), text);
        assert!(split_text("").is_empty());
        assert_eq!(split_text("   "), vec!["   "]);
    }

    #[test]
    fn derive_title_trims_truncates_and_defaults() {
        assert_eq!(derive_title("  fix the build  "), "fix the build");
        assert_eq!(derive_title("   "), "New session");
        assert_eq!(derive_title(""), "New session");

        let long = "this message is much longer than thirty characters";
        let title = derive_title(long);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn find_session_id_searches_breadth_first() {
        let payload = json!({
            "data": {"nested": {"sessionId": "deep"}},
            "items": [{"session_id": "in-array"}],
        });
        // both hits are at the same depth; object fields come first
        assert_eq!(find_session_id(&payload).as_deref(), Some("deep"));

        let top = json!({"session_id": "top", "data": {"session_id": "nested"}});
        assert_eq!(find_session_id(&top).as_deref(), Some("top"));
        assert_eq!(find_session_id(&json!({"other": 1})), None);
        assert_eq!(find_session_id(&json!({"session_id": ""})), None);
    }

    fn manager_with_driver(driver: Arc<dyn AgentDriver>, idle: Duration) -> Arc<SessionManager> {
        let store = Arc::new(SessionStore::in_memory().expect("store"));
        Arc::new(SessionManager::with_idle_timeout(store, driver, idle))
    }

    fn test_manager(idle: Duration) -> Arc<SessionManager> {
        manager_with_driver(Arc::new(MockDriver), idle)
    }

    /// Plays back a fixed event sequence regardless of input.
    struct ScriptDriver {
        events: Vec<AgentEvent>,
    }

    impl AgentDriver for ScriptDriver {
        fn run(&self, _input: InputReceiver, _config: AgentConfig) -> AgentEventStream {
            Box::pin(futures::stream::iter(
                self.events.clone().into_iter().map(Ok),
            ))
        }
    }

    fn params(message: &str, cwd: Option<&str>, session_id: Option<&str>) -> ChatParams {
        ChatParams {
            session_id: session_id.map(ToOwned::to_owned),
            cwd: cwd.map(ToOwned::to_owned),
            message: message.to_string(),
            permission_mode: "default".to_string(),
            system_prompt: None,
        }
    }

    async fn collect(mut stream: ChatStream) -> Vec<OutboundEvent> {
        let mut events = stream.preface;
        while let Some(event) = stream.events.recv().await {
            events.push(event);
        }
        events
    }

    fn token_text(events: &[OutboundEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                OutboundEvent::Token { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn new_run_streams_tokens_and_done() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir
            .path()
            .canonicalize()
            .expect("canonical tempdir")
            .to_string_lossy()
            .into_owned();
        let manager = test_manager(Duration::from_millis(50));

        let stream = manager
            .chat(params("hello", Some(&cwd), None))
            .expect("chat");
        let run_id = stream.run_id.clone();
        let events = collect(stream).await;

        match &events[0] {
            OutboundEvent::Run { run_id: reported } => assert_eq!(reported, &run_id),
            other => panic!("expected run first, got {other:?}"),
        }

        let session_id = events
            .iter()
            .find_map(|event| match event {
                OutboundEvent::Session {
                    session_id, is_new, ..
                } => {
                    assert!(*is_new);
                    Some(session_id.clone())
                }
                _ => None,
            })
            .expect("session event");

        assert_eq!(token_text(&events), "mock reply: hello");

        match events.last().expect("last event") {
            OutboundEvent::Done {
                session_id: done_id,
                length,
                ..
            } => {
                assert_eq!(done_id, &session_id);
                assert_eq!(*length, "mock reply: hello".chars().count());
            }
            other => panic!("expected done last, got {other:?}"),
        }

        let row = manager
            .store
            .get_session(&session_id)
            .expect("get")
            .expect("row");
        assert_eq!(row.title, "hello");
        assert_eq!(row.cwd, cwd);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn second_request_joins_live_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir.path().to_string_lossy().into_owned();
        let manager = test_manager(Duration::from_millis(300));

        let mut first = manager
            .chat(params("first", Some(&cwd), None))
            .expect("chat");
        let run_id = first.run_id.clone();

        let mut early = Vec::new();
        let session_id = loop {
            let event = first.events.recv().await.expect("event");
            early.push(event);
            if let Some(OutboundEvent::Session { session_id, .. }) = early.last() {
                break session_id.clone();
            }
        };

        let second = manager
            .chat(params("second", None, Some(&session_id)))
            .expect("join");
        assert_eq!(second.run_id, run_id);
        assert!(matches!(second.preface[0], OutboundEvent::Run { .. }));
        assert!(matches!(
            second.preface[1],
            OutboundEvent::Session { is_new: false, .. }
        ));

        while let Some(event) = first.events.recv().await {
            early.push(event);
        }

        let text = token_text(&early);
        assert!(text.contains("mock reply: first"));
        assert!(text.contains("mock reply: second"));

        let runs = early
            .iter()
            .filter(|event| matches!(event, OutboundEvent::Run { .. }))
            .count();
        assert_eq!(runs, 1);
        let dones = early
            .iter()
            .filter(|event| matches!(event, OutboundEvent::Done { .. }))
            .count();
        assert_eq!(dones, 1);
    }

    #[tokio::test]
    async fn stop_cancels_run_and_emits_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir.path().to_string_lossy().into_owned();
        let manager = test_manager(Duration::from_secs(5));

        let mut stream = manager
            .chat(params("please hang", Some(&cwd), None))
            .expect("chat");
        let run_id = stream.run_id.clone();

        // wait for the first delta so the agent is mid-turn
        loop {
            let event = stream.events.recv().await.expect("event");
            if matches!(event, OutboundEvent::Token { .. }) {
                break;
            }
        }

        manager.stop(&run_id).expect("stop");

        let mut stopped = None;
        while let Some(event) = stream.events.recv().await {
            if let OutboundEvent::Stopped {
                run_id: reported, ..
            } = &event
            {
                assert_eq!(reported, &run_id);
                stopped = Some(event);
            }
        }
        assert!(stopped.is_some());
        assert_eq!(manager.active_count(), 0);

        let err = manager.stop(&run_id).expect_err("run gone");
        assert!(matches!(err, GatewayError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn run_without_session_id_ends_in_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir.path().to_string_lossy().into_owned();
        let manager = test_manager(Duration::from_millis(50));

        let stream = manager.chat(params("noid", Some(&cwd), None)).expect("chat");
        let events = collect(stream).await;

        assert!(!events
            .iter()
            .any(|event| matches!(event, OutboundEvent::Session { .. })));
        assert!(!events
            .iter()
            .any(|event| matches!(event, OutboundEvent::Done { .. })));
        match events.last().expect("last event") {
            OutboundEvent::Error { message } => {
                assert!(message.contains("session id"));
            }
            other => panic!("expected error last, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_session_requires_existing_cwd() {
        let manager = test_manager(Duration::from_millis(50));

        let err = manager
            .chat(params("hi", None, None))
            .expect_err("missing cwd");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));

        let err = manager
            .chat(params("hi", Some("/definitely/not/a/dir"), None))
            .expect_err("bad cwd");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn resume_validates_session_and_cwd() {
        let manager = test_manager(Duration::from_millis(50));

        let err = manager
            .chat(params("hi", None, Some("ghost")))
            .expect_err("unknown session");
        assert!(matches!(err, GatewayError::SessionNotFound { .. }));

        manager
            .store
            .upsert_session("s1", "title", "/tmp/real", Utc::now(), Utc::now())
            .expect("seed");
        let err = manager
            .chat(params("hi", Some("/tmp/other"), Some("s1")))
            .expect_err("wrong cwd");
        assert!(matches!(err, GatewayError::CwdMismatch { .. }));
    }

    #[tokio::test]
    async fn resumed_run_reuses_stored_title() {
        let manager = test_manager(Duration::from_millis(50));
        manager
            .store
            .upsert_session("s-resume", "stored title", "/tmp/real", Utc::now(), Utc::now())
            .expect("seed");

        let stream = manager
            .chat(params("continue please", None, Some("s-resume")))
            .expect("chat");
        let events = collect(stream).await;

        // mock resumes under the same id; is_new stays false
        let is_new = events.iter().find_map(|event| match event {
            OutboundEvent::Session { is_new, .. } => Some(*is_new),
            _ => None,
        });
        assert_eq!(is_new, Some(false));

        let row = manager
            .store
            .get_session("s-resume")
            .expect("get")
            .expect("row");
        assert_eq!(row.title, "stored title");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resumes_share_one_run() {
        let manager = test_manager(Duration::from_millis(50));
        manager
            .store
            .upsert_session("s1", "title", "/tmp/real", Utc::now(), Utc::now())
            .expect("seed");

        for round in 0..20 {
            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let tasks: Vec<_> = (0..2)
                .map(|_| {
                    let manager = manager.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        manager.chat(params("go", None, Some("s1")))
                    })
                })
                .collect();

            let mut streams = Vec::new();
            for task in tasks {
                let stream = task
                    .await
                    .expect("join task")
                    .unwrap_or_else(|err| panic!("round {round}: chat failed: {err}"));
                streams.push(stream);
            }
            assert_eq!(streams[0].run_id, streams[1].run_id, "round {round}");

            // drain both feeds so the run finishes before the next round
            for stream in streams {
                collect(stream).await;
            }
        }
    }

    #[tokio::test]
    async fn idle_timer_ends_quiet_stream() {
        let (tx, _rx) = InputStreamController::channel();
        let idle = IdleTimer::new();
        idle.arm_if_idle(Duration::from_millis(10), &tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tx.is_ended());
    }

    #[tokio::test]
    async fn injection_disarms_idle_timer() {
        let (tx, _rx) = InputStreamController::channel();
        let idle = IdleTimer::new();
        idle.arm_if_idle(Duration::from_millis(20), &tx);
        idle.disarm_then(|| tx.push(InputEvent::new("more")))
            .expect("push");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!tx.is_ended());
        idle.cancel();
    }

    #[tokio::test]
    async fn armed_timer_spares_input_pushed_before_it_fires() {
        let (tx, _rx) = InputStreamController::channel();
        let idle = IdleTimer::new();
        idle.arm_if_idle(Duration::from_millis(20), &tx);
        // push racing the deadline without going through disarm_then
        tx.push(InputEvent::new("late")).expect("push");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!tx.is_ended());
        idle.cancel();
    }

    #[tokio::test]
    async fn arm_is_a_no_op_with_pending_input() {
        let (tx, _rx) = InputStreamController::channel();
        tx.push(InputEvent::new("queued")).expect("push");
        let idle = IdleTimer::new();
        idle.arm_if_idle(Duration::from_millis(10), &tx);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!tx.is_ended());
    }

    #[tokio::test]
    async fn cwd_check_resolves_equivalent_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir
            .path()
            .canonicalize()
            .expect("canonical tempdir")
            .to_string_lossy()
            .into_owned();
        let manager = test_manager(Duration::from_millis(50));

        // start under an alternate spelling of the same directory
        let slashed = format!("{cwd}/");
        let stream = manager
            .chat(params("hello", Some(&slashed), None))
            .expect("chat");
        let events = collect(stream).await;
        let session_id = events
            .iter()
            .find_map(|event| match event {
                OutboundEvent::Session { session_id, .. } => Some(session_id.clone()),
                _ => None,
            })
            .expect("session event");

        let row = manager
            .store
            .get_session(&session_id)
            .expect("get")
            .expect("row");
        assert_eq!(row.cwd, cwd);

        // the plain spelling passes the resume check
        let stream = manager
            .chat(params("again", Some(&cwd), Some(&session_id)))
            .expect("resume");
        let events = collect(stream).await;
        assert!(events
            .iter()
            .any(|event| matches!(event, OutboundEvent::Done { .. })));
    }

    #[tokio::test]
    async fn deep_scanned_id_is_recorded_without_announcement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cwd = dir.path().to_string_lossy().into_owned();
        let driver = Arc::new(ScriptDriver {
            events: vec![
                AgentEvent::Other {
                    raw: json!({"type": "stream_event", "data": {"sessionId": "s-deep"}}),
                },
                AgentEvent::Result {
                    text: Some("summary".to_string()),
                    session_id: None,
                    raw: json!({"type": "result", "result": "summary"}),
                },
            ],
        });
        let manager = manager_with_driver(driver, Duration::from_millis(50));

        let stream = manager.chat(params("hi", Some(&cwd), None)).expect("chat");
        let events = collect(stream).await;

        assert!(!events
            .iter()
            .any(|event| matches!(event, OutboundEvent::Session { .. })));
        match events.last().expect("last event") {
            OutboundEvent::Done { session_id, .. } => assert_eq!(session_id, "s-deep"),
            other => panic!("expected done last, got {other:?}"),
        }

        let row = manager
            .store
            .get_session("s-deep")
            .expect("get")
            .expect("row");
        assert_eq!(row.title, "hi");
    }
}
