use std::collections::HashMap;
use std::sync::Arc;

use chat_gateway_error::GatewayError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::fanout::SinkSet;
use crate::input_stream::InputStreamController;
use crate::run::IdleTimer;

/// Live state for one session with a run in flight. Owned by the registry
/// from run start until the run reaches a terminal state.
#[derive(Debug)]
pub struct ActiveSession {
    pub run_id: String,
    pub cancel: CancellationToken,
    /// Immutable for the life of the session; a request naming a different
    /// cwd for this session is rejected before it touches the run.
    pub cwd: String,
    pub is_new: bool,
    pub started_at: DateTime<Utc>,
    /// Captured at run start; later injected messages do not change them.
    pub permission_mode: String,
    pub system_prompt: Option<Value>,
    /// Resolved before the run starts: the stored title when resuming, a
    /// derivation of the first message otherwise.
    pub title: String,
    pub sinks: SinkSet,
    pub input: InputStreamController,
    pub idle: IdleTimer,
    session_id: Mutex<Option<String>>,
}

impl ActiveSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        cwd: String,
        is_new: bool,
        started_at: DateTime<Utc>,
        permission_mode: String,
        system_prompt: Option<Value>,
        title: String,
        session_id: Option<String>,
        input: InputStreamController,
    ) -> Self {
        Self {
            run_id,
            cancel: CancellationToken::new(),
            cwd,
            is_new,
            started_at,
            permission_mode,
            system_prompt,
            title,
            sinks: SinkSet::new(),
            input,
            idle: IdleTimer::new(),
            session_id: Mutex::new(session_id),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub fn set_session_id(&self, session_id: String) {
        *self.session_id.lock() = Some(session_id);
    }
}

/// Process-wide map from session key (provisional run id or real session id)
/// to active session records, plus the adjacent run-id → cancellation map
/// used by out-of-band stop requests. Owned by the application state and
/// injected into handlers; never a module-level singleton.
#[derive(Debug, Default)]
pub struct ActiveSessions {
    sessions: Mutex<HashMap<String, Arc<ActiveSession>>>,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<ActiveSession>> {
        self.sessions.lock().get(key).cloned()
    }

    /// Registers the record under the key, or hands back the record already
    /// live there so the caller can join its run instead. Lookup and insert
    /// happen under one lock acquisition; no interleaving request can make
    /// both callers believe they started the run.
    pub fn register(
        &self,
        key: &str,
        record: Arc<ActiveSession>,
    ) -> Result<(), Arc<ActiveSession>> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(key) {
            return Err(existing.clone());
        }
        sessions.insert(key.to_string(), record);
        Ok(())
    }

    /// Atomically moves a record from the provisional key to the resolved
    /// session id. No interleaving lookup can observe the record under
    /// neither key.
    pub fn rebind(&self, old_key: &str, new_key: &str, record: Arc<ActiveSession>) {
        if old_key == new_key {
            return;
        }
        let mut sessions = self.sessions.lock();
        sessions.remove(old_key);
        sessions.insert(new_key.to_string(), record);
    }

    /// Removes a mapping; absent keys are fine, finalization removes both
    /// the provisional and the real key.
    pub fn remove(&self, key: &str) {
        self.sessions.lock().remove(key);
    }

    pub fn register_run(&self, run_id: &str, cancel: CancellationToken) {
        self.runs.lock().insert(run_id.to_string(), cancel);
    }

    /// Triggers the cancellation handle for a run.
    pub fn cancel_run(&self, run_id: &str) -> Result<(), GatewayError> {
        let runs = self.runs.lock();
        match runs.get(run_id) {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            }
            None => Err(GatewayError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    pub fn remove_run(&self, run_id: &str) {
        self.runs.lock().remove(run_id);
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
