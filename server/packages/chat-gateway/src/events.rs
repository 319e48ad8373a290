use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Event published to every sink attached to an active session.
///
/// Serialized untagged: the SSE layer carries the variant name in the
/// `event:` field, the data object holds only the payload fields.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum OutboundEvent {
    Run {
        run_id: String,
    },
    Session {
        session_id: String,
        cwd: String,
        is_new: bool,
    },
    Token {
        session_id: Option<String>,
        text: String,
    },
    Message {
        session_id: Option<String>,
        payload: Value,
    },
    Done {
        session_id: String,
        cwd: String,
        length: usize,
    },
    Error {
        message: String,
    },
    Stopped {
        run_id: String,
        session_id: Option<String>,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Session { .. } => "session",
            Self::Token { .. } => "token",
            Self::Message { .. } => "message",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Stopped { .. } => "stopped",
        }
    }
}

/// One user input handed to the upstream agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub text: String,
}

impl InputEvent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}
