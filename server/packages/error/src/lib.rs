use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    Unauthorized,
    SessionNotFound,
    RunNotFound,
    CwdMismatch,
    StreamClosed,
    AgentFailed,
    Storage,
    Io,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:chat-gateway:error:invalid_request",
            Self::Conflict => "urn:chat-gateway:error:conflict",
            Self::Unauthorized => "urn:chat-gateway:error:unauthorized",
            Self::SessionNotFound => "urn:chat-gateway:error:session_not_found",
            Self::RunNotFound => "urn:chat-gateway:error:run_not_found",
            Self::CwdMismatch => "urn:chat-gateway:error:cwd_mismatch",
            Self::StreamClosed => "urn:chat-gateway:error:stream_closed",
            Self::AgentFailed => "urn:chat-gateway:error:agent_failed",
            Self::Storage => "urn:chat-gateway:error:storage",
            Self::Io => "urn:chat-gateway:error:io",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::Unauthorized => "Unauthorized",
            Self::SessionNotFound => "Session Not Found",
            Self::RunNotFound => "Run Not Found",
            Self::CwdMismatch => "Working Directory Mismatch",
            Self::StreamClosed => "Stream Closed",
            Self::AgentFailed => "Agent Failed",
            Self::Storage => "Storage Error",
            Self::Io => "I/O Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::Unauthorized => 401,
            Self::SessionNotFound => 404,
            Self::RunNotFound => 404,
            Self::CwdMismatch => 400,
            Self::StreamClosed => 409,
            Self::AgentFailed => 502,
            Self::Storage => 500,
            Self::Io => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("unauthorized")]
    Unauthorized,
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },
    #[error("cwd mismatch for session {session_id}: {requested}")]
    CwdMismatch {
        session_id: String,
        requested: String,
    },
    #[error("input stream already ended")]
    StreamClosed,
    #[error("agent failed: {message}")]
    AgentFailed { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn agent_failed(message: impl Into<String>) -> Self {
        Self::AgentFailed {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::Unauthorized => ErrorType::Unauthorized,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::RunNotFound { .. } => ErrorType::RunNotFound,
            Self::CwdMismatch { .. } => ErrorType::CwdMismatch,
            Self::StreamClosed => ErrorType::StreamClosed,
            Self::AgentFailed { .. } => ErrorType::AgentFailed,
            Self::Storage { .. } => ErrorType::Storage,
            Self::Io(_) => ErrorType::Io,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::SessionNotFound { session_id } | Self::CwdMismatch { session_id, .. } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::RunNotFound { run_id } => {
                extensions.insert("runId".to_string(), Value::String(run_id.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}
