use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use chat_gateway_error::{GatewayError, ProblemDetails};
use futures::{stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::events::OutboundEvent;
use crate::run::{ChatParams, SessionManager};
use crate::store::SessionStore;
use crate::transcripts::TranscriptDir;

const SERVER_INFO: &str = concat!("chat-gateway v", env!("CARGO_PKG_VERSION"));

/// Response header carrying the run id of the stream being returned, so a
/// client can stop the run without parsing the event feed.
pub const RUN_ID_HEADER: &str = "x-claude-run-id";

const PERMISSION_MODES: [&str; 4] = ["default", "acceptEdits", "bypassPermissions", "plan"];

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    sessions: Arc<SessionManager>,
    store: Arc<SessionStore>,
    transcripts: TranscriptDir,
}

impl AppState {
    pub fn new(
        auth: AuthConfig,
        sessions: Arc<SessionManager>,
        store: Arc<SessionStore>,
        transcripts: TranscriptDir,
    ) -> Self {
        Self {
            auth,
            sessions,
            store,
            transcripts,
        }
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut api_router = Router::new()
        .route("/health", get(get_health))
        .route("/chat", post(post_chat))
        .route("/chat/stop", post(post_chat_stop))
        .route("/sessions", get(list_sessions))
        .route("/sessions/load", post(load_sessions))
        .route("/sessions/:session_id", get(get_session))
        .route("/users/:user_id/settings", get(get_user_settings))
        .route("/users/:user_id/settings", put(put_user_settings))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        api_router = api_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .merge(api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("CHAT_GATEWAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        post_chat,
        post_chat_stop,
        list_sessions,
        load_sessions,
        get_session,
        get_user_settings,
        put_user_settings
    ),
    components(schemas(
        ChatRequest,
        StopRequest,
        StopResponse,
        HealthResponse,
        SessionSummary,
        SessionListResponse,
        SessionDetailResponse,
        LoadRequest,
        LoadResponse,
        UserSettingsRequest,
        UserSettingsResponse,
        ProblemDetails
    ))
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Gateway(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(GatewayError::Unauthorized.into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?;
    let value = value.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    pub message: String,
    /// When set, this user's stored settings fill in omitted fields.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<Value>,
}

fn default_system_prompt() -> Value {
    json!({ "type": "preset", "preset": "claude_code" })
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
pub struct StopRequest {
    pub run_id: String,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct StopResponse {
    pub run_id: String,
    pub stopping: bool,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub cwd: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
    pub active: bool,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct SessionDetailResponse {
    pub session_id: String,
    pub title: String,
    pub cwd: String,
    pub created_at: String,
    pub updated_at: String,
    pub active: bool,
    pub messages: Vec<Value>,
}

#[derive(Debug, Default, Deserialize, JsonSchema, ToSchema)]
pub struct LoadRequest {
    #[serde(default)]
    pub claude_dir: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct LoadResponse {
    pub claude_dir: String,
    pub sessions: usize,
    pub agent_runs: usize,
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
pub struct UserSettingsRequest {
    pub permission_mode: String,
    #[serde(default)]
    pub system_prompt: Option<Value>,
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct UserSettingsResponse {
    pub user_id: String,
    pub permission_mode: String,
    pub system_prompt: Option<Value>,
}

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "system"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

fn to_sse_event(event: &OutboundEvent) -> Event {
    let base = Event::default().event(event.name());
    base.json_data(event)
        .unwrap_or_else(|_| Event::default().event("error").data("{}"))
}

#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream of run events"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let stored = match request.user_id.as_deref() {
        Some(user_id) => state.store.get_user_settings(user_id)?,
        None => None,
    };

    let permission_mode = request
        .permission_mode
        .or_else(|| {
            stored
                .as_ref()
                .map(|settings| settings.permission_mode.clone())
        })
        .unwrap_or_else(|| "default".to_string());
    if !PERMISSION_MODES.contains(&permission_mode.as_str()) {
        return Err(GatewayError::invalid_request(format!(
            "unknown permission mode: {permission_mode}"
        ))
        .into());
    }

    let system_prompt = request
        .system_prompt
        .or_else(|| stored.and_then(|settings| settings.system_prompt))
        .unwrap_or_else(default_system_prompt);

    let chat = state.sessions.chat(ChatParams {
        session_id: request.session_id,
        cwd: request.cwd,
        message: request.message,
        permission_mode,
        system_prompt: Some(system_prompt),
    })?;

    let run_id = chat.run_id.clone();
    let preface = stream::iter(
        chat.preface
            .into_iter()
            .map(|event| Ok::<Event, Infallible>(to_sse_event(&event))),
    );
    let live = UnboundedReceiverStream::new(chat.events)
        .map(|event| Ok::<Event, Infallible>(to_sse_event(&event)));

    let mut response = Sse::new(preface.chain(live)).into_response();
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        response.headers_mut().insert(RUN_ID_HEADER, value);
    }
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/chat/stop",
    request_body = StopRequest,
    responses(
        (status = 200, body = StopResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat_stop(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StopRequest>,
) -> Result<Json<StopResponse>, ApiError> {
    state.sessions.stop(&request.run_id)?;
    Ok(Json(StopResponse {
        run_id: request.run_id,
        stopping: true,
    }))
}

#[utoipa::path(
    get,
    path = "/sessions",
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let rows = state.store.list_sessions()?;
    let sessions = rows
        .into_iter()
        .map(|row| SessionSummary {
            message_count: state.transcripts.count_messages(&row.cwd, &row.session_id),
            active: state.sessions.is_active(&row.session_id),
            session_id: row.session_id,
            title: row.title,
            cwd: row.cwd,
            created_at: row.created_at.to_rfc3339(),
            updated_at: row.updated_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(SessionListResponse { sessions }))
}

#[utoipa::path(
    get,
    path = "/sessions/{session_id}",
    responses(
        (status = 200, body = SessionDetailResponse),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let row = state
        .store
        .get_session(&session_id)?
        .ok_or(GatewayError::SessionNotFound { session_id })?;
    let messages = state.transcripts.load_messages(&row.cwd, &row.session_id);
    Ok(Json(SessionDetailResponse {
        active: state.sessions.is_active(&row.session_id),
        messages,
        session_id: row.session_id,
        title: row.title,
        cwd: row.cwd,
        created_at: row.created_at.to_rfc3339(),
        updated_at: row.updated_at.to_rfc3339(),
    }))
}

#[utoipa::path(
    post,
    path = "/sessions/load",
    request_body = LoadRequest,
    responses(
        (status = 200, body = LoadResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn load_sessions(
    State(state): State<Arc<AppState>>,
    request: Option<Json<LoadRequest>>,
) -> Result<Json<LoadResponse>, ApiError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let transcripts = match request.claude_dir {
        Some(dir) => TranscriptDir::new(dir),
        None => state.transcripts.clone(),
    };
    let stats = transcripts.bootstrap(&state.store)?;
    Ok(Json(LoadResponse {
        claude_dir: transcripts.root().display().to_string(),
        sessions: stats.sessions,
        agent_runs: stats.agent_runs,
    }))
}

#[utoipa::path(
    get,
    path = "/users/{user_id}/settings",
    responses((status = 200, body = UserSettingsResponse)),
    params(("user_id" = String, Path, description = "User id")),
    tag = "users"
)]
async fn get_user_settings(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserSettingsResponse>, ApiError> {
    let settings = state.store.get_user_settings(&user_id)?;
    Ok(Json(match settings {
        Some(settings) => UserSettingsResponse {
            user_id: settings.user_id,
            permission_mode: settings.permission_mode,
            system_prompt: settings.system_prompt,
        },
        None => UserSettingsResponse {
            user_id,
            permission_mode: "default".to_string(),
            system_prompt: None,
        },
    }))
}

#[utoipa::path(
    put,
    path = "/users/{user_id}/settings",
    request_body = UserSettingsRequest,
    responses(
        (status = 200, body = UserSettingsResponse),
        (status = 400, body = ProblemDetails)
    ),
    params(("user_id" = String, Path, description = "User id")),
    tag = "users"
)]
async fn put_user_settings(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<UserSettingsRequest>,
) -> Result<Json<UserSettingsResponse>, ApiError> {
    if !PERMISSION_MODES.contains(&request.permission_mode.as_str()) {
        return Err(GatewayError::invalid_request(format!(
            "unknown permission mode: {}",
            request.permission_mode
        ))
        .into());
    }

    let settings = state.store.upsert_user_settings(
        &user_id,
        &request.permission_mode,
        request.system_prompt.as_ref(),
    )?;
    Ok(Json(UserSettingsResponse {
        user_id: settings.user_id,
        permission_mode: settings.permission_mode,
        system_prompt: settings.system_prompt,
    }))
}
