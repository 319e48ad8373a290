use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::agent::{AgentDriver, ClaudeCliDriver, MockDriver};
use crate::router::{build_router_with_state, AppState, AuthConfig};
use crate::run::SessionManager;
use crate::store::SessionStore;
use crate::transcripts::TranscriptDir;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;

#[derive(Parser, Debug)]
#[command(name = "chat-gateway", bin_name = "chat-gateway")]
#[command(about = "Session gateway for the Claude CLI", version)]
#[command(arg_required_else_help = true)]
pub struct ChatGatewayCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat gateway HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding Claude CLI state; defaults to ~/.claude.
    #[arg(long = "claude-dir")]
    claude_dir: Option<PathBuf>,

    /// SQLite database path; defaults to <claude-dir>/chat-gateway.db.
    #[arg(long = "db")]
    db: Option<PathBuf>,

    /// Claude CLI binary to spawn for runs.
    #[arg(long = "claude-bin", default_value = "claude")]
    claude_bin: String,

    /// Use the built-in scripted agent instead of spawning the CLI.
    #[arg(long = "mock-agent")]
    mock_agent: bool,

    /// Skip the transcript scan at startup.
    #[arg(long = "no-bootstrap")]
    no_bootstrap: bool,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_chat_gateway() -> Result<(), CliError> {
    let cli = ChatGatewayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    match &cli.command {
        Command::Server(args) => run_server(cli.token.clone(), args),
    }
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

fn default_claude_dir() -> PathBuf {
    dirs::home_dir()
        .map(|dir| dir.join(".claude"))
        .unwrap_or_else(|| PathBuf::from(".claude"))
}

fn run_server(token: Option<String>, server: &ServerArgs) -> Result<(), CliError> {
    let auth = match token {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };

    let claude_dir = server
        .claude_dir
        .clone()
        .unwrap_or_else(default_claude_dir);
    let db_path = server
        .db
        .clone()
        .unwrap_or_else(|| claude_dir.join("chat-gateway.db"));

    let store = Arc::new(
        SessionStore::open(&db_path).map_err(|err| CliError::Server(err.to_string()))?,
    );
    let transcripts = TranscriptDir::new(claude_dir);

    if !server.no_bootstrap {
        // Startup bootstrap is best effort; a missing claude dir just means
        // there is nothing to import yet.
        match transcripts.bootstrap(&store) {
            Ok(stats) => {
                tracing::info!(
                    sessions = stats.sessions,
                    agent_runs = stats.agent_runs,
                    "imported transcripts"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "transcript bootstrap skipped");
            }
        }
    }

    let driver: Arc<dyn AgentDriver> = if server.mock_agent {
        tracing::warn!("using mock agent, no Claude CLI will be spawned");
        Arc::new(MockDriver)
    } else {
        Arc::new(ClaudeCliDriver::new(server.claude_bin.clone()))
    };

    let sessions = Arc::new(SessionManager::new(store.clone(), driver));
    let state = Arc::new(AppState::new(auth, sessions, store, transcripts));
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
