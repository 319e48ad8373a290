use std::pin::Pin;
use std::process::Stdio;

use chat_gateway_error::GatewayError;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::events::InputEvent;
use crate::input_stream::InputReceiver;

/// Configuration bundle captured at run start.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub resume: Option<String>,
    pub cwd: String,
    pub permission_mode: String,
    pub system_prompt: Option<Value>,
    pub cancel: CancellationToken,
}

/// The closed subset of upstream event shapes the gateway acts on. Anything
/// unrecognized passes through as `Other` with its raw payload intact.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Init {
        session_id: String,
        raw: Value,
    },
    AssistantDelta {
        texts: Vec<String>,
        raw: Value,
    },
    Result {
        text: Option<String>,
        session_id: Option<String>,
        raw: Value,
    },
    Other {
        raw: Value,
    },
}

impl AgentEvent {
    pub fn raw(&self) -> &Value {
        match self {
            Self::Init { raw, .. }
            | Self::AssistantDelta { raw, .. }
            | Self::Result { raw, .. }
            | Self::Other { raw } => raw,
        }
    }
}

pub type AgentEventStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, GatewayError>> + Send>>;

/// Upstream conversational agent. Must keep accepting input events pushed
/// after the output stream has started iterating.
pub trait AgentDriver: Send + Sync + 'static {
    fn run(&self, input: InputReceiver, config: AgentConfig) -> AgentEventStream;
}

/// Maps one upstream stream-json line onto the event subset the run driver
/// handles.
pub fn classify(raw: Value) -> AgentEvent {
    match raw.get("type").and_then(Value::as_str) {
        Some("system") if raw.get("subtype").and_then(Value::as_str) == Some("init") => {
            let session_id = raw
                .get("session_id")
                .or_else(|| raw.get("data").and_then(|data| data.get("session_id")))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            match session_id {
                Some(session_id) => AgentEvent::Init { session_id, raw },
                None => AgentEvent::Other { raw },
            }
        }
        Some("assistant") => {
            let texts = raw
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|block| {
                            block.get("type").and_then(Value::as_str) == Some("text")
                        })
                        .filter_map(|block| block.get("text").and_then(Value::as_str))
                        .filter(|text| !text.is_empty())
                        .map(ToOwned::to_owned)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            AgentEvent::AssistantDelta { texts, raw }
        }
        Some("result") => {
            let text = raw
                .get("result")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            let session_id = raw
                .get("session_id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            AgentEvent::Result {
                text,
                session_id,
                raw,
            }
        }
        _ => AgentEvent::Other { raw },
    }
}

fn input_line(event: &InputEvent) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": event.text }],
        },
    })
}

/// Drives the `claude` CLI in bidirectional stream-json mode: input events
/// become JSON lines on stdin, stdout JSON lines become [`AgentEvent`]s.
#[derive(Debug, Clone)]
pub struct ClaudeCliDriver {
    binary: String,
}

impl ClaudeCliDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ClaudeCliDriver {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl AgentDriver for ClaudeCliDriver {
    fn run(&self, input: InputReceiver, config: AgentConfig) -> AgentEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let binary = self.binary.clone();
        tokio::spawn(async move {
            if let Err(err) = drive_process(binary, input, config, &tx).await {
                let _ = tx.send(Err(err));
            }
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

async fn drive_process(
    binary: String,
    mut input: InputReceiver,
    config: AgentConfig,
    tx: &mpsc::UnboundedSender<Result<AgentEvent, GatewayError>>,
) -> Result<(), GatewayError> {
    let mut command = Command::new(&binary);
    command
        .arg("--print")
        .args(["--input-format", "stream-json"])
        .args(["--output-format", "stream-json"])
        .arg("--verbose")
        .arg("--include-partial-messages")
        .args(["--permission-mode", &config.permission_mode]);
    if let Some(resume) = &config.resume {
        command.args(["--resume", resume]);
    }
    // A plain-string prompt maps to the CLI flag; the structured preset form
    // is the CLI's own default and needs no flag.
    if let Some(Value::String(prompt)) = &config.system_prompt {
        command.args(["--system-prompt", prompt]);
    }
    command
        .current_dir(&config.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| GatewayError::agent_failed("agent stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| GatewayError::agent_failed("agent stdout unavailable"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| GatewayError::agent_failed("agent stderr unavailable"))?;

    let writer = tokio::spawn(async move {
        while let Some(Ok(event)) = input.next().await {
            let mut line = input_line(&event).to_string();
            line.push('\n');
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
        // Dropping stdin closes the agent's input; it finishes the turn in
        // flight and exits.
    });

    let stderr_tail = tokio::spawn(async move {
        let mut buffer = String::new();
        let _ = stderr.read_to_string(&mut buffer).await;
        buffer
    });

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = config.cancel.cancelled() => {
                let _ = child.start_kill();
                writer.abort();
                return Err(GatewayError::agent_failed("run aborted"));
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(line) {
                            Ok(raw) => {
                                tracing::debug!(payload = %raw, "agent event");
                                if tx.send(Ok(classify(raw))).is_err() {
                                    let _ = child.start_kill();
                                    writer.abort();
                                    return Ok(());
                                }
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, line, "skipping unparseable agent line");
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    writer.abort();
    let status = child.wait().await?;
    if !status.success() {
        let stderr = stderr_tail.await.unwrap_or_default();
        let detail = stderr.lines().rev().take(5).collect::<Vec<_>>();
        return Err(GatewayError::agent_failed(format!(
            "claude exited with {status}: {}",
            detail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        )));
    }
    Ok(())
}

/// Scripted in-process agent used by tests and `--mock-agent`: echoes each
/// input as a delta plus result, which exercises injection, idle-timeout and
/// stop paths without spawning a process.
///
/// Recognized markers in the message text: `hang` parks after the first
/// delta until cancelled, `noid` suppresses every session id the driver
/// would otherwise report.
#[derive(Debug, Clone, Default)]
pub struct MockDriver;

impl AgentDriver for MockDriver {
    fn run(&self, mut input: InputReceiver, config: AgentConfig) -> AgentEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let session_id = config
                .resume
                .clone()
                .unwrap_or_else(|| format!("mock-{}", uuid::Uuid::new_v4()));
            let mut init_sent = false;
            loop {
                let event = tokio::select! {
                    _ = config.cancel.cancelled() => {
                        let _ = tx.send(Err(GatewayError::agent_failed("run aborted")));
                        return;
                    }
                    item = input.next() => match item {
                        Some(Ok(event)) => event,
                        Some(Err(_)) | None => return,
                    }
                };

                let suppress_id = event.text.contains("noid");
                if !init_sent && !suppress_id {
                    init_sent = true;
                    let raw = json!({
                        "type": "system",
                        "subtype": "init",
                        "session_id": session_id,
                    });
                    if tx
                        .send(Ok(AgentEvent::Init {
                            session_id: session_id.clone(),
                            raw,
                        }))
                        .is_err()
                    {
                        return;
                    }
                }

                let reply = format!("mock reply: {}", event.text);
                let raw = json!({
                    "type": "assistant",
                    "message": {
                        "role": "assistant",
                        "content": [{ "type": "text", "text": reply }],
                    },
                });
                if tx
                    .send(Ok(AgentEvent::AssistantDelta {
                        texts: vec![reply.clone()],
                        raw,
                    }))
                    .is_err()
                {
                    return;
                }

                if event.text.contains("hang") {
                    config.cancel.cancelled().await;
                    let _ = tx.send(Err(GatewayError::agent_failed("run aborted")));
                    return;
                }

                let mut raw = json!({
                    "type": "result",
                    "subtype": "success",
                    "result": reply,
                });
                if !suppress_id {
                    raw["session_id"] = Value::String(session_id.clone());
                }
                let result = AgentEvent::Result {
                    text: Some(reply),
                    session_id: (!suppress_id).then(|| session_id.clone()),
                    raw,
                };
                if tx.send(Ok(result)).is_err() {
                    return;
                }
            }
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}
