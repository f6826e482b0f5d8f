use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gateway_core::{
    event_channel, AdapterError, AgentAdapter, AgentInfo, Attachment, EventReceiver, EventSender,
    GatewayConfig, McpServerConfig, McpTransportConfig, OperationId, PermissionArbiter,
    PermissionHandler, PermissionOption, PermissionRequest, PermissionResponse, SessionId,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::decode::{acp_option_kind, handle_session_update, mark_pending_permission, TurnState};

enum Command {
    Initialize {
        reply: oneshot::Sender<Result<AgentInfo, AdapterError>>,
    },
    NewSession {
        mcp_servers: Vec<McpServerConfig>,
        reply: oneshot::Sender<Result<SessionId, AdapterError>>,
    },
    LoadSession {
        session_id: SessionId,
        mcp_servers: Vec<McpServerConfig>,
        reply: oneshot::Sender<Result<SessionId, AdapterError>>,
    },
    Prompt {
        message: String,
        reply: oneshot::Sender<Result<(), AdapterError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), AdapterError>>,
    },
    Close,
}

/// The ACP adapter: strict JSON-RPC 2.0 over stdio, with an explicit
/// `jsonrpc: "2.0"` field on every request/response, matching the dialect
/// ACP agents expect. One decoder task owns the wire and a pending-request
/// correlator; public methods forward through `cmd_tx` and await a oneshot
/// reply.
pub struct AcpAdapter {
    config: GatewayConfig,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    events: Mutex<Option<EventReceiver>>,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Arc<Mutex<SessionId>>,
    connected: AtomicBool,
    supports_load_session: Arc<AtomicBool>,
    /// Context text queued by a fork-style [`AgentAdapter::load_session`] to
    /// be prepended to the next `prompt` call.
    pending_context: Arc<Mutex<Option<String>>>,
}

impl AcpAdapter {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            cmd_tx: Mutex::new(None),
            events: Mutex::new(None),
            permission_handler: Arc::new(Mutex::new(None)),
            session_id: Arc::new(Mutex::new(SessionId::placeholder())),
            connected: AtomicBool::new(false),
            supports_load_session: Arc::new(AtomicBool::new(false)),
            pending_context: Arc::new(Mutex::new(None)),
        }
    }

    fn command_sender(&self) -> Result<mpsc::UnboundedSender<Command>, AdapterError> {
        self.cmd_tx.lock().unwrap().clone().ok_or(AdapterError::NotInitialized)
    }
}

fn mcp_servers_json(mcp_servers: &[McpServerConfig]) -> Value {
    Value::Array(
        mcp_servers
            .iter()
            .map(|server| match &server.transport {
                McpTransportConfig::Stdio { command, args } => json!({
                    "name": server.name,
                    "command": command,
                    "args": args,
                }),
                McpTransportConfig::Sse { url } | McpTransportConfig::Http { url } => json!({
                    "name": server.name,
                    "url": url,
                }),
            })
            .collect(),
    )
}

#[async_trait]
impl AgentAdapter for AcpAdapter {
    async fn connect(
        &self,
        stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Result<(), AdapterError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::AlreadyConnected);
        }

        let (event_tx, event_rx) = event_channel("acp");
        *self.events.lock().unwrap() = Some(event_rx);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);

        let permission_handler = self.permission_handler.clone();
        let session_id = self.session_id.clone();
        let permission_timeout = self.config.permission_timeout();
        let work_dir = self
            .config
            .work_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        let supports_load_session = self.supports_load_session.clone();
        let pending_context = self.pending_context.clone();

        tokio::spawn(run_decoder(
            stdin,
            stdout,
            cmd_rx,
            event_tx,
            permission_handler,
            session_id,
            permission_timeout,
            work_dir,
            supports_load_session,
            pending_context,
        ));

        Ok(())
    }

    async fn initialize(&self) -> Result<AgentInfo, AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::Initialize { reply: reply_tx })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    async fn new_session(&self, mcp_servers: &[McpServerConfig]) -> Result<SessionId, AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::NewSession { mcp_servers: mcp_servers.to_vec(), reply: reply_tx })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    async fn load_session(&self, session_id: SessionId) -> Result<SessionId, AdapterError> {
        if !self.supports_load_session.load(Ordering::SeqCst) {
            return Err(AdapterError::LoadSessionUnsupported);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::LoadSession {
                session_id,
                mcp_servers: self.config.mcp_servers().to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    async fn prompt(&self, message: &str, _attachments: &[Attachment]) -> Result<(), AdapterError> {
        let message = match self.pending_context.lock().unwrap().take() {
            Some(context) => format!("{context}\n\n{message}"),
            None => message.to_string(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::Prompt { message, reply: reply_tx })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::Cancel { reply: reply_tx })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    fn updates(&self) -> Option<EventReceiver> {
        self.events.lock().unwrap().take()
    }

    fn set_permission_handler(&self, handler: Option<Arc<dyn PermissionHandler>>) {
        *self.permission_handler.lock().unwrap() = handler;
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if let Some(tx) = self.cmd_tx.lock().unwrap().take() {
            let _ = tx.send(Command::Close);
        }
        Ok(())
    }

    fn requires_process_kill(&self) -> bool {
        false
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_decoder(
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: EventSender,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Arc<Mutex<SessionId>>,
    permission_timeout: Option<std::time::Duration>,
    work_dir: String,
    supports_load_session: Arc<AtomicBool>,
    pending_context: Arc<Mutex<Option<String>>>,
) {
    let mut stdin = stdin;
    let mut lines = BufReader::new(stdout).lines();
    let mut state = TurnState::new(session_id.lock().unwrap().clone());

    let next_id = AtomicU64::new(1);
    let mut pending: HashSet<u64> = HashSet::new();
    let mut pending_initialize: Option<oneshot::Sender<Result<AgentInfo, AdapterError>>> = None;
    let mut pending_new_session: Option<oneshot::Sender<Result<SessionId, AdapterError>>> = None;
    let mut pending_prompt: Option<oneshot::Sender<Result<(), AdapterError>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Initialize { reply }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        pending.insert(id);
                        let params = json!({
                            "protocolVersion": 1,
                            "clientCapabilities": { "fs": { "readTextFile": true, "writeTextFile": true } },
                        });
                        if let Err(err) = write_message(&mut stdin, json!({
                            "jsonrpc": "2.0", "id": id, "method": "initialize", "params": params,
                        })).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_initialize = Some(reply);
                    }
                    Some(Command::NewSession { mcp_servers, reply }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        pending.insert(id);
                        let params = json!({ "cwd": work_dir, "mcpServers": mcp_servers_json(&mcp_servers) });
                        if let Err(err) = write_message(&mut stdin, json!({
                            "jsonrpc": "2.0", "id": id, "method": "session/new", "params": params,
                        })).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_new_session = Some(reply);
                    }
                    Some(Command::LoadSession { session_id: to_load, mcp_servers, reply }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        pending.insert(id);
                        let params = json!({
                            "sessionId": to_load.as_str(),
                            "cwd": work_dir,
                            "mcpServers": mcp_servers_json(&mcp_servers),
                        });
                        if let Err(err) = write_message(&mut stdin, json!({
                            "jsonrpc": "2.0", "id": id, "method": "session/load", "params": params,
                        })).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_new_session = Some(reply);
                    }
                    Some(Command::Prompt { message, reply }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        let params = json!({
                            "sessionId": state.session_id.as_str(),
                            "prompt": [{ "type": "text", "text": message }],
                        });
                        pending.insert(id);
                        if let Err(err) = write_message(&mut stdin, json!({
                            "jsonrpc": "2.0", "id": id, "method": "session/prompt", "params": params,
                        })).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_prompt = Some(reply);
                    }
                    Some(Command::Cancel { reply }) => {
                        let params = json!({ "sessionId": state.session_id.as_str() });
                        let result = write_message(&mut stdin, json!({
                            "jsonrpc": "2.0", "method": "session/cancel", "params": params,
                        }))
                            .await
                            .map_err(AdapterError::Io);
                        let _ = reply.send(result);
                    }
                    Some(Command::Close) | None => {
                        let _ = stdin.shutdown().await;
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                            warn!(line = %raw, "failed to parse acp jsonrpc line");
                            continue;
                        };

                        let id = value.get("id").cloned();
                        let method = value.get("method").and_then(Value::as_str).map(str::to_string);

                        match (id, method) {
                            (Some(id), Some(method)) if method == "session/requestPermission" => {
                                handle_permission_request(
                                    &mut stdin,
                                    &id,
                                    value.get("params").unwrap_or(&Value::Null),
                                    &mut state,
                                    &permission_handler,
                                    &events,
                                    permission_timeout,
                                )
                                    .await;
                            }
                            (Some(id), Some(method)) => {
                                debug!(id = ?id, method, "unrecognized acp incoming request, declining");
                                let _ = write_message(&mut stdin, json!({
                                    "jsonrpc": "2.0", "id": id,
                                    "error": { "code": -32601, "message": "method not found" },
                                }))
                                    .await;
                            }
                            (Some(id), None) => {
                                let Some(id_num) = id.as_u64() else { continue };
                                if !pending.remove(&id_num) {
                                    continue;
                                }
                                let result = if let Some(error) = value.get("error") {
                                    Err(AdapterError::ProtocolError {
                                        context: "acp jsonrpc",
                                        message: error.to_string(),
                                    })
                                } else {
                                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                                };

                                match result {
                                    Ok(result_value) => {
                                        if let Some(reply) = pending_initialize.take() {
                                            let supports = result_value
                                                .get("agentCapabilities")
                                                .and_then(|c| c.get("loadSession"))
                                                .and_then(Value::as_bool)
                                                .unwrap_or(false);
                                            supports_load_session.store(supports, Ordering::SeqCst);
                                            let _ = reply.send(Ok(AgentInfo {
                                                name: "acp".to_string(),
                                                version: result_value
                                                    .get("protocolVersion")
                                                    .map(|v| v.to_string())
                                                    .unwrap_or_else(|| "unknown".to_string()),
                                            }));
                                        } else if let Some(reply) = pending_new_session.take() {
                                            let sid = result_value
                                                .get("sessionId")
                                                .and_then(Value::as_str)
                                                .map(SessionId::from_upstream)
                                                .unwrap_or_else(|| state.session_id.clone());
                                            state.session_id = sid.clone();
                                            *session_id.lock().unwrap() = sid.clone();
                                            if let Some(context) = result_value.get("context").and_then(Value::as_str) {
                                                *pending_context.lock().unwrap() = Some(context.to_string());
                                            }
                                            let _ = reply.send(Ok(sid));
                                        } else if let Some(reply) = pending_prompt.take() {
                                            let stop_reason = result_value
                                                .get("stopReason")
                                                .and_then(Value::as_str)
                                                .unwrap_or("end_turn");
                                            let is_error = stop_reason == "refusal";
                                            events.send(complete_event(&state, is_error));
                                            let _ = reply.send(Ok(()));
                                        }
                                    }
                                    Err(err) => {
                                        if let Some(reply) = pending_initialize.take() {
                                            let _ = reply.send(Err(err));
                                        } else if let Some(reply) = pending_new_session.take() {
                                            let _ = reply.send(Err(err));
                                        } else if let Some(reply) = pending_prompt.take() {
                                            let _ = reply.send(Err(err));
                                        }
                                    }
                                }
                            }
                            (None, Some(method)) if method == "session/update" => {
                                let params = value.get("params").cloned().unwrap_or(Value::Null);
                                let Some(update) = params.get("update") else { continue };
                                for event in handle_session_update(&mut state, update) {
                                    events.send(event);
                                }
                            }
                            (None, Some(other)) => {
                                debug!(method = other, "unrecognized acp notification, skipping");
                            }
                            (None, None) => {
                                debug!(line = %raw, "acp line is neither request, response, nor notification");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("acp stdout closed");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "error reading acp stdout");
                        break;
                    }
                }
            }
        }
    }

    if let Some(reply) = pending_initialize.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
    if let Some(reply) = pending_new_session.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
    if let Some(reply) = pending_prompt.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
}

fn complete_event(state: &TurnState, is_error: bool) -> gateway_core::AgentEvent {
    gateway_core::AgentEvent::new(
        state.session_id.clone(),
        OperationId::empty(),
        gateway_core::AgentEventKind::Complete {
            data: gateway_core::CompleteData {
                cost_usd: None,
                duration_ms: None,
                num_turns: None,
                input_tokens: None,
                output_tokens: None,
            },
            is_error,
        },
    )
}

async fn write_message(stdin: &mut (impl AsyncWrite + Unpin), message: Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await
}

async fn handle_permission_request(
    stdin: &mut (impl AsyncWrite + Unpin),
    id: &Value,
    params: &Value,
    state: &mut TurnState,
    permission_handler: &Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    events: &EventSender,
    permission_timeout: Option<std::time::Duration>,
) {
    let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
    let tool_call_id = tool_call.get("toolCallId").and_then(Value::as_str).unwrap_or("").to_string();
    let title = tool_call
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("tool call")
        .to_string();

    events.send(mark_pending_permission(state, &tool_call_id, &title));

    let options: Vec<PermissionOption> = params
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|opt| {
                    let option_id = opt.get("optionId").and_then(Value::as_str)?.to_string();
                    let name = opt.get("name").and_then(Value::as_str).unwrap_or(&option_id).to_string();
                    let kind = opt
                        .get("kind")
                        .and_then(Value::as_str)
                        .and_then(acp_option_kind)
                        .unwrap_or(gateway_core::OptionKind::RejectOnce);
                    Some(PermissionOption { option_id, name, kind })
                })
                .collect()
        })
        .unwrap_or_default();

    let request = PermissionRequest {
        session_id: state.session_id.clone(),
        tool_call_id,
        pending_id: id.to_string(),
        title,
        action_type: gateway_core::ActionType::Other,
        action_details: tool_call.get("rawInput").map(|v| v.to_string()).unwrap_or_default(),
        options,
    };

    let handler = permission_handler.lock().unwrap().clone();
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let outcome = PermissionArbiter::arbitrate(
        handler.as_deref(),
        request,
        permission_timeout,
        cancel_rx,
        gateway_core::NoHandlerPolicy::FirstAllowOrFirstOption,
    )
        .await;

    let response = match outcome {
        gateway_core::ArbitrationOutcome::Decision(response) => response,
        gateway_core::ArbitrationOutcome::TimedOut | gateway_core::ArbitrationOutcome::Cancelled => {
            events.send(gateway_core::AgentEvent::new(
                state.session_id.clone(),
                OperationId::empty(),
                gateway_core::AgentEventKind::PermissionCancelled { pending_id: id.to_string() },
            ));
            PermissionResponse::cancelled()
        }
    };

    let result = if response.cancelled {
        json!({ "outcome": { "outcome": "cancelled" } })
    } else {
        json!({ "outcome": { "outcome": "selected", "optionId": response.option_id } })
    };
    let _ = write_message(stdin, json!({ "jsonrpc": "2.0", "id": id, "result": result })).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::transport::test_duplex_pair;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn initialize_records_load_session_capability() {
        let adapter = Arc::new(AcpAdapter::new(GatewayConfig::default()));
        let ((adapter_stdin, mut test_reader), (mut test_writer, adapter_stdout)) = test_duplex_pair();
        adapter.connect(Box::new(adapter_stdin), Box::new(adapter_stdout)).await.unwrap();

        let init_adapter = adapter.clone();
        let init_handle = tokio::spawn(async move { init_adapter.initialize().await });

        let mut buf = [0u8; 1024];
        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent["method"], "initialize");
        assert_eq!(sent["jsonrpc"], "2.0");
        let id = sent["id"].clone();

        let response = json!({
            "jsonrpc": "2.0", "id": id,
            "result": { "protocolVersion": 1, "agentCapabilities": { "loadSession": true } },
        });
        test_writer.write_all(format!("{response}\n").as_bytes()).await.unwrap();

        init_handle.await.unwrap().unwrap();
        assert!(adapter.supports_load_session.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn load_session_errors_when_capability_absent() {
        let adapter = AcpAdapter::new(GatewayConfig::default());
        let err = adapter.load_session(SessionId::from_upstream("s1")).await.unwrap_err();
        assert!(matches!(err, AdapterError::LoadSessionUnsupported));
    }

    #[tokio::test]
    async fn new_session_resolves_from_session_new_response() {
        let adapter = Arc::new(AcpAdapter::new(GatewayConfig::default()));
        let ((adapter_stdin, mut test_reader), (mut test_writer, adapter_stdout)) = test_duplex_pair();
        adapter.connect(Box::new(adapter_stdin), Box::new(adapter_stdout)).await.unwrap();

        let session_adapter = adapter.clone();
        let session_handle = tokio::spawn(async move { session_adapter.new_session(&[]).await });

        let mut buf = [0u8; 1024];
        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent["method"], "session/new");
        let id = sent["id"].clone();

        let response = json!({ "jsonrpc": "2.0", "id": id, "result": { "sessionId": "s1" } });
        test_writer.write_all(format!("{response}\n").as_bytes()).await.unwrap();

        let session_id = session_handle.await.unwrap().unwrap();
        assert_eq!(session_id.as_str(), "s1");
    }

    #[tokio::test]
    async fn load_session_context_is_prepended_to_next_prompt() {
        let adapter = Arc::new(AcpAdapter::new(GatewayConfig::default()));
        adapter.supports_load_session.store(true, Ordering::SeqCst);
        let ((adapter_stdin, mut test_reader), (mut test_writer, adapter_stdout)) = test_duplex_pair();
        adapter.connect(Box::new(adapter_stdin), Box::new(adapter_stdout)).await.unwrap();

        let load_adapter = adapter.clone();
        let load_handle = tokio::spawn(async move {
            load_adapter.load_session(SessionId::from_upstream("s1")).await
        });

        let mut buf = [0u8; 1024];
        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent["method"], "session/load");
        let id = sent["id"].clone();

        let response = json!({
            "jsonrpc": "2.0", "id": id,
            "result": { "sessionId": "s1", "context": "prior thread summary" },
        });
        test_writer.write_all(format!("{response}\n").as_bytes()).await.unwrap();
        load_handle.await.unwrap().unwrap();

        assert_eq!(
            adapter.pending_context.lock().unwrap().as_deref(),
            Some("prior thread summary")
        );

        let prompt_adapter = adapter.clone();
        let _ = tokio::spawn(async move { prompt_adapter.prompt("go on", &[]).await });

        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        let text = sent["params"]["prompt"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("prior thread summary"));
        assert!(text.ends_with("go on"));
        assert!(adapter.pending_context.lock().unwrap().is_none());
    }

    #[test]
    fn requires_process_kill_is_false() {
        let adapter = AcpAdapter::new(GatewayConfig::default());
        assert!(!adapter.requires_process_kill());
    }
}
