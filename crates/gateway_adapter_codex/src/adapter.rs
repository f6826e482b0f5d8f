use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gateway_core::{
    event_channel, AdapterError, AgentAdapter, AgentInfo, Attachment, EventReceiver, EventSender,
    GatewayConfig, McpServerConfig, OperationId, PermissionArbiter, PermissionHandler,
    PermissionRequest, PermissionResponse, SessionId,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::merge_mcp_config;
use crate::decode::{approval_options, decision_for_response, handle_notification, TurnState};

enum Command {
    Initialize {
        reply: oneshot::Sender<Result<AgentInfo, AdapterError>>,
    },
    NewSession {
        resume: Option<String>,
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

/// Codex's JSON-RPC adapter: Thread/Turn model over newline-delimited
/// JSON-RPC (the Codex variant omits the `jsonrpc` field other JSON-RPC
/// servers carry). One decoder task owns the wire and a pending-request
/// correlator; public methods forward through `cmd_tx` and await a oneshot
/// reply.
pub struct CodexAdapter {
    config: GatewayConfig,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    events: Mutex<Option<EventReceiver>>,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Arc<Mutex<SessionId>>,
    connected: AtomicBool,
}

impl CodexAdapter {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            cmd_tx: Mutex::new(None),
            events: Mutex::new(None),
            permission_handler: Arc::new(Mutex::new(None)),
            session_id: Arc::new(Mutex::new(SessionId::placeholder())),
            connected: AtomicBool::new(false),
        }
    }

    fn command_sender(&self) -> Result<mpsc::UnboundedSender<Command>, AdapterError> {
        self.cmd_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(AdapterError::NotInitialized)
    }
}

#[async_trait]
impl AgentAdapter for CodexAdapter {
    fn prepare_command_args(&self) -> Vec<String> {
        // Codex takes no extra CLI args for MCP servers; they're announced
        // through its own config file instead. `prepare_command_args`
        // is still the right lifecycle hook for this side effect: it runs
        // once, before the subprocess starts, same as the args it would
        // otherwise return.
        if !self.config.mcp_servers().is_empty() {
            let path = crate::config::default_config_path();
            if let Err(err) = merge_mcp_config(&path, self.config.mcp_servers()) {
                warn!(error = %err, path = %path.display(), "failed to merge codex mcp config");
            }
        }
        Vec::new()
    }

    async fn connect(
        &self,
        stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Result<(), AdapterError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::AlreadyConnected);
        }

        let (event_tx, event_rx) = event_channel("codex");
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
        let approval_policy = self.config.approval_policy().as_cli_str().to_string();

        tokio::spawn(run_decoder(
            stdin,
            stdout,
            cmd_rx,
            event_tx,
            permission_handler,
            session_id,
            permission_timeout,
            work_dir,
            approval_policy,
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

    async fn new_session(&self, _mcp_servers: &[McpServerConfig]) -> Result<SessionId, AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::NewSession { resume: None, reply: reply_tx })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    async fn load_session(&self, session_id: SessionId) -> Result<SessionId, AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::NewSession {
                resume: Some(session_id.as_str().to_string()),
                reply: reply_tx,
            })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    async fn prompt(&self, message: &str, _attachments: &[Attachment]) -> Result<(), AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::Prompt { message: message.to_string(), reply: reply_tx })
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

fn sandbox_policy_json(work_dir: &str) -> Value {
    json!({
        "mode": "workspaceWrite",
        "writableRoots": [work_dir],
        "networkAccess": true,
    })
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
    approval_policy: String,
) {
    let mut stdin = stdin;
    let mut lines = BufReader::new(stdout).lines();
    let mut state = TurnState::new(session_id.lock().unwrap().clone(), OperationId::empty());

    let next_id = AtomicU64::new(1);
    let mut pending: HashSet<u64> = HashSet::new();
    let mut pending_initialize: Option<(u64, oneshot::Sender<Result<AgentInfo, AdapterError>>)> = None;
    let mut pending_prompt: Option<oneshot::Sender<Result<(), AdapterError>>> = None;
    let mut pending_new_session: Option<oneshot::Sender<Result<SessionId, AdapterError>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Initialize { reply }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        let params = json!({
                            "clientInfo": { "name": "gateway", "version": env!("CARGO_PKG_VERSION") },
                        });
                        pending.insert(id);
                        if let Err(err) = write_request(&mut stdin, id, "initialize", params).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_initialize = Some((id, reply));
                    }
                    Some(Command::NewSession { resume, reply }) => {
                        let method = if resume.is_some() { "thread/resume" } else { "thread/start" };
                        let mut params = json!({
                            "cwd": work_dir,
                            "approvalPolicy": approval_policy,
                            "sandboxPolicy": sandbox_policy_json(&work_dir),
                        });
                        if let Some(thread_id) = &resume {
                            params["threadId"] = json!(thread_id);
                        }
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        pending.insert(id);
                        if let Err(err) = write_request(&mut stdin, id, method, params).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_new_session = Some(reply);
                    }
                    Some(Command::Prompt { message, reply }) => {
                        let Some(thread_id) = state.thread_id.clone() else {
                            let _ = reply.send(Err(AdapterError::AdapterState("prompt before new_session")));
                            continue;
                        };
                        state.begin_turn(OperationId::new());
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        let params = json!({
                            "threadId": thread_id,
                            "input": [{ "type": "text", "text": message }],
                        });
                        pending.insert(id);
                        if let Err(err) = write_request(&mut stdin, id, "turn/start", params).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_prompt = Some(reply);
                    }
                    Some(Command::Cancel { reply }) => {
                        let (thread_id, turn_id) = (state.thread_id.clone(), state.turn_id.clone());
                        let (Some(thread_id), Some(turn_id)) = (thread_id, turn_id) else {
                            let _ = reply.send(Ok(()));
                            continue;
                        };
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        let params = json!({ "threadId": thread_id, "turnId": turn_id });
                        let result = write_request(&mut stdin, id, "turn/interrupt", params)
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
                            warn!(line = %raw, "failed to parse codex jsonrpc line");
                            continue;
                        };

                        let id = value.get("id").cloned();
                        let method = value.get("method").and_then(Value::as_str).map(str::to_string);

                        match (id, method) {
                            (Some(id), Some(method)) => {
                                // An incoming request from the server: an approval request.
                                handle_approval_request(
                                    &mut stdin,
                                    &id,
                                    &method,
                                    value.get("params").unwrap_or(&Value::Null),
                                    &state.session_id,
                                    &permission_handler,
                                    &events,
                                    permission_timeout,
                                )
                                    .await;
                            }
                            (Some(id), None) => {
                                // A response to one of our own requests.
                                let Some(id_num) = id.as_u64() else { continue };
                                if pending.remove(&id_num) {
                                    let result = if let Some(error) = value.get("error") {
                                        Err(AdapterError::ProtocolError {
                                            context: "codex jsonrpc",
                                            message: error.to_string(),
                                        })
                                    } else {
                                        Ok(value.get("result").cloned().unwrap_or(Value::Null))
                                    };

                                    if pending_initialize.as_ref().is_some_and(|(pid, _)| *pid == id_num) {
                                        let (_, reply) = pending_initialize.take().unwrap();
                                        match result {
                                            Ok(result_value) => {
                                                let version = result_value
                                                    .get("userAgent")
                                                    .and_then(Value::as_str)
                                                    .unwrap_or("jsonrpc")
                                                    .to_string();
                                                let _ = write_notification(&mut stdin, "initialized").await;
                                                let _ = reply.send(Ok(AgentInfo {
                                                    name: "codex".to_string(),
                                                    version,
                                                }));
                                            }
                                            Err(err) => {
                                                let _ = reply.send(Err(err));
                                            }
                                        }
                                        continue;
                                    }

                                    match result {
                                        Ok(result_value) => {
                                            if let Some(thread_id) = result_value.get("threadId").and_then(Value::as_str) {
                                                state.thread_id = Some(thread_id.to_string());
                                                let sid = SessionId::from_upstream(thread_id);
                                                state.session_id = sid.clone();
                                                *session_id.lock().unwrap() = sid.clone();
                                                if let Some(reply) = pending_new_session.take() {
                                                    let _ = reply.send(Ok(sid));
                                                }
                                            }
                                            if let Some(turn_id) = result_value.get("turnId").and_then(Value::as_str) {
                                                state.turn_id = Some(turn_id.to_string());
                                            }
                                        }
                                        Err(err) => {
                                            if let Some(reply) = pending_new_session.take() {
                                                let _ = reply.send(Err(err));
                                            } else if let Some(reply) = pending_prompt.take() {
                                                let _ = reply.send(Err(err));
                                            }
                                        }
                                    }
                                }
                            }
                            (None, Some(method)) => {
                                let params = value.get("params").cloned().unwrap_or(Value::Null);
                                let dispatched = handle_notification(&mut state, &method, &params);
                                for event in dispatched.events {
                                    events.send(event);
                                }
                                if let Some(outcome) = dispatched.turn_completed {
                                    if let Some(reply) = pending_prompt.take() {
                                        let _ = reply.send(outcome.map_err(AdapterError::AgentError));
                                    }
                                }
                            }
                            (None, None) => {
                                debug!(line = %raw, "codex line is neither request, response, nor notification");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("codex stdout closed");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "error reading codex stdout");
                        break;
                    }
                }
            }
        }
    }

    if let Some((_, reply)) = pending_initialize.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
    if let Some(reply) = pending_prompt.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
    if let Some(reply) = pending_new_session.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
}

async fn write_request(
    stdin: &mut (impl AsyncWrite + Unpin),
    id: u64,
    method: &str,
    params: Value,
) -> std::io::Result<()> {
    let mut line = json!({ "id": id, "method": method, "params": params }).to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await
}

async fn write_response(
    stdin: &mut (impl AsyncWrite + Unpin),
    id: &Value,
    result: Value,
) -> std::io::Result<()> {
    let mut line = json!({ "id": id, "result": result }).to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await
}

async fn write_notification(
    stdin: &mut (impl AsyncWrite + Unpin),
    method: &str,
) -> std::io::Result<()> {
    let mut line = json!({ "method": method, "params": {} }).to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await
}

#[allow(clippy::too_many_arguments)]
async fn handle_approval_request(
    stdin: &mut (impl AsyncWrite + Unpin),
    id: &Value,
    method: &str,
    params: &Value,
    session_id: &SessionId,
    permission_handler: &Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    events: &EventSender,
    permission_timeout: Option<std::time::Duration>,
) {
    let (tool_call_id, title, action_type, action_details) = match method {
        "item.cmd_exec.request_approval" => {
            let command = params.get("command").and_then(Value::as_str).unwrap_or_default();
            let reasoning = params.get("reasoning").and_then(Value::as_str).unwrap_or_default();
            (
                params.get("itemId").and_then(Value::as_str).unwrap_or_default().to_string(),
                format!("Run: {command}"),
                gateway_core::ActionType::Command,
                format!("{command}\n{reasoning}").trim().to_string(),
            )
        }
        "item.file_change.request_approval" => {
            let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
            let reasoning = params.get("reasoning").and_then(Value::as_str).unwrap_or_default();
            (
                params.get("itemId").and_then(Value::as_str).unwrap_or_default().to_string(),
                format!("Edit: {path}"),
                gateway_core::ActionType::FileWrite,
                format!("{}\n{reasoning}", params.get("diff").and_then(Value::as_str).unwrap_or_default()).trim().to_string(),
            )
        }
        other => {
            warn!(method = other, "unrecognized codex approval request method");
            let _ = write_response(stdin, id, json!({ "decision": "decline" })).await;
            return;
        }
    };

    let request_options: Vec<Value> = params
        .get("options")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let options = approval_options(&request_options);

    let request = PermissionRequest {
        session_id: session_id.clone(),
        tool_call_id,
        pending_id: id.to_string(),
        title,
        action_type,
        action_details,
        options,
    };

    let handler = permission_handler.lock().unwrap().clone();
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let outcome = PermissionArbiter::arbitrate(
        handler.as_deref(),
        request,
        permission_timeout,
        cancel_rx,
        gateway_core::NoHandlerPolicy::AlwaysApprove,
    )
        .await;

    let response = match outcome {
        gateway_core::ArbitrationOutcome::Decision(response) => response,
        gateway_core::ArbitrationOutcome::TimedOut | gateway_core::ArbitrationOutcome::Cancelled => {
            events.send(gateway_core::AgentEvent::new(
                session_id.clone(),
                gateway_core::OperationId::empty(),
                gateway_core::AgentEventKind::PermissionCancelled { pending_id: id.to_string() },
            ));
            PermissionResponse::cancelled()
        }
    };

    let decision = decision_for_response(&response);
    let _ = write_response(stdin, id, json!({ "decision": decision })).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::transport::test_duplex_pair;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn initialize_sends_handshake_and_records_user_agent() {
        let adapter = Arc::new(CodexAdapter::new(GatewayConfig::default()));
        let ((adapter_stdin, mut test_reader), (mut test_writer, adapter_stdout)) = test_duplex_pair();
        adapter.connect(Box::new(adapter_stdin), Box::new(adapter_stdout)).await.unwrap();

        let init_adapter = adapter.clone();
        let init_handle = tokio::spawn(async move { init_adapter.initialize().await });

        let mut buf = [0u8; 1024];
        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent["method"], "initialize");
        let id = sent["id"].clone();

        let response = json!({ "id": id, "result": { "userAgent": "codex-cli/1.2.3" } });
        test_writer.write_all(format!("{response}\n").as_bytes()).await.unwrap();

        let info = init_handle.await.unwrap().unwrap();
        assert_eq!(info.version, "codex-cli/1.2.3");

        // The handshake must also emit the `initialized` notification.
        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent["method"], "initialized");
    }

    #[tokio::test]
    async fn new_session_resolves_from_thread_start_response() {
        let adapter = Arc::new(CodexAdapter::new(GatewayConfig::default()));
        let ((adapter_stdin, mut test_reader), (mut test_writer, adapter_stdout)) = test_duplex_pair();
        adapter.connect(Box::new(adapter_stdin), Box::new(adapter_stdout)).await.unwrap();

        let session_adapter = adapter.clone();
        let session_handle = tokio::spawn(async move { session_adapter.new_session(&[]).await });

        let mut buf = [0u8; 1024];
        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent["method"], "thread/start");
        let id = sent["id"].clone();

        let response = json!({ "id": id, "result": { "threadId": "t1" } });
        test_writer.write_all(format!("{response}\n").as_bytes()).await.unwrap();

        let session_id = session_handle.await.unwrap().unwrap();
        assert_eq!(session_id.as_str(), "t1");
    }

    #[tokio::test]
    async fn prompt_blocks_until_turn_completed_notification() {
        let adapter = Arc::new(CodexAdapter::new(GatewayConfig::default()));
        let ((adapter_stdin, mut test_reader), (mut test_writer, adapter_stdout)) = test_duplex_pair();
        adapter.connect(Box::new(adapter_stdin), Box::new(adapter_stdout)).await.unwrap();
        let mut events = adapter.updates().unwrap();

        let session_adapter = adapter.clone();
        let session_handle = tokio::spawn(async move { session_adapter.new_session(&[]).await });
        let mut buf = [0u8; 1024];
        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        let response = json!({ "id": sent["id"], "result": { "threadId": "t1" } });
        test_writer.write_all(format!("{response}\n").as_bytes()).await.unwrap();
        session_handle.await.unwrap().unwrap();

        let prompt_adapter = adapter.clone();
        let prompt_handle = tokio::spawn(async move { prompt_adapter.prompt("hi", &[]).await });

        let n = test_reader.read(&mut buf).await.unwrap();
        let sent: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent["method"], "turn/start");

        test_writer
            .write_all(b"{\"method\":\"turn/completed\",\"params\":{}}\n")
            .await
            .unwrap();

        prompt_handle.await.unwrap().unwrap();

        let mut saw_complete = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            if matches!(event.kind, gateway_core::AgentEventKind::Complete { .. }) {
                saw_complete = true;
                break;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn prompt_before_new_session_reports_adapter_state_error() {
        let adapter = CodexAdapter::new(GatewayConfig::default());
        let ((stdin, _), (_, stdout)) = test_duplex_pair();
        adapter.connect(Box::new(stdin), Box::new(stdout)).await.unwrap();
        let err = adapter.prompt("hi", &[]).await.unwrap_err();
        assert!(matches!(err, AdapterError::AdapterState(_)));
    }
}
