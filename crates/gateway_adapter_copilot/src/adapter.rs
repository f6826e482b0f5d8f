use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{
    event_channel, AdapterError, AgentAdapter, AgentInfo, Attachment, EventReceiver, EventSender,
    GatewayConfig, McpServerConfig, OperationId, PermissionArbiter, PermissionHandler,
    PermissionOption, PermissionRequest, PermissionResponse, SessionId,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::decode::{handle_event, TurnState};
use crate::protocol::CopilotProtocol;

const PORT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(180);
const PERMISSION_RACE_POLL: Duration = Duration::from_millis(50);
const PERMISSION_RACE_ATTEMPTS: u32 = 10;

enum Command {
    NewSession {
        mcp_servers: Vec<McpServerConfig>,
        reply: oneshot::Sender<Result<SessionId, AdapterError>>,
    },
    LoadSession {
        session_id: SessionId,
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

/// The Copilot (and, via [`CopilotProtocol::opencode`], OpenCode) adapter:
/// the collaborator subprocess serves its wire protocol over a dynamically
/// chosen TCP port it announces on stdout, rather than over its own
/// stdin/stdout. `connect` scans the handed-in stdout for that announcement,
/// then opens the actual TCP connection itself and drives it with the same
/// decoder-task shape once that connection is up.
pub struct CopilotAdapter {
    config: GatewayConfig,
    protocol: CopilotProtocol,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    events: Mutex<Option<EventReceiver>>,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Arc<Mutex<SessionId>>,
    connected: AtomicBool,
}

impl CopilotAdapter {
    pub fn new(config: GatewayConfig, protocol: CopilotProtocol) -> Self {
        Self {
            config,
            protocol,
            cmd_tx: Mutex::new(None),
            events: Mutex::new(None),
            permission_handler: Arc::new(Mutex::new(None)),
            session_id: Arc::new(Mutex::new(SessionId::placeholder())),
            connected: AtomicBool::new(false),
        }
    }

    fn command_sender(&self) -> Result<mpsc::UnboundedSender<Command>, AdapterError> {
        self.cmd_tx.lock().unwrap().clone().ok_or(AdapterError::NotInitialized)
    }
}

/// Scans `stdout` line by line for `prefix<port>`, with a 180 s timeout and
/// the last 12 lines logged on failure.
async fn discover_port(
    stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    prefix: &str,
) -> Result<(u16, Box<dyn tokio::io::AsyncRead + Send + Unpin>), AdapterError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut seen: Vec<String> = Vec::new();

    let search = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(rest) = line.strip_prefix(prefix) {
                        if let Ok(port) = rest.trim().parse::<u16>() {
                            return Ok(port);
                        }
                    }
                    seen.push(line);
                    if seen.len() > 12 {
                        seen.remove(0);
                    }
                }
                Ok(None) => {
                    return Err(AdapterError::AgentError(format!(
                        "copilot subprocess exited before announcing its port; last lines:\n{}",
                        seen.join("\n")
                    )));
                }
                Err(err) => return Err(AdapterError::Io(err)),
            }
        }
    };

    let port = match tokio::time::timeout(PORT_DISCOVERY_TIMEOUT, search).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(AdapterError::Timeout);
        }
    };

    // `lines()` owns the reader; reconstruct a boxed reader over whatever
    // remains buffered so the caller can keep draining it in the background.
    let remainder = lines.into_inner();
    Ok((port, Box::new(remainder)))
}

#[async_trait]
impl AgentAdapter for CopilotAdapter {
    async fn connect(
        &self,
        _stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Result<(), AdapterError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::AlreadyConnected);
        }

        let (port, mut leftover_stdout) = discover_port(stdout, self.protocol.port_announcement_prefix).await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match leftover_stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        });

        let stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(AdapterError::Io)?;
        let (tcp_read, tcp_write) = stream.into_split();

        let (event_tx, event_rx) = event_channel("copilot");
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
        let events_table = self.protocol.events;

        tokio::spawn(run_decoder(
            Box::new(tcp_write),
            Box::new(tcp_read),
            cmd_rx,
            event_tx,
            permission_handler,
            session_id,
            permission_timeout,
            work_dir,
            events_table,
        ));

        Ok(())
    }

    async fn initialize(&self) -> Result<AgentInfo, AdapterError> {
        Ok(AgentInfo { name: "copilot".to_string(), version: "tcp".to_string() })
    }

    async fn new_session(&self, mcp_servers: &[McpServerConfig]) -> Result<SessionId, AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::NewSession { mcp_servers: mcp_servers.to_vec(), reply: reply_tx })
            .map_err(|_| AdapterError::AdapterState("decoder task is gone"))?;
        reply_rx.await.map_err(|_| AdapterError::Cancelled)?
    }

    async fn load_session(&self, session_id: SessionId) -> Result<SessionId, AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::LoadSession { session_id, reply: reply_tx })
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
        // The CLI's TCP server keeps running after its stdin closes; the
        // caller that owns the child process must kill it explicitly.
        true
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_decoder(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: EventSender,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Arc<Mutex<SessionId>>,
    permission_timeout: Option<std::time::Duration>,
    work_dir: String,
    events_table: crate::protocol::EventNames,
) {
    let mut reader = BufReader::new(reader);
    let mut state = TurnState::new(session_id.lock().unwrap().clone(), OperationId::empty());

    let next_id = AtomicU64::new(1);
    let mut pending: HashSet<u64> = HashSet::new();
    let mut pending_new_session: Option<oneshot::Sender<Result<SessionId, AdapterError>>> = None;
    let mut pending_prompt: Option<oneshot::Sender<Result<(), AdapterError>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::NewSession { mcp_servers, reply }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        pending.insert(id);
                        let params = json!({ "cwd": work_dir, "mcpServers": mcp_servers.iter().map(|s| s.name.clone()).collect::<Vec<_>>() });
                        if let Err(err) = write_message(&mut writer, json!({
                            "jsonrpc": "2.0", "id": id, "method": events_table.session_start, "params": params,
                        })).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_new_session = Some(reply);
                    }
                    Some(Command::LoadSession { session_id: to_resume, reply }) => {
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        pending.insert(id);
                        let params = json!({ "sessionId": to_resume.as_str(), "cwd": work_dir });
                        if let Err(err) = write_message(&mut writer, json!({
                            "jsonrpc": "2.0", "id": id, "method": events_table.session_resume, "params": params,
                        })).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_new_session = Some(reply);
                    }
                    Some(Command::Prompt { message, reply }) => {
                        state.begin_turn(OperationId::new());
                        let id = next_id.fetch_add(1, Ordering::SeqCst);
                        let params = json!({ "sessionId": state.session_id.as_str(), "text": message });
                        pending.insert(id);
                        if let Err(err) = write_message(&mut writer, json!({
                            "jsonrpc": "2.0", "id": id, "method": "session.prompt", "params": params,
                        })).await {
                            pending.remove(&id);
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_prompt = Some(reply);
                    }
                    Some(Command::Cancel { reply }) => {
                        let params = json!({ "sessionId": state.session_id.as_str() });
                        let result = write_message(&mut writer, json!({
                            "jsonrpc": "2.0", "method": events_table.session_abort, "params": params,
                        }))
                            .await
                            .map_err(AdapterError::Io);
                        let _ = reply.send(result);
                    }
                    Some(Command::Close) | None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            message = read_message(&mut reader) => {
                match message {
                    Ok(Some(value)) => {
                        let id = value.get("id").cloned();
                        let method = value.get("method").and_then(Value::as_str).map(str::to_string);

                        match (id, method) {
                            (Some(id), Some(method)) if method == "tool.requestPermission" => {
                                handle_permission_request(
                                    &mut writer,
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
                                debug!(id = ?id, method, "unrecognized copilot incoming request, ignoring");
                            }
                            (Some(id), None) => {
                                let Some(id_num) = id.as_u64() else { continue };
                                if !pending.remove(&id_num) {
                                    continue;
                                }
                                let result = if let Some(error) = value.get("error") {
                                    Err(AdapterError::ProtocolError {
                                        context: "copilot jsonrpc",
                                        message: error.to_string(),
                                    })
                                } else {
                                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                                };
                                match result {
                                    Ok(result_value) => {
                                        if let Some(reply) = pending_new_session.take() {
                                            let sid = result_value
                                                .get("sessionId")
                                                .and_then(Value::as_str)
                                                .map(SessionId::from_upstream)
                                                .unwrap_or_else(|| state.session_id.clone());
                                            state.session_id = sid.clone();
                                            *session_id.lock().unwrap() = sid.clone();
                                            let _ = reply.send(Ok(sid));
                                        }
                                        // The `session.prompt` response is only an ack; the
                                        // prompt itself resolves off `session.idle`, so
                                        // `pending_prompt` stays queued.
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
                            (None, Some(method)) if method == "session.event" => {
                                let params = value.get("params").cloned().unwrap_or(Value::Null);
                                let Some(event) = params.get("event") else { continue };
                                let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
                                let data = event.get("data").cloned().unwrap_or(Value::Null);
                                let was_complete = state.complete_sent;
                                for event in handle_event(&mut state, &events_table, event_type, &data) {
                                    events.send(event);
                                }
                                if !was_complete && state.complete_sent {
                                    if let Some(reply) = pending_prompt.take() {
                                        let _ = reply.send(Ok(()));
                                    }
                                }
                            }
                            (None, Some(other)) => {
                                debug!(method = other, "unrecognized copilot notification, skipping");
                            }
                            (None, None) => {
                                debug!("copilot message is neither request, response, nor notification");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("copilot tcp connection closed");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "error reading copilot tcp stream");
                        break;
                    }
                }
            }
        }
    }

    if let Some(reply) = pending_new_session.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
    if let Some(reply) = pending_prompt.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
}

/// Reads one `Content-Length`-framed JSON-RPC message from `reader`.
async fn read_message(
    reader: &mut BufReader<Box<dyn tokio::io::AsyncRead + Send + Unpin>>,
) -> std::io::Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut header = String::new();
        let n = reader.read_line(&mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some(rest) = header.strip_prefix("Content-Length:") {
            content_length = rest.trim().parse::<usize>().ok();
        }
    }

    let Some(len) = content_length else {
        return Ok(Some(Value::Null));
    };
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body).ok())
}

async fn write_message(writer: &mut (impl AsyncWrite + Unpin), message: Value) -> std::io::Result<()> {
    let body = message.to_string();
    let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer.write_all(framed.as_bytes()).await
}

/// Answers an incoming `tool.requestPermission` call. `tool.start` for the same `tool_call_id` may not have been
/// processed yet, so this polls `state.pending_tool` up to 10×50 ms before
/// falling back to the request's own `title`.
async fn handle_permission_request(
    writer: &mut (impl AsyncWrite + Unpin),
    id: &Value,
    params: &Value,
    state: &mut TurnState,
    permission_handler: &Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    events: &EventSender,
    permission_timeout: Option<std::time::Duration>,
) {
    let tool_call_id = params.get("tool_call_id").and_then(Value::as_str).unwrap_or("").to_string();
    let fallback_title = params.get("title").and_then(Value::as_str).unwrap_or("tool call").to_string();

    let mut payload = state.pending_tool(&tool_call_id).cloned();
    for _ in 0..PERMISSION_RACE_ATTEMPTS {
        if payload.is_some() {
            break;
        }
        tokio::time::sleep(PERMISSION_RACE_POLL).await;
        payload = state.pending_tool(&tool_call_id).cloned();
    }

    let action_type = payload
        .as_ref()
        .map(gateway_core::ActionType::from_payload)
        .unwrap_or(gateway_core::ActionType::Other);
    let title = payload
        .as_ref()
        .map(|p| format!("Use {}", p.kind_name()))
        .unwrap_or(fallback_title);

    let options: Vec<PermissionOption> = params
        .get("options")
        .and_then(Value::as_array)
        .filter(|opts| !opts.is_empty())
        .map(|opts| {
            opts.iter()
                .filter_map(|opt| {
                    let option_id = opt.get("optionId").and_then(Value::as_str)?.to_string();
                    let name = opt.get("name").and_then(Value::as_str).unwrap_or(&option_id).to_string();
                    let kind = gateway_core::OptionKind::from_option_id(&option_id)
                        .unwrap_or(gateway_core::OptionKind::RejectOnce);
                    Some(PermissionOption { option_id, name, kind })
                })
                .collect()
        })
        .unwrap_or_else(|| {
            vec![
                PermissionOption { option_id: "approve".into(), name: "Approve".into(), kind: gateway_core::OptionKind::AllowOnce },
                PermissionOption { option_id: "deny".into(), name: "Deny".into(), kind: gateway_core::OptionKind::RejectOnce },
            ]
        });

    let request = PermissionRequest {
        session_id: state.session_id.clone(),
        tool_call_id,
        pending_id: id.to_string(),
        title,
        action_type,
        action_details: params.get("args").map(|v| v.to_string()).unwrap_or_default(),
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
                state.session_id.clone(),
                OperationId::empty(),
                gateway_core::AgentEventKind::PermissionCancelled { pending_id: id.to_string() },
            ));
            PermissionResponse::cancelled()
        }
    };

    let decision = if !response.cancelled && response.option_id.as_deref().map(|o| gateway_core::OptionKind::from_option_id(o).is_some_and(|k| k.is_allow())).unwrap_or(false) {
        "approve"
    } else {
        "deny"
    };
    let _ = write_message(writer, json!({ "jsonrpc": "2.0", "id": id, "result": { "decision": decision } })).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn discover_port_reports_eof_with_recent_lines() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"starting\nversion 1.2\n").await.unwrap();
        drop(writer);

        let err = discover_port(Box::new(reader), "listening on port ").await.unwrap_err();
        let message = format!("{err}");
        assert!(message.contains("starting"));
        assert!(message.contains("version 1.2"));
    }

    #[tokio::test]
    async fn discover_port_parses_announced_port() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"starting\nlistening on port 4123\n").await.unwrap();

        let (port, _) = discover_port(Box::new(reader), "listening on port ").await.unwrap();
        assert_eq!(port, 4123);
    }

    #[test]
    fn requires_process_kill_is_true() {
        let adapter = CopilotAdapter::new(GatewayConfig::default(), CopilotProtocol::copilot());
        assert!(adapter.requires_process_kill());
    }

    #[test]
    fn opencode_protocol_uses_a_different_port_prefix() {
        let opencode = CopilotProtocol::opencode();
        assert_ne!(opencode.port_announcement_prefix, CopilotProtocol::copilot().port_announcement_prefix);
        assert_eq!(opencode.events.session_idle, CopilotProtocol::copilot().events.session_idle);
    }
}
