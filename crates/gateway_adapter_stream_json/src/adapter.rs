use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gateway_core::{
    event_channel, AdapterError, AgentAdapter, AgentInfo, Attachment, EventReceiver, EventSender,
    GatewayConfig, McpServerConfig, OperationId, PermissionArbiter, PermissionHandler,
    PermissionOption, PermissionRequest, PermissionResponse, SessionId,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::decode::{handle_message, TurnState};

enum Command {
    Prompt {
        message: String,
        reply: oneshot::Sender<Result<(), AdapterError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), AdapterError>>,
    },
    Close,
}

/// Claude Code's stream-json adapter.
///
/// Owns a single background task (the decoder) that reads newline-delimited
/// JSON from the collaborator's stdout and writes control/user messages to
/// its stdin; public methods forward requests to it over `cmd_tx` and wait
/// on a per-call oneshot reply.
pub struct StreamJsonAdapter {
    config: GatewayConfig,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    events: Mutex<Option<EventReceiver>>,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Arc<Mutex<SessionId>>,
    connected: AtomicBool,
}

impl StreamJsonAdapter {
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
impl AgentAdapter for StreamJsonAdapter {
    fn prepare_command_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if !self.config.mcp_servers().is_empty() {
            let servers: BTreeMap<String, Value> = self
                .config
                .mcp_servers()
                .iter()
                .map(|server| (server.name.clone(), mcp_server_json(server)))
                .collect();
            args.push("--mcp-config".to_string());
            args.push(json!({ "mcpServers": servers }).to_string());
        }

        if let Some(hooks) = hook_settings_json(self.config.permission_policy()) {
            args.push("--settings".to_string());
            args.push(json!({ "hooks": hooks }).to_string());
        }

        args
    }

    async fn connect(
        &self,
        stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Result<(), AdapterError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::AlreadyConnected);
        }

        let (event_tx, event_rx) = event_channel("stream_json");
        *self.events.lock().unwrap() = Some(event_rx);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);

        let permission_handler = self.permission_handler.clone();
        let session_id = self.session_id.clone();
        let permission_timeout = self.config.permission_timeout();

        tokio::spawn(run_decoder(
            stdin,
            stdout,
            cmd_rx,
            event_tx,
            permission_handler,
            session_id,
            permission_timeout,
        ));

        Ok(())
    }

    async fn initialize(&self) -> Result<AgentInfo, AdapterError> {
        // The handshake itself is driven by the decoder task on first
        // `system` message; by the time callers observe `session_status`
        // the handshake has already completed. Hook registration for
        // `permission_policy` was already handed to the agent process via
        // `prepare_command_args`'s `--settings` flag before this runs, so
        // there is nothing further to configure here.
        Ok(AgentInfo {
            name: "claude-code".to_string(),
            version: "stream-json".to_string(),
        })
    }

    async fn new_session(&self, _mcp_servers: &[McpServerConfig]) -> Result<SessionId, AdapterError> {
        Ok(self.session_id.lock().unwrap().clone())
    }

    async fn load_session(&self, session_id: SessionId) -> Result<SessionId, AdapterError> {
        *self.session_id.lock().unwrap() = session_id.clone();
        Ok(session_id)
    }

    async fn prompt(&self, message: &str, _attachments: &[Attachment]) -> Result<(), AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_sender()?
            .send(Command::Prompt {
                message: message.to_string(),
                reply: reply_tx,
            })
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

/// Builds the `hooks` object of the `--settings` JSON for `policy`, per spec
/// §4.2's table. Entries reference the `callback_id`s `handle_control_request`
/// dispatches on (`tool_approval`/`auto_approve`/`stop_git_check`); `None` for
/// `Autonomous`, which registers no hooks at all.
fn hook_settings_json(policy: gateway_core::PermissionPolicy) -> Option<Value> {
    use gateway_core::PermissionPolicy;

    let pre_tool_use = match policy {
        PermissionPolicy::Autonomous => return None,
        PermissionPolicy::Supervised => vec![json!({ "callback_id": "tool_approval" })],
        PermissionPolicy::Plan => vec![
            json!({ "matcher": "^ExitPlanMode$", "callback_id": "tool_approval" }),
            json!({ "callback_id": "auto_approve" }),
        ],
    };
    Some(json!({
        "PreToolUse": pre_tool_use,
        "Stop": [{ "callback_id": "stop_git_check" }],
    }))
}

fn mcp_server_json(server: &McpServerConfig) -> Value {
    match &server.transport {
        gateway_core::McpTransportConfig::Stdio { command, args } => {
            json!({ "command": command, "args": args })
        }
        gateway_core::McpTransportConfig::Sse { url } => json!({ "url": url, "type": "sse" }),
        gateway_core::McpTransportConfig::Http { url } => json!({ "url": url, "type": "http" }),
    }
}

async fn run_decoder(
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: EventSender,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Arc<Mutex<SessionId>>,
    permission_timeout: Option<std::time::Duration>,
) {
    let mut stdin = stdin;
    let mut lines = BufReader::new(stdout).lines();
    let mut state = TurnState::new(session_id.lock().unwrap().clone(), OperationId::empty());
    let mut pending_prompt: Option<oneshot::Sender<Result<(), AdapterError>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Prompt { message, reply }) => {
                        state.begin_turn(OperationId::new());
                        let payload = json!({
                            "type": "user",
                            "message": { "role": "user", "content": message },
                        });
                        if let Err(err) = write_line(&mut stdin, &payload).await {
                            let _ = reply.send(Err(AdapterError::Io(err)));
                            continue;
                        }
                        pending_prompt = Some(reply);
                    }
                    Some(Command::Cancel { reply }) => {
                        let payload = json!({
                            "type": "control_request",
                            "request_id": uuid::Uuid::new_v4().to_string(),
                            "request": { "subtype": "interrupt" },
                        });
                        let result = write_line(&mut stdin, &payload).await.map_err(AdapterError::Io);
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
                            warn!(line = %raw, "failed to parse stream-json line");
                            continue;
                        };

                        if value.get("type").and_then(Value::as_str) == Some("control_request") {
                            handle_control_request(
                                &mut stdin,
                                &value,
                                &state.session_id,
                                &permission_handler,
                                &events,
                                permission_timeout,
                            )
                                .await;
                            continue;
                        }
                        if value.get("type").and_then(Value::as_str) == Some("control_cancel_request") {
                            if let Some(pending_id) = value.get("request_id").and_then(Value::as_str) {
                                events.send(gateway_core::AgentEvent::new(
                                    state.session_id.clone(),
                                    state.operation_id.clone(),
                                    gateway_core::AgentEventKind::PermissionCancelled {
                                        pending_id: pending_id.to_string(),
                                    },
                                ));
                            }
                            continue;
                        }

                        *session_id.lock().unwrap() = state.session_id.clone();
                        let emitted = handle_message(&mut state, &value);
                        let completed = emitted.iter().any(|e| e.is_terminal());
                        for event in emitted {
                            events.send(event);
                        }
                        if completed {
                            if let Some(reply) = pending_prompt.take() {
                                let _ = reply.send(Ok(()));
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("stream-json stdout closed");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "error reading stream-json stdout");
                        break;
                    }
                }
            }
        }
    }

    if let Some(reply) = pending_prompt.take() {
        let _ = reply.send(Err(AdapterError::Cancelled));
    }
}

async fn write_line(stdin: &mut (impl AsyncWrite + Unpin), value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await
}

async fn handle_control_request(
    stdin: &mut (impl AsyncWrite + Unpin),
    value: &Value,
    session_id: &SessionId,
    permission_handler: &Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    events: &EventSender,
    permission_timeout: Option<std::time::Duration>,
) {
    let Some(request_id) = value.get("request_id").and_then(Value::as_str) else {
        return;
    };
    let request = value.get("request");
    let subtype = request.and_then(|r| r.get("subtype")).and_then(Value::as_str);

    match subtype {
        Some("can_use_tool") => {
            let tool_name = request
                .and_then(|r| r.get("tool_name"))
                .and_then(Value::as_str)
                .unwrap_or("tool");
            let input = request.and_then(|r| r.get("input")).cloned().unwrap_or(Value::Null);
            // Reuse the same name/args mapping the actual `tool_use` block
            // will use, so the permission's action_type matches the tool
            // call that's about to run and isn't just `Other`.
            let payload = crate::decode::normalize_call(tool_name, &input);
            let action_type = gateway_core::ActionType::from_payload(&payload);
            let tool_call_id = request
                .and_then(|r| r.get("tool_use_id"))
                .and_then(Value::as_str)
                .unwrap_or(request_id)
                .to_string();

            let options = vec![
                PermissionOption {
                    option_id: "allow".into(),
                    name: "Allow".into(),
                    kind: gateway_core::OptionKind::AllowOnce,
                },
                PermissionOption {
                    option_id: "deny".into(),
                    name: "Deny".into(),
                    kind: gateway_core::OptionKind::RejectOnce,
                },
            ];
            let permission_request = PermissionRequest {
                session_id: session_id.clone(),
                tool_call_id: tool_call_id.clone(),
                pending_id: request_id.to_string(),
                title: format!("Use {tool_name}"),
                action_type,
                action_details: input.to_string(),
                options,
            };

            // The synthetic tool_call must precede the permission_request so
            // downstream persistence has a message to attach it to.
            events.send(gateway_core::AgentEvent::new(
                session_id.clone(),
                gateway_core::OperationId::empty(),
                gateway_core::AgentEventKind::ToolCall {
                    tool_call_id: tool_call_id.clone(),
                    title: format!("Use {tool_name}"),
                    payload,
                    status: gateway_core::ToolStatus::PendingPermission,
                },
            ));
            events.send(gateway_core::AgentEvent::new(
                session_id.clone(),
                gateway_core::OperationId::empty(),
                gateway_core::AgentEventKind::PermissionRequest {
                    pending_id: request_id.to_string(),
                },
            ));

            let handler = permission_handler.lock().unwrap().clone();
            let (_cancel_tx, cancel_rx) = oneshot::channel();
            let outcome = PermissionArbiter::arbitrate(
                handler.as_deref(),
                permission_request,
                permission_timeout,
                cancel_rx,
                gateway_core::NoHandlerPolicy::FirstAllowOrFirstOption,
            )
                .await;

            let mut timeout_message = None;
            let response = match outcome {
                gateway_core::ArbitrationOutcome::Decision(response) => response,
                gateway_core::ArbitrationOutcome::TimedOut => {
                    events.send(gateway_core::AgentEvent::new(
                        session_id.clone(),
                        gateway_core::OperationId::empty(),
                        gateway_core::AgentEventKind::PermissionCancelled {
                            pending_id: request_id.to_string(),
                        },
                    ));
                    timeout_message = Some("Permission request timed out");
                    PermissionResponse::cancelled()
                }
                gateway_core::ArbitrationOutcome::Cancelled => {
                    events.send(gateway_core::AgentEvent::new(
                        session_id.clone(),
                        gateway_core::OperationId::empty(),
                        gateway_core::AgentEventKind::PermissionCancelled {
                            pending_id: request_id.to_string(),
                        },
                    ));
                    PermissionResponse::cancelled()
                }
            };

            let behavior = if response.cancelled || response.option_id.as_deref() == Some("deny") {
                match timeout_message {
                    Some(message) => {
                        json!({ "behavior": "deny", "interrupt": response.cancelled, "message": message })
                    }
                    None => json!({ "behavior": "deny", "interrupt": response.cancelled }),
                }
            } else {
                json!({ "behavior": "allow" })
            };
            let reply = json!({
                "type": "control_response",
                "response": { "request_id": request_id, "response": behavior },
            });
            let _ = write_line(stdin, &reply).await;
        }
        Some("hook_callback") => {
            let callback_id = request
                .and_then(|r| r.get("callback_id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let decision = match callback_id {
                "auto_approve" => json!({ "permissionDecision": "allow" }),
                "stop_git_check" => json!({ "approved": true }),
                "initialize" => json!({ "commands": Vec::<String>::new() }),
                _ => json!({ "permissionDecision": "ask" }),
            };
            let reply = json!({
                "type": "control_response",
                "response": { "request_id": request_id, "response": decision },
            });
            let _ = write_line(stdin, &reply).await;
        }
        Some("initialize") => {
            let reply = json!({
                "type": "control_response",
                "response": { "request_id": request_id, "response": { "commands": Vec::<String>::new() } },
            });
            let _ = write_line(stdin, &reply).await;
        }
        _ => {
            warn!(subtype = ?subtype, "unrecognized control_request subtype");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::transport::test_duplex_pair;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn prompt_resolves_once_result_message_arrives() {
        let adapter = Arc::new(StreamJsonAdapter::new(GatewayConfig::default()));
        let ((adapter_stdin, mut test_reader), (mut test_writer, adapter_stdout)) =
        test_duplex_pair();
        adapter
            .connect(Box::new(adapter_stdin), Box::new(adapter_stdout))
            .await
            .unwrap();
        let mut events = adapter.updates().unwrap();

        let prompt_adapter = adapter.clone();
        let prompt_handle = tokio::spawn(async move { prompt_adapter.prompt("hello", &[]).await });

        // Drain the echoed user-message control line before feeding the fixture
        // response, so the reply channel is armed before `result` lands.
        let mut echoed = [0u8; 1024];
        let n = test_reader.read(&mut echoed).await.unwrap();
        assert!(n > 0);

        for line in [
            br#"{"type":"system","session_id":"s1","subtype":"init"}"#.as_slice(),
            br#"{"type":"assistant","session_id":"s1","message":{"content":[{"type":"text","text":"hi"}]}}"#.as_slice(),
            br#"{"type":"result","session_id":"s1","is_error":false}"#.as_slice(),
        ] {
            test_writer.write_all(line).await.unwrap();
            test_writer.write_all(b"\n").await.unwrap();
        }

        prompt_handle.await.unwrap().unwrap();

        let mut saw_complete = false;
        while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            if matches!(event.kind, gateway_core::AgentEventKind::Complete { .. }) {
                saw_complete = true;
                break;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn cancel_without_connect_reports_not_initialized() {
        let adapter = StreamJsonAdapter::new(GatewayConfig::default());
        let err = adapter.cancel().await.unwrap_err();
        assert!(matches!(err, AdapterError::NotInitialized));
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let adapter = StreamJsonAdapter::new(GatewayConfig::default());
        let ((stdin_a, _), (_, stdout_a)) = test_duplex_pair();
        adapter
            .connect(Box::new(stdin_a), Box::new(stdout_a))
            .await
            .unwrap();

        let ((stdin_b, _), (_, stdout_b)) = test_duplex_pair();
        let err = adapter
            .connect(Box::new(stdin_b), Box::new(stdout_b))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::AlreadyConnected));
    }

    #[tokio::test]
    async fn prepare_command_args_empty_without_mcp_servers() {
        let adapter = StreamJsonAdapter::new(GatewayConfig::default());
        assert!(adapter.prepare_command_args().is_empty());
    }

    #[tokio::test]
    async fn prepare_command_args_carries_mcp_config() {
        let config = GatewayConfig::builder()
            .mcp_server(McpServerConfig {
                name: "fs".into(),
                transport: gateway_core::McpTransportConfig::Stdio {
                    command: "mcp-fs".into(),
                    args: vec![],
                },
            })
            .build();
        let adapter = StreamJsonAdapter::new(config);
        let args = adapter.prepare_command_args();
        assert_eq!(args[0], "--mcp-config");
        assert!(args[1].contains("\"fs\""));
    }

    #[tokio::test]
    async fn supervised_policy_carries_pretooluse_and_stop_hooks() {
        let config = GatewayConfig::builder()
            .permission_policy(gateway_core::PermissionPolicy::Supervised)
            .build();
        let adapter = StreamJsonAdapter::new(config);
        let args = adapter.prepare_command_args();
        assert_eq!(args[0], "--settings");
        assert!(args[1].contains("\"PreToolUse\""));
        assert!(args[1].contains("\"tool_approval\""));
        assert!(args[1].contains("\"stop_git_check\""));
        assert!(!args[1].contains("ExitPlanMode"));
    }

    #[tokio::test]
    async fn plan_policy_carries_exit_plan_mode_matcher_and_auto_approve() {
        let config = GatewayConfig::builder()
            .permission_policy(gateway_core::PermissionPolicy::Plan)
            .build();
        let adapter = StreamJsonAdapter::new(config);
        let args = adapter.prepare_command_args();
        assert_eq!(args[0], "--settings");
        assert!(args[1].contains("^ExitPlanMode$"));
        assert!(args[1].contains("\"auto_approve\""));
    }

    struct RecordingHandler {
        seen_action_type: Mutex<Option<gateway_core::ActionType>>,
    }

    #[async_trait]
    impl PermissionHandler for RecordingHandler {
        async fn handle(
            &self,
            request: PermissionRequest,
        ) -> Result<gateway_core::PermissionResponse, String> {
            *self.seen_action_type.lock().unwrap() = Some(request.action_type);
            Ok(gateway_core::PermissionResponse::cancelled())
        }
    }

    #[tokio::test]
    async fn can_use_tool_derives_action_type_from_tool_name() {
        let ((mut stdin, _reader), (_writer, _stdout)) = test_duplex_pair();
        let (events_tx, mut events_rx) = gateway_core::event_channel("stream_json");
        let handler = Arc::new(RecordingHandler { seen_action_type: Mutex::new(None) });
        let permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>> =
            Arc::new(Mutex::new(Some(handler.clone() as Arc<dyn PermissionHandler>)));
        let session_id = SessionId::from_upstream("s1");

        let request = json!({
            "type": "control_request",
            "request_id": "req-2",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": { "command": "rm -rf /tmp/x" },
            },
        });

        handle_control_request(
            &mut stdin,
            &request,
            &session_id,
            &permission_handler,
            &events_tx,
            Some(Duration::from_millis(50)),
        )
        .await;

        assert_eq!(
            handler.seen_action_type.lock().unwrap().take(),
            Some(gateway_core::ActionType::Command)
        );
        drop(events_rx.try_recv());
        drop(events_rx.try_recv());
    }

    #[tokio::test]
    async fn can_use_tool_emits_tool_call_then_permission_request_with_derived_action_type() {
        let ((mut stdin, _reader), (_writer, _stdout)) = test_duplex_pair();
        let (events_tx, mut events_rx) = gateway_core::event_channel("stream_json");
        let permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>> =
            Arc::new(Mutex::new(None));
        let session_id = SessionId::from_upstream("s1");

        let request = json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": { "command": "rm -rf /tmp/x" },
            },
        });

        handle_control_request(
            &mut stdin,
            &request,
            &session_id,
            &permission_handler,
            &events_tx,
            Some(Duration::from_millis(50)),
        )
        .await;

        let first = events_rx.try_recv().unwrap();
        let gateway_core::AgentEventKind::ToolCall { tool_call_id, payload, status, .. } = first.kind else {
            panic!("expected synthetic tool_call first");
        };
        assert_eq!(tool_call_id, "req-1");
        assert_eq!(status, gateway_core::ToolStatus::PendingPermission);
        assert_eq!(payload.kind_name(), "shell_exec");

        let second = events_rx.try_recv().unwrap();
        assert!(matches!(
            second.kind,
            gateway_core::AgentEventKind::PermissionRequest { pending_id } if pending_id == "req-1"
        ));
    }
}
