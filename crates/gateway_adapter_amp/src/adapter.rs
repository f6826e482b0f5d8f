use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gateway_core::{
    event_channel, transport, AdapterError, AgentAdapter, AgentInfo, Attachment, EventReceiver,
    EventSender, GatewayConfig, McpServerConfig, OperationId, PermissionArbiter, PermissionHandler,
    PermissionOption, PermissionRequest, PermissionResponse, SessionId,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::warn;

use crate::decode::{handle_message, TurnState};

/// Amp's one-shot adapter: every `prompt` spawns a fresh subprocess
/// rather than reusing one long-lived connection, so `connect` is a no-op
/// per [`AgentAdapter::connect`]'s documented allowance and all the actual
/// work happens lazily inside `prompt`.
pub struct AmpAdapter {
    config: GatewayConfig,
    events: Mutex<Option<EventSender>>,
    events_rx: Mutex<Option<EventReceiver>>,
    permission_handler: Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    session_id: Mutex<SessionId>,
    has_amp_thread_id: AtomicBool,
    current_pid: Mutex<Option<u32>>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    first_call_made: AtomicBool,
}

impl AmpAdapter {
    pub fn new(config: GatewayConfig) -> Self {
        let (tx, rx) = event_channel("amp");
        Self {
            config,
            events: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            permission_handler: Arc::new(Mutex::new(None)),
            session_id: Mutex::new(SessionId::placeholder()),
            has_amp_thread_id: AtomicBool::new(false),
            current_pid: Mutex::new(None),
            cancel_tx: Mutex::new(None),
            first_call_made: AtomicBool::new(false),
        }
    }

    fn build_args(&self) -> Vec<String> {
        let one_shot = self.config.one_shot_config().cloned().unwrap_or_default();
        if self.has_amp_thread_id.load(Ordering::SeqCst) && self.first_call_made.load(Ordering::SeqCst) {
            let mut args = one_shot.continue_args_template;
            args.push(self.session_id.lock().unwrap().as_str().to_string());
            args
        } else {
            one_shot.initial_args
        }
    }
}

#[async_trait]
impl AgentAdapter for AmpAdapter {
    async fn connect(
        &self,
        _stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        _stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    ) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn initialize(&self) -> Result<AgentInfo, AdapterError> {
        Ok(AgentInfo { name: "amp".to_string(), version: "one-shot".to_string() })
    }

    async fn new_session(&self, _mcp_servers: &[McpServerConfig]) -> Result<SessionId, AdapterError> {
        Ok(self.session_id.lock().unwrap().clone())
    }

    async fn load_session(&self, session_id: SessionId) -> Result<SessionId, AdapterError> {
        self.has_amp_thread_id.store(session_id.as_str().starts_with("T-"), Ordering::SeqCst);
        *self.session_id.lock().unwrap() = session_id.clone();
        self.first_call_made.store(true, Ordering::SeqCst);
        Ok(session_id)
    }

    async fn prompt(&self, message: &str, _attachments: &[Attachment]) -> Result<(), AdapterError> {
        let binary = self
            .config
            .binary()
            .cloned()
            .ok_or(AdapterError::AdapterState("amp adapter has no configured binary"))?;
        let args = self.build_args();

        let mut command = Command::new(&binary);
        command.args(&args).stdin(std::process::Stdio::piped()).stdout(std::process::Stdio::piped());
        if let Some(dir) = self.config.work_dir() {
            command.current_dir(dir);
        }
        for (key, value) in self.config.env() {
            command.env(key, value);
        }
        if let Some(one_shot) = self.config.one_shot_config() {
            for (key, value) in &one_shot.env {
                command.env(key, value);
            }
        }
        // Detaches the child into its own session so `cancel`'s
        // `kill_process_group` reaches everything it spawns, not just the
        // immediate child.
        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }

        let mut child = transport::spawn_with_retry(&mut command, &binary)?;
        *self.current_pid.lock().unwrap() = child.id();

        let mut stdin = child.stdin.take().ok_or(AdapterError::AdapterState("amp child has no stdin"))?;
        let stdout = child.stdout.take().ok_or(AdapterError::AdapterState("amp child has no stdout"))?;

        let payload = json!({ "type": "user", "message": { "role": "user", "content": message } });
        let mut line = payload.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await.map_err(AdapterError::Io)?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        *self.cancel_tx.lock().unwrap() = Some(cancel_tx);

        let operation_id = OperationId::new();
        let mut state = TurnState::new(self.session_id.lock().unwrap().clone(), operation_id);
        let events = self.events.lock().unwrap().clone().ok_or(AdapterError::AdapterState("amp event sender missing"))?;
        let permission_handler = self.permission_handler.clone();
        let permission_timeout = self.config.permission_timeout();

        let mut lines = BufReader::new(stdout).lines();
        let result = loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    if let Some(pid) = *self.current_pid.lock().unwrap() {
                        let _ = transport::kill_process_group(pid);
                    }
                    break Err(AdapterError::Cancelled);
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(raw)) => {
                            let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                                warn!(line = %raw, "failed to parse amp stream-json line");
                                continue;
                            };

                            if value.get("type").and_then(Value::as_str) == Some("control_request") {
                                handle_permission_request(&mut stdin, &value, &state.session_id, &permission_handler, &events, permission_timeout).await;
                                continue;
                            }

                            let emitted = handle_message(&mut state, &value);
                            let completed = state.complete_sent;
                            for event in emitted {
                                events.send(event);
                            }
                            if completed {
                                break Ok(());
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(err) => break Err(AdapterError::Io(err)),
                    }
                }
            }
        };

        let _ = stdin.shutdown().await;
        drop(stdin);

        *self.cancel_tx.lock().unwrap() = None;
        *self.current_pid.lock().unwrap() = None;
        let _ = child.wait().await;

        *self.session_id.lock().unwrap() = state.session_id;
        self.has_amp_thread_id.store(state.has_amp_thread_id, Ordering::SeqCst);
        self.first_call_made.store(true, Ordering::SeqCst);

        result
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        if let Some(tx) = self.cancel_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    fn updates(&self) -> Option<EventReceiver> {
        self.events_rx.lock().unwrap().take()
    }

    fn set_permission_handler(&self, handler: Option<Arc<dyn PermissionHandler>>) {
        *self.permission_handler.lock().unwrap() = handler;
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if let Some(pid) = self.current_pid.lock().unwrap().take() {
            let _ = transport::kill_process_group(pid);
        }
        Ok(())
    }

    fn requires_process_kill(&self) -> bool {
        false
    }
}

async fn handle_permission_request(
    stdin: &mut (impl tokio::io::AsyncWrite + Unpin),
    value: &Value,
    session_id: &SessionId,
    permission_handler: &Arc<Mutex<Option<Arc<dyn PermissionHandler>>>>,
    events: &EventSender,
    permission_timeout: Option<std::time::Duration>,
) {
    let Some(request_id) = value.get("request_id").and_then(Value::as_str) else { return };
    let request = value.get("request");
    let tool_name = request.and_then(|r| r.get("tool_name")).and_then(Value::as_str).unwrap_or("tool");

    let permission_request = PermissionRequest {
        session_id: session_id.clone(),
        tool_call_id: request_id.to_string(),
        pending_id: request_id.to_string(),
        title: format!("Use {tool_name}"),
        action_type: gateway_core::ActionType::Other,
        action_details: request.and_then(|r| r.get("input")).map(|v| v.to_string()).unwrap_or_default(),
        options: vec![
            PermissionOption { option_id: "allow".into(), name: "Allow".into(), kind: gateway_core::OptionKind::AllowOnce },
            PermissionOption { option_id: "deny".into(), name: "Deny".into(), kind: gateway_core::OptionKind::RejectOnce },
        ],
    };

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

    let response = match outcome {
        gateway_core::ArbitrationOutcome::Decision(response) => response,
        gateway_core::ArbitrationOutcome::TimedOut | gateway_core::ArbitrationOutcome::Cancelled => {
            events.send(gateway_core::AgentEvent::new(
                session_id.clone(),
                gateway_core::OperationId::empty(),
                gateway_core::AgentEventKind::PermissionCancelled { pending_id: request_id.to_string() },
            ));
            PermissionResponse::cancelled()
        }
    };

    let behavior = if response.cancelled || response.option_id.as_deref() == Some("deny") {
        json!({ "behavior": "deny", "interrupt": response.cancelled })
    } else {
        json!({ "behavior": "allow" })
    };
    let reply = json!({
        "type": "control_response",
        "response": { "request_id": request_id, "response": behavior },
    });
    let mut line = reply.to_string();
    line.push('\n');
    let _ = stdin.write_all(line.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_uses_initial_args_before_any_thread_id_observed() {
        let config = GatewayConfig::builder()
            .one_shot_config(gateway_core::OneShotConfig {
                initial_args: vec!["--initial".into()],
                continue_args_template: vec!["--continue".into()],
                env: Default::default(),
            })
            .build();
        let adapter = AmpAdapter::new(config);
        assert_eq!(adapter.build_args(), vec!["--initial".to_string()]);
    }

    #[test]
    fn build_args_uses_continue_args_once_real_thread_id_observed() {
        let config = GatewayConfig::builder()
            .one_shot_config(gateway_core::OneShotConfig {
                initial_args: vec!["--initial".into()],
                continue_args_template: vec!["--continue".into()],
                env: Default::default(),
            })
            .build();
        let adapter = AmpAdapter::new(config);
        adapter.has_amp_thread_id.store(true, Ordering::SeqCst);
        adapter.first_call_made.store(true, Ordering::SeqCst);
        *adapter.session_id.lock().unwrap() = SessionId::from_upstream("T-abc");
        assert_eq!(adapter.build_args(), vec!["--continue".to_string(), "T-abc".to_string()]);
    }

    #[test]
    fn requires_process_kill_is_false() {
        let adapter = AmpAdapter::new(GatewayConfig::default());
        assert!(!adapter.requires_process_kill());
    }
}
