use std::path::PathBuf;

use gateway_core::transport::{kill_process_group, spawn_with_retry, ChildTransport};
use gateway_core::{AdapterError, AgentAdapter, GatewayConfig};
use tokio::process::Command;
use tracing::warn;

use crate::adapter::{build_adapter, AnyAgentAdapter};
use crate::protocol::AgentProtocol;

/// A spawned collaborator subprocess paired with the adapter driving it.
/// Owns the `Child` handle so `close` can kill the process group for
/// protocols that don't exit on stdin close.
pub struct Session {
    pub adapter: AnyAgentAdapter,
    transport: ChildTransport,
    protocol: AgentProtocol,
}

impl Session {
    /// Spawns `binary` with the adapter's own extra args/env
    /// (`prepare_command_args`/`prepare_environment`), wires its stdin/stdout
    /// into the adapter via `connect`, and returns the pair ready for
    /// `initialize`.
    pub async fn spawn(
        protocol: AgentProtocol,
        binary: PathBuf,
        config: GatewayConfig,
    ) -> Result<Self, AdapterError> {
        let adapter = build_adapter(protocol, config.clone());

        let mut command = Command::new(&binary);
        command.args(adapter.prepare_command_args());
        for (key, value) in adapter.prepare_environment() {
            command.env(key, value);
        }
        if let Some(dir) = config.work_dir() {
            command.current_dir(dir);
        }
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());

        let child = spawn_with_retry(&mut command, &binary)?;
        let mut transport = ChildTransport::from_child(child)?;
        let (stdin, stdout) = transport
            .take_io()
            .ok_or(AdapterError::AdapterState("child transport already taken"))?;

        adapter.connect(Box::new(stdin), Box::new(stdout)).await?;

        Ok(Self { adapter, transport, protocol })
    }

    /// Idempotent teardown: closes the adapter, then kills the process
    /// group for protocols that require it (Copilot, OpenCode); other
    /// protocols exit on their own once stdin closes along with `close`.
    pub async fn close(&mut self) -> Result<(), AdapterError> {
        self.adapter.close().await?;
        if self.protocol.requires_process_kill() {
            if let Some(pid) = self.transport.process_id() {
                if let Err(err) = kill_process_group(pid) {
                    warn!(pid, error = %err, "failed to kill collaborator process group");
                }
            }
        } else if let Err(err) = self.transport.kill().await {
            warn!(error = %err, "failed to reap collaborator subprocess");
        }
        Ok(())
    }
}
