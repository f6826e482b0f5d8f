use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

use crate::error::AdapterError;

/// Spawns `command`, retrying on `ExecutableFileBusy`/errno 26 with capped
/// exponential backoff: some sandboxed environments transiently deny exec
/// on a just-written binary.
pub fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, AdapterError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.kill_on_drop(true).spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                warn!(binary = %binary.display(), error = %source, "failed to spawn collaborator subprocess");
                return Err(AdapterError::Io(source));
            }
        }
    }
    unreachable!("spawn_with_retry should return before exhausting retries")
}

/// Pairs a spawned child's stdin/stdout into the `Connect(stdin, stdout)`
/// shape every adapter expects. Owns the `Child` so it is killed on
/// drop for protocols where `kill_on_drop` is sufficient teardown.
pub struct ChildTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
}

impl ChildTransport {
    pub fn from_child(mut child: Child) -> Result<Self, AdapterError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::AdapterState("child has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::AdapterState("child has no stdout pipe"))?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
        })
    }

    /// Takes the stdin/stdout halves, leaving the `Child` handle behind for
    /// lifecycle management (wait/kill).
    pub fn take_io(&mut self) -> Option<(ChildStdin, BufReader<ChildStdout>)> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some((stdin, stdout)),
            _ => None,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// An in-memory duplex pair satisfying the same `AsyncRead + AsyncWrite`
/// shape as [`ChildTransport`]'s halves, used by adapter test suites to
/// drive fixture JSONL through the real decoder without spawning a process.
pub fn test_duplex_pair() -> (
    (impl AsyncWrite + Unpin, impl AsyncRead + Unpin),
    (impl AsyncWrite + Unpin, impl AsyncRead + Unpin),
) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    ((a_write, b_read), (b_write, a_read))
}

/// Kills the process group rooted at `pid`. Used by the `RequiresProcessKill
/// = true` adapters (Copilot, OpenCode) whose subprocess does not exit when
/// stdin closes.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(windows)]
pub fn kill_process_group(pid: u32) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .status()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn duplex_pair_round_trips() {
        let ((mut a_write, mut a_read), (mut b_write, mut b_read)) = test_duplex_pair();
        a_write.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        b_write.write_all(b"pong\n").await.unwrap();
        let mut buf = [0u8; 5];
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong\n");
    }
}
