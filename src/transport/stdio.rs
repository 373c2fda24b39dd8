//! Long-lived subprocess transport speaking newline-delimited JSON-RPC.
//!
//! A child process is started lazily on first use and reused for later
//! calls. Calls to the same child are serialized through its pipe mutex,
//! so at most one JSON-RPC request is in flight per process. A dedicated
//! task drains stderr continuously; without it a chatty child deadlocks
//! on a full pipe buffer.

use super::{outcome_from_response, response_id_matches, rpc_request, next_request_id, RpcOutcome};
use crate::error::RuntimeError;
use log::{debug, info};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Overall deadline for one response.
const READ_DEADLINE: Duration = Duration::from_secs(30);
/// A single silent stretch this long aborts the read (the child is kept).
const CHUNK_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for the per-child serialization mutex.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 64 * 1024;

// ============================================================================
// Child process
// ============================================================================

struct ChildPipes {
    stdin: ChildStdin,
    stdout: ChildStdout,
    /// Carry-over bytes between chunked reads; responses are not bounded
    /// by any line-buffer size.
    carry: Vec<u8>,
    initialized: bool,
}

/// A running provider subprocess.
pub struct StdioChild {
    pid: u32,
    proc: Mutex<Child>,
    pipes: tokio::sync::Mutex<ChildPipes>,
    last_activity: Mutex<Instant>,
}

impl StdioChild {
    pub fn spawn(name: &str, cmd: &[String], env: &HashMap<String, String>) -> Result<Arc<Self>, RuntimeError> {
        let program = cmd
            .first()
            .ok_or_else(|| RuntimeError::Config(format!("provider '{name}' has an empty cmd")))?;

        let mut command = Command::new(program);
        command
            .args(&cmd[1..])
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| RuntimeError::Transport(format!("failed to start provider process '{program}': {err}")))?;

        let pid = child.id().unwrap_or_default();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Transport("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Transport("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Transport("child stderr unavailable".to_string()))?;

        let drain_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("provider '{drain_name}' stderr: {line}");
            }
        });

        Ok(Arc::new(Self {
            pid,
            proc: Mutex::new(child),
            pipes: tokio::sync::Mutex::new(ChildPipes {
                stdin,
                stdout,
                carry: Vec::new(),
                initialized: false,
            }),
            last_activity: Mutex::new(Instant::now()),
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self.proc.lock().unwrap_or_else(PoisonError::into_inner).try_wait(),
            Ok(None)
        )
    }

    pub fn terminate(&self) {
        let _ = self
            .proc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start_kill();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Send one JSON-RPC request and read the matching response line. The
    /// first call per child performs the initialization handshake.
    pub async fn call(&self, name: &str, method: &str, params: Value) -> Result<RpcOutcome, RuntimeError> {
        let mut pipes = tokio::time::timeout(LOCK_TIMEOUT, self.pipes.lock())
            .await
            .map_err(|_| RuntimeError::Transport("lock timeout - possible deadlock".to_string()))?;

        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();

        if !pipes.initialized {
            Self::handshake(&mut pipes, name).await?;
            pipes.initialized = true;
        }

        let id = next_request_id();
        let body = rpc_request(method, params, id);
        Self::write_line(&mut pipes.stdin, &body)
            .await
            .map_err(|err| RuntimeError::Transport(format!("failed to write request: {err}")))?;
        Self::read_response(&mut pipes, id).await
    }

    async fn handshake(pipes: &mut ChildPipes, name: &str) -> Result<(), RuntimeError> {
        let id = next_request_id();
        let init = rpc_request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "agent-runtime", "version": env!("CARGO_PKG_VERSION")},
            }),
            id,
        );
        Self::write_line(&mut pipes.stdin, &init)
            .await
            .map_err(|err| RuntimeError::Transport(format!("failed to initialize provider process: {err}")))?;

        let outcome = Self::read_response(pipes, id).await?;
        if !outcome.ok {
            return Err(RuntimeError::Transport(format!(
                "initialize failed: {}",
                outcome.error_text()
            )));
        }

        // Notification only: no id, no reply expected.
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        Self::write_line(&mut pipes.stdin, &note)
            .await
            .map_err(|err| RuntimeError::Transport(format!("failed to send initialized notification: {err}")))?;

        debug!("provider '{name}' handshake complete");
        Ok(())
    }

    async fn write_line(stdin: &mut ChildStdin, body: &Value) -> std::io::Result<()> {
        let mut line = body.to_string().into_bytes();
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await
    }

    /// Read stdout in chunks until a line parses to a JSON value with the
    /// expected id. Interleaved log lines are skipped; a silent stall
    /// returns a transport error without killing the child.
    async fn read_response(pipes: &mut ChildPipes, id: i64) -> Result<RpcOutcome, RuntimeError> {
        let deadline = Instant::now() + READ_DEADLINE;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            while let Some(pos) = pipes.carry.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pipes.carry.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let Ok(data) = serde_json::from_str::<Value>(text) else {
                    debug!("skipping non-JSON stdout line from child");
                    continue;
                };
                if response_id_matches(&data, id) {
                    return Ok(outcome_from_response(&data));
                }
            }

            if Instant::now() >= deadline {
                return Err(RuntimeError::Transport("stdio read timeout".to_string()));
            }

            match tokio::time::timeout(CHUNK_TIMEOUT, pipes.stdout.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(RuntimeError::Transport("provider process closed stdout".to_string())),
                Ok(Ok(n)) => pipes.carry.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => return Err(RuntimeError::Transport(format!("stdio read error: {err}"))),
                Err(_) => return Err(RuntimeError::Transport("stdio read timeout".to_string())),
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the child slot for one stdio provider. The slot is cleared when
/// the process exits and a fresh process is started on next use.
pub struct StdioDriver {
    name: String,
    cmd: Vec<String>,
    env: HashMap<String, String>,
    slot: tokio::sync::Mutex<Option<Arc<StdioChild>>>,
}

impl StdioDriver {
    pub fn new(name: &str, cmd: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            cmd,
            env,
            slot: tokio::sync::Mutex::new(None),
        }
    }

    pub fn command_line(&self) -> &[String] {
        &self.cmd
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<RpcOutcome, RuntimeError> {
        let child = self.ensure_child().await?;
        child.call(&self.name, method, params).await
    }

    async fn ensure_child(&self) -> Result<Arc<StdioChild>, RuntimeError> {
        let mut slot = self.slot.lock().await;
        if let Some(child) = slot.as_ref() {
            if child.is_alive() {
                return Ok(child.clone());
            }
            info!("provider '{}' process exited, respawning", self.name);
        }

        let child = StdioChild::spawn(&self.name, &self.cmd, &self.env)?;
        info!("provider '{}' started (pid {})", self.name, child.pid());
        *slot = Some(child.clone());
        Ok(child)
    }

    /// Clear the slot if the child has exited. Returns true when a dead
    /// child was swept.
    pub async fn sweep(&self) -> bool {
        let mut slot = self.slot.lock().await;
        if let Some(child) = slot.as_ref() {
            if !child.is_alive() {
                info!("provider '{}': cleaning up exited process (pid {})", self.name, child.pid());
                *slot = None;
                return true;
            }
        }
        false
    }

    pub async fn child_pid(&self) -> Option<u32> {
        self.slot.lock().await.as_ref().map(|c| c.pid())
    }

    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(child) = slot.take() {
            child.terminate();
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    /// Shell child that answers every id-bearing JSON-RPC line with a
    /// result, after an initial non-JSON log line. The initialized
    /// notification carries no id and is ignored.
    const ECHO_SERVER: &str = r#"
echo "provider starting up"
while read -r line; do
  id=$(printf '%s' "$line" | grep -o '"id":[0-9]*' | head -n1 | cut -d: -f2)
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","description":"pong","inputSchema":{}}]}}\n' "$id"
  fi
done
"#;

    fn driver_for(script: &str) -> StdioDriver {
        StdioDriver::new(
            "test-provider",
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_handshake_and_call_skipping_log_lines() {
        let driver = driver_for(ECHO_SERVER);

        let outcome = driver.call("tools/list", serde_json::json!({})).await.unwrap();
        assert!(outcome.ok, "unexpected error: {:?}", outcome.error);
        let tools = outcome.result.unwrap()["tools"].clone();
        assert_eq!(tools[0]["name"], "ping");

        // Second call reuses the child and skips the handshake.
        let pid_before = driver.child_pid().await;
        let outcome = driver
            .call("tools/call", serde_json::json!({"name": "ping", "arguments": {}}))
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(driver.child_pid().await, pid_before);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_large_single_line_response() {
        // 256 KiB payload on one line must survive chunked reads intact.
        let script = r#"
big=$(head -c 262144 /dev/zero | tr '\0' 'x')
while read -r line; do
  id=$(printf '%s' "$line" | grep -o '"id":[0-9]*' | head -n1 | cut -d: -f2)
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"blob":"%s"}}\n' "$id" "$big"
  fi
done
"#;
        let driver = driver_for(script);
        let outcome = driver
            .call("tools/call", serde_json::json!({"name": "dump", "arguments": {}}))
            .await
            .unwrap();
        assert!(outcome.ok, "unexpected error: {:?}", outcome.error);
        let blob = outcome.result.unwrap()["blob"].as_str().unwrap().to_string();
        assert_eq!(blob.len(), 262_144);
        assert!(blob.bytes().all(|b| b == b'x'));

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_rpc_error_passthrough() {
        let script = r#"
while read -r line; do
  id=$(printf '%s' "$line" | grep -o '"id":[0-9]*' | head -n1 | cut -d: -f2)
  if [ -n "$id" ]; then
    case "$line" in
      *initialize*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
      *) printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id" ;;
    esac
  fi
done
"#;
        let driver = driver_for(script);
        let outcome = driver
            .call("tools/call", serde_json::json!({"name": "nope", "arguments": {}}))
            .await
            .unwrap();
        // Business error: carried in the outcome, not a transport failure.
        assert!(!outcome.ok);
        assert_eq!(outcome.error_text(), "method not found");

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_clears_dead_child() {
        let driver = driver_for(ECHO_SERVER);
        assert!(driver.call("tools/list", serde_json::json!({})).await.unwrap().ok);

        // Kill the child out from under the driver.
        {
            let slot = driver.slot.lock().await;
            slot.as_ref().unwrap().terminate();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(driver.sweep().await);
        assert!(driver.child_pid().await.is_none());

        // Next call starts a fresh process.
        let outcome = driver.call("tools/list", serde_json::json!({})).await.unwrap();
        assert!(outcome.ok);
        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let driver = StdioDriver::new(
            "missing",
            vec!["/nonexistent/definitely-not-a-binary".to_string()],
            HashMap::new(),
        );
        let err = driver.call("tools/list", serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
