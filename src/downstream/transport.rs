//! Transport adapters for downstream MCP servers.
//!
//! Two adapters implement the same abstract operation — send one JSON-RPC
//! request, get one response, under a deadline:
//!
//! - **Stdio**: spawn a child process and speak newline-delimited JSON-RPC
//!   over its stdin/stdout. A dedicated reader task matches replies to
//!   callers through an in-flight table keyed by local request id, so
//!   replies may arrive in any order. Only stdout carries protocol traffic;
//!   stderr is drained to the log.
//! - **HTTP**: POST each request to the downstream's `/mcp` endpoint and
//!   read the response body. Connection failures are retried at most once
//!   per call.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::LaunchDescriptor;
use crate::error::TransportError;
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::mcp::transport::Outbound;

/// Default deadline for a downstream call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between asking a child to terminate and force-killing it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Consecutive HTTP failures after which the transport reports dead.
const HTTP_FAILURE_THRESHOLD: u32 = 3;

/// Abstract downstream transport: one request in, one response out.
#[async_trait]
pub trait DownstreamTransport: Send + Sync + std::fmt::Debug {
    /// Sends a JSON-RPC request and waits for the matching response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Sends a JSON-RPC notification (no response expected).
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    /// Whether the transport can still carry requests.
    fn is_alive(&self) -> bool;

    /// Stops accepting requests and releases the underlying resources.
    async fn shutdown(&self);
}

/// Reply channels for requests awaiting a downstream response.
type InFlightTable = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Child-process transport speaking newline-delimited JSON-RPC.
pub struct StdioTransport {
    server_name: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    in_flight: InFlightTable,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl StdioTransport {
    /// Spawns the child described by the launch descriptor and starts its
    /// stdout/stderr reader tasks.
    ///
    /// Verbatim downstream notifications are relayed to `outbound`.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be spawned or its pipes
    /// cannot be captured.
    pub fn spawn(
        server_name: &str,
        descriptor: &LaunchDescriptor,
        outbound: Outbound,
    ) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &descriptor.cwd {
            cmd.current_dir(cwd);
        }
        // Overlay on the inherited parent environment.
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Io)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stderr",
            ))
        })?;

        let in_flight: InFlightTable = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Stderr is free-form and only logged.
        let stderr_name = server_name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %stderr_name, line = %line, "downstream stderr");
            }
        });

        tokio::spawn(reader_loop(
            server_name.to_string(),
            stdout,
            Arc::clone(&in_flight),
            Arc::clone(&alive),
            outbound,
        ));

        Ok(Self {
            server_name: server_name.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            in_flight,
            next_id: AtomicI64::new(1),
            alive,
        })
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Reads the child's stdout line by line, matching responses to the
/// in-flight table and relaying notifications upstream verbatim.
async fn reader_loop(
    server_name: String,
    stdout: tokio::process::ChildStdout,
    in_flight: InFlightTable,
    alive: Arc<AtomicBool>,
    outbound: Outbound,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                    debug!(server = %server_name, line = %trimmed, "discarding non-JSON line from downstream stdout");
                    continue;
                };
                dispatch_inbound(&server_name, value, &in_flight, &outbound).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server_name, error = %e, "error reading downstream stdout");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Pending callers learn the session is gone through their dropped
    // reply channels.
    let dropped = in_flight.lock().await.drain().count();
    if dropped > 0 {
        warn!(server = %server_name, pending = dropped, "downstream closed with requests in flight");
    }
    debug!(server = %server_name, "downstream stdout reader finished");
}

async fn dispatch_inbound(
    server_name: &str,
    value: Value,
    in_flight: &InFlightTable,
    outbound: &Outbound,
) {
    let id = value.get("id").and_then(Value::as_i64);
    match id {
        Some(id) => {
            let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value.clone()) else {
                debug!(server = %server_name, "discarding invalid JSON-RPC line from downstream");
                return;
            };
            let sender = in_flight.lock().await.remove(&id);
            match sender {
                Some(sender) => {
                    let _ = sender.send(response);
                }
                None => {
                    debug!(server = %server_name, id, "discarding reply with no in-flight request");
                }
            }
        }
        None if value.get("method").is_some() => {
            // A downstream-originated notification; relay verbatim.
            outbound.raw(value).await;
        }
        None => {
            debug!(server = %server_name, "discarding message with neither id nor method");
        }
    }
}

#[async_trait]
impl DownstreamTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.in_flight.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request)?;
        debug!(server = %self.server_name, id, method, "forwarding request to downstream");

        if let Err(e) = self.write_line(&json).await {
            self.in_flight.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                // Deadline expired: cancel the in-flight entry. The session
                // stays usable; a late reply is discarded by the reader.
                self.in_flight.lock().await.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let json = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);

        // Ask the child to terminate by closing its stdin, then wait out
        // the grace period before force-killing. Requests already in
        // flight may still complete through the reader until then.
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                debug!(server = %self.server_name, error = %e, "error closing downstream stdin");
            }
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.server_name, ?status, "downstream process exited");
            }
            Ok(Err(e)) => {
                warn!(server = %self.server_name, error = %e, "error waiting for downstream process");
            }
            Err(_) => {
                warn!(server = %self.server_name, "downstream did not exit within grace period, killing");
                if let Err(e) = child.kill().await {
                    warn!(server = %self.server_name, error = %e, "failed to kill downstream process");
                }
            }
        }

        self.in_flight.lock().await.clear();
    }
}

/// HTTP POST transport: one request per round-trip to `POST /mcp`.
pub struct HttpTransport {
    server_name: String,
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicI64,
    consecutive_failures: AtomicU32,
    closed: AtomicBool,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("server_name", &self.server_name)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpTransport {
    /// Creates a transport for a downstream reachable at `base_url`.
    #[must_use]
    pub fn new(server_name: &str, base_url: &str, client: reqwest::Client) -> Self {
        Self {
            server_name: server_name.to_string(),
            endpoint: format!("{}/mcp", base_url.trim_end_matches('/')),
            client,
            next_id: AtomicI64::new(1),
            consecutive_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The resolved `POST /mcp` endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(
        &self,
        body: &Value,
        deadline: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let attempt = || {
            self.client
                .post(&self.endpoint)
                .timeout(deadline)
                .json(body)
                .send()
        };

        match attempt().await {
            Ok(response) => Ok(response),
            // Connection failures are retried at most once per call.
            Err(e) if e.is_connect() => {
                debug!(server = %self.server_name, error = %e, "HTTP connect failed, retrying once");
                attempt().await
            }
            Err(e) => Err(e),
        }
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl DownstreamTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&request)?;

        let result = async {
            let response = self.post(&body, deadline).await?;
            response.json::<JsonRpcResponse>().await
        }
        .await;

        match result {
            Ok(response) => {
                self.record_success();
                if response.id != RequestId::Number(id) {
                    warn!(
                        server = %self.server_name,
                        expected = id,
                        got = %response.id,
                        "HTTP reply id mismatch"
                    );
                }
                Ok(response)
            }
            Err(e) => {
                self.record_failure();
                if e.is_timeout() {
                    Err(TransportError::Timeout)
                } else {
                    Err(TransportError::Http(e))
                }
            }
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let body = serde_json::to_value(JsonRpcNotification::new(method))?;
        match self.post(&body, DEFAULT_CALL_TIMEOUT).await {
            Ok(_) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(TransportError::Http(e))
            }
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.consecutive_failures.load(Ordering::Relaxed) < HTTP_FAILURE_THRESHOLD
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
