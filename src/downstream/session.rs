//! Downstream session lifecycle.
//!
//! One session exists per configured downstream server. A session owns its
//! transport (and through it, any spawned child process) and walks the
//! lifecycle:
//!
//! ```text
//! NEW ──▶ STARTING ──▶ READY ──▶ DRAINING ──▶ CLOSED
//!             │           │
//!             └──▶ FAILED ◀┘
//! ```
//!
//! Startup is lazy and retried on the next demand: a FAILED session goes
//! back through STARTING when the router or the catalog next needs it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{LaunchDescriptor, ServerRecord};
use crate::error::{SessionError, TransportError};
use crate::mcp::protocol::{
    JsonRpcResponse, ToolDescriptor, ToolsListResult, MCP_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::mcp::transport::Outbound;
use crate::downstream::transport::{DownstreamTransport, HttpTransport, StdioTransport};

/// Lifecycle state of a downstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never started.
    New,
    /// Handshake in progress.
    Starting,
    /// Accepting forwards.
    Ready,
    /// Shutting down; no new forwards, in-flight calls may finish.
    Draining,
    /// Torn down; child reaped.
    Closed,
    /// Startup failed or the transport died; restarted on next demand.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// How this session reaches its downstream.
enum SessionKind {
    /// Child process looked up in the launch descriptors.
    Child { descriptor: Option<LaunchDescriptor> },
    /// HTTP endpoint.
    Http { url: String },
}

struct Inner {
    state: SessionState,
    transport: Option<Arc<dyn DownstreamTransport>>,
}

/// The gateway's connection to a single downstream server.
pub struct DownstreamSession {
    name: String,
    namespace: String,
    kind: SessionKind,
    outbound: Outbound,
    http_client: reqwest::Client,
    inner: Mutex<Inner>,
}

impl DownstreamSession {
    /// Creates a session for a server record.
    ///
    /// For child-process downstreams `descriptor` is the launch descriptor
    /// looked up under the record's name; `None` makes startup fail with a
    /// clear reason rather than erroring here, so a missing descriptor
    /// behaves like any other unavailable downstream.
    #[must_use]
    pub fn new(
        record: &ServerRecord,
        descriptor: Option<LaunchDescriptor>,
        outbound: Outbound,
        http_client: reqwest::Client,
    ) -> Self {
        let kind = if record.uses_http() {
            SessionKind::Http {
                url: record.url.clone(),
            }
        } else {
            SessionKind::Child { descriptor }
        };

        Self {
            name: record.name.clone(),
            namespace: record.namespace(),
            kind,
            outbound,
            http_client,
            inner: Mutex::new(Inner {
                state: SessionState::New,
                transport: None,
            }),
        }
    }

    /// Creates a session that is already READY over the given transport.
    ///
    /// Primarily for tests and embedders that bring their own transport.
    #[must_use]
    pub fn with_transport(
        name: &str,
        outbound: Outbound,
        transport: Arc<dyn DownstreamTransport>,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: crate::config::derive_namespace(name),
            kind: SessionKind::Child { descriptor: None },
            outbound,
            http_client: reqwest::Client::new(),
            inner: Mutex::new(Inner {
                state: SessionState::Ready,
                transport: Some(transport),
            }),
        }
    }

    /// The administrative server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The routing namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The session's current state, corrected for a transport that died
    /// underneath a READY session.
    pub async fn state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.transport) {
            (SessionState::Ready, Some(t)) if !t.is_alive() => SessionState::Failed,
            (state, _) => *state,
        }
    }

    /// Brings the session to READY, starting it if necessary, and returns
    /// its transport.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Draining`] once shutdown has begun, or
    /// [`SessionError::Unavailable`] when startup fails or does not finish
    /// within `deadline`.
    pub async fn ensure_ready(
        &self,
        deadline: Duration,
    ) -> Result<Arc<dyn DownstreamTransport>, SessionError> {
        let mut inner = self.inner.lock().await;

        if inner.state == SessionState::Ready {
            match &inner.transport {
                Some(transport) if transport.is_alive() => {
                    return Ok(Arc::clone(transport));
                }
                _ => {
                    warn!(server = %self.name, "transport died underneath READY session");
                    inner.state = SessionState::Failed;
                    inner.transport = None;
                }
            }
        }

        match inner.state {
            SessionState::Draining | SessionState::Closed => Err(SessionError::Draining {
                name: self.name.clone(),
            }),
            SessionState::New | SessionState::Failed => {
                inner.state = SessionState::Starting;
                match tokio::time::timeout(deadline, self.start(deadline)).await {
                    Ok(Ok(transport)) => {
                        info!(server = %self.name, "downstream session ready");
                        inner.state = SessionState::Ready;
                        inner.transport = Some(Arc::clone(&transport));
                        Ok(transport)
                    }
                    Ok(Err(e)) => {
                        warn!(server = %self.name, error = %e, "downstream session failed to start");
                        inner.state = SessionState::Failed;
                        Err(e)
                    }
                    Err(_) => {
                        warn!(server = %self.name, "downstream initialize timed out");
                        inner.state = SessionState::Failed;
                        Err(SessionError::Unavailable {
                            name: self.name.clone(),
                            reason: "initialize timed out".to_string(),
                        })
                    }
                }
            }
            // Unreachable while the lock is held across startup.
            SessionState::Starting | SessionState::Ready => Err(SessionError::Unavailable {
                name: self.name.clone(),
                reason: "session is mid-startup".to_string(),
            }),
        }
    }

    /// Spawns or connects the transport and performs the MCP handshake.
    ///
    /// The first request on a fresh transport carries local id 1.
    async fn start(
        &self,
        deadline: Duration,
    ) -> Result<Arc<dyn DownstreamTransport>, SessionError> {
        let transport: Arc<dyn DownstreamTransport> = match &self.kind {
            SessionKind::Child { descriptor } => {
                let descriptor = descriptor.as_ref().ok_or_else(|| SessionError::Unavailable {
                    name: self.name.clone(),
                    reason: "no launch descriptor configured".to_string(),
                })?;
                Arc::new(
                    StdioTransport::spawn(&self.name, descriptor, self.outbound.clone())
                        .map_err(|e| self.transport_error(e))?,
                )
            }
            SessionKind::Http { url } => Arc::new(HttpTransport::new(
                &self.name,
                url,
                self.http_client.clone(),
            )),
        };

        let response = transport
            .send_request("initialize", Some(initialize_params()), deadline)
            .await
            .map_err(|e| self.transport_error(e))?;

        if let Err(err) = response.into_result() {
            return Err(SessionError::Protocol {
                name: self.name.clone(),
                message: format!("initialize failed: {err}"),
            });
        }

        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(|e| self.transport_error(e))?;

        debug!(server = %self.name, "downstream handshake complete");
        Ok(transport)
    }

    /// Forwards one request under a deadline.
    ///
    /// A timeout leaves the session READY; a dead transport marks it
    /// FAILED so the next demand restarts it.
    ///
    /// # Errors
    ///
    /// Propagates startup failures and transport failures, tagged with the
    /// downstream name.
    pub async fn forward(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<JsonRpcResponse, SessionError> {
        let transport = self.ensure_ready(deadline).await?;

        match transport.send_request(method, params, deadline).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if matches!(e, TransportError::ProcessExited | TransportError::Closed) {
                    let mut inner = self.inner.lock().await;
                    if inner.state == SessionState::Ready {
                        inner.state = SessionState::Failed;
                        inner.transport = None;
                    }
                }
                Err(self.transport_error(e))
            }
        }
    }

    /// Issues `tools/call` for the downstream's original tool name and
    /// returns the raw response for verbatim relay.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::forward`].
    pub async fn call_tool(
        &self,
        tool_name: &str,
        parameters: Value,
        deadline: Duration,
    ) -> Result<JsonRpcResponse, SessionError> {
        self.forward(
            "tools/call",
            Some(serde_json::json!({ "name": tool_name, "parameters": parameters })),
            deadline,
        )
        .await
    }

    /// Issues `tools/list` and parses the descriptor list.
    ///
    /// # Errors
    ///
    /// Propagates forward failures; a downstream error reply or an
    /// unparseable result becomes [`SessionError::Protocol`].
    pub async fn list_tools(
        &self,
        deadline: Duration,
    ) -> Result<Vec<ToolDescriptor>, SessionError> {
        let response = self.forward("tools/list", None, deadline).await?;
        let result = response.into_result().map_err(|err| SessionError::Protocol {
            name: self.name.clone(),
            message: format!("tools/list failed: {err}"),
        })?;

        let parsed: ToolsListResult =
            serde_json::from_value(result).map_err(|e| SessionError::Protocol {
                name: self.name.clone(),
                message: format!("unparseable tools/list result: {e}"),
            })?;
        Ok(parsed.tools)
    }

    /// Stops accepting new forwards. In-flight requests may complete until
    /// their deadlines; [`Self::close`] finishes the teardown.
    pub async fn drain(&self) {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, SessionState::Closed) {
            inner.state = SessionState::Draining;
        }
    }

    /// Tears down the transport (asking any child to exit, killing it
    /// after the grace period) and marks the session CLOSED.
    pub async fn close(&self) {
        let transport = {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Draining;
            inner.transport.take()
        };

        if let Some(transport) = transport {
            transport.shutdown().await;
        }

        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Closed;
        info!(server = %self.name, "downstream session closed");
    }

    /// Drains and closes in one step; used on gateway shutdown.
    pub async fn drain_and_close(&self) {
        self.drain().await;
        self.close().await;
    }

    fn transport_error(&self, source: TransportError) -> SessionError {
        SessionError::Transport {
            name: self.name.clone(),
            source,
        }
    }
}

/// The `initialize` parameters the gateway presents to downstreams.
fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::mcp::protocol::RequestId;
    use crate::mcp::transport::spawn_writer_to;

    fn sink() -> Outbound {
        let (outbound, _handle) = spawn_writer_to(tokio::io::sink());
        outbound
    }

    /// Transport that answers every request from a canned script.
    #[derive(Debug)]
    struct ScriptedTransport {
        replies: Vec<(String, Value)>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<(&str, Value)>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|(m, v)| (m.to_string(), v))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DownstreamTransport for ScriptedTransport {
        async fn send_request(
            &self,
            method: &str,
            _params: Option<Value>,
            _deadline: Duration,
        ) -> Result<JsonRpcResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (expected, result) = &self.replies[n.min(self.replies.len() - 1)];
            assert_eq!(method, expected);
            Ok(JsonRpcResponse::success(
                RequestId::Number(i64::try_from(n).unwrap() + 1),
                result.clone(),
            ))
        }

        async fn send_notification(&self, _method: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn preconnected_session_is_ready() {
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "tools/list",
            serde_json::json!({ "tools": [ { "name": "ping" } ] }),
        )]));
        let session = DownstreamSession::with_transport("Foo Bar", sink(), transport);

        assert_eq!(session.state().await, SessionState::Ready);
        assert_eq!(session.namespace(), "foo_bar");

        let tools = session.list_tools(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");
    }

    #[tokio::test]
    async fn missing_launch_descriptor_fails_startup() {
        let record = ServerRecord {
            name: "local".to_string(),
            url: "stdio".to_string(),
            enabled: true,
        };
        let session = DownstreamSession::new(&record, None, sink(), reqwest::Client::new());

        let err = session
            .ensure_ready(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no launch descriptor"));
        assert_eq!(session.state().await, SessionState::Failed);
    }

    #[tokio::test]
    async fn drained_session_rejects_forwards() {
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "tools/list",
            serde_json::json!({ "tools": [] }),
        )]));
        let session = DownstreamSession::with_transport("x", sink(), transport);
        session.drain().await;

        let err = session
            .forward("tools/list", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Draining { .. }));

        session.close().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_child_fails_within_deadline() {
        let record = ServerRecord {
            name: "slow".to_string(),
            url: "stdio".to_string(),
            enabled: true,
        };
        let descriptor = LaunchDescriptor {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            cwd: None,
            env: std::collections::HashMap::new(),
        };
        let session =
            DownstreamSession::new(&record, Some(descriptor), sink(), reqwest::Client::new());

        let start = std::time::Instant::now();
        let err = session
            .ensure_ready(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            SessionError::Unavailable { .. } | SessionError::Transport { .. }
        ));
        assert_eq!(session.state().await, SessionState::Failed);
    }
}
