//! The gateway dispatcher.
//!
//! Implements the upstream MCP server lifecycle over standard I/O:
//!
//! 1. **Initialisation**: capability negotiation; the first `initialize`
//!    starts every enabled downstream and warms the catalog
//! 2. **Operation**: `tools/list` serves built-ins plus the cached
//!    catalog; `tools/call` routes to the admin tools or a downstream
//! 3. **Shutdown**: stdin EOF or a termination signal drains every
//!    session and answers still-pending calls
//!
//! # Message Flow
//!
//! ```text
//! Client                       Gateway                    Downstreams
//!   │                            │                            │
//!   ├─── initialize ────────────▶│── spawn/connect ──────────▶│
//!   │◀── initialize result ──────┤── tools/list (fan-out) ───▶│
//!   │◀── update/tools ───────────┤◀─ tool descriptors ────────┤
//!   │                            │                            │
//!   ├─── tools/list ────────────▶│   (served from cache)      │
//!   │◀── namespaced catalog ─────┤                            │
//!   │                            │                            │
//!   ├─── tools/call ────────────▶│── tools/call (original) ──▶│
//!   │◀── relayed reply ──────────┤◀─ result or error ─────────┤
//! ```
//!
//! Replies to `tools/call` are produced by spawned tasks, so responses may
//! leave in a different order than their requests arrived; the client
//! correlates by id. Every request with an id receives exactly one reply,
//! including "gateway shutting down" errors for calls still in flight when
//! the gateway stops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::admin::{builtin_tools, handle_admin_call, AdminTool, RefreshRequest};
use crate::config::ConfigStore;
use crate::error::FatalError;
use crate::mcp::protocol::{
    parse_message, EnvelopeError, IncomingMessage, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId, ToolCallParams, MCP_PROTOCOL_VERSION, SERVER_NAME,
};
use crate::mcp::transport::{spawn_writer, Outbound, StdinReader};
use crate::router::{forward_tool_call, resolve_tool};
use crate::state::GatewayState;

/// Calls in flight on behalf of the client, keyed by an internal sequence
/// number. Owning an entry is the right to reply: whoever removes it —
/// the call's own task, or shutdown — writes the one response.
type PendingCalls = Arc<Mutex<HashMap<u64, (RequestId, Option<AbortHandle>)>>>;

enum OutboundReply {
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

/// The aggregating MCP gateway server.
pub struct GatewayServer {
    state: Arc<GatewayState>,
    outbound: Outbound,
    writer: Option<JoinHandle<Result<(), FatalError>>>,
    pending: PendingCalls,
    next_seq: AtomicU64,
}

impl GatewayServer {
    /// Creates a gateway writing to standard output.
    #[must_use]
    pub fn new(config: ConfigStore) -> Self {
        let (outbound, writer) = spawn_writer();
        Self::with_outbound(config, outbound, Some(writer))
    }

    /// Creates a gateway over an externally provided writer handle. Tests
    /// use this to capture emitted lines.
    #[must_use]
    pub fn with_outbound(
        config: ConfigStore,
        outbound: Outbound,
        writer: Option<JoinHandle<Result<(), FatalError>>>,
    ) -> Self {
        let state = GatewayState::new(config, outbound.clone());
        Self {
            state,
            outbound,
            writer,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    /// The shared gateway state.
    #[must_use]
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Runs the dispatcher until stdin closes, a termination signal
    /// arrives, or a fatal condition occurs.
    ///
    /// # Errors
    ///
    /// Returns the fatal condition; the caller maps it to an exit code.
    pub async fn run(&mut self) -> Result<(), FatalError> {
        // Informational greeting, permitted before the first initialize.
        self.outbound
            .notification(&JsonRpcNotification::with_params(
                "notification",
                json!({
                    "message": format!("{SERVER_NAME} {} ready", env!("CARGO_PKG_VERSION")),
                }),
            ))
            .await;

        let mut reader = StdinReader::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                line = reader.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if let Err(fatal) = self.handle_line(&line).await {
                            break Err(fatal);
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, shutting down");
                        break Ok(());
                    }
                    Err(e) => break Err(FatalError::StdIo(e)),
                },
                () = &mut shutdown => {
                    info!("termination signal received, shutting down");
                    break Ok(());
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Handles one inbound line.
    ///
    /// # Errors
    ///
    /// Returns a fatal condition when the reply cannot be enqueued.
    pub async fn handle_line(&self, line: &str) -> Result<(), FatalError> {
        match parse_message(line) {
            Ok(IncomingMessage::Request(request)) => self.handle_request(request).await,
            Ok(IncomingMessage::Notification(notification)) => {
                // Client notifications (including notifications/initialized)
                // require no action.
                debug!(method = %notification.method, "ignoring client notification");
                Ok(())
            }
            Err(EnvelopeError::Reply(error)) => self.outbound.error_or_fatal(&error).await,
            Err(EnvelopeError::Drop(reason)) => {
                debug!(reason = %reason, "dropping unanswerable inbound line");
                Ok(())
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Result<(), FatalError> {
        debug!(method = %request.method, id = %request.id, "inbound request");
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request).await,
            "ping" => {
                self.outbound
                    .response_or_fatal(&JsonRpcResponse::success(request.id, json!({})))
                    .await
            }
            "tools/list" => self.handle_tools_list(request).await,
            "tools/call" => self.handle_tools_call(request).await,
            method => {
                self.outbound
                    .error_or_fatal(&JsonRpcError::method_not_found(request.id, method))
                    .await
            }
        }
    }

    async fn handle_initialize(&self, request: JsonRpcRequest) -> Result<(), FatalError> {
        let result = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "supported": true },
            },
        });
        self.outbound
            .response_or_fatal(&JsonRpcResponse::success(request.id, result))
            .await?;

        // Only the first initialize starts the fleet; repeats are
        // idempotent and do not restart sessions.
        if self.state.first_start() {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                warm_catalog(&state).await;
            });
        }
        Ok(())
    }

    async fn handle_tools_list(&self, request: JsonRpcRequest) -> Result<(), FatalError> {
        let mut tools = builtin_tools();
        tools.extend(self.state.catalog.tools().await);
        self.outbound
            .response_or_fatal(&JsonRpcResponse::success(
                request.id,
                json!({ "tools": tools }),
            ))
            .await?;

        // Serve from cache, refresh stale entries behind the reply.
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            refresh_stale(&state).await;
        });
        Ok(())
    }

    async fn handle_tools_call(&self, request: JsonRpcRequest) -> Result<(), FatalError> {
        let params = request.params.unwrap_or(json!({}));
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return self
                    .outbound
                    .error_or_fatal(&JsonRpcError::invalid_params(
                        request.id,
                        format!("Invalid tool call params: {e}"),
                    ))
                    .await;
            }
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .await
            .insert(seq, (request.id.clone(), None));

        let state = Arc::clone(&self.state);
        let outbound = self.outbound.clone();
        let pending = Arc::clone(&self.pending);
        let id = request.id;
        let handle = tokio::spawn(async move {
            run_tool_call(state, outbound, pending, seq, id, params).await;
        });

        // The task may already have replied and removed its entry; only a
        // still-pending call learns its abort handle.
        if let Some(entry) = self.pending.lock().await.get_mut(&seq) {
            entry.1 = Some(handle.abort_handle());
        }
        Ok(())
    }

    /// Fails still-pending calls, tears down every session, and releases
    /// the writer.
    pub async fn shutdown(&mut self) {
        let drained: Vec<(RequestId, Option<AbortHandle>)> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for (id, abort) in drained {
            if let Some(abort) = abort {
                abort.abort();
            }
            self.outbound
                .error(&JsonRpcError::internal_error(id, "gateway shutting down"))
                .await;
        }

        self.state.shutdown_sessions().await;

        if let Some(writer) = self.writer.take() {
            if writer.is_finished() {
                match writer.await {
                    Ok(Ok(())) | Err(_) => {}
                    Ok(Err(e)) => warn!(error = %e, "stdout writer failed"),
                }
            }
        }
    }
}

/// Runs one `tools/call` to completion and writes its single reply.
async fn run_tool_call(
    state: Arc<GatewayState>,
    outbound: Outbound,
    pending: PendingCalls,
    seq: u64,
    id: RequestId,
    params: ToolCallParams,
) {
    if let Some(tool) = AdminTool::from_tool_name(&params.name) {
        let outcome = handle_admin_call(&state, tool, &params.parameters).await;
        let reply = match outcome.reply {
            Ok(value) => OutboundReply::Response(JsonRpcResponse::success(id, value)),
            Err(data) => OutboundReply::Error(JsonRpcError::new(Some(id), data)),
        };
        deliver(&outbound, &pending, seq, reply).await;

        // Admin ordering contract: reply, then notification, then the
        // requested discovery.
        if let Some(message) = outcome.notification {
            outbound
                .notification(&JsonRpcNotification::update_tools(message))
                .await;
        }
        if let Some(request) = outcome.refresh {
            run_refresh(&state, request).await;
        }
        return;
    }

    let records = state.enabled_records().await;
    let Some((record, original_tool)) = resolve_tool(&records, &params.name) else {
        deliver(
            &outbound,
            &pending,
            seq,
            OutboundReply::Error(JsonRpcError::method_not_found(id, &params.name)),
        )
        .await;
        return;
    };
    let record = record.clone();

    let reply = match forward_tool_call(&state, &record, &original_tool, params.parameters).await {
        Ok(response) => OutboundReply::Response(response.with_id(id)),
        Err(data) => OutboundReply::Error(JsonRpcError::new(Some(id), data)),
    };
    deliver(&outbound, &pending, seq, reply).await;
}

/// Writes the reply for a pending call, unless shutdown already did.
async fn deliver(outbound: &Outbound, pending: &PendingCalls, seq: u64, reply: OutboundReply) {
    let owned = pending.lock().await.remove(&seq).is_some();
    if !owned {
        return;
    }
    match reply {
        OutboundReply::Response(response) => outbound.response(&response).await,
        OutboundReply::Error(error) => outbound.error(&error).await,
    }
}

/// First-initialize side effect: start every enabled downstream and warm
/// the catalog, then announce the result.
async fn warm_catalog(state: &Arc<GatewayState>) {
    let sessions = state.enabled_sessions().await;
    if sessions.is_empty() {
        info!("no enabled downstream servers to start");
        return;
    }
    info!(count = sessions.len(), "starting enabled downstream servers");
    let outcome = state
        .catalog
        .refresh_all(&sessions, state.call_timeout)
        .await;
    if outcome.performed > 0 {
        state
            .outbound
            .notification(&JsonRpcNotification::update_tools(outcome.message()))
            .await;
    }
}

/// Background refresh of catalog entries that are missing, invalidated,
/// or past their TTL.
async fn refresh_stale(state: &Arc<GatewayState>) {
    let records = state.enabled_records().await;
    let names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
    let stale = state.catalog.stale_names(&names).await;
    if stale.is_empty() {
        return;
    }

    let mut sessions = Vec::with_capacity(stale.len());
    for record in records.iter().filter(|r| stale.contains(&r.name)) {
        sessions.push(state.session_for(record).await);
    }
    let outcome = state
        .catalog
        .refresh_all(&sessions, state.call_timeout)
        .await;
    if outcome.performed > 0 {
        state
            .outbound
            .notification(&JsonRpcNotification::update_tools(outcome.message()))
            .await;
    }
}

/// Runs discovery requested by an admin tool and announces the result.
async fn run_refresh(state: &Arc<GatewayState>, request: RefreshRequest) {
    let sessions = match request {
        RefreshRequest::All => state.enabled_sessions().await,
        RefreshRequest::Server(name) => {
            let records = state.enabled_records().await;
            match records.iter().find(|r| r.name == name) {
                Some(record) => vec![state.session_for(record).await],
                None => return,
            }
        }
    };
    if sessions.is_empty() {
        return;
    }

    let outcome = state
        .catalog
        .refresh_all(&sessions, state.call_timeout)
        .await;
    if outcome.performed > 0 {
        state
            .outbound
            .notification(&JsonRpcNotification::update_tools(outcome.message()))
            .await;
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    async fn wait_for(kind: SignalKind) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to register signal handler");
                std::future::pending::<()>().await;
            }
        }
    }

    tokio::select! {
        () = wait_for(SignalKind::interrupt()) => {}
        () = wait_for(SignalKind::terminate()) => {}
    }
}

/// Resolves when the process receives Ctrl+C.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to register Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}
