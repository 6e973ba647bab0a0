//! Tool-call routing.
//!
//! A namespaced tool name either belongs to the built-in admin set or
//! resolves — by longest namespace prefix on an underscore boundary — to
//! an enabled downstream, whose session then carries the call under a
//! deadline. Downstream replies are relayed verbatim: a structured error
//! from the downstream reaches the client unchanged, while transport
//! failures are wrapped in `-32603` with the downstream name embedded.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::ServerRecord;
use crate::error::{SessionError, TransportError};
use crate::mcp::protocol::{ErrorCode, JsonRpcErrorData, JsonRpcResponse};
use crate::state::GatewayState;

/// Resolves a namespaced tool name against enabled records.
///
/// The longest matching namespace wins, and the match must sit on an
/// underscore boundary: `"foo"` matches `"foo_x"` but not `"foobar_x"`.
/// Where two records share a namespace only the first-listed one is
/// reachable. Returns the matched record and the downstream's original
/// tool name.
#[must_use]
pub fn resolve_tool<'a>(
    records: &'a [ServerRecord],
    tool_name: &str,
) -> Option<(&'a ServerRecord, String)> {
    let mut seen_namespaces = HashSet::new();
    let mut best: Option<(&ServerRecord, usize)> = None;

    for record in records {
        let namespace = record.namespace();
        if namespace.is_empty() {
            continue;
        }
        if !seen_namespaces.insert(namespace.clone()) {
            // A later record with a colliding namespace is unreachable.
            continue;
        }

        let boundary = tool_name.len() > namespace.len() + 1
            && tool_name.starts_with(namespace.as_str())
            && tool_name.as_bytes()[namespace.len()] == b'_';
        if boundary && best.map_or(true, |(_, len)| namespace.len() > len) {
            best = Some((record, namespace.len()));
        }
    }

    best.map(|(record, len)| (record, tool_name[len + 1..].to_string()))
}

/// Forwards a resolved tool call to its downstream session.
///
/// On success the downstream's raw response is returned for verbatim
/// relay (the caller rebinds the id). Transport and startup failures are
/// mapped to `-32603` error data naming the downstream.
pub async fn forward_tool_call(
    state: &Arc<GatewayState>,
    record: &ServerRecord,
    original_tool: &str,
    parameters: Value,
) -> Result<JsonRpcResponse, JsonRpcErrorData> {
    let session = state.session_for(record).await;
    debug!(server = %record.name, tool = %original_tool, "routing tool call");

    session
        .call_tool(original_tool, parameters, state.call_timeout)
        .await
        .map_err(|e| match &e {
            SessionError::Transport {
                name,
                source: TransportError::Timeout,
            } => JsonRpcErrorData::new(
                ErrorCode::InternalError,
                format!("upstream timeout: {name}"),
            ),
            SessionError::Transport {
                name,
                source: TransportError::ProcessExited | TransportError::Closed,
            } => JsonRpcErrorData::new(
                ErrorCode::InternalError,
                format!("upstream closed: {name}"),
            ),
            _ => JsonRpcErrorData::new(ErrorCode::InternalError, e.to_string()),
        })
}
