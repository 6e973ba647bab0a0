//! Built-in administrative tools.
//!
//! Four tools let the upstream client manage the downstream fleet without
//! touching configuration files: `servers_list`, `servers_enable`,
//! `servers_disable`, and `refresh_tools`. They are exposed under the
//! reserved `admin` namespace, which configuration validation keeps free
//! of user-defined servers.
//!
//! Every invocation runs inside the admin critical section: mutations to
//! the server list are serialised, persisted crash-atomically, and
//! followed by a catalog invalidation and an `update/tools` notification
//! (emitted by the dispatcher after the tool's reply).

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::mcp::protocol::{ErrorCode, JsonRpcErrorData, ToolDescriptor};
use crate::state::GatewayState;

/// The reserved namespace for built-in tools.
pub const ADMIN_NAMESPACE: &str = "admin";

/// The four built-in tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminTool {
    /// List configured servers with their status.
    ServersList,
    /// Enable a server, subject to the tool cap.
    ServersEnable,
    /// Disable a server and tear down its session.
    ServersDisable,
    /// Invalidate the catalog and rediscover every enabled server.
    RefreshTools,
}

impl AdminTool {
    /// Resolves a namespaced tool name to a built-in, if it is one.
    #[must_use]
    pub fn from_tool_name(tool_name: &str) -> Option<Self> {
        let rest = tool_name
            .strip_prefix(ADMIN_NAMESPACE)?
            .strip_prefix('_')?;
        match rest {
            "servers_list" => Some(Self::ServersList),
            "servers_enable" => Some(Self::ServersEnable),
            "servers_disable" => Some(Self::ServersDisable),
            "refresh_tools" => Some(Self::RefreshTools),
            _ => None,
        }
    }
}

/// Background discovery requested by an admin tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshRequest {
    /// Rediscover one server's tools.
    Server(String),
    /// Rediscover every enabled server.
    All,
}

/// What an admin invocation produced.
///
/// The dispatcher writes the reply first, then the notification, then
/// kicks off the requested discovery — that ordering is part of the admin
/// contract.
pub struct AdminOutcome {
    /// Success payload or the error to reply with.
    pub reply: Result<Value, JsonRpcErrorData>,
    /// `update/tools` message to emit after the reply, if any.
    pub notification: Option<String>,
    /// Background discovery to kick off, if any.
    pub refresh: Option<RefreshRequest>,
}

impl AdminOutcome {
    fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            reply: Err(JsonRpcErrorData::new(code, message)),
            notification: None,
            refresh: None,
        }
    }

    fn reply_only(value: Value) -> Self {
        Self {
            reply: Ok(value),
            notification: None,
            refresh: None,
        }
    }
}

/// The built-in tool descriptors, namespaced under [`ADMIN_NAMESPACE`].
#[must_use]
pub fn builtin_tools() -> Vec<ToolDescriptor> {
    let tool = |name: &str, description: &str, parameters: Value| ToolDescriptor {
        name: format!("{ADMIN_NAMESPACE}_{name}"),
        description: description.to_string(),
        parameters,
        extra: serde_json::Map::new(),
    };

    let no_params = json!({ "type": "object", "properties": {} });
    let name_param = json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": "Administrative name of the server"
            }
        },
        "required": ["name"]
    });

    vec![
        tool(
            "servers_list",
            "List configured downstream servers with their status, the tool cap, and the enabled count",
            no_params.clone(),
        ),
        tool(
            "servers_enable",
            "Enable a downstream server so its tools join the catalog (subject to the tool cap)",
            name_param.clone(),
        ),
        tool(
            "servers_disable",
            "Disable a downstream server and remove its tools from the catalog",
            name_param,
        ),
        tool(
            "refresh_tools",
            "Invalidate the tool catalog and rediscover every enabled server",
            no_params,
        ),
    ]
}

/// Runs one admin tool inside the admin critical section.
pub async fn handle_admin_call(
    state: &Arc<GatewayState>,
    tool: AdminTool,
    params: &Value,
) -> AdminOutcome {
    let _section = state.admin_section().await;

    match tool {
        AdminTool::ServersList => servers_list(state).await,
        AdminTool::ServersEnable => match required_name(params) {
            Ok(name) => servers_enable(state, &name).await,
            Err(outcome) => outcome,
        },
        AdminTool::ServersDisable => match required_name(params) {
            Ok(name) => servers_disable(state, &name).await,
            Err(outcome) => outcome,
        },
        AdminTool::RefreshTools => refresh_tools(state).await,
    }
}

/// Validates the `name` parameter against the declared schema.
fn required_name(params: &Value) -> Result<String, AdminOutcome> {
    match params.get("name") {
        Some(Value::String(name)) if !name.is_empty() => Ok(name.clone()),
        Some(Value::String(_)) => Err(AdminOutcome::error(
            ErrorCode::InvalidParams,
            "Parameter 'name' must not be empty",
        )),
        Some(_) => Err(AdminOutcome::error(
            ErrorCode::InvalidParams,
            "Parameter 'name' must be a string",
        )),
        None => Err(AdminOutcome::error(
            ErrorCode::InvalidParams,
            "Missing required parameter: name",
        )),
    }
}

async fn servers_list(state: &Arc<GatewayState>) -> AdminOutcome {
    let (tool_cap, records) = {
        let config = state.config.lock().await;
        let list = config.server_list();
        (list.tool_cap, list.servers.clone())
    };

    let enabled_count = records.iter().filter(|r| r.enabled).count();
    let mut servers = Vec::with_capacity(records.len());
    for record in &records {
        let status = if record.enabled {
            match state.catalog.entry_status(&record.name).await {
                Some((status, _)) => status.as_str().to_string(),
                None => match state.session(&record.name).await {
                    Some(session) => session.state().await.to_string(),
                    None => "PENDING".to_string(),
                },
            }
        } else {
            "DISABLED".to_string()
        };
        servers.push(json!({
            "name": record.name,
            "url": record.url,
            "status": status,
        }));
    }

    let message = format!(
        "{enabled_count}/{} servers enabled (cap {tool_cap}); {} tools in catalog",
        records.len(),
        state.catalog.tool_count().await,
    );

    AdminOutcome {
        reply: Ok(json!({
            "toolCap": tool_cap,
            "enabledCount": enabled_count,
            "servers": servers,
            "message": message,
        })),
        notification: Some(message),
        refresh: None,
    }
}

async fn servers_enable(state: &Arc<GatewayState>, name: &str) -> AdminOutcome {
    let (message, enabled_count, tool_cap) = {
        let mut config = state.config.lock().await;
        let list = config.server_list_mut();

        let Some(record) = list.find(name) else {
            return AdminOutcome::error(
                ErrorCode::InvalidParams,
                format!("Unknown server: {name}"),
            );
        };

        if record.enabled {
            return AdminOutcome::reply_only(json!({
                "success": true,
                "message": format!("Server '{name}' is already enabled"),
            }));
        }

        let tool_cap = list.tool_cap;
        let enabled_count = list.enabled_count();
        if enabled_count >= tool_cap as usize {
            return AdminOutcome::error(
                ErrorCode::InvalidParams,
                format!(
                    "Cannot enable '{name}': tool limit reached ({enabled_count}/{tool_cap} servers enabled)"
                ),
            );
        }

        if let Some(record) = list.find_mut(name) {
            record.enabled = true;
        }

        if let Err(e) = config.save() {
            // Roll the in-memory flag back so state and disk stay aligned.
            if let Some(record) = config.server_list_mut().find_mut(name) {
                record.enabled = false;
            }
            return AdminOutcome::error(
                ErrorCode::InternalError,
                format!("Failed to persist configuration: {e}"),
            );
        }

        let enabled_now = config.server_list().enabled_count();
        (
            format!("Server '{name}' enabled ({enabled_now}/{tool_cap} servers enabled)"),
            enabled_now,
            tool_cap,
        )
    };

    info!(server = %name, enabled = enabled_count, cap = tool_cap, "server enabled");
    state.catalog.invalidate(name).await;

    AdminOutcome {
        reply: Ok(json!({ "success": true, "message": message })),
        notification: Some(message),
        refresh: Some(RefreshRequest::Server(name.to_string())),
    }
}

async fn servers_disable(state: &Arc<GatewayState>, name: &str) -> AdminOutcome {
    let message = {
        let mut config = state.config.lock().await;
        let list = config.server_list_mut();

        let Some(record) = list.find(name) else {
            return AdminOutcome::error(
                ErrorCode::InvalidParams,
                format!("Unknown server: {name}"),
            );
        };

        if !record.enabled {
            return AdminOutcome::reply_only(json!({
                "success": true,
                "message": format!("Server '{name}' is already disabled"),
            }));
        }

        if let Some(record) = list.find_mut(name) {
            record.enabled = false;
        }

        if let Err(e) = config.save() {
            if let Some(record) = config.server_list_mut().find_mut(name) {
                record.enabled = true;
            }
            return AdminOutcome::error(
                ErrorCode::InternalError,
                format!("Failed to persist configuration: {e}"),
            );
        }

        format!("Server '{name}' disabled; its tools were removed from the catalog")
    };

    // Stop routing first, then let the child wind down in the background:
    // the drain flag is set before this invocation replies.
    if let Some(session) = state.remove_session(name).await {
        session.drain().await;
        tokio::spawn(async move { session.close().await });
    }
    state.catalog.remove(name).await;
    info!(server = %name, "server disabled");

    AdminOutcome {
        reply: Ok(json!({ "success": true, "message": message })),
        notification: Some(message),
        refresh: None,
    }
}

async fn refresh_tools(state: &Arc<GatewayState>) -> AdminOutcome {
    let enabled_servers = {
        let config = state.config.lock().await;
        config.server_list().enabled_count()
    };

    state.catalog.invalidate_all().await;
    info!(enabled = enabled_servers, "catalog invalidated, discovery requested");

    AdminOutcome {
        reply: Ok(json!({
            "success": true,
            "enabledServers": enabled_servers,
        })),
        // The notification is emitted when the requested discovery
        // finishes, not here.
        notification: None,
        refresh: Some(RefreshRequest::All),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, LaunchConfig, ServerList};
    use crate::mcp::transport::spawn_writer_to;

    fn state_with(list_json: &str, dir: &std::path::Path) -> Arc<GatewayState> {
        let list: ServerList = serde_json::from_str(list_json).unwrap();
        let store = ConfigStore::in_memory(
            dir.join("servers.json"),
            list,
            LaunchConfig::default(),
        );
        let (outbound, _handle) = spawn_writer_to(tokio::io::sink());
        GatewayState::new(store, outbound)
    }

    #[test]
    fn builtin_names_carry_the_reserved_namespace() {
        let tools = builtin_tools();
        assert_eq!(tools.len(), 4);
        for tool in &tools {
            assert!(tool.name.starts_with("admin_"));
            assert!(AdminTool::from_tool_name(&tool.name).is_some());
        }
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        assert!(AdminTool::from_tool_name("admin_nope").is_none());
        assert!(AdminTool::from_tool_name("adminservers_list").is_none());
        assert!(AdminTool::from_tool_name("foo_servers_list").is_none());
    }

    #[tokio::test]
    async fn enable_unknown_server_is_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(r#"{ "toolCap": 5, "servers": [] }"#, dir.path());
        let outcome =
            handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "ghost" })).await;
        let err = outcome.reply.unwrap_err();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("Unknown server"));
    }

    #[tokio::test]
    async fn enable_missing_name_is_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(r#"{ "toolCap": 5, "servers": [] }"#, dir.path());
        let outcome = handle_admin_call(&state, AdminTool::ServersEnable, &json!({})).await;
        let err = outcome.reply.unwrap_err();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("name"));
    }

    #[tokio::test]
    async fn enable_respects_the_tool_cap() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{
                "toolCap": 1,
                "servers": [
                    { "name": "A", "url": "http://a:1/", "enabled": false },
                    { "name": "B", "url": "http://b:1/", "enabled": true }
                ]
            }"#,
            dir.path(),
        );

        let outcome =
            handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "A" })).await;
        let err = outcome.reply.unwrap_err();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("tool limit"));

        // Freeing the slot makes the retry succeed.
        let outcome =
            handle_admin_call(&state, AdminTool::ServersDisable, &json!({ "name": "B" })).await;
        assert!(outcome.reply.is_ok());
        let outcome =
            handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "A" })).await;
        assert!(outcome.reply.is_ok());
        assert_eq!(outcome.refresh, Some(RefreshRequest::Server("A".into())));
    }

    #[tokio::test]
    async fn cap_zero_rejects_every_enable() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{ "toolCap": 0, "servers": [ { "name": "A", "url": "http://a:1/" } ] }"#,
            dir.path(),
        );
        let outcome =
            handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "A" })).await;
        let err = outcome.reply.unwrap_err();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("tool limit"));
    }

    #[tokio::test]
    async fn enable_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{ "toolCap": 5, "servers": [ { "name": "A", "url": "http://a:1/" } ] }"#,
            dir.path(),
        );

        let first =
            handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "A" })).await;
        assert!(first.reply.is_ok());
        assert!(first.notification.is_some());

        let second =
            handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "A" })).await;
        let value = second.reply.unwrap();
        assert_eq!(value["success"], true);
        assert!(value["message"].as_str().unwrap().contains("already enabled"));
        assert!(second.notification.is_none());
        assert!(second.refresh.is_none());
    }

    #[tokio::test]
    async fn disable_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{ "toolCap": 5, "servers": [ { "name": "A", "url": "http://a:1/", "enabled": true } ] }"#,
            dir.path(),
        );

        let first =
            handle_admin_call(&state, AdminTool::ServersDisable, &json!({ "name": "A" })).await;
        assert!(first.reply.is_ok());

        let second =
            handle_admin_call(&state, AdminTool::ServersDisable, &json!({ "name": "A" })).await;
        let value = second.reply.unwrap();
        assert!(value["message"].as_str().unwrap().contains("already disabled"));
        assert!(second.notification.is_none());
    }

    #[tokio::test]
    async fn enable_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{ "toolCap": 5, "servers": [ { "name": "A", "url": "http://a:1/" } ] }"#,
            dir.path(),
        );

        handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "A" })).await;

        let persisted: ServerList = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("servers.json")).unwrap(),
        )
        .unwrap();
        assert!(persisted.find("A").unwrap().enabled);
    }

    #[tokio::test]
    async fn enable_then_disable_round_trips_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{ "toolCap": 5, "servers": [ { "name": "A", "url": "http://a:1/" } ] }"#,
            dir.path(),
        );

        handle_admin_call(&state, AdminTool::ServersEnable, &json!({ "name": "A" })).await;
        handle_admin_call(&state, AdminTool::ServersDisable, &json!({ "name": "A" })).await;

        let persisted: ServerList = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("servers.json")).unwrap(),
        )
        .unwrap();
        assert!(!persisted.find("A").unwrap().enabled);
        assert!(state.session("A").await.is_none());
    }

    #[tokio::test]
    async fn refresh_tools_reports_enabled_count_and_requests_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{
                "toolCap": 5,
                "servers": [
                    { "name": "A", "url": "http://a:1/", "enabled": true },
                    { "name": "B", "url": "http://b:1/", "enabled": true }
                ]
            }"#,
            dir.path(),
        );

        let outcome = handle_admin_call(&state, AdminTool::RefreshTools, &json!({})).await;
        let value = outcome.reply.unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["enabledServers"], 2);
        assert_eq!(outcome.refresh, Some(RefreshRequest::All));
        assert!(outcome.notification.is_none());
    }

    #[tokio::test]
    async fn servers_list_reports_cap_and_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            r#"{
                "toolCap": 3,
                "servers": [
                    { "name": "A", "url": "http://a:1/", "enabled": true },
                    { "name": "B", "url": "http://b:1/", "enabled": false }
                ]
            }"#,
            dir.path(),
        );

        let outcome = handle_admin_call(&state, AdminTool::ServersList, &json!({})).await;
        let value = outcome.reply.unwrap();
        assert_eq!(value["toolCap"], 3);
        assert_eq!(value["enabledCount"], 1);
        let servers = value["servers"].as_array().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0]["status"], "PENDING");
        assert_eq!(servers[1]["status"], "DISABLED");
        assert!(outcome.notification.is_some());
    }
}
