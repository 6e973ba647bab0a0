//! The namespaced tool catalog.
//!
//! For every enabled downstream the catalog keeps the last-known list of
//! its tools, already namespaced for the upstream client. Entries age out
//! after a TTL, are invalidated explicitly by the admin tools, and survive
//! failed refreshes as STALE so one flaky discovery never erases a
//! working catalog.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::downstream::DownstreamSession;
use crate::mcp::protocol::ToolDescriptor;

/// How long a catalog entry stays fresh.
pub const CATALOG_TTL: Duration = Duration::from_secs(5 * 60);

/// Freshness of one downstream's catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogStatus {
    /// Fetched successfully and within TTL.
    Ok,
    /// Discovery has never succeeded for this downstream.
    Failed,
    /// A previous list is being served; the last refresh failed or the
    /// entry was invalidated.
    Stale,
}

impl CatalogStatus {
    /// Wire representation used in `servers_list`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::Stale => "STALE",
        }
    }
}

/// Last-known tools of one downstream.
#[derive(Debug, Clone)]
pub struct ToolCatalogEntry {
    /// Namespaced tool descriptors.
    pub tools: Vec<ToolDescriptor>,
    /// When the list was last fetched successfully.
    pub fetched_at: Instant,
    /// Freshness of the entry.
    pub status: CatalogStatus,
    /// Reason for the most recent failure, if any.
    pub failure: Option<String>,
}

/// Namespaces a downstream's tool descriptors for the upstream catalog.
///
/// The tool name becomes `<namespace>_<original>`; the description gains a
/// `[<serverName>] ` prefix.
#[must_use]
pub fn namespace_tools(
    server_name: &str,
    namespace: &str,
    tools: Vec<ToolDescriptor>,
) -> Vec<ToolDescriptor> {
    tools
        .into_iter()
        .map(|tool| ToolDescriptor {
            name: format!("{namespace}_{}", tool.name),
            description: format!("[{server_name}] {}", tool.description),
            parameters: tool.parameters,
            extra: tool.extra,
        })
        .collect()
}

/// Result of one discovery pass.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    /// Downstreams actually refreshed (coalesced ones are not counted).
    pub performed: usize,
    /// Downstreams whose refresh failed.
    pub failed: Vec<String>,
    /// Total namespaced tools in the catalog after the pass.
    pub tool_count: usize,
}

impl RefreshOutcome {
    /// Human-readable summary for the `update/tools` notification.
    #[must_use]
    pub fn message(&self) -> String {
        if self.failed.is_empty() {
            format!(
                "Tool catalog updated: {} tools from {} servers",
                self.tool_count, self.performed
            )
        } else {
            format!(
                "Tool catalog updated: {} tools from {} servers ({} failed: {})",
                self.tool_count,
                self.performed.saturating_sub(self.failed.len()),
                self.failed.len(),
                self.failed.join(", ")
            )
        }
    }
}

/// The catalog cache, keyed by downstream server name.
pub struct Catalog {
    entries: RwLock<HashMap<String, ToolCatalogEntry>>,
    /// Names with a refresh in flight; used to coalesce duplicates.
    refreshing: Mutex<HashSet<String>>,
    ttl: Duration,
}

impl Catalog {
    /// Creates an empty catalog with the given entry TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
            ttl,
        }
    }

    /// All namespaced tools currently cached, flattened across downstreams.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.entries
            .read()
            .await
            .values()
            .flat_map(|entry| entry.tools.iter().cloned())
            .collect()
    }

    /// Total number of cached namespaced tools.
    pub async fn tool_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| entry.tools.len())
            .sum()
    }

    /// Status and failure reason for one downstream, if an entry exists.
    pub async fn entry_status(&self, name: &str) -> Option<(CatalogStatus, Option<String>)> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|entry| (entry.status, entry.failure.clone()))
    }

    /// Names among `enabled` whose entry is missing, invalidated, or past
    /// the TTL — the set a background refresh should cover.
    pub async fn stale_names(&self, enabled: &[String]) -> Vec<String> {
        let entries = self.entries.read().await;
        enabled
            .iter()
            .filter(|name| {
                entries.get(*name).map_or(true, |entry| {
                    entry.status != CatalogStatus::Ok || entry.fetched_at.elapsed() > self.ttl
                })
            })
            .cloned()
            .collect()
    }

    /// Marks one downstream's entry stale, keeping its tools.
    pub async fn invalidate(&self, name: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.status = CatalogStatus::Stale;
        }
    }

    /// Marks every entry stale, keeping the cached tools.
    pub async fn invalidate_all(&self) {
        for entry in self.entries.write().await.values_mut() {
            entry.status = CatalogStatus::Stale;
        }
    }

    /// Removes one downstream's entry entirely (server disabled).
    pub async fn remove(&self, name: &str) {
        self.entries.write().await.remove(name);
    }

    /// Refreshes one downstream's entry by issuing `tools/list`.
    ///
    /// Returns `false` when another refresh for the same downstream was
    /// already in flight (the request is coalesced). On failure the
    /// previous entry is kept and marked STALE; a downstream that never
    /// produced a catalog gets an empty FAILED entry.
    pub async fn refresh_server(&self, session: &Arc<DownstreamSession>, deadline: Duration) -> bool {
        let name = session.name().to_string();
        {
            let mut refreshing = self.refreshing.lock().await;
            if !refreshing.insert(name.clone()) {
                debug!(server = %name, "catalog refresh already in flight, coalescing");
                return false;
            }
        }

        let result = session.list_tools(deadline).await;

        {
            let mut entries = self.entries.write().await;
            match result {
                Ok(tools) => {
                    let namespaced = namespace_tools(&name, session.namespace(), tools);
                    debug!(server = %name, tools = namespaced.len(), "catalog entry refreshed");
                    entries.insert(
                        name.clone(),
                        ToolCatalogEntry {
                            tools: namespaced,
                            fetched_at: Instant::now(),
                            status: CatalogStatus::Ok,
                            failure: None,
                        },
                    );
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "catalog refresh failed");
                    match entries.get_mut(&name) {
                        Some(entry) => {
                            entry.status = CatalogStatus::Stale;
                            entry.failure = Some(e.to_string());
                        }
                        None => {
                            entries.insert(
                                name.clone(),
                                ToolCatalogEntry {
                                    tools: Vec::new(),
                                    fetched_at: Instant::now(),
                                    status: CatalogStatus::Failed,
                                    failure: Some(e.to_string()),
                                },
                            );
                        }
                    }
                }
            }
        }

        self.refreshing.lock().await.remove(&name);
        true
    }

    /// Fans discovery out to every given session in parallel.
    ///
    /// Sessions with a refresh already in flight are skipped; a slow or
    /// unresponsive downstream does not block discovery of its peers
    /// beyond the shared deadline.
    pub async fn refresh_all(
        &self,
        sessions: &[Arc<DownstreamSession>],
        deadline: Duration,
    ) -> RefreshOutcome {
        let refreshes = sessions
            .iter()
            .map(|session| self.refresh_server(session, deadline));
        let performed = join_all(refreshes)
            .await
            .into_iter()
            .filter(|done| *done)
            .count();

        let mut failed = Vec::new();
        {
            let entries = self.entries.read().await;
            for session in sessions {
                if let Some(entry) = entries.get(session.name()) {
                    if entry.status != CatalogStatus::Ok {
                        failed.push(session.name().to_string());
                    }
                }
            }
        }

        RefreshOutcome {
            performed,
            failed,
            tool_count: self.tool_count().await,
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(CATALOG_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::TransportError;
    use crate::mcp::protocol::{JsonRpcResponse, RequestId};
    use crate::mcp::transport::spawn_writer_to;
    use crate::downstream::DownstreamTransport;

    fn sink() -> crate::mcp::transport::Outbound {
        let (outbound, _handle) = spawn_writer_to(tokio::io::sink());
        outbound
    }

    /// Transport whose `tools/list` reply can be swapped at runtime.
    #[derive(Debug)]
    struct SwappableTools {
        tools: std::sync::Mutex<Value>,
        fail: std::sync::atomic::AtomicBool,
        list_calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl SwappableTools {
        fn new(tools: Value) -> Self {
            Self {
                tools: std::sync::Mutex::new(tools),
                fail: std::sync::atomic::AtomicBool::new(false),
                list_calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn set_tools(&self, tools: Value) {
            *self.tools.lock().unwrap() = tools;
        }
    }

    #[async_trait]
    impl DownstreamTransport for SwappableTools {
        async fn send_request(
            &self,
            method: &str,
            _params: Option<Value>,
            _deadline: Duration,
        ) -> Result<JsonRpcResponse, TransportError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Timeout);
            }
            assert_eq!(method, "tools/list");
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let tools = self.tools.lock().unwrap().clone();
            Ok(JsonRpcResponse::success(
                RequestId::Number(1),
                serde_json::json!({ "tools": tools }),
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

    fn session_with(transport: Arc<SwappableTools>) -> Arc<DownstreamSession> {
        Arc::new(DownstreamSession::with_transport(
            "Foo Bar",
            sink(),
            transport,
        ))
    }

    #[test]
    fn namespacing_rewrites_name_and_description() {
        let tools = vec![ToolDescriptor {
            name: "ping".to_string(),
            description: String::new(),
            parameters: serde_json::json!({}),
            extra: serde_json::Map::new(),
        }];
        let namespaced = namespace_tools("Foo Bar", "foo_bar", tools);
        assert_eq!(namespaced[0].name, "foo_bar_ping");
        assert_eq!(namespaced[0].description, "[Foo Bar] ");
    }

    #[tokio::test]
    async fn refresh_populates_and_lists() {
        let transport = Arc::new(SwappableTools::new(serde_json::json!([
            { "name": "ping", "description": "", "parameters": {} }
        ])));
        let session = session_with(transport);
        let catalog = Catalog::default();

        assert!(catalog.refresh_server(&session, Duration::from_secs(1)).await);
        let tools = catalog.tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "foo_bar_ping");
        assert_eq!(
            catalog.entry_status("Foo Bar").await.unwrap().0,
            CatalogStatus::Ok
        );
    }

    #[tokio::test]
    async fn invalidation_keeps_tools_but_marks_stale() {
        let transport = Arc::new(SwappableTools::new(serde_json::json!([
            { "name": "a", "description": "", "parameters": {} }
        ])));
        let session = session_with(transport.clone());
        let catalog = Catalog::default();
        catalog.refresh_server(&session, Duration::from_secs(1)).await;

        catalog.invalidate_all().await;
        assert_eq!(
            catalog.entry_status("Foo Bar").await.unwrap().0,
            CatalogStatus::Stale
        );
        // Cached tools are still served while stale.
        assert_eq!(catalog.tool_count().await, 1);
        assert_eq!(catalog.stale_names(&["Foo Bar".to_string()]).await.len(), 1);

        // The swapped catalog is only visible after a refresh.
        transport.set_tools(serde_json::json!([
            { "name": "b", "description": "", "parameters": {} }
        ]));
        assert_eq!(catalog.tools().await[0].name, "foo_bar_a");
        catalog.refresh_server(&session, Duration::from_secs(1)).await;
        assert_eq!(catalog.tools().await[0].name, "foo_bar_b");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entry_as_stale() {
        let transport = Arc::new(SwappableTools::new(serde_json::json!([
            { "name": "a", "description": "", "parameters": {} }
        ])));
        let session = session_with(transport.clone());
        let catalog = Catalog::default();
        catalog.refresh_server(&session, Duration::from_secs(1)).await;

        transport.fail.store(true, Ordering::SeqCst);
        catalog.refresh_server(&session, Duration::from_secs(1)).await;

        let (status, failure) = catalog.entry_status("Foo Bar").await.unwrap();
        assert_eq!(status, CatalogStatus::Stale);
        assert!(failure.unwrap().contains("Foo Bar"));
        assert_eq!(catalog.tool_count().await, 1);
    }

    #[tokio::test]
    async fn first_failure_yields_failed_entry() {
        let transport = Arc::new(SwappableTools::new(serde_json::json!([])));
        transport.fail.store(true, Ordering::SeqCst);
        let session = session_with(transport);
        let catalog = Catalog::default();

        catalog.refresh_server(&session, Duration::from_secs(1)).await;
        let (status, _) = catalog.entry_status("Foo Bar").await.unwrap();
        assert_eq!(status, CatalogStatus::Failed);
        assert_eq!(catalog.tool_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce() {
        let transport = Arc::new(SwappableTools {
            tools: std::sync::Mutex::new(serde_json::json!([
                { "name": "a", "description": "", "parameters": {} }
            ])),
            fail: std::sync::atomic::AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            delay: Some(Duration::from_millis(100)),
        });
        let session = session_with(transport.clone());
        let catalog = Catalog::default();

        let (a, b) = tokio::join!(
            catalog.refresh_server(&session, Duration::from_secs(1)),
            catalog.refresh_server(&session, Duration::from_secs(1)),
        );
        // Exactly one of the two performed the discovery.
        assert!(a ^ b);
        assert_eq!(transport.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_erases_entry() {
        let transport = Arc::new(SwappableTools::new(serde_json::json!([
            { "name": "a", "description": "", "parameters": {} }
        ])));
        let session = session_with(transport);
        let catalog = Catalog::default();
        catalog.refresh_server(&session, Duration::from_secs(1)).await;

        catalog.remove("Foo Bar").await;
        assert_eq!(catalog.tool_count().await, 0);
        assert!(catalog.entry_status("Foo Bar").await.is_none());
    }
}
