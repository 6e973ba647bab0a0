//! Process-wide gateway state.
//!
//! A single [`GatewayState`] value is threaded through the dispatcher, the
//! router, the admin tools, and the catalog — there is no module-scope
//! mutable state anywhere in the gateway. The configuration document sits
//! behind its own mutex (the admin critical section serialises mutations),
//! sessions behind theirs, and the catalog manages its own interior
//! locking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::catalog::Catalog;
use crate::config::{ConfigStore, ServerRecord};
use crate::downstream::{DownstreamSession, DEFAULT_CALL_TIMEOUT};
use crate::mcp::transport::Outbound;

/// Everything the gateway's components share.
pub struct GatewayState {
    /// Serialises admin tool invocations end to end.
    admin_lock: Mutex<()>,
    /// The two configuration documents. Held briefly for reads; mutated
    /// only while an admin invocation holds `admin_lock`.
    pub config: Mutex<ConfigStore>,
    /// Live sessions keyed by administrative server name.
    sessions: Mutex<HashMap<String, Arc<DownstreamSession>>>,
    /// The namespaced tool catalog.
    pub catalog: Catalog,
    /// Handle to the stdout writer.
    pub outbound: Outbound,
    /// Shared HTTP client for all HTTP downstreams.
    http_client: reqwest::Client,
    /// Whether the first `initialize` has been observed.
    started: AtomicBool,
    /// Deadline applied to downstream calls.
    pub call_timeout: Duration,
}

impl GatewayState {
    /// Builds the shared state around a loaded configuration.
    #[must_use]
    pub fn new(config: ConfigStore, outbound: Outbound) -> Arc<Self> {
        Arc::new(Self {
            admin_lock: Mutex::new(()),
            config: Mutex::new(config),
            sessions: Mutex::new(HashMap::new()),
            catalog: Catalog::default(),
            outbound,
            http_client: reqwest::Client::new(),
            started: AtomicBool::new(false),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Enters the admin critical section.
    pub async fn admin_section(&self) -> MutexGuard<'_, ()> {
        self.admin_lock.lock().await
    }

    /// Returns `true` exactly once, on the first call: the dispatcher uses
    /// it to make repeated `initialize` requests idempotent.
    pub fn first_start(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Snapshot of the enabled server records, in listed order.
    pub async fn enabled_records(&self) -> Vec<ServerRecord> {
        let config = self.config.lock().await;
        config.server_list().enabled().cloned().collect()
    }

    /// The session for a record, created on first use.
    ///
    /// The launch descriptor is looked up before the session map is
    /// touched, so the config lock and the session lock never nest.
    pub async fn session_for(&self, record: &ServerRecord) -> Arc<DownstreamSession> {
        let descriptor = if record.uses_http() {
            None
        } else {
            let config = self.config.lock().await;
            config.launch_descriptor(&record.name).cloned()
        };

        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(record.name.clone()).or_insert_with(|| {
            Arc::new(DownstreamSession::new(
                record,
                descriptor,
                self.outbound.clone(),
                self.http_client.clone(),
            ))
        }))
    }

    /// Sessions for every enabled record, created on demand.
    pub async fn enabled_sessions(self: &Arc<Self>) -> Vec<Arc<DownstreamSession>> {
        let records = self.enabled_records().await;
        let mut sessions = Vec::with_capacity(records.len());
        for record in &records {
            sessions.push(self.session_for(record).await);
        }
        sessions
    }

    /// Looks up a live session without creating one.
    pub async fn session(&self, name: &str) -> Option<Arc<DownstreamSession>> {
        self.sessions.lock().await.get(name).cloned()
    }

    /// Registers a session under a server name, replacing any existing
    /// one. Embedders and tests use this to bring their own transports.
    pub async fn insert_session(&self, name: &str, session: Arc<DownstreamSession>) {
        self.sessions.lock().await.insert(name.to_string(), session);
    }

    /// Removes a session from the map (server disabled), returning it for
    /// teardown.
    pub async fn remove_session(&self, name: &str) -> Option<Arc<DownstreamSession>> {
        self.sessions.lock().await.remove(name)
    }

    /// Drains and closes every live session concurrently.
    pub async fn shutdown_sessions(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        let closing = sessions.iter().map(|s| s.drain_and_close());
        futures_util::future::join_all(closing).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaunchConfig, ServerList};
    use crate::mcp::transport::spawn_writer_to;

    fn state() -> Arc<GatewayState> {
        let list: ServerList = serde_json::from_str(
            r#"{
                "toolCap": 5,
                "servers": [
                    { "name": "Foo Bar", "url": "http://host:9/", "enabled": true },
                    { "name": "Off", "url": "http://host:10/", "enabled": false }
                ]
            }"#,
        )
        .unwrap();
        let store = ConfigStore::in_memory(
            std::env::temp_dir().join("switchboard-test-servers.json"),
            list,
            LaunchConfig::default(),
        );
        let (outbound, _handle) = spawn_writer_to(tokio::io::sink());
        GatewayState::new(store, outbound)
    }

    #[tokio::test]
    async fn first_start_fires_once() {
        let state = state();
        assert!(state.first_start());
        assert!(!state.first_start());
        assert!(!state.first_start());
    }

    #[tokio::test]
    async fn enabled_records_excludes_disabled() {
        let state = state();
        let records = state.enabled_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Foo Bar");
    }

    #[tokio::test]
    async fn session_for_returns_same_instance() {
        let state = state();
        let record = state.enabled_records().await.remove(0);
        let a = state.session_for(&record).await;
        let b = state.session_for(&record).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(state.session("Foo Bar").await.is_some());
    }

    #[tokio::test]
    async fn remove_session_detaches() {
        let state = state();
        let record = state.enabled_records().await.remove(0);
        let _session = state.session_for(&record).await;
        assert!(state.remove_session("Foo Bar").await.is_some());
        assert!(state.session("Foo Bar").await.is_none());
    }
}
