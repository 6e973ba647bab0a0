//! Configuration structures for deserialisation.
//!
//! These structures map directly to the two JSON configuration documents:
//! the server list (`servers.json`) and the launch descriptors
//! (`mcp-config.json`). Namespace derivation lives here too — it is the
//! single definition every other module refers to.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default maximum number of concurrently enabled downstream servers.
pub const DEFAULT_TOOL_CAP: u32 = 60;

/// Derives the routing namespace from an administrative server name.
///
/// The name is lowercased and every maximal run of whitespace is replaced
/// with a single underscore. The derivation is deterministic: `"Foo  Bar"`
/// and `"foo bar"` both map to `"foo_bar"`.
#[must_use]
pub fn derive_namespace(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_whitespace = false;
    for ch in name.chars() {
        if ch.is_whitespace() {
            if !in_whitespace && !out.is_empty() {
                out.push('_');
            }
            in_whitespace = true;
        } else {
            in_whitespace = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        }
    }
    // A trailing separator would never sit on an underscore boundary.
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Administrative entry for one downstream server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerRecord {
    /// Unique, case-sensitive administrative name.
    pub name: String,

    /// Server address. `http://`/`https://` select the HTTP transport;
    /// anything else means a child process looked up by `name` in the
    /// launch descriptors.
    pub url: String,

    /// Whether this downstream participates in the catalog and routing.
    #[serde(default)]
    pub enabled: bool,
}

impl ServerRecord {
    /// The routing namespace derived from this record's name.
    #[must_use]
    pub fn namespace(&self) -> String {
        derive_namespace(&self.name)
    }

    /// Whether this record's downstream is reached over HTTP.
    #[must_use]
    pub fn uses_http(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

/// The server-list document: tool cap plus downstream records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerList {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    schema: Option<String>,

    /// Maximum count of enabled servers.
    #[serde(rename = "toolCap", default = "default_tool_cap")]
    pub tool_cap: u32,

    /// Downstream server records, in listed order.
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

const fn default_tool_cap() -> u32 {
    DEFAULT_TOOL_CAP
}

impl Default for ServerList {
    fn default() -> Self {
        Self {
            schema: None,
            tool_cap: DEFAULT_TOOL_CAP,
            servers: Vec::new(),
        }
    }
}

impl ServerList {
    /// Looks up a record by administrative name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ServerRecord> {
        self.servers.iter().find(|r| r.name == name)
    }

    /// Looks up a record by administrative name, mutably.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut ServerRecord> {
        self.servers.iter_mut().find(|r| r.name == name)
    }

    /// The count of records with `enabled == true`.
    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.servers.iter().filter(|r| r.enabled).count()
    }

    /// Records with `enabled == true`, in listed order.
    pub fn enabled(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.iter().filter(|r| r.enabled)
    }

    /// Diagnoses configuration problems without rejecting the document.
    ///
    /// The gateway keeps running on a flawed server list; offending records
    /// are simply unreachable. Each returned string is logged as an error
    /// at load time.
    #[must_use]
    pub fn diagnostics(&self, reserved_namespace: &str) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen_names: HashMap<&str, usize> = HashMap::new();
        let mut seen_namespaces: HashMap<String, &str> = HashMap::new();

        for record in &self.servers {
            if record.name.is_empty() {
                problems.push("server record with empty name".to_string());
                continue;
            }

            if let Some(count) = seen_names.get_mut(record.name.as_str()) {
                *count += 1;
                problems.push(format!(
                    "duplicate server name '{}': later record is ignored",
                    record.name
                ));
                continue;
            }
            seen_names.insert(&record.name, 1);

            let ns = record.namespace();
            if ns.is_empty() {
                problems.push(format!(
                    "server '{}' derives an empty namespace and is unreachable",
                    record.name
                ));
                continue;
            }
            if ns == reserved_namespace {
                problems.push(format!(
                    "server '{}' collides with the reserved '{}' namespace and is unreachable",
                    record.name, reserved_namespace
                ));
            }
            if let Some(earlier) = seen_namespaces.get(&ns) {
                problems.push(format!(
                    "servers '{earlier}' and '{}' share namespace '{ns}': the later-listed one is unreachable",
                    record.name
                ));
            } else {
                seen_namespaces.insert(ns, &record.name);
            }
        }

        problems
    }
}

/// How to spawn a child-process downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchDescriptor {
    /// Absolute or PATH-resolvable command.
    pub command: String,

    /// Ordered argument list.
    #[serde(default)]
    pub args: Vec<String>,

    /// Optional working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment overlaid on the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The launch-descriptor document (`mcp-config.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LaunchConfig {
    /// Launch descriptors keyed by administrative server name.
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, LaunchDescriptor>,
}
