//! Configuration loading, mutation, and crash-atomic persistence.
//!
//! Two JSON documents drive the gateway:
//!
//! 1. `servers.json` — the administrative server list plus the tool cap.
//!    Mutated by the admin tools and persisted on every mutation.
//! 2. `mcp-config.json` — launch descriptors for child-process downstreams.
//!    Read-only at runtime.
//!
//! # Configuration File Locations
//!
//! Both documents are searched in the following order:
//!
//! 1. Paths specified via `--servers` / `--mcp-config` CLI flags
//! 2. Default location:
//!    - **Linux/macOS:** `~/.switchboard-mcp/`
//!    - **Windows:** `%USERPROFILE%\.switchboard-mcp\`
//!
//! A failed load is not fatal: the gateway falls back to a defaulted, empty
//! in-memory configuration so the client can rebuild it through the admin
//! tools. Saves are write-to-temp + rename so a crash never leaves a
//! half-written document behind.

mod settings;

pub use settings::{
    derive_namespace, LaunchConfig, LaunchDescriptor, ServerList, ServerRecord, DEFAULT_TOOL_CAP,
};

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.switchboard-mcp/`
/// - **Windows:** `%USERPROFILE%\.switchboard-mcp\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".switchboard-mcp"))
}

/// In-memory configuration with its backing file paths.
#[derive(Debug)]
pub struct ConfigStore {
    servers_path: PathBuf,
    server_list: ServerList,
    launch: LaunchConfig,
}

impl ConfigStore {
    /// Resolves the two document paths from CLI overrides and the default
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] when a path has no override and
    /// no home directory exists to derive a default from.
    pub fn resolve_paths(
        servers_override: Option<&Path>,
        launch_override: Option<&Path>,
    ) -> Result<(PathBuf, PathBuf), ConfigError> {
        let dir = match (servers_override, launch_override) {
            (Some(_), Some(_)) => None,
            _ => Some(default_config_dir().ok_or(ConfigError::NoConfigDir)?),
        };

        let servers_path = servers_override.map_or_else(
            || dir.as_ref().map(|d| d.join("servers.json")).unwrap_or_default(),
            Path::to_path_buf,
        );
        let launch_path = launch_override.map_or_else(
            || dir.as_ref().map(|d| d.join("mcp-config.json")).unwrap_or_default(),
            Path::to_path_buf,
        );

        Ok((servers_path, launch_path))
    }

    /// Loads both documents, falling back to defaults on failure.
    ///
    /// Load failures are logged and degrade to an empty configuration with
    /// the default tool cap; validation problems are logged and left in
    /// place (the offending records are unreachable at runtime).
    #[must_use]
    pub fn load(servers_path: PathBuf, launch_path: &Path, reserved_namespace: &str) -> Self {
        let server_list = match read_document::<ServerList>(&servers_path) {
            Ok(list) => {
                info!(
                    path = %servers_path.display(),
                    servers = list.servers.len(),
                    tool_cap = list.tool_cap,
                    "Loaded server list"
                );
                list
            }
            Err(e) => {
                error!(error = %e, "Falling back to empty server list with default tool cap");
                ServerList::default()
            }
        };

        for problem in server_list.diagnostics(reserved_namespace) {
            error!(problem = %problem, "Server list configuration error");
        }

        let launch = match read_document::<LaunchConfig>(launch_path) {
            Ok(launch) => {
                info!(
                    path = %launch_path.display(),
                    descriptors = launch.mcp_servers.len(),
                    "Loaded launch descriptors"
                );
                launch
            }
            Err(e) => {
                warn!(error = %e, "No usable launch descriptors; child-process downstreams cannot start");
                LaunchConfig::default()
            }
        };

        Self {
            servers_path,
            server_list,
            launch,
        }
    }

    /// Builds a store around in-memory documents, without touching disk.
    ///
    /// The server list is persisted to `servers_path` on the first
    /// mutation. Used by tests and embedders.
    #[must_use]
    pub fn in_memory(servers_path: PathBuf, server_list: ServerList, launch: LaunchConfig) -> Self {
        Self {
            servers_path,
            server_list,
            launch,
        }
    }

    /// The current server list.
    #[must_use]
    pub const fn server_list(&self) -> &ServerList {
        &self.server_list
    }

    /// The current server list, mutably. Callers persist via [`Self::save`].
    pub fn server_list_mut(&mut self) -> &mut ServerList {
        &mut self.server_list
    }

    /// Looks up the launch descriptor for a child-process downstream.
    #[must_use]
    pub fn launch_descriptor(&self, name: &str) -> Option<&LaunchDescriptor> {
        self.launch.mcp_servers.get(name)
    }

    /// Persists the server list crash-atomically.
    ///
    /// The document is serialised to `servers.json.tmp` and renamed over
    /// the original, so readers observe either the old or the new document.
    ///
    /// # Errors
    ///
    /// Returns an error when the temporary file cannot be written or the
    /// rename fails.
    pub fn save(&self) -> Result<(), ConfigError> {
        let serialised = serde_json::to_string_pretty(&self.server_list).map_err(|e| {
            ConfigError::ParseError {
                path: self.servers_path.clone(),
                source: e,
            }
        })?;

        if let Some(parent) = self.servers_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let tmp_path = self.servers_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialised).map_err(|e| ConfigError::WriteError {
            path: tmp_path.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, &self.servers_path).map_err(|e| ConfigError::WriteError {
            path: self.servers_path.clone(),
            source: e,
        })?;

        Ok(())
    }
}

/// Reads and parses one JSON document.
fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}
