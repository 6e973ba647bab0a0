//! Error types for switchboard-mcp.
//!
//! Errors are split by boundary: configuration loading, downstream
//! transports, downstream sessions, and the small set of fatal conditions
//! that terminate the gateway with a documented exit code. Protocol-level
//! errors (`-32700` … `-32603`) are wire values, not Rust errors — they
//! live in [`crate::mcp::protocol`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file could not be written.
    #[error("failed to write configuration file: {path}")]
    WriteError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// No configuration directory could be determined.
    ///
    /// Raised when there is neither a CLI override nor a resolvable home
    /// directory. This is the one configuration failure with no usable
    /// default.
    #[error("no configuration directory could be determined")]
    NoConfigDir,
}

/// Errors that can occur on a downstream transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be serialised or deserialised.
    #[error("JSON serialisation error: {0}")]
    Json(#[from] serde_json::Error),

    /// The downstream child process has exited.
    #[error("downstream process has exited")]
    ProcessExited,

    /// The call's deadline expired before a reply arrived.
    #[error("timeout waiting for response")]
    Timeout,

    /// HTTP round-trip failure, after the single permitted retry.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The transport has been shut down and accepts no further requests.
    #[error("transport is closed")]
    Closed,
}

/// Errors raised by a downstream session on behalf of the router.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session could not reach the READY state.
    #[error("downstream '{name}' unavailable: {reason}")]
    Unavailable {
        /// Downstream server name.
        name: String,
        /// Why startup failed.
        reason: String,
    },

    /// The session is draining and accepts no new forwards.
    #[error("downstream '{name}' is shutting down")]
    Draining {
        /// Downstream server name.
        name: String,
    },

    /// The forwarded call failed at the transport layer.
    #[error("downstream '{name}': {source}")]
    Transport {
        /// Downstream server name.
        name: String,
        /// The underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The downstream replied, but with a protocol-level error.
    #[error("downstream '{name}' protocol error: {message}")]
    Protocol {
        /// Downstream server name.
        name: String,
        /// The downstream's error message.
        message: String,
    },
}

/// Fatal conditions that terminate the gateway.
#[derive(Error, Debug)]
pub enum FatalError {
    /// Standard input or output failed or closed unexpectedly.
    #[error("fatal I/O error on standard I/O: {0}")]
    StdIo(#[source] std::io::Error),

    /// The output writer's queue could not drain: misbehaving client.
    #[error("output queue did not drain: client is not reading")]
    Backpressure,
}

impl FatalError {
    /// The documented process exit code for this condition.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::StdIo(_) => 2,
            Self::Backpressure => 3,
        }
    }
}
