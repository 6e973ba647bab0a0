//! Downstream server connectivity.
//!
//! A *downstream* is an MCP server the gateway connects to as a client.
//! This module owns the per-server session lifecycle and the two transport
//! adapters (child-process stdio and HTTP POST) behind the
//! [`DownstreamTransport`] seam.

pub mod session;
pub mod transport;

pub use session::{DownstreamSession, SessionState};
pub use transport::{
    DownstreamTransport, HttpTransport, StdioTransport, DEFAULT_CALL_TIMEOUT, SHUTDOWN_GRACE,
};
