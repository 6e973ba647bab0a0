//! Model Context Protocol (MCP) boundary with the upstream client.
//!
//! The gateway speaks line-delimited JSON-RPC 2.0 over standard I/O and
//! presents itself as a single MCP server while multiplexing the
//! downstream fleet behind it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MCP Gateway                           │
//! │                                                             │
//! │   ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    │
//! │   │  Transport  │───▶│ Dispatcher  │───▶│ Admin tools │    │
//! │   │   (stdio)   │    │ (lifecycle) │    │  + Router   │    │
//! │   └─────────────┘    └─────────────┘    └─────────────┘    │
//! │          │                  │                  │           │
//! │          ▼                  ▼                  ▼           │
//! │   ┌─────────────────────────────────────────────────┐      │
//! │   │              JSON-RPC Messages                  │      │
//! │   └─────────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use server::GatewayServer;
pub use transport::{Outbound, StdinReader};
