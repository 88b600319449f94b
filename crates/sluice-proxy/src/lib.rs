//! Two-mode TCP forwarding proxy.
//!
//! `sluice-proxy` accepts plaintext TCP connections, sniffs the first chunk
//! each client sends, and forwards the connection either as an opaque
//! `CONNECT` tunnel or as a plain HTTP request to the host named in the
//! request. It never terminates TLS: a `CONNECT` tunnel carries the client's
//! own TLS session untouched.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ProxyServer (0.0.0.0:8080)  -- one task per accepted socket
//!   |
//!   +-- Connection state machine
//!          |
//!          +-- AddressResolver     first chunk -> CONNECT / plain HTTP + host:port
//!          +-- UpstreamConnector   single dial, bounded by a timeout
//!          +-- ConnectionRelay     bidirectional copy, symmetric teardown
//!
//! TunnelClient  -- broker session -> local service, reusing the relay
//! ```
//!
//! # Components
//!
//! - [`parse_request_head`]: classifies the first chunk of a connection
//! - [`UpstreamConnector`]: dials the destination with a timeout
//! - [`ConnectionRelay`]: copies bytes both ways until either side closes
//! - [`Connection`]: drives one client through the states above
//! - [`ProxyServer`]: accept loop, live-connection registry, shutdown
//! - [`TunnelClient`]: exposes a local port through a remote [`Broker`]
//!
//! # Usage
//!
//! ```ignore
//! use sluice_proxy::{ProxyConfig, ProxyServer};
//!
//! let config = ProxyConfig {
//!     bind_addr: "127.0.0.1:8080".parse()?,
//!     ..Default::default()
//! };
//!
//! let handle = ProxyServer::new(config)?.start().await?;
//! // ... later ...
//! handle.shutdown().await?;
//! ```

mod connection;
mod connector;
mod relay;
mod resolver;
mod server;
mod tunnel;

pub use connection::{
    Connection, ConnectionId, ConnectionPolicy, ConnectionState, RelayResult,
    DEFAULT_FIRST_CHUNK_TIMEOUT,
};
pub use connector::{ConnectError, UpstreamConnector, DEFAULT_CONNECT_TIMEOUT};
pub use relay::{ClosedBy, ConnectionRelay, RelayOutcome, RelayStats, RELAY_BUFFER_SIZE};
pub use resolver::{
    find_head_end, parse_request_head, ClassificationError, Destination, Mode, ParsedRequestHead,
    DEFAULT_HTTP_PORT, DEFAULT_TUNNEL_PORT, MAX_REQUEST_HEAD_SIZE,
};
pub use server::{
    ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_PORT,
};
pub use tunnel::{
    Broker, BrokerSession, ReconnectPolicy, TunnelClient, TunnelConfig, TunnelEvent, TunnelHandle,
    TunnelRequest, DEFAULT_LOCAL_PORT, DEFAULT_TUNNEL_SERVER,
};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
///
/// Only [`ProxyError::Bind`] is fatal to a server. Every other variant ends a
/// single connection (or, for [`ProxyError::Tunnel`], a single broker session).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The first chunk did not name a destination.
    #[error("Failed to classify request: {0}")]
    Classification(#[from] ClassificationError),

    /// The upstream dial failed or timed out.
    #[error(transparent)]
    Dial(#[from] ConnectError),

    /// Socket-level I/O error on either side of a connection.
    #[error("Relay error: {0}")]
    Relay(#[source] std::io::Error),

    /// The client sent nothing before the first-chunk deadline.
    #[error("No request received within {0:?}")]
    RequestTimeout(std::time::Duration),

    /// A tunnel broker session could not be established or was lost.
    #[error("Tunnel error: {message}")]
    Tunnel { message: String },

    /// Server shutdown error.
    #[error("Server shutdown error: {0}")]
    Shutdown(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}
