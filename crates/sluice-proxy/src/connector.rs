//! Upstream dialing.

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default bound on a single upstream dial, name resolution included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure to open the upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The dial did not complete within the configured timeout.
    #[error("Connection to {host}:{port} timed out after {after:?}")]
    Timeout {
        host: String,
        port: u16,
        after: Duration,
    },

    /// Resolution failed, or the destination refused or was unreachable.
    #[error("Connection to {host}:{port} failed: {source}")]
    Io {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Opens TCP connections to resolved destinations.
///
/// One attempt per call, no retries. A failed or timed-out dial leaves no
/// socket behind.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamConnector {
    connect_timeout: Duration,
}

impl Default for UpstreamConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl UpstreamConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Dial `host:port`.
    ///
    /// # Errors
    /// * `ConnectError::Timeout` - resolution plus connect exceeded the timeout
    /// * `ConnectError::Io` - resolution failed or the connection was refused
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ConnectError> {
        self.dial_within(host, port, TcpStream::connect((host, port))).await
    }

    /// Bound `dial` by the connect timeout and map its outcome.
    async fn dial_within<F>(
        &self,
        host: &str,
        port: u16,
        dial: F,
    ) -> Result<TcpStream, ConnectError>
    where
        F: Future<Output = io::Result<TcpStream>>,
    {
        match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok(stream)) => {
                // Best-effort; a socket without TCP_NODELAY still relays correctly.
                let _ = stream.set_nodelay(true);
                debug!(host, port, "Upstream connected");
                Ok(stream)
            }
            Ok(Err(source)) => Err(ConnectError::Io {
                host: host.to_string(),
                port,
                source,
            }),
            Err(_) => Err(ConnectError::Timeout {
                host: host.to_string(),
                port,
                after: self.connect_timeout,
            }),
        }
    }
}
