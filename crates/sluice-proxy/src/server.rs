//! Listening server and its lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! accept loop, one task         |
//! per connection (JoinSet)      |
//!       |                       v
//!       |               ProxyHandle::shutdown()
//!       |                       |
//!       v                       v
//! stop accepting, abort live connections <--+
//! ```

use crate::connection::{Connection, ConnectionId, ConnectionPolicy, DEFAULT_FIRST_CHUNK_TIMEOUT};
use crate::connector::{UpstreamConnector, DEFAULT_CONNECT_TIMEOUT};
use crate::relay::ConnectionRelay;
use crate::{ProxyError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default relay idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default cap on concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// How long [`ProxyHandle::shutdown`] waits before aborting the server task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listening address.
    /// Default: `0.0.0.0:8080`
    pub bind_addr: SocketAddr,

    /// Upstream dial timeout, name resolution included.
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Close a relay after this long without traffic. `None` disables it.
    /// Default: 5 minutes
    pub idle_timeout: Option<Duration>,

    /// Drop clients that send nothing for this long after connecting.
    /// Default: 30 seconds
    pub first_chunk_timeout: Duration,

    /// Connections beyond this are closed on accept.
    /// Default: 1000
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            first_chunk_timeout: DEFAULT_FIRST_CHUNK_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ProxyConfig {
    /// Per-connection policy derived from this config.
    pub fn policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            connector: UpstreamConnector::new(self.connect_timeout),
            relay: ConnectionRelay::new(self.idle_timeout),
            first_chunk_timeout: self.first_chunk_timeout,
        }
    }
}

/// Live-connection bookkeeping shared by the accept loop and the handle.
#[derive(Debug, Default)]
struct ConnectionRegistry {
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl ConnectionRegistry {
    /// Reserve a slot, or `None` when `max` connections are already live.
    fn admit(self: &Arc<Self>, max: usize) -> Option<ActiveGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        Some(ActiveGuard {
            id,
            registry: Arc::clone(self),
        })
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases a registry slot when the connection task ends, aborted or not.
struct ActiveGuard {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle for controlling a running proxy server.
///
/// Dropping the handle also stops the server.
pub struct ProxyHandle {
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Join handle for the server task.
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,

    /// Actual bound address (OS-assigned port resolved).
    local_addr: SocketAddr,

    registry: Arc<ConnectionRegistry>,
}

impl ProxyHandle {
    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.registry.active()
    }

    /// Stop accepting and close every live connection.
    ///
    /// Waits up to 2 seconds for the server task, then aborts it.
    ///
    /// # Errors
    /// * `ProxyError::Shutdown` - the server task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let signal_sent = self
            .shutdown_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);

        let Some(mut handle) = self.join_handle.take() else {
            return Ok(());
        };
        if !signal_sent {
            handle.abort();
        }

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(ProxyError::Shutdown(e.to_string())),
            Err(_) => {
                warn!(addr = %self.local_addr, "Server did not stop in time, aborting");
                handle.abort();
                Ok(())
            }
        }
    }
}

/// Two-mode forwarding proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    policy: ConnectionPolicy,
    registry: Arc<ConnectionRegistry>,
}

impl ProxyServer {
    /// Create a new proxy server.
    ///
    /// # Errors
    /// * `ProxyError::Internal` - `max_connections` is zero.
    ///
    /// # Example
    /// ```ignore
    /// let server = ProxyServer::new(ProxyConfig::default())?;
    /// let handle = server.start().await?;
    /// // ... later ...
    /// handle.shutdown().await?;
    /// ```
    pub fn new(config: ProxyConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(ProxyError::Internal(
                "max_connections must be at least 1".to_string(),
            ));
        }
        // A zero bound would fail every dial or every first read at once.
        if config.connect_timeout.is_zero() {
            return Err(ProxyError::Internal(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        if config.first_chunk_timeout.is_zero() {
            return Err(ProxyError::Internal(
                "first_chunk_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            policy: config.policy(),
            config,
            registry: Arc::new(ConnectionRegistry::default()),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.registry.active()
    }

    /// Bind and serve in a background task.
    ///
    /// The listener is bound before this returns, so the handle reports the
    /// real port even for `:0` binds.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - the address is in use or not permitted.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: self.config.bind_addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let join_handle = tokio::spawn(async move {
            self.serve_until(listener, async move {
                // A dropped handle counts as a shutdown request.
                let _ = shutdown_rx.await;
            })
            .await
        });

        Ok(ProxyHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
            registry,
        })
    }

    /// Bind and serve on the current task until the process exits.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - the address is in use or not permitted.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_until(listener, std::future::pending()).await
    }

    async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.bind_addr,
                source: e,
            })
    }

    /// Accept loop. Returns once `shutdown` resolves, after every live
    /// connection task has been aborted.
    async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr().unwrap_or(self.config.bind_addr);
        info!(addr = %addr, "Proxy listening");

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                // Reap finished tasks so the set does not grow without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accepted = listener.accept() => {
                    let (client, peer) = match accepted {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "TCP accept error");
                            continue;
                        }
                    };

                    let Some(guard) = self.registry.admit(self.config.max_connections) else {
                        warn!(client = %peer, "Connection limit reached, rejecting");
                        drop(client);
                        continue;
                    };

                    let policy = self.policy;
                    tasks.spawn(async move {
                        let _ = client.set_nodelay(true);
                        debug!(conn = %guard.id, peer = %peer, "Accepted connection");
                        let result = Connection::new(guard.id, peer).serve(client, &policy).await;
                        result.log();
                        drop(guard);
                    });
                }
            }
        }

        let live = tasks.len();
        tasks.shutdown().await;
        info!(addr = %addr, aborted = live, "Proxy stopped");
        Ok(())
    }
}
