//! Reverse tunnel client.
//!
//! Exposes a local TCP service through a remote broker. The broker assigns a
//! public URL and hands over one stream per external request; each stream is
//! dialed through to `local_host:local_port` and relayed like a proxied
//! connection.
//!
//! # Lifecycle
//!
//! ```text
//! TunnelClient::start(broker, config) --> TunnelHandle (events, close)
//!       |
//!       v
//! register ----fail----> Reconnecting { attempt, delay } --+
//!       |                                                  |
//!       v                                                  |
//! Connected { url } -> accept streams -> session ends -----+
//!                        |
//!                        +-- per stream: dial local service, relay
//! ```
//!
//! The broker's wire protocol is not part of this crate; implement [`Broker`]
//! and [`BrokerSession`] for it.

use crate::connector::{UpstreamConnector, DEFAULT_CONNECT_TIMEOUT};
use crate::relay::{ClosedBy, ConnectionRelay, RelayStats};
use crate::ProxyError;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default broker host.
pub const DEFAULT_TUNNEL_SERVER: &str = "localtunnel.dev";

/// Default local service port.
pub const DEFAULT_LOCAL_PORT: u16 = 3000;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the client asks the broker for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub server: String,
    pub subdomain: Option<String>,
    pub local_port: u16,
}

/// A remote tunnel service.
pub trait Broker: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Register a tunnel and open a session for it.
    fn register(
        &self,
        request: &TunnelRequest,
    ) -> impl Future<Output = io::Result<Self::Session>> + Send;
}

/// One registered tunnel.
pub trait BrokerSession: Send + 'static {
    /// An external request forwarded by the broker.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Public URL assigned by the broker.
    fn public_url(&self) -> &str;

    /// Subdomain actually assigned, which may differ from the one requested.
    fn subdomain(&self) -> &str;

    /// Wait for the next external request. `Ok(None)` means the broker
    /// ended the session.
    fn accept(&mut self) -> impl Future<Output = io::Result<Option<Self::Stream>>> + Send;
}

/// Backoff between registration attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th reconnect (1-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Tunnel client configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Host of the local service. Default: `localhost`
    pub local_host: String,
    /// Port of the local service. Default: 3000
    pub local_port: u16,
    /// Broker host. Default: `localtunnel.dev`
    pub server: String,
    /// Requested subdomain; the broker picks one when `None`.
    pub subdomain: Option<String>,
    /// Dial timeout for the local service.
    pub connect_timeout: Duration,
    /// Idle timeout for each forwarded stream.
    pub idle_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_host: "localhost".to_string(),
            local_port: DEFAULT_LOCAL_PORT,
            server: DEFAULT_TUNNEL_SERVER.to_string(),
            subdomain: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl TunnelConfig {
    pub fn request(&self) -> TunnelRequest {
        TunnelRequest {
            server: self.server.clone(),
            subdomain: self.subdomain.clone(),
            local_port: self.local_port,
        }
    }
}

/// Progress reported by a running tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A broker session is up.
    Connected { url: String, subdomain: String },
    /// The broker forwarded an external request.
    StreamOpened { stream: u64 },
    /// A forwarded request finished.
    StreamClosed {
        stream: u64,
        closed_by: ClosedBy,
        stats: RelayStats,
    },
    /// A registration, session, or local dial failed.
    Error { message: String },
    /// Waiting before the next registration attempt.
    Reconnecting { attempt: u32, delay: Duration },
    /// The reconnect budget is exhausted; the tunnel has stopped.
    GaveUp { attempts: u32 },
}

/// Handle to a running tunnel. Dropping it closes the tunnel.
pub struct TunnelHandle {
    events: mpsc::UnboundedReceiver<TunnelEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TunnelHandle {
    /// Next event, or `None` once the tunnel has stopped and all events
    /// were consumed.
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Tear down the session and every forwarded stream.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.join_handle.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

/// Keeps a broker session alive and forwards its streams to the local service.
pub struct TunnelClient<B> {
    broker: B,
    config: TunnelConfig,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl<B: Broker> TunnelClient<B> {
    /// Spawn the tunnel on the current runtime.
    pub fn start(broker: B, config: TunnelConfig) -> TunnelHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let client = Self {
            broker,
            config,
            events: events_tx,
        };

        let join_handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx => debug!("Tunnel closed"),
                _ = client.run() => {}
            }
        });

        TunnelHandle {
            events: events_rx,
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
        }
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    /// Register, serve, and re-register until the reconnect budget runs out.
    async fn run(&self) {
        let request = self.config.request();
        let policy = self.config.reconnect;
        let mut attempt = 0u32;

        loop {
            match self.broker.register(&request).await {
                Ok(session) => {
                    attempt = 0;
                    info!(
                        url = session.public_url(),
                        subdomain = session.subdomain(),
                        local_port = self.config.local_port,
                        "Tunnel connected"
                    );
                    self.emit(TunnelEvent::Connected {
                        url: session.public_url().to_string(),
                        subdomain: session.subdomain().to_string(),
                    });
                    let message = match self.serve_session(session).await {
                        Ok(()) => "broker ended the session".to_string(),
                        Err(e) => e.to_string(),
                    };
                    self.report(ProxyError::Tunnel { message });
                }
                Err(e) => self.report(ProxyError::Tunnel {
                    message: format!("registration with {} failed: {e}", request.server),
                }),
            }

            attempt += 1;
            if policy.max_attempts.is_some_and(|max| attempt > max) {
                let attempts = attempt - 1;
                warn!(attempts, "Tunnel reconnect budget exhausted");
                self.emit(TunnelEvent::GaveUp { attempts });
                return;
            }

            let delay = policy.delay_for(attempt);
            info!(attempt, delay = ?delay, "Tunnel reconnecting");
            self.emit(TunnelEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;
        }
    }

    fn report(&self, error: ProxyError) {
        warn!(error = %error, "Tunnel session lost");
        self.emit(TunnelEvent::Error {
            message: error.to_string(),
        });
    }

    async fn serve_session(&self, mut session: B::Session) -> io::Result<()> {
        let target = Arc::<str>::from(self.config.local_host.as_str());
        let connector = UpstreamConnector::new(self.config.connect_timeout);
        let relay = ConnectionRelay::new(self.config.idle_timeout);
        let mut streams = JoinSet::new();
        let mut next_stream = 0u64;

        loop {
            tokio::select! {
                Some(_) = streams.join_next(), if !streams.is_empty() => {}
                accepted = session.accept() => {
                    let Some(stream) = accepted? else {
                        return Ok(());
                    };
                    next_stream += 1;
                    streams.spawn(forward(
                        stream,
                        next_stream,
                        Arc::clone(&target),
                        self.config.local_port,
                        connector,
                        relay,
                        self.events.clone(),
                    ));
                }
            }
        }
    }
}

/// Carry one broker stream to the local service.
async fn forward<S>(
    stream: S,
    id: u64,
    host: Arc<str>,
    port: u16,
    connector: UpstreamConnector,
    relay: ConnectionRelay,
    events: mpsc::UnboundedSender<TunnelEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let _ = events.send(TunnelEvent::StreamOpened { stream: id });

    let local = match connector.connect(&host, port).await {
        Ok(local) => local,
        Err(e) => {
            warn!(stream = id, error = %e, "Local service unreachable");
            let _ = events.send(TunnelEvent::Error {
                message: e.to_string(),
            });
            let _ = events.send(TunnelEvent::StreamClosed {
                stream: id,
                closed_by: ClosedBy::Error,
                stats: RelayStats::default(),
            });
            return;
        }
    };

    let outcome = relay.run(stream, local).await;
    if let Some(e) = &outcome.error {
        debug!(stream = id, error = %e, "Tunnel stream error");
    }
    let _ = events.send(TunnelEvent::StreamClosed {
        stream: id,
        closed_by: outcome.closed_by,
        stats: outcome.stats,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    struct MemorySession {
        url: String,
        subdomain: String,
        incoming: mpsc::UnboundedReceiver<DuplexStream>,
    }

    impl BrokerSession for MemorySession {
        type Stream = DuplexStream;

        fn public_url(&self) -> &str {
            &self.url
        }

        fn subdomain(&self) -> &str {
            &self.subdomain
        }

        fn accept(&mut self) -> impl Future<Output = io::Result<Option<DuplexStream>>> + Send {
            async move { Ok(self.incoming.recv().await) }
        }
    }

    /// Hands out pre-built sessions in order, then refuses.
    #[derive(Default)]
    struct MemoryBroker {
        sessions: Mutex<VecDeque<MemorySession>>,
        requests: Arc<Mutex<Vec<TunnelRequest>>>,
    }

    impl MemoryBroker {
        /// Queue a session and return the sender that feeds it streams.
        fn with_session(self, subdomain: &str) -> (Self, mpsc::UnboundedSender<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.sessions.lock().unwrap().push_back(MemorySession {
                url: format!("https://{subdomain}.localtunnel.dev"),
                subdomain: subdomain.to_string(),
                incoming: rx,
            });
            (self, tx)
        }
    }

    impl Broker for MemoryBroker {
        type Session = MemorySession;

        fn register(
            &self,
            request: &TunnelRequest,
        ) -> impl Future<Output = io::Result<MemorySession>> + Send {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.sessions.lock().unwrap().pop_front();
            async move {
                next.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no session"))
            }
        }
    }

    async fn tcp_listener_or_skip(addr: &str) -> Option<TcpListener> {
        match TcpListener::bind(addr).await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    async fn next_event(handle: &mut TunnelHandle) -> TunnelEvent {
        tokio::time::timeout(Duration::from_secs(2), handle.next_event())
            .await
            .expect("timed out waiting for tunnel event")
            .expect("tunnel event channel closed")
    }

    fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    // ========================================================================
    // Configuration Tests
    // ========================================================================

    #[test]
    fn test_tunnel_config_default() {
        let config = TunnelConfig::default();
        assert_eq!(config.local_host, "localhost");
        assert_eq!(config.local_port, 3000);
        assert_eq!(config.server, "localtunnel.dev");
        assert!(config.subdomain.is_none());
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(100), Duration::from_secs(30));
    }

    // ========================================================================
    // Forwarding Tests
    // ========================================================================

    #[tokio::test]
    async fn test_tunnel_forwards_stream_to_local_service() {
        let Some(local) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let (broker, streams) = MemoryBroker::default().with_session("quiet-fox");
        let config = TunnelConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: local.local_addr().unwrap().port(),
            ..Default::default()
        };
        let mut handle = TunnelClient::start(broker, config);

        assert_eq!(
            next_event(&mut handle).await,
            TunnelEvent::Connected {
                url: "https://quiet-fox.localtunnel.dev".to_string(),
                subdomain: "quiet-fox".to_string(),
            }
        );

        let (mut external, tunnel_side) = duplex(1024);
        streams.send(tunnel_side).unwrap();
        assert_eq!(
            next_event(&mut handle).await,
            TunnelEvent::StreamOpened { stream: 1 }
        );

        let (mut service, _) = local.accept().await.unwrap();
        external.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 18];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");

        service.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(service);
        let mut response = Vec::new();
        external.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");

        match next_event(&mut handle).await {
            TunnelEvent::StreamClosed {
                stream, closed_by, ..
            } => {
                assert_eq!(stream, 1);
                assert_eq!(closed_by, ClosedBy::Upstream);
            }
            other => panic!("Expected StreamClosed, got {other:?}"),
        }

        handle.close().await;
    }

    #[tokio::test]
    async fn test_tunnel_local_dial_failure_closes_only_that_stream() {
        let Some(listener) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (broker, streams) = MemoryBroker::default().with_session("lonely");
        let config = TunnelConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: port,
            connect_timeout: Duration::from_secs(1),
            reconnect: fast_reconnect(Some(0)),
            ..Default::default()
        };
        let mut handle = TunnelClient::start(broker, config);
        assert!(matches!(
            next_event(&mut handle).await,
            TunnelEvent::Connected { .. }
        ));

        let (mut external, tunnel_side) = duplex(1024);
        streams.send(tunnel_side).unwrap();
        assert_eq!(
            next_event(&mut handle).await,
            TunnelEvent::StreamOpened { stream: 1 }
        );
        assert!(matches!(
            next_event(&mut handle).await,
            TunnelEvent::Error { .. }
        ));
        assert!(matches!(
            next_event(&mut handle).await,
            TunnelEvent::StreamClosed {
                closed_by: ClosedBy::Error,
                ..
            }
        ));

        let mut rest = Vec::new();
        external.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // The session itself survives.
        assert!(handle.is_running());
        handle.close().await;
    }

    // ========================================================================
    // Reconnect Tests
    // ========================================================================

    #[tokio::test]
    async fn test_tunnel_gives_up_after_max_attempts() {
        let broker = MemoryBroker::default();
        let config = TunnelConfig {
            reconnect: fast_reconnect(Some(2)),
            ..Default::default()
        };
        let mut handle = TunnelClient::start(broker, config);

        assert!(matches!(next_event(&mut handle).await, TunnelEvent::Error { .. }));
        assert_eq!(
            next_event(&mut handle).await,
            TunnelEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(10),
            }
        );
        assert!(matches!(next_event(&mut handle).await, TunnelEvent::Error { .. }));
        assert_eq!(
            next_event(&mut handle).await,
            TunnelEvent::Reconnecting {
                attempt: 2,
                delay: Duration::from_millis(20),
            }
        );
        assert!(matches!(next_event(&mut handle).await, TunnelEvent::Error { .. }));
        assert_eq!(
            next_event(&mut handle).await,
            TunnelEvent::GaveUp { attempts: 2 }
        );

        assert!(handle.next_event().await.is_none());
        for _ in 0..50 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_tunnel_reconnects_after_session_ends() {
        let (broker, first) = MemoryBroker::default().with_session("first");
        let (broker, _second) = broker.with_session("second");
        let requests = Arc::clone(&broker.requests);
        let config = TunnelConfig {
            subdomain: Some("wanted".to_string()),
            reconnect: fast_reconnect(Some(1)),
            ..Default::default()
        };
        let mut handle = TunnelClient::start(broker, config);

        assert!(matches!(
            next_event(&mut handle).await,
            TunnelEvent::Connected { subdomain, .. } if subdomain == "first"
        ));

        drop(first);
        assert!(matches!(next_event(&mut handle).await, TunnelEvent::Error { .. }));
        assert!(matches!(
            next_event(&mut handle).await,
            TunnelEvent::Reconnecting { attempt: 1, .. }
        ));
        assert!(matches!(
            next_event(&mut handle).await,
            TunnelEvent::Connected { subdomain, .. } if subdomain == "second"
        ));

        let seen = requests.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen
            .iter()
            .all(|r| r.subdomain.as_deref() == Some("wanted") && r.local_port == 3000));

        handle.close().await;
    }

    #[tokio::test]
    async fn test_tunnel_close_stops_client() {
        let (broker, _streams) = MemoryBroker::default().with_session("bye");
        let mut handle = TunnelClient::start(broker, TunnelConfig::default());
        assert!(matches!(
            next_event(&mut handle).await,
            TunnelEvent::Connected { .. }
        ));

        tokio::time::timeout(Duration::from_secs(3), handle.close())
            .await
            .expect("close should not hang");
    }
}
