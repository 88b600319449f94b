//! Per-connection state machine.
//!
//! ```text
//! AwaitingFirstChunk -> Resolving -> Connecting -> Relaying -> Closed
//!         |                 |            |            |
//!         +-----------------+------------+------------+--> Closed (closed_by recorded)
//! ```
//!
//! A connection owns its client socket for its whole life and its upstream
//! socket from a successful dial until it closes. Failures never leave the
//! connection: the caller only sees the final [`RelayResult`].

use crate::connector::{ConnectError, UpstreamConnector};
use crate::relay::{ClosedBy, ConnectionRelay, RelayStats, RELAY_BUFFER_SIZE};
use crate::resolver::{
    find_head_end, parse_request_head, ClassificationError, Destination, Mode, ParsedRequestHead,
    MAX_REQUEST_HEAD_SIZE,
};
use crate::ProxyError;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default bound on the wait for a client's first bytes.
pub const DEFAULT_FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Client bytes held while the upstream dial is in flight. Reading pauses
/// once this much is buffered.
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Upper bound on delivering an error response to the client.
const REJECT_GRACE: Duration = Duration::from_secs(1);

const RESPONSE_200: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Log correlation id, unique per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingFirstChunk,
    Resolving,
    Connecting,
    Relaying,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AwaitingFirstChunk => "awaiting-first-chunk",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Timeouts and collaborators shared by every connection of a server.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionPolicy {
    pub connector: UpstreamConnector,
    pub relay: ConnectionRelay,
    /// How long a new client may stay silent before it is dropped.
    pub first_chunk_timeout: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            connector: UpstreamConnector::default(),
            relay: ConnectionRelay::default(),
            first_chunk_timeout: DEFAULT_FIRST_CHUNK_TIMEOUT,
        }
    }
}

/// Terminal outcome of one connection.
#[derive(Debug)]
pub struct RelayResult {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub mode: Mode,
    pub destination: Option<Destination>,
    pub closed_by: ClosedBy,
    pub error: Option<ProxyError>,
    pub stats: RelayStats,
}

impl RelayResult {
    /// Emit the close event for this connection.
    pub fn log(&self) {
        let dest = self
            .destination
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        match &self.error {
            None => info!(
                conn = %self.id,
                peer = %self.peer,
                mode = %self.mode,
                dest = %dest,
                closed_by = %self.closed_by,
                sent = self.stats.client_to_upstream,
                received = self.stats.upstream_to_client,
                "Connection closed"
            ),
            Some(e @ ProxyError::Dial(_)) => warn!(
                conn = %self.id,
                peer = %self.peer,
                mode = %self.mode,
                dest = %dest,
                error = %e,
                "Upstream unreachable"
            ),
            Some(e) => debug!(
                conn = %self.id,
                peer = %self.peer,
                mode = %self.mode,
                dest = %dest,
                closed_by = %self.closed_by,
                error = %e,
                "Connection error"
            ),
        }
    }
}

/// One accepted client.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    mode: Mode,
    destination: Option<Destination>,
    state: ConnectionState,
    stats: RelayStats,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            mode: Mode::Unknown,
            destination: None,
            state: ConnectionState::AwaitingFirstChunk,
            stats: RelayStats::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(conn = %self.id, from = %self.state, to = %next, "State change");
        self.state = next;
    }

    /// Drive the client through classification, dial, and relay.
    ///
    /// Always returns a result; both sockets are closed by the time it does.
    pub async fn serve<S>(self, client: S, policy: &ConnectionPolicy) -> RelayResult
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connector = policy.connector;
        self.serve_via(client, policy, move |dest: Destination| async move {
            connector.connect(&dest.host, dest.port).await
        })
        .await
    }

    /// [`Connection::serve`] with the upstream opened by `dial`.
    ///
    /// `dial` is called once, after classification. Client input keeps being
    /// buffered while its future is pending.
    async fn serve_via<S, D, F>(
        mut self,
        mut client: S,
        policy: &ConnectionPolicy,
        dial: D,
    ) -> RelayResult
    where
        S: AsyncRead + AsyncWrite + Unpin,
        D: FnOnce(Destination) -> F,
        F: Future<Output = Result<TcpStream, ConnectError>>,
    {
        let mut scratch = vec![0u8; RELAY_BUFFER_SIZE];

        let read = tokio::time::timeout(policy.first_chunk_timeout, client.read(&mut scratch)).await;
        let n = match read {
            Ok(Ok(0)) => return self.finish(ClosedBy::Client, None),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return self.finish(ClosedBy::Error, Some(ProxyError::Relay(e))),
            Err(_) => {
                let err = ProxyError::RequestTimeout(policy.first_chunk_timeout);
                return self.finish(ClosedBy::Error, Some(err));
            }
        };

        self.transition(ConnectionState::Resolving);
        let head = match parse_request_head(&scratch[..n]) {
            Ok(head) => head,
            Err(e) => {
                reject(&mut client, RESPONSE_400).await;
                return self.finish(ClosedBy::Error, Some(e.into()));
            }
        };
        self.mode = head.mode;
        self.destination = Some(head.destination.clone());
        debug!(
            conn = %self.id,
            mode = %self.mode,
            dest = %head.destination,
            "Request classified"
        );

        self.transition(ConnectionState::Connecting);
        let mut pending = PendingInput::new(&head, &scratch[..n]);
        let dial = dial(head.destination.clone());
        tokio::pin!(dial);

        let dialed = loop {
            tokio::select! {
                result = &mut dial => break result,
                fed = pending.fill(&mut client, &mut scratch), if pending.has_room() => {
                    match fed {
                        Ok(true) => {}
                        // Dropping the dial future abandons the attempt.
                        Ok(false) => return self.finish(ClosedBy::Client, None),
                        Err(e) => return self.finish(ClosedBy::Error, Some(e)),
                    }
                }
            }
        };

        let mut upstream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                reject(&mut client, RESPONSE_502).await;
                return self.finish(ClosedBy::Error, Some(e.into()));
            }
        };

        // The rest of a split CONNECT head must be consumed before the 200.
        while pending.head_incomplete() {
            let fed = tokio::time::timeout(
                policy.first_chunk_timeout,
                pending.fill(&mut client, &mut scratch),
            )
            .await;
            match fed {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return self.finish(ClosedBy::Client, None),
                Ok(Err(e)) => return self.finish(ClosedBy::Error, Some(e)),
                Err(_) => {
                    let err = ProxyError::RequestTimeout(policy.first_chunk_timeout);
                    return self.finish(ClosedBy::Error, Some(err));
                }
            }
        }

        if self.mode == Mode::TlsTunnel {
            if let Err(e) = client.write_all(RESPONSE_200).await {
                return self.finish(ClosedBy::Client, Some(ProxyError::Relay(e)));
            }
        }
        if !pending.buffered.is_empty() {
            if let Err(e) = upstream.write_all(&pending.buffered).await {
                return self.finish(ClosedBy::Upstream, Some(ProxyError::Relay(e)));
            }
        }
        let flushed = pending.buffered.len() as u64;
        drop(pending);
        drop(scratch);

        self.transition(ConnectionState::Relaying);
        info!(
            conn = %self.id,
            peer = %self.peer,
            mode = %self.mode,
            dest = %head.destination,
            "Relaying"
        );

        let outcome = policy.relay.run(client, upstream).await;
        self.stats = outcome.stats;
        self.stats.client_to_upstream += flushed;
        self.finish(outcome.closed_by, outcome.error)
    }

    fn finish(mut self, closed_by: ClosedBy, error: Option<ProxyError>) -> RelayResult {
        self.transition(ConnectionState::Closed);
        RelayResult {
            id: self.id,
            peer: self.peer,
            mode: self.mode,
            destination: self.destination,
            closed_by,
            error,
            stats: self.stats,
        }
    }
}

/// Best-effort error response, then close the write side.
async fn reject<S>(client: &mut S, response: &[u8])
where
    S: AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(REJECT_GRACE, async {
        client.write_all(response).await?;
        client.shutdown().await
    })
    .await;
}

/// Client bytes read before the upstream is ready to take them.
struct PendingInput {
    /// Partial `CONNECT` head still being read; discarded once complete.
    head: Option<Vec<u8>>,
    /// Bytes owed to upstream, in arrival order.
    buffered: Vec<u8>,
}

impl PendingInput {
    fn new(parsed: &ParsedRequestHead, first_chunk: &[u8]) -> Self {
        let head = (parsed.mode == Mode::TlsTunnel && !parsed.head_complete)
            .then(|| first_chunk.to_vec());
        Self {
            head,
            buffered: parsed.payload.clone(),
        }
    }

    fn head_incomplete(&self) -> bool {
        self.head.is_some()
    }

    fn has_room(&self) -> bool {
        self.buffered.len() < MAX_PENDING_BYTES
    }

    /// Read one chunk from the client. Returns `false` on EOF.
    async fn fill<S>(&mut self, client: &mut S, scratch: &mut [u8]) -> Result<bool, ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        let n = client.read(scratch).await.map_err(ProxyError::Relay)?;
        if n == 0 {
            return Ok(false);
        }
        self.push(&scratch[..n])?;
        Ok(true)
    }

    fn push(&mut self, chunk: &[u8]) -> Result<(), ClassificationError> {
        let Some(mut head) = self.head.take() else {
            self.buffered.extend_from_slice(chunk);
            return Ok(());
        };

        // The terminator may straddle the previous chunk boundary.
        let resume = head.len().saturating_sub(3);
        head.extend_from_slice(chunk);
        match find_head_end(&head[resume..]) {
            Some(end) => self.buffered.extend_from_slice(&head[resume + end..]),
            None if head.len() > MAX_REQUEST_HEAD_SIZE => {
                return Err(ClassificationError::HeadTooLarge)
            }
            None => self.head = Some(head),
        }
        Ok(())
    }
}
