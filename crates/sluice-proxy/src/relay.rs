//! Bidirectional byte relay with symmetric teardown.
//!
//! # Lifecycle
//!
//! ```text
//! client ──read──> pump ──write──> upstream
//! client <──write── pump <──read── upstream
//!            |
//!            +-- first pump to finish (EOF or error) or idle watchdog
//!                     |
//!                     v
//!            shut down both write halves, drop both sockets
//! ```
//!
//! Each direction reads into a fixed buffer and awaits the full write before
//! reading again, so a slow reader on one side stalls the matching writer
//! instead of growing memory.

use crate::ProxyError;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

/// Per-direction copy buffer size.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on flushing a write half during teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Which event ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    /// The client closed (or reset) its socket.
    Client,
    /// The upstream closed (or reset) its socket.
    Upstream,
    /// A parse, dial, or socket error.
    Error,
    /// No bytes moved in either direction for the idle threshold.
    IdleTimeout,
}

impl fmt::Display for ClosedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedBy::Client => f.write_str("client"),
            ClosedBy::Upstream => f.write_str("upstream"),
            ClosedBy::Error => f.write_str("error"),
            ClosedBy::IdleTimeout => f.write_str("idle-timeout"),
        }
    }
}

/// Byte counters for one relayed pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// How a relay ended.
#[derive(Debug)]
pub struct RelayOutcome {
    pub closed_by: ClosedBy,
    pub error: Option<ProxyError>,
    pub stats: RelayStats,
}

/// Copies bytes between a client stream and an upstream stream.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRelay {
    idle_timeout: Option<Duration>,
    buffer_size: usize,
}

impl Default for ConnectionRelay {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConnectionRelay {
    /// Create a relay. `None` disables the idle timeout.
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            buffer_size: RELAY_BUFFER_SIZE,
        }
    }

    /// Override the per-direction buffer size (minimum 1 byte).
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Relay until either side closes, either side fails, or the idle
    /// timeout fires. Both streams are shut down and dropped before this
    /// returns, whichever way it ended.
    pub async fn run<C, U>(&self, client: C, upstream: U) -> RelayOutcome
    where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let activity = Activity::new();
        let to_upstream = AtomicU64::new(0);
        let to_client = AtomicU64::new(0);

        let (closed_by, error) = tokio::select! {
            end = pump(&mut client_read, &mut upstream_write, &to_upstream, &activity, self.buffer_size) => {
                settle(Side::Client, end)
            }
            end = pump(&mut upstream_read, &mut client_write, &to_client, &activity, self.buffer_size) => {
                settle(Side::Upstream, end)
            }
            _ = activity.idle_for(self.idle_timeout) => (ClosedBy::IdleTimeout, None),
        };

        // Close the surviving side too; a half-open pair must not outlive the relay.
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, upstream_write.shutdown()).await;
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, client_write.shutdown()).await;
        drop((client_read, client_write, upstream_read, upstream_write));

        let stats = RelayStats {
            client_to_upstream: to_upstream.load(Ordering::Relaxed),
            upstream_to_client: to_client.load(Ordering::Relaxed),
        };
        debug!(
            closed_by = %closed_by,
            sent = stats.client_to_upstream,
            received = stats.upstream_to_client,
            "Relay finished"
        );

        RelayOutcome {
            closed_by,
            error: error.map(ProxyError::Relay),
            stats,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Upstream,
}

impl Side {
    fn closed_by(self) -> ClosedBy {
        match self {
            Side::Client => ClosedBy::Client,
            Side::Upstream => ClosedBy::Upstream,
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}

enum PumpEnd {
    Eof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// Attribute the end of a pump reading from `source` to one side or to an error.
fn settle(source: Side, end: PumpEnd) -> (ClosedBy, Option<io::Error>) {
    match end {
        PumpEnd::Eof => (source.closed_by(), None),
        PumpEnd::ReadFailed(e) if is_disconnect(&e) => (source.closed_by(), None),
        PumpEnd::WriteFailed(e) if is_disconnect(&e) => (source.peer().closed_by(), None),
        PumpEnd::ReadFailed(e) | PumpEnd::WriteFailed(e) => (ClosedBy::Error, Some(e)),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
    buffer_size: usize,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => n,
            Err(e) => return PumpEnd::ReadFailed(e),
        };
        activity.touch();
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return PumpEnd::WriteFailed(e);
        }
        if let Err(e) = writer.flush().await {
            return PumpEnd::WriteFailed(e);
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Last time any byte moved, shared by both pumps.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    /// Resolves once nothing has moved for `limit`; never resolves for `None`.
    async fn idle_for(&self, limit: Option<Duration>) {
        let Some(limit) = limit else {
            return std::future::pending().await;
        };
        loop {
            let deadline = self.last() + limit;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}
