//! First-chunk classification.
//!
//! Decides from the first bytes a client sends whether the connection is an
//! HTTP `CONNECT` tunnel or a plain HTTP request, and where it should go.
//!
//! | First chunk                          | Mode        | Destination            | Forwarded upstream        |
//! |--------------------------------------|-------------|------------------------|---------------------------|
//! | `CONNECT host:port HTTP/1.1 ...`     | `TlsTunnel` | `host:port` (443)      | bytes after the head only |
//! | `GET / HTTP/1.1\r\nHost: host ...`   | `PlainHttp` | `Host` header (80)     | the whole chunk           |
//! | anything without a usable target     | error       | none                   | nothing                   |

use std::fmt;

/// Default port for `CONNECT` targets without an explicit port.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Default port for plain HTTP requests whose `Host` has no port.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Upper bound on a `CONNECT` request head that spans several reads.
pub const MAX_REQUEST_HEAD_SIZE: usize = 8192;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// How a connection is forwarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Not classified yet.
    #[default]
    Unknown,
    /// Plain HTTP request, forwarded verbatim.
    PlainHttp,
    /// `CONNECT` tunnel, acknowledged with `200 OK` then relayed blindly.
    TlsTunnel,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Unknown => f.write_str("unknown"),
            Mode::PlainHttp => f.write_str("http"),
            Mode::TlsTunnel => f.write_str("tunnel"),
        }
    }
}

/// Upstream host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Hostname or IP literal, without IPv6 brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Classification of a connection's first chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequestHead {
    /// `PlainHttp` or `TlsTunnel`; never `Unknown`.
    pub mode: Mode,

    /// Where the connection goes.
    pub destination: Destination,

    /// Bytes already read from the client that must still reach upstream.
    ///
    /// For `PlainHttp` this is the entire chunk. For `TlsTunnel` it never
    /// contains any part of the `CONNECT` head, only bytes the client sent
    /// after the head's blank line.
    pub payload: Vec<u8>,

    /// Whether the head's terminating blank line was part of the chunk.
    pub head_complete: bool,
}

impl ParsedRequestHead {
    pub fn host(&self) -> &str {
        &self.destination.host
    }

    pub fn port(&self) -> u16 {
        self.destination.port
    }
}

/// Why a first chunk could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("empty request")]
    Empty,

    #[error("request head is not valid text")]
    NotText,

    #[error("CONNECT request without a target")]
    MissingConnectTarget,

    #[error("request without a Host header")]
    MissingHost,

    #[error("invalid authority `{0}`")]
    InvalidAuthority(String),

    #[error("request head exceeds {MAX_REQUEST_HEAD_SIZE} bytes")]
    HeadTooLarge,
}

/// Classify the first chunk read from a freshly accepted client.
///
/// # Errors
/// Returns a [`ClassificationError`] when no destination can be extracted.
/// There is no fallback host: the caller closes the connection.
pub fn parse_request_head(chunk: &[u8]) -> Result<ParsedRequestHead, ClassificationError> {
    if chunk.is_empty() {
        return Err(ClassificationError::Empty);
    }

    let head_end = find_head_end(chunk);
    let head = &chunk[..head_end.unwrap_or(chunk.len())];
    let text = std::str::from_utf8(head).map_err(|_| ClassificationError::NotText)?;
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut tokens = request_line.split(' ').filter(|t| !t.is_empty());

    if tokens.next() == Some("CONNECT") {
        if head_end.is_none() && chunk.len() > MAX_REQUEST_HEAD_SIZE {
            return Err(ClassificationError::HeadTooLarge);
        }
        let target = tokens
            .next()
            .ok_or(ClassificationError::MissingConnectTarget)?;
        let destination = parse_authority(
            target,
            DEFAULT_TUNNEL_PORT,
            ClassificationError::MissingConnectTarget,
        )?;
        return Ok(ParsedRequestHead {
            mode: Mode::TlsTunnel,
            destination,
            payload: head_end.map(|end| chunk[end..].to_vec()).unwrap_or_default(),
            head_complete: head_end.is_some(),
        });
    }

    let host = lines
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim())
        })
        .filter(|host| !host.is_empty())
        .ok_or(ClassificationError::MissingHost)?;

    let destination = parse_authority(host, DEFAULT_HTTP_PORT, ClassificationError::MissingHost)?;

    Ok(ParsedRequestHead {
        mode: Mode::PlainHttp,
        destination,
        payload: chunk.to_vec(),
        head_complete: head_end.is_some(),
    })
}

/// Offset just past the `\r\n\r\n` that ends an HTTP head, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Split `host[:port]` or `[v6]:port`, falling back to `default_port`.
fn parse_authority(
    authority: &str,
    default_port: u16,
    missing: ClassificationError,
) -> Result<Destination, ClassificationError> {
    let invalid = || ClassificationError::InvalidAuthority(authority.to_string());

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            // Bare IPv6 literal without brackets: ambiguous, reject.
            Some(_) => return Err(invalid()),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(missing);
    }

    let port = match port {
        None => default_port,
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(invalid)?,
    };

    Ok(Destination::new(host, port))
}
