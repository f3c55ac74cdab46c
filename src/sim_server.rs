//! Stand-in HTTP endpoint for rehearsing migrations.
//!
//! Speaks just enough HTTP/1.1 to accept the upload POST: the request body is
//! drained, a randomized delay is slept, and the reply is the same JSON shape
//! the real endpoint uses, with a populated `Errors` array at the configured
//! rate. One request per connection.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::simulate::{SimulationProfile, SIMULATED_ERROR};

const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Serialize)]
struct SimResponse {
    #[serde(rename = "Response")]
    response: bool,
    #[serde(rename = "Errors")]
    errors: Vec<String>,
}

/// Request line and body size of one parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body_len: usize,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Target without its query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }
}

pub struct SimulationServer {
    listener: TcpListener,
    profile: SimulationProfile,
}

impl SimulationServer {
    pub async fn bind(addr: impl ToSocketAddrs, profile: SimulationProfile) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, profile })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Base URL uploads should be posted to.
    pub fn url(&self) -> io::Result<String> {
        Ok(format!("http://{}/", self.local_addr()?))
    }

    /// Serves until `cancel` fires, then waits for open connections to close.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "simulation endpoint listening");
        let rng = Arc::new(Mutex::new(self.profile.rng()));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let profile = self.profile.clone();
                    let rng = rng.clone();
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, &profile, &rng, &cancel).await {
                            debug!(%peer, "connection error: {e}");
                        }
                    });
                }
            }
            // Reap finished connections so the set does not grow unbounded
            while connections.try_join_next().is_some() {}
        }

        connections.shutdown().await;
        info!("simulation endpoint stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    profile: &SimulationProfile,
    rng: &Mutex<StdRng>,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };

    if request.path() != "/" {
        return write_response(&mut stream, 404, "{}").await;
    }
    if request.method != "POST" {
        return write_response(&mut stream, 405, "{}").await;
    }

    let (delay, rejected) = {
        let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
        profile.draw(&mut rng)
    };

    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = tokio::time::sleep(delay) => {}
    }

    let errors = if rejected {
        info!(bytes = request.body_len, "simulated error");
        vec![SIMULATED_ERROR.to_string()]
    } else {
        Vec::new()
    };
    let body = serde_json::to_string(&SimResponse {
        response: true,
        errors,
    })
    .map_err(io::Error::other)?;

    write_response(&mut stream, 200, &body).await
}

/// Reads one request head and drains its body (fixed length or chunked).
///
/// Returns `None` when the peer closed the connection before sending anything.
pub async fn read_request(stream: &mut TcpStream) -> io::Result<Option<RequestHead>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];

    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    let mut request = RequestHead {
        method,
        target,
        headers,
        body_len: 0,
    };

    let chunked = request
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    let content_length = match request.header("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        None => 0,
    };

    let pending = buf[head_end..].to_vec();
    request.body_len = if chunked {
        drain_chunked(stream, pending).await?
    } else {
        let mut body_len = pending.len();
        while body_len < content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            body_len += n;
        }
        body_len
    };

    Ok(Some(request))
}

/// Consumes a chunked body, returning the decoded payload length.
async fn drain_chunked(stream: &mut TcpStream, mut pending: Vec<u8>) -> io::Result<usize> {
    let mut chunk = [0u8; 8192];
    let mut payload = 0usize;

    loop {
        let line_end = loop {
            if let Some(pos) = find(&pending, b"\r\n") {
                break pos;
            }
            if pending.len() > MAX_HEAD_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk size line too long"));
            }
            read_more(stream, &mut pending, &mut chunk).await?;
        };

        let size = {
            let line = String::from_utf8_lossy(&pending[..line_end]);
            let digits = line.split(';').next().unwrap_or_default().trim();
            usize::from_str_radix(digits, 16)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        };
        pending.drain(..line_end + 2);

        if size == 0 {
            // Trailer section, terminated by an empty line
            loop {
                if pending.starts_with(b"\r\n") || find(&pending, b"\r\n\r\n").is_some() {
                    return Ok(payload);
                }
                if pending.len() > MAX_HEAD_BYTES {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "trailers too large"));
                }
                read_more(stream, &mut pending, &mut chunk).await?;
            }
        }

        // Chunk data plus its CRLF
        let mut remaining = size
            .checked_add(2)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "chunk size overflow"))?;
        loop {
            let take = remaining.min(pending.len());
            pending.drain(..take);
            remaining -= take;
            if remaining == 0 {
                break;
            }
            read_more(stream, &mut pending, &mut chunk).await?;
        }
        payload = payload.saturating_add(size);
    }
}

async fn read_more(stream: &mut TcpStream, pending: &mut Vec<u8>, chunk: &mut [u8]) -> io::Result<()> {
    let n = stream.read(chunk).await?;
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    pending.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Writes a complete JSON response and closes the write half.
pub async fn write_response(stream: &mut TcpStream, status: u16, body: &str) -> io::Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
