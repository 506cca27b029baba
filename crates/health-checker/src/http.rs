//! Minimal HTTP/1.1 client over async-net
//!
//! Probes talk plain HTTP to loopback services, so the client is a direct
//! request writer in the same style the rest of the stack speaks its wire
//! protocols: connect, send one `Connection: close` request, read the whole
//! response. Bodies are capped at 1 MiB.

use std::time::Duration;

use async_io::Timer;
use async_net::TcpStream;
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use futures_lite::future;
use thiserror::Error;

/// Maximum bytes of response body kept
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// HTTP probe failures
#[derive(Debug, Error)]
pub enum HttpError {
    /// TCP connect failed
    #[error("connection refused")]
    ConnectionRefused,
    /// Connect or read did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The peer answered with something that is not HTTP
    #[error("malformed HTTP response: {0}")]
    Malformed(String),
    /// Only plain http is probed; TLS endpoints are out of reach here
    #[error("https endpoints are not supported for local probes")]
    TlsUnsupported,
    /// Other socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code from the response line
    pub status: u16,
    /// Response body, possibly truncated at the cap
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 2xx or 3xx
    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Target of one probe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request path including any query
    pub path: String,
}

impl HttpTarget {
    /// Probe target on localhost
    pub fn localhost(port: u16, path: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            path: path.into(),
        }
    }

    /// Parse an endpoint declaration: either an absolute `http://` URL or a
    /// bare path resolved against `default_port` on localhost
    pub fn parse(endpoint: &str, default_port: u16) -> Result<Self, HttpError> {
        if endpoint.starts_with("https://") {
            return Err(HttpError::TlsUnsupported);
        }
        if let Some(rest) = endpoint.strip_prefix("http://") {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let (host, port) = match authority.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    port.parse::<u16>()
                        .map_err(|_| HttpError::Malformed(format!("bad port in '{}'", endpoint)))?,
                ),
                None => (authority.to_string(), 80),
            };
            return Ok(Self {
                host,
                port,
                path: path.to_string(),
            });
        }
        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        };
        Ok(Self::localhost(default_port, path))
    }

    /// Render the URL for reports
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Issue one request and read the full response within `timeout`
pub async fn request(
    method: &str,
    target: &HttpTarget,
    timeout: Duration,
) -> Result<HttpResponse, HttpError> {
    let io = async {
        let mut stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => HttpError::ConnectionRefused,
                _ => HttpError::Io(e),
            })?;

        let request = format!(
            "{} {} HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\nAccept: */*\r\nUser-Agent: azd-app/0.1\r\n\r\n",
            method, target.path, target.host, target.port
        );
        stream.write_all(request.as_bytes()).await?;

        // Connection: close lets us read to EOF, capped.
        let mut raw = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            if raw.len() > MAX_BODY_BYTES + 16 * 1024 {
                break;
            }
        }
        parse_response(&raw)
    };

    let deadline = async {
        Timer::after(timeout).await;
        Err(HttpError::Timeout(timeout))
    };

    future::or(io, deadline).await
}

fn parse_response(raw: &[u8]) -> Result<HttpResponse, HttpError> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| HttpError::Malformed("no header terminator".to_string()))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| HttpError::Malformed("non-utf8 headers".to_string()))?;

    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| HttpError::Malformed("empty response".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Malformed(format!(
            "bad status line '{}'",
            status_line
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| HttpError::Malformed(format!("bad status line '{}'", status_line)))?;

    let chunked = lines.any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with("transfer-encoding:") && lower.contains("chunked")
    });

    let mut body = raw[header_end + 4..].to_vec();
    if chunked {
        body = dechunk(&body);
    }
    body.truncate(MAX_BODY_BYTES);

    Ok(HttpResponse { status, body })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Best-effort chunked-transfer decoding; gives up on malformed framing
fn dechunk(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let Ok(size_str) = std::str::from_utf8(&rest[..line_end]) else {
            break;
        };
        let size_str = size_str.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let end = start + size;
        if end > rest.len() {
            out.extend_from_slice(&rest[start..]);
            break;
        }
        out.extend_from_slice(&rest[start..end]);
        // Skip the trailing CRLF of the chunk.
        rest = rest.get(end + 2..).unwrap_or_default();
    }
    out
}
