//! Hand-written HTTP/1.1 request handling for the dashboard listener

use std::collections::HashMap;

use async_net::TcpStream;
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound on a request head; anything bigger is rejected
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// A parsed request head
#[derive(Debug)]
pub struct Request {
    /// Request method, uppercased
    pub method: String,
    /// Request path without query string
    pub path: String,
    /// Decoded query parameters
    pub query: HashMap<String, String>,
    /// Header map, keys lowercased
    pub headers: HashMap<String, String>,
}

impl Request {
    /// Whether this request asks for a WebSocket upgrade
    pub fn wants_upgrade(&self) -> bool {
        self.headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// The client's WebSocket handshake key, if present
    pub fn websocket_key(&self) -> Option<&str> {
        self.headers.get("sec-websocket-key").map(String::as_str)
    }
}

/// Read and parse the request head from a fresh connection
pub async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            )));
        }
    }

    let head_end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ))
        })?;
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_ascii_uppercase();
    let target = parts.next().unwrap_or("/");
    let (path, raw_query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query)),
        None => (target.to_string(), None),
    };

    let mut query = HashMap::new();
    if let Some(raw) = raw_query {
        for pair in raw.split('&') {
            match pair.split_once('=') {
                Some((k, v)) => query.insert(k.to_string(), v.to_string()),
                None => query.insert(pair.to_string(), String::new()),
            };
        }
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(Request {
        method,
        path,
        query,
        headers,
    })
}

/// Write a JSON response and flush
pub async fn write_json(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body).await
}

/// Write an HTML response and flush
pub async fn write_html(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "text/html; charset=utf-8", body).await
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &str,
) -> Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Complete the server side of the WebSocket handshake
pub async fn accept_websocket(
    mut stream: TcpStream,
    key: &str,
) -> Result<async_tungstenite::WebSocketStream<TcpStream>> {
    let accept = tungstenite::handshake::derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(async_tungstenite::WebSocketStream::from_raw_socket(
        stream,
        tungstenite::protocol::Role::Server,
        None,
    )
    .await)
}
