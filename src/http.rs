//! Minimal HTTP/1.1 request-line-and-headers parser for the broker's two
//! endpoints. Reads one byte at a time until the blank line that ends the
//! headers, so the underlying stream is left positioned exactly on the first
//! byte after the handshake — unlike a `BufReader`, which may pull more bytes
//! off the socket than it hands back, this never strands WebSocket frame
//! bytes in a buffer the caller can't see.

use crate::error::HandshakeError;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Duration};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Reads and parses one HTTP request line plus headers (no body — the two
/// broker endpoints are bare `GET`s) off `stream`.
pub async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_bytes: usize,
) -> Result<Request, HandshakeError> {
    let raw = timeout(HEADER_READ_TIMEOUT, read_until_blank_line(stream, max_bytes))
        .await
        .map_err(|_| HandshakeError::MalformedRequest("timed out reading request headers".into()))??;

    let text = String::from_utf8(raw)
        .map_err(|_| HandshakeError::MalformedRequest("request is not valid UTF-8".into()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| HandshakeError::MalformedRequest("missing request line".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HandshakeError::MalformedRequest("missing HTTP method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| HandshakeError::MalformedRequest("missing request target".into()))?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), HashMap::new()),
    };

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
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

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => {
                map.insert(k.to_string(), v.to_string());
            }
            None => {
                map.insert(pair.to_string(), String::new());
            }
        }
    }
    map
}

async fn read_until_blank_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_bytes: usize,
) -> Result<Vec<u8>, HandshakeError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= max_bytes {
            return Err(HandshakeError::MalformedRequest(
                "request headers exceed the configured limit".into(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(HandshakeError::MalformedRequest(
                "connection closed before headers completed".into(),
            ));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            buf.truncate(buf.len() - 4);
            return Ok(buf);
        }
    }
}
