//! The RFC 6455 opening handshake: validate the four upgrade headers,
//! compute `Sec-WebSocket-Accept`, and write the `101 Switching Protocols`
//! response. Once this returns, the stream is handed to a
//! [`crate::connection::Connection`] as a plain binary-frame transport.

use crate::config::BrokerConfig;
use crate::error::HandshakeError;
use crate::http::{self, Request};
use base64::prelude::*;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Validates method + the four required upgrade headers, returning the raw
/// `Sec-WebSocket-Key` value on success.
pub fn validate_upgrade_request(req: &Request) -> Result<&str, HandshakeError> {
    if req.method != "GET" {
        return Err(HandshakeError::WrongMethod);
    }
    let upgrade = req.header("upgrade").ok_or(HandshakeError::MissingUpgradeHeader)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::MissingUpgradeHeader);
    }
    let connection = req
        .header("connection")
        .ok_or(HandshakeError::MissingConnectionHeader)?;
    if !connection
        .split(',')
        .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::MissingConnectionHeader);
    }
    let version = req.header("sec-websocket-version").unwrap_or("");
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion);
    }
    let key = req.header("sec-websocket-key").ok_or(HandshakeError::MissingKey)?;
    if key.is_empty() {
        return Err(HandshakeError::MissingKey);
    }
    Ok(key)
}

/// `base64(SHA1(client_key + GUID))`, per RFC 6455 §1.3. Rejects keys that
/// don't base64-decode to exactly 16 bytes, the one shape constraint the RFC
/// places on the key.
pub fn compute_accept_key(client_key: &str) -> Result<String, HandshakeError> {
    let decoded = BASE64_STANDARD
        .decode(client_key)
        .map_err(|_| HandshakeError::InvalidKey)?;
    if decoded.len() != 16 {
        return Err(HandshakeError::InvalidKey);
    }
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    Ok(BASE64_STANDARD.encode(hasher.finalize()))
}

async fn write_switching_protocols<W: AsyncWrite + Unpin>(
    writer: &mut W,
    accept_key: &str,
) -> Result<(), HandshakeError> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    );
    writer.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Reads the HTTP request off `stream`, validates it as a WebSocket upgrade,
/// and writes the `101` response. Returns the stream (now positioned right
/// after the handshake bytes) together with the parsed request, so the
/// caller can route on `req.path`/`req.query` before attaching a
/// [`crate::connection::Connection`].
pub async fn accept<S>(mut stream: S, config: &BrokerConfig) -> Result<(S, Request), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = http::read_request(&mut stream, config.max_header_bytes).await?;
    let key = validate_upgrade_request(&req)?;
    let accept_key = compute_accept_key(key)?;
    write_switching_protocols(&mut stream, &accept_key).await?;
    Ok((stream, req))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{duplex, AsyncReadExt};

    fn req(method: &str, headers: &[(&str, &str)]) -> Request {
        let mut h = HashMap::new();
        for (k, v) in headers {
            h.insert(k.to_ascii_lowercase(), v.to_string());
        }
        Request {
            method: method.to_string(),
            path: "/send".to_string(),
            query: HashMap::new(),
            headers: h,
        }
    }

    fn valid_headers() -> Vec<(&'static str, &'static str)> {
        vec![
            ("upgrade", "websocket"),
            ("connection", "Upgrade"),
            ("sec-websocket-version", "13"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]
    }

    #[test]
    fn valid_request_passes_validation() {
        let r = req("GET", &valid_headers());
        assert_eq!(validate_upgrade_request(&r).unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn non_get_method_is_rejected() {
        let r = req("POST", &valid_headers());
        assert!(matches!(
            validate_upgrade_request(&r),
            Err(HandshakeError::WrongMethod)
        ));
    }

    #[test]
    fn missing_upgrade_header_is_rejected() {
        let headers: Vec<_> = valid_headers().into_iter().filter(|(k, _)| *k != "upgrade").collect();
        let r = req("GET", &headers);
        assert!(matches!(
            validate_upgrade_request(&r),
            Err(HandshakeError::MissingUpgradeHeader)
        ));
    }

    #[test]
    fn connection_header_without_upgrade_token_is_rejected() {
        let mut headers = valid_headers();
        headers.retain(|(k, _)| *k != "connection");
        headers.push(("connection", "keep-alive"));
        let r = req("GET", &headers);
        assert!(matches!(
            validate_upgrade_request(&r),
            Err(HandshakeError::MissingConnectionHeader)
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut headers = valid_headers();
        headers.retain(|(k, _)| *k != "sec-websocket-version");
        headers.push(("sec-websocket-version", "8"));
        let r = req("GET", &headers);
        assert!(matches!(
            validate_upgrade_request(&r),
            Err(HandshakeError::UnsupportedVersion)
        ));
    }

    #[test]
    fn known_rfc6455_example_computes_expected_accept_key() {
        // The worked example from RFC 6455 §1.3.
        let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn key_not_16_bytes_is_rejected() {
        assert!(matches!(
            compute_accept_key("dG9vc2hvcnQ="),
            Err(HandshakeError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn accept_writes_101_response_and_returns_request() {
        let (a, mut b) = duplex(8192);
        let raw = format!(
            "GET /send HTTP/1.1\r\n\
             Host: example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n"
        );
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            b.write_all(raw.as_bytes()).await.unwrap();
            b
        });

        let config = BrokerConfig::default();
        let (mut stream, req) = accept(a, &config).await.unwrap();
        assert_eq!(req.path, "/send");

        let mut response = vec![0u8; 129];
        stream.read_exact(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        drop(writer);
    }
}
