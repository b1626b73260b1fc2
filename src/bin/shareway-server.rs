//! Runnable broker: binds a `TcpListener` on the two configured paths and
//! spawns one share task per accepted sender, matching the teacher's own
//! bare-`TcpListener` accept loop (no external HTTP framework).
//!
//! Routing happens before the WebSocket upgrade commits: an unknown or
//! malformed `share_code` gets a plain HTTP 4xx, never a 101 response.

use shareway::config::BrokerConfig;
use shareway::connection::Connection;
use shareway::error::HandshakeError;
use shareway::http::{self, Request};
use shareway::handshake;
use shareway::registry::Registry;
use shareway::share::run_share;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

type ShareRegistry = Registry<Connection<TcpStream>>;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = BrokerConfig::default();
    let registry: Arc<ShareRegistry> = Arc::new(Registry::new());

    let addr = std::env::var("SHAREWAY_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let listener = TcpListener::bind(&addr).await?;
    log::info!("shareway listening on {addr}");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let config = config.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, config, registry).await {
                log::warn!("connection from {peer_addr} failed: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    config: BrokerConfig,
    registry: Arc<ShareRegistry>,
) -> Result<(), HandshakeError> {
    let req = http::read_request(&mut stream, config.max_header_bytes).await?;

    if req.path == config.sender_path {
        let stream = upgrade(stream, &req).await?;
        let sender = Connection::create(config.clone());
        sender.attach(stream).await;
        tokio::spawn(run_share(sender, registry, config));
        return Ok(());
    }

    if req.path == config.receiver_path {
        let share_code = match decode_share_code(&req, &config) {
            Ok(code) => code,
            Err(e) => {
                write_status(&mut stream, 400, "Bad Request").await;
                return Err(e);
            }
        };
        let receiver = match registry.claim(&share_code).await {
            Ok(receiver) => receiver,
            Err(_) => {
                write_status(&mut stream, 404, "Not Found").await;
                return Err(HandshakeError::UnknownShareCode);
            }
        };
        let stream = upgrade(stream, &req).await?;
        receiver.attach(stream).await;
        return Ok(());
    }

    write_status(&mut stream, 404, "Not Found").await;
    Err(HandshakeError::MalformedRequest(format!("no such path: {}", req.path)))
}

async fn upgrade(mut stream: TcpStream, req: &Request) -> Result<TcpStream, HandshakeError> {
    let key = handshake::validate_upgrade_request(req)?;
    let accept_key = handshake::compute_accept_key(key)?;
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(stream)
}

async fn write_status(stream: &mut TcpStream, code: u16, reason: &str) {
    let response = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\n\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
}

fn decode_share_code(req: &Request, config: &BrokerConfig) -> Result<[u8; 5], HandshakeError> {
    use base64::prelude::*;

    let raw = req.query.get("share_code").ok_or(HandshakeError::MissingShareCode)?;
    let decoded = BASE64_STANDARD
        .decode(raw)
        .map_err(|_| HandshakeError::InvalidShareCode {
            expected: config.share_code_len,
        })?;
    if decoded.len() != config.share_code_len {
        return Err(HandshakeError::InvalidShareCode {
            expected: config.share_code_len,
        });
    }
    let mut code = [0u8; 5];
    code.copy_from_slice(&decoded);
    Ok(code)
}
