//! Owns one bidirectional byte stream for the lifetime of a peer's
//! participation in a share: a dedicated read task that dispatches frames,
//! a write side serialized behind a mutex, and the two-phase close
//! handshake with its retry/give-up timers (spec §4.2).

use crate::config::BrokerConfig;
use crate::error::ConnectionError;
use crate::frame::{self, Frame, OpCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

type InboundItem = Result<Vec<u8>, ConnectionError>;

struct Shared<S> {
    write: Mutex<Option<WriteHalf<S>>>,
    connected: AtomicBool,
    closing: AtomicBool,
    notify: Notify,
    config: BrokerConfig,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Shared<S>
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        let mut guard = self.write.lock().await;
        let write_half = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
        write_half.write_all(&frame::encode(frame)).await?;
        Ok(())
    }

    async fn force_shutdown(&self) {
        if let Some(mut write_half) = self.write.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        if let Some(handle) = self.read_task.lock().await.take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// A handle to one peer's transport connection. Cheap to clone — internally
/// an `Arc` over the shared read/write/lifecycle state, so both the share
/// task and the read task it spawns can hold a reference.
pub struct Connection<S> {
    shared: Arc<Shared<S>>,
    inbound_rx: Arc<Mutex<Receiver<InboundItem>>>,
    inbound_tx: Sender<InboundItem>,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Connection {
            shared: self.shared.clone(),
            inbound_rx: self.inbound_rx.clone(),
            inbound_tx: self.inbound_tx.clone(),
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// A new, unattached Connection. No stream, no read task yet.
    pub fn create(config: BrokerConfig) -> Self {
        let (tx, rx) = channel(32);
        Connection {
            shared: Arc::new(Shared {
                write: Mutex::new(None),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                notify: Notify::new(),
                config,
                read_task: Mutex::new(None),
            }),
            inbound_rx: Arc::new(Mutex::new(rx)),
            inbound_tx: tx,
        }
    }

    /// Associates this Connection with a byte stream, starts the read
    /// task, and transitions to `connected`.
    pub async fn attach(&self, stream: S) {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.shared.write.lock().await = Some(write_half);

        let shared = self.shared.clone();
        let tx = self.inbound_tx.clone();
        let handle = tokio::spawn(async move {
            read_loop(read_half, tx, shared).await;
        });
        *self.shared.read_task.lock().await = Some(handle);

        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Blocks until `connected` is true; returns immediately if already.
    pub async fn wait_until_connected(&self) {
        loop {
            if self.shared.connected.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.shared.notify.notified();
            if self.shared.connected.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Encodes `bytes` as a single unmasked binary frame and writes it.
    /// Fails if not connected or if closing.
    pub async fn send_blob(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.is_connected() || self.is_closing() {
            return Err(ConnectionError::NotConnected);
        }
        let frame = Frame::unmasked(true, OpCode::Binary, bytes);
        self.shared.write_frame(&frame).await
    }

    /// Sends a close frame, marks `closing`, and arms the retry/give-up
    /// timers. Idempotent-rejecting: a second call errors.
    pub async fn initiate_close(&self) -> Result<(), ConnectionError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::CloseAlreadyInitiated);
        }

        let close_frame = Frame::unmasked(true, OpCode::Close, Vec::new());
        // Write errors here are best-effort: the peer may already be gone.
        let _ = self.shared.write_frame(&close_frame).await;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            close_timer(shared).await;
        });
        Ok(())
    }

    /// The only sink for application payloads: the ordered payloads of
    /// binary frames that arrived on this connection. Blocks up to `dur`;
    /// on timeout, on the channel closing, or on a decode error raised by
    /// the read task, returns an error.
    pub async fn recv_blob_timeout(
        &self,
        dur: std::time::Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        let mut rx = self.inbound_rx.lock().await;
        match timeout(dur, rx.recv()).await {
            Ok(Some(Ok(blob))) => Ok(blob),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(ConnectionError::StreamClosed),
            Err(_) => Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for a blob",
            ))),
        }
    }
}

async fn close_timer<S>(shared: Arc<Shared<S>>)
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    tokio::time::sleep(shared.config.close_retry_interval).await;
    if shared.connected.load(Ordering::SeqCst) {
        let frame = Frame::unmasked(true, OpCode::Close, Vec::new());
        let _ = shared.write_frame(&frame).await;
    }

    let remaining = shared
        .config
        .close_give_up_interval
        .saturating_sub(shared.config.close_retry_interval);
    tokio::time::sleep(remaining).await;
    if shared.connected.load(Ordering::SeqCst) {
        shared.force_shutdown().await;
    }
}

async fn read_one_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &BrokerConfig,
) -> Result<Frame, ConnectionError> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = (header[0] & 0b1000_0000) != 0;
    if header[0] & 0b0111_0000 != 0 {
        return Err(ConnectionError::Frame(crate::error::FrameError::ReservedBitsSet));
    }
    let opcode = OpCode::from_u8(header[0] & 0b0000_1111)
        .map_err(ConnectionError::Frame)?;

    if !fin && opcode.is_control() {
        return Err(ConnectionError::Frame(
            crate::error::FrameError::FragmentedControlFrame,
        ));
    }

    let masked = (header[1] & 0b1000_0000) != 0;
    let len7 = header[1] & 0b0111_1111;

    if len7 > 125 && opcode.is_control() {
        return Err(ConnectionError::Frame(
            crate::error::FrameError::ControlFramePayloadTooLarge,
        ));
    }

    let payload_len: u64 = if len7 == 127 {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes).await?;
        let len = u64::from_be_bytes(bytes);
        if len & (1 << 63) != 0 {
            return Err(ConnectionError::Frame(
                crate::error::FrameError::NonCanonicalLength64,
            ));
        }
        len
    } else if len7 == 126 {
        let mut bytes = [0u8; 2];
        reader.read_exact(&mut bytes).await?;
        u16::from_be_bytes(bytes) as u64
    } else {
        len7 as u64
    };

    if payload_len > config.max_frame_bytes as u64 {
        return Err(ConnectionError::Frame(
            crate::error::FrameError::PayloadTooLarge(payload_len),
        ));
    }

    let mask_key = if masked {
        let mut bytes = [0u8; 4];
        reader.read_exact(&mut bytes).await?;
        Some(bytes)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    // Bounds a peer that completes the handshake, sends a header, then
    // stalls indefinitely mid-frame.
    match timeout(config.frame_read_timeout, reader.read_exact(&mut payload)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out reading frame payload",
            )))
        }
    }

    if let Some(mask) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        mask_key,
        payload,
    })
}

async fn read_loop<S>(mut read_half: ReadHalf<S>, tx: Sender<InboundItem>, shared: Arc<Shared<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match read_one_frame(&mut read_half, &shared.config).await {
            Ok(frame) => match frame.opcode {
                OpCode::Binary => {
                    if tx.send(Ok(frame.payload)).await.is_err() {
                        break;
                    }
                }
                OpCode::Ping => {
                    let pong = Frame::unmasked(true, OpCode::Pong, frame.payload);
                    if shared.write_frame(&pong).await.is_err() {
                        break;
                    }
                }
                OpCode::Pong => {
                    // Absorbed; nothing to do.
                }
                OpCode::Close => {
                    let already_closing = shared.closing.swap(true, Ordering::SeqCst);
                    if !already_closing {
                        let reply = Frame::unmasked(true, OpCode::Close, Vec::new());
                        let _ = shared.write_frame(&reply).await;
                    }
                    break;
                }
                OpCode::Text | OpCode::Continuation => {
                    // Not used by the application; ignored per spec §4.2.
                }
            },
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.notify.notify_waiters();
}
