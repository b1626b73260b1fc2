use thiserror::Error;
use tokio::time::error::Elapsed;

/// Frame-codec failures (spec §4.1). One variant per distinct malformed-frame
/// condition so callers (and tests) can match on exactly what went wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header shorter than 2 bytes")]
    ShortHeader,

    #[error("reserved bits must be zero")]
    ReservedBitsSet,

    #[error("invalid opcode `{0:#x}`")]
    InvalidOpcode(u8),

    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFramePayloadTooLarge,

    #[error("buffer truncated while reading extended payload length")]
    TruncatedExtendedLength,

    #[error("64-bit payload length has its top bit set")]
    NonCanonicalLength64,

    #[error("mask bit set but fewer than 4 mask-key bytes present")]
    MissingMaskKey,

    #[error("advertised payload length exceeds remaining buffer")]
    PayloadTooShort,

    #[error("advertised payload length {0} exceeds the configured max frame size")]
    PayloadTooLarge(u64),
}

/// Errors surfaced while a [`crate::connection::Connection`] is attached to a
/// byte stream (spec §7, "Transport-level").
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection is not attached to a stream")]
    NotConnected,

    #[error("close already initiated")]
    CloseAlreadyInitiated,

    #[error("peer went away before completing the handshake")]
    StreamClosed,
}

/// Handshake validation failures (spec §4.3). The HTTP caller renders any of
/// these as a 4xx.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("method must be GET")]
    WrongMethod,

    #[error("Upgrade header must be `websocket`")]
    MissingUpgradeHeader,

    #[error("Connection header must contain `Upgrade`")]
    MissingConnectionHeader,

    #[error("Sec-WebSocket-Version must be 13")]
    UnsupportedVersion,

    #[error("Sec-WebSocket-Key header missing or empty")]
    MissingKey,

    #[error("Sec-WebSocket-Key does not base64-decode to 16 bytes")]
    InvalidKey,

    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),

    #[error("share_code query parameter missing")]
    MissingShareCode,

    #[error("share_code does not base64-decode to {expected} bytes")]
    InvalidShareCode { expected: usize },

    #[error("no share awaiting that code")]
    UnknownShareCode,

    #[error("I/O error during handshake: {0}")]
    Io(String),
}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        HandshakeError::Io(e.to_string())
    }
}

/// Application-codec decode failures (spec §4.4). One variant per opcode
/// body shape, matching the original `commonDecoding`/`decodeX` split.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppCodecError {
    #[error("blob shorter than opcode+version")]
    Empty,

    #[error("unknown opcode `{0:#x}`")]
    UnknownOpcode(u8),

    #[error("unsupported protocol version `{0}`, expected 0")]
    UnsupportedVersion(u8),

    #[error("expected opcode `{expected:#x}`, got `{actual:#x}`")]
    UnexpectedOpcode { expected: u8, actual: u8 },

    #[error("share code must be {expected} bytes, got {actual}")]
    BadShareCodeLen { expected: usize, actual: usize },

    #[error("public key must be {expected} bytes, got {actual}")]
    BadPublicKeyLen { expected: usize, actual: usize },

    #[error("metadata filename length must be at least 1")]
    EmptyFilename,

    #[error("metadata body truncated")]
    TruncatedMetadata,

    #[error("data-chunk body truncated")]
    TruncatedChunk,

    #[error("acknowledge body truncated")]
    TruncatedAcknowledge,

    #[error("error-reason bytes are not valid UTF-8")]
    NonUtf8Reason,

    #[error("error reason exceeds 65535 bytes")]
    ReasonTooLong,
}

/// Application-level faults during the share exchange (spec §7, "phase
/// mismatch"). These are the ones that get turned into an `error` opcode
/// blob and sent to whichever peer(s) are still connected.
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("connection fault: {0}")]
    Connection(ConnectionError),

    #[error("malformed application message: {0}")]
    Codec(#[from] AppCodecError),

    #[error("registry fault: {0}")]
    Registry(#[from] RegistryError),

    #[error("expected chunk index {expected}, got {actual}")]
    WrongChunkIndex { expected: u16, actual: u16 },

    #[error("expected acknowledge for index {expected}, got {actual}")]
    WrongAckIndex { expected: u16, actual: u16 },

    #[error("peer did not respond within the phase timeout")]
    PhaseTimeout,

    #[error("peer disconnected mid-exchange")]
    PeerGone,
}

impl From<Elapsed> for ShareError {
    fn from(_: Elapsed) -> Self {
        ShareError::PhaseTimeout
    }
}

/// A clean stream close is reported back as `PeerGone` instead of the
/// generic `Connection` variant, since the share state machine treats
/// "peer walked away" as its own fault category (spec §7).
impl From<ConnectionError> for ShareError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::StreamClosed => ShareError::PeerGone,
            other => ShareError::Connection(other),
        }
    }
}

/// Registry-level faults (spec §4.6).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no share awaiting a receiver under that code")]
    UnknownCode,

    #[error("failed to draw a unique share code after {0} attempts")]
    ExhaustedRetries(u32),
}
