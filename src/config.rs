use std::time::Duration;

/// Tunables for the broker. Mirrors the shape of a typical websocket
/// library's config struct (one place for every timeout/limit instead of
/// scattering magic numbers through the state machine).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long to wait before resending a close frame once `initiateClose`
    /// has fired.
    pub close_retry_interval: Duration,
    /// How long to wait for the peer to finish the close handshake before
    /// forcing the stream shut.
    pub close_give_up_interval: Duration,
    /// Bound on every blocking receive the share state machine performs.
    /// A stalled peer faults the share instead of hanging it forever.
    pub phase_timeout: Duration,
    /// Cap on the bytes read while looking for the end of the HTTP
    /// handshake request, to bound a slow/malicious client.
    pub max_header_bytes: usize,
    /// Cap on a single frame's advertised payload length. Checked before
    /// the payload buffer is allocated, so a forged extended-length header
    /// can't force a multi-exabyte allocation.
    pub max_frame_bytes: usize,
    /// Bound on the read of a frame's payload bytes once the header has
    /// been parsed, so a peer that completes the handshake and then stalls
    /// mid-frame can't hold a read task open forever.
    pub frame_read_timeout: Duration,
    /// Length in bytes of a share code. Fixed by the wire format (5), but
    /// kept as a named constant rather than a literal scattered around.
    pub share_code_len: usize,
    /// URL path the sender connects to.
    pub sender_path: String,
    /// URL path the receiver connects to.
    pub receiver_path: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            close_retry_interval: Duration::from_secs(2),
            close_give_up_interval: Duration::from_secs(30),
            phase_timeout: Duration::from_secs(30),
            max_header_bytes: 16 * 1024,
            max_frame_bytes: 16 << 20,
            frame_read_timeout: Duration::from_secs(5),
            share_code_len: 5,
            sender_path: "/send".to_string(),
            receiver_path: "/receive".to_string(),
        }
    }
}
