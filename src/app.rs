//! The nine-opcode application protocol carried inside binary-frame blobs
//! (spec §4.4). Every blob is `opcode(1) | version(1) | body`; all
//! multi-byte integers in the body are little-endian.

use crate::error::AppCodecError;

pub const PROTOCOL_VERSION: u8 = 0;
pub const SHARE_CODE_LEN: usize = 5;
pub const PUBLIC_KEY_LEN: usize = 512;
/// Acknowledge index meaning "this acknowledges the metadata blob", per the
/// resolved Open Question in spec §9 (full 16-bit all-ones, not 0xFF).
pub const METADATA_ACK_INDEX: u16 = 0xFFFF;

pub(crate) const OP_SENDER_INIT: u8 = 0x1;
pub(crate) const OP_SENDER_ACCEPTED: u8 = 0x2;
pub(crate) const OP_RECEIVER_INIT: u8 = 0x3;
pub(crate) const OP_RECEIVER_ACCEPTED: u8 = 0x4;
pub(crate) const OP_READY: u8 = 0x5;
pub(crate) const OP_METADATA: u8 = 0x6;
pub(crate) const OP_DATA_CHUNK: u8 = 0x7;
pub(crate) const OP_ACKNOWLEDGE: u8 = 0x8;
pub(crate) const OP_ERROR: u8 = 0x9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    SenderInit,
    SenderAccepted { share_code: [u8; SHARE_CODE_LEN] },
    ReceiverInit { public_key: Vec<u8> },
    ReceiverAccepted,
    Ready { public_key: Vec<u8> },
    Metadata { filename: String, chunk_count: u16 },
    DataChunk { index: u16, payload: Vec<u8> },
    Acknowledge { index: u16 },
    Error { reason: String },
}

impl AppMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            AppMessage::SenderInit => OP_SENDER_INIT,
            AppMessage::SenderAccepted { .. } => OP_SENDER_ACCEPTED,
            AppMessage::ReceiverInit { .. } => OP_RECEIVER_INIT,
            AppMessage::ReceiverAccepted => OP_RECEIVER_ACCEPTED,
            AppMessage::Ready { .. } => OP_READY,
            AppMessage::Metadata { .. } => OP_METADATA,
            AppMessage::DataChunk { .. } => OP_DATA_CHUNK,
            AppMessage::Acknowledge { .. } => OP_ACKNOWLEDGE,
            AppMessage::Error { .. } => OP_ERROR,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut blob = vec![self.opcode(), PROTOCOL_VERSION];
        match self {
            AppMessage::SenderInit | AppMessage::ReceiverAccepted => {}
            AppMessage::SenderAccepted { share_code } => blob.extend_from_slice(share_code),
            AppMessage::ReceiverInit { public_key } | AppMessage::Ready { public_key } => {
                blob.extend_from_slice(public_key)
            }
            AppMessage::Metadata {
                filename,
                chunk_count,
            } => {
                blob.push(filename.len() as u8);
                blob.extend_from_slice(filename.as_bytes());
                blob.extend_from_slice(&chunk_count.to_le_bytes());
            }
            AppMessage::DataChunk { index, payload } => {
                blob.extend_from_slice(&index.to_le_bytes());
                blob.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                blob.extend_from_slice(payload);
            }
            AppMessage::Acknowledge { index } => blob.extend_from_slice(&index.to_le_bytes()),
            AppMessage::Error { reason } => {
                let bytes = reason.as_bytes();
                blob.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                blob.extend_from_slice(bytes);
            }
        }
        blob
    }

    pub fn decode(blob: &[u8]) -> Result<Self, AppCodecError> {
        if blob.len() < 2 {
            return Err(AppCodecError::Empty);
        }
        let opcode = blob[0];
        let version = blob[1];
        if version != PROTOCOL_VERSION {
            return Err(AppCodecError::UnsupportedVersion(version));
        }
        let body = &blob[2..];

        match opcode {
            OP_SENDER_INIT => Ok(AppMessage::SenderInit),
            OP_SENDER_ACCEPTED => {
                if body.len() != SHARE_CODE_LEN {
                    return Err(AppCodecError::BadShareCodeLen {
                        expected: SHARE_CODE_LEN,
                        actual: body.len(),
                    });
                }
                let mut share_code = [0u8; SHARE_CODE_LEN];
                share_code.copy_from_slice(body);
                Ok(AppMessage::SenderAccepted { share_code })
            }
            OP_RECEIVER_INIT => {
                if body.len() != PUBLIC_KEY_LEN {
                    return Err(AppCodecError::BadPublicKeyLen {
                        expected: PUBLIC_KEY_LEN,
                        actual: body.len(),
                    });
                }
                Ok(AppMessage::ReceiverInit {
                    public_key: body.to_vec(),
                })
            }
            OP_RECEIVER_ACCEPTED => Ok(AppMessage::ReceiverAccepted),
            OP_READY => {
                if body.len() != PUBLIC_KEY_LEN {
                    return Err(AppCodecError::BadPublicKeyLen {
                        expected: PUBLIC_KEY_LEN,
                        actual: body.len(),
                    });
                }
                Ok(AppMessage::Ready {
                    public_key: body.to_vec(),
                })
            }
            OP_METADATA => {
                if body.is_empty() {
                    return Err(AppCodecError::TruncatedMetadata);
                }
                let filename_len = body[0] as usize;
                if filename_len == 0 {
                    return Err(AppCodecError::EmptyFilename);
                }
                let min_len = 1 + filename_len + 2;
                if body.len() < min_len {
                    return Err(AppCodecError::TruncatedMetadata);
                }
                let filename = String::from_utf8(body[1..1 + filename_len].to_vec())
                    .map_err(|_| AppCodecError::TruncatedMetadata)?;
                let count_bytes = &body[1 + filename_len..1 + filename_len + 2];
                let chunk_count = u16::from_le_bytes([count_bytes[0], count_bytes[1]]);
                Ok(AppMessage::Metadata {
                    filename,
                    chunk_count,
                })
            }
            OP_DATA_CHUNK => {
                if body.len() < 4 {
                    return Err(AppCodecError::TruncatedChunk);
                }
                let index = u16::from_le_bytes([body[0], body[1]]);
                let payload_len = u16::from_le_bytes([body[2], body[3]]) as usize;
                if body[4..].len() < payload_len {
                    return Err(AppCodecError::TruncatedChunk);
                }
                Ok(AppMessage::DataChunk {
                    index,
                    payload: body[4..4 + payload_len].to_vec(),
                })
            }
            OP_ACKNOWLEDGE => {
                if body.len() < 2 {
                    return Err(AppCodecError::TruncatedAcknowledge);
                }
                let index = u16::from_le_bytes([body[0], body[1]]);
                Ok(AppMessage::Acknowledge { index })
            }
            OP_ERROR => {
                if body.len() < 2 {
                    return Err(AppCodecError::TruncatedMetadata);
                }
                let reason_len = u16::from_le_bytes([body[0], body[1]]) as usize;
                if body[2..].len() < reason_len {
                    return Err(AppCodecError::TruncatedMetadata);
                }
                let reason = String::from_utf8(body[2..2 + reason_len].to_vec())
                    .map_err(|_| AppCodecError::NonUtf8Reason)?;
                Ok(AppMessage::Error { reason })
            }
            other => Err(AppCodecError::UnknownOpcode(other)),
        }
    }

    /// Decodes `blob`, first checking its opcode byte against `expected`.
    /// Lets a caller that knows which message should come next (the share
    /// state machine, phase by phase) get the actual opcode back on a
    /// mismatch instead of pattern-matching the decoded variant itself.
    pub fn decode_expecting(blob: &[u8], expected: u8) -> Result<Self, AppCodecError> {
        match blob.first() {
            Some(&actual) if actual != expected => {
                Err(AppCodecError::UnexpectedOpcode { expected, actual })
            }
            Some(_) => Self::decode(blob),
            None => Err(AppCodecError::Empty),
        }
    }

    /// Builds an `error` blob, failing if `reason` exceeds the 65,535-byte
    /// wire limit for the field.
    pub fn try_error(reason: impl Into<String>) -> Result<Self, AppCodecError> {
        let reason = reason.into();
        if reason.len() > u16::MAX as usize {
            return Err(AppCodecError::ReasonTooLong);
        }
        Ok(AppMessage::Error { reason })
    }

    /// Builds an `error` blob, truncating the reason to 65,535 bytes per
    /// spec §7 instead of failing — the broker's own fault report must
    /// always be sendable.
    pub fn error(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::try_error(reason.clone()).unwrap_or_else(|_| {
            let mut reason = reason;
            reason.truncate(u16::MAX as usize);
            while !reason.is_char_boundary(reason.len()) {
                reason.pop();
            }
            AppMessage::Error { reason }
        })
    }
}
