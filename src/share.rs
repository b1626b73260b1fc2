//! The share state machine (spec §4.5): one task per accepted sender
//! handshake, driving the lockstep sender/receiver exchange from
//! `sender-init` through the final data chunk, then tearing the share down.

use crate::app::{self, AppMessage, METADATA_ACK_INDEX};
use crate::config::BrokerConfig;
use crate::connection::Connection;
use crate::error::ShareError;
use crate::registry::{Registry, ShareCode};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Runs one share to completion (success or failure) and always leaves the
/// registry and both Connections torn down on return.
pub async fn run_share<S>(
    sender: Connection<S>,
    registry: Arc<Registry<Connection<S>>>,
    config: BrokerConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err((reason, code, receiver)) = drive(&sender, &registry, &config).await {
        log::warn!("share faulted: {reason}");
        let error_blob = AppMessage::error(reason.clone()).encode();
        let _ = sender.send_blob(error_blob.clone()).await;
        let _ = sender.initiate_close().await;
        if let Some(receiver) = &receiver {
            let _ = receiver.send_blob(error_blob).await;
            let _ = receiver.initiate_close().await;
        }
        match code {
            Some(code) if receiver.is_some() => registry.remove_active(&code).await,
            Some(code) => registry.remove_awaiting(&code).await,
            None => {}
        }
        return;
    }
}

/// Returns `Ok(())` on the full successful run (closing both Connections
/// and removing the share from `active` itself), or `Err((reason, code,
/// receiver))` describing what to clean up.
async fn drive<S>(
    sender: &Connection<S>,
    registry: &Arc<Registry<Connection<S>>>,
    config: &BrokerConfig,
) -> Result<(), (String, Option<ShareCode>, Option<Connection<S>>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    macro_rules! fault {
        ($code:expr, $receiver:expr, $e:expr) => {
            return Err(($e.to_string(), $code, $receiver))
        };
    }

    // Phase 1: sender-init.
    if let Err(e) = recv_expect(sender, config, app::OP_SENDER_INIT).await {
        fault!(None, None, e);
    }

    // Phase 2: register the share and tell the sender its code.
    let receiver: Connection<S> = Connection::create(config.clone());
    let code = match registry.register_awaiting(receiver.clone()).await {
        Ok(code) => code,
        Err(e) => fault!(None, None, ShareError::from(e)),
    };
    if let Err(e) = sender
        .send_blob(AppMessage::SenderAccepted { share_code: code }.encode())
        .await
    {
        fault!(Some(code), None, e);
    }

    // Phase 3: wait for the receiver to claim the code and attach, then
    // read receiver-init.
    if tokio::time::timeout(config.phase_timeout, receiver.wait_until_connected())
        .await
        .is_err()
    {
        fault!(Some(code), None, ShareError::PhaseTimeout);
    }
    let (_, msg) = match recv_expect(&receiver, config, app::OP_RECEIVER_INIT).await {
        Ok(pair) => pair,
        Err(e) => fault!(Some(code), Some(receiver), e),
    };
    let public_key = match msg {
        AppMessage::ReceiverInit { public_key } => public_key,
        _ => unreachable!("decode_expecting guarantees the matching variant"),
    };

    // Phase 4 + 5.
    if let Err(e) = receiver.send_blob(AppMessage::ReceiverAccepted.encode()).await {
        fault!(Some(code), Some(receiver), e);
    }
    if let Err(e) = sender
        .send_blob(AppMessage::Ready { public_key }.encode())
        .await
    {
        fault!(Some(code), Some(receiver), e);
    }

    // Phase 6: metadata, forwarded verbatim.
    let (raw, msg) = match recv_expect(sender, config, app::OP_METADATA).await {
        Ok(pair) => pair,
        Err(e) => fault!(Some(code), Some(receiver), e),
    };
    let chunk_count = match msg {
        AppMessage::Metadata { chunk_count, .. } => chunk_count,
        _ => unreachable!("decode_expecting guarantees the matching variant"),
    };
    if let Err(e) = receiver.send_blob(raw).await {
        fault!(Some(code), Some(receiver), e);
    }

    // Phase 7: metadata acknowledge, forwarded verbatim.
    let (raw, msg) = match recv_expect(&receiver, config, app::OP_ACKNOWLEDGE).await {
        Ok(pair) => pair,
        Err(e) => fault!(Some(code), Some(receiver), e),
    };
    match msg {
        AppMessage::Acknowledge { index } if index == METADATA_ACK_INDEX => {}
        AppMessage::Acknowledge { index } => fault!(
            Some(code),
            Some(receiver),
            ShareError::WrongAckIndex {
                expected: METADATA_ACK_INDEX,
                actual: index
            }
        ),
        _ => unreachable!("decode_expecting guarantees the matching variant"),
    }
    if let Err(e) = sender.send_blob(raw).await {
        fault!(Some(code), Some(receiver), e);
    }

    // Phase 8: the data-chunk / acknowledge loop.
    for i in 0..chunk_count {
        let (raw, msg) = match recv_expect(sender, config, app::OP_DATA_CHUNK).await {
            Ok(pair) => pair,
            Err(e) => fault!(Some(code), Some(receiver), e),
        };
        match msg {
            AppMessage::DataChunk { index, .. } if index == i => {}
            AppMessage::DataChunk { index, .. } => fault!(
                Some(code),
                Some(receiver),
                ShareError::WrongChunkIndex {
                    expected: i,
                    actual: index
                }
            ),
            _ => unreachable!("decode_expecting guarantees the matching variant"),
        }
        if let Err(e) = receiver.send_blob(raw).await {
            fault!(Some(code), Some(receiver), e);
        }

        let (raw, msg) = match recv_expect(&receiver, config, app::OP_ACKNOWLEDGE).await {
            Ok(pair) => pair,
            Err(e) => fault!(Some(code), Some(receiver), e),
        };
        match msg {
            AppMessage::Acknowledge { index } if index == i => {}
            AppMessage::Acknowledge { index } => fault!(
                Some(code),
                Some(receiver),
                ShareError::WrongAckIndex {
                    expected: i,
                    actual: index
                }
            ),
            _ => unreachable!("decode_expecting guarantees the matching variant"),
        }
        if let Err(e) = sender.send_blob(raw).await {
            fault!(Some(code), Some(receiver), e);
        }
    }

    // Phase 9: clean teardown.
    let _ = sender.initiate_close().await;
    let _ = receiver.initiate_close().await;
    registry.remove_active(&code).await;
    Ok(())
}

/// Receives the next blob and requires its opcode to be `expected`,
/// reporting the actual opcode byte via `AppCodecError::UnexpectedOpcode`
/// on a mismatch instead of leaving the caller to fault on a wrong variant.
async fn recv_expect<S>(
    conn: &Connection<S>,
    config: &BrokerConfig,
    expected: u8,
) -> Result<(Vec<u8>, AppMessage), ShareError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let raw = conn.recv_blob_timeout(config.phase_timeout).await?;
    let msg = AppMessage::decode_expecting(&raw, expected)?;
    Ok((raw, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppMessage, PUBLIC_KEY_LEN};
    use crate::frame::{self, Frame, OpCode};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn cfg() -> BrokerConfig {
        let mut c = BrokerConfig::default();
        c.phase_timeout = Duration::from_secs(2);
        c.close_retry_interval = Duration::from_millis(20);
        c.close_give_up_interval = Duration::from_millis(60);
        c
    }

    async fn send_blob(stream: &mut tokio::io::DuplexStream, bytes: Vec<u8>) {
        let frame = Frame::masked(true, OpCode::Binary, [1, 2, 3, 4], bytes);
        stream.write_all(&frame::encode(&frame)).await.unwrap();
    }

    async fn recv_blob(stream: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        let len7 = header[1] & 0x7F;
        let len = if len7 == 126 {
            let mut b = [0u8; 2];
            stream.read_exact(&mut b).await.unwrap();
            u16::from_be_bytes(b) as usize
        } else {
            len7 as usize
        };
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    #[tokio::test]
    async fn happy_path_single_chunk_transfer() {
        let config = cfg();
        let (sender_io, mut sender_peer) = duplex(1 << 16);
        let sender = Connection::create(config.clone());
        sender.attach(sender_io).await;

        let registry = Arc::new(Registry::<Connection<tokio::io::DuplexStream>>::new());
        let registry_clone = registry.clone();
        let config_clone = config.clone();
        let task = tokio::spawn(async move {
            run_share(sender, registry_clone, config_clone).await;
        });

        send_blob(&mut sender_peer, AppMessage::SenderInit.encode()).await;

        let accepted = AppMessage::decode(&recv_blob(&mut sender_peer).await).unwrap();
        let code = match accepted {
            AppMessage::SenderAccepted { share_code } => share_code,
            other => panic!("expected sender-accepted, got {other:?}"),
        };

        let (receiver_io, mut receiver_peer) = duplex(1 << 16);
        let receiver_conn = registry.claim(&code).await.unwrap();
        receiver_conn.attach(receiver_io).await;

        let public_key = vec![7u8; PUBLIC_KEY_LEN];
        send_blob(
            &mut receiver_peer,
            AppMessage::ReceiverInit {
                public_key: public_key.clone(),
            }
            .encode(),
        )
        .await;

        let accepted = AppMessage::decode(&recv_blob(&mut receiver_peer).await).unwrap();
        assert!(matches!(accepted, AppMessage::ReceiverAccepted));

        let ready = AppMessage::decode(&recv_blob(&mut sender_peer).await).unwrap();
        match ready {
            AppMessage::Ready { public_key: pk } => assert_eq!(pk, public_key),
            other => panic!("expected ready, got {other:?}"),
        }

        send_blob(
            &mut sender_peer,
            AppMessage::Metadata {
                filename: "file".to_string(),
                chunk_count: 1,
            }
            .encode(),
        )
        .await;
        let forwarded = AppMessage::decode(&recv_blob(&mut receiver_peer).await).unwrap();
        assert!(matches!(forwarded, AppMessage::Metadata { .. }));

        send_blob(
            &mut receiver_peer,
            AppMessage::Acknowledge {
                index: METADATA_ACK_INDEX,
            }
            .encode(),
        )
        .await;
        let forwarded = AppMessage::decode(&recv_blob(&mut sender_peer).await).unwrap();
        assert!(matches!(
            forwarded,
            AppMessage::Acknowledge {
                index: METADATA_ACK_INDEX
            }
        ));

        send_blob(
            &mut sender_peer,
            AppMessage::DataChunk {
                index: 0,
                payload: b"abc".to_vec(),
            }
            .encode(),
        )
        .await;
        let forwarded = AppMessage::decode(&recv_blob(&mut receiver_peer).await).unwrap();
        assert!(matches!(forwarded, AppMessage::DataChunk { index: 0, .. }));

        send_blob(&mut receiver_peer, AppMessage::Acknowledge { index: 0 }.encode()).await;
        let forwarded = AppMessage::decode(&recv_blob(&mut sender_peer).await).unwrap();
        assert!(matches!(forwarded, AppMessage::Acknowledge { index: 0 }));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("share task to finish")
            .expect("share task to not panic");
    }

    #[tokio::test]
    async fn wrong_first_opcode_faults_the_share() {
        let config = cfg();
        let (sender_io, mut sender_peer) = duplex(1 << 16);
        let sender = Connection::create(config.clone());
        sender.attach(sender_io).await;

        let registry = Arc::new(Registry::<Connection<tokio::io::DuplexStream>>::new());
        let task = tokio::spawn(run_share(sender, registry, config));

        send_blob(
            &mut sender_peer,
            AppMessage::ReceiverInit {
                public_key: vec![0u8; PUBLIC_KEY_LEN],
            }
            .encode(),
        )
        .await;

        let error_blob = recv_blob(&mut sender_peer).await;
        let decoded = AppMessage::decode(&error_blob).unwrap();
        assert!(matches!(decoded, AppMessage::Error { .. }));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("share task to finish")
            .expect("share task to not panic");
    }

    #[tokio::test]
    async fn bad_chunk_order_faults_the_share() {
        let config = cfg();
        let (sender_io, mut sender_peer) = duplex(1 << 16);
        let sender = Connection::create(config.clone());
        sender.attach(sender_io).await;

        let registry = Arc::new(Registry::<Connection<tokio::io::DuplexStream>>::new());
        let registry_clone = registry.clone();
        let config_clone = config.clone();
        let task = tokio::spawn(run_share(sender, registry_clone, config_clone));

        send_blob(&mut sender_peer, AppMessage::SenderInit.encode()).await;
        let accepted = AppMessage::decode(&recv_blob(&mut sender_peer).await).unwrap();
        let code = match accepted {
            AppMessage::SenderAccepted { share_code } => share_code,
            other => panic!("expected sender-accepted, got {other:?}"),
        };

        let (receiver_io, mut receiver_peer) = duplex(1 << 16);
        let receiver_conn = registry.claim(&code).await.unwrap();
        receiver_conn.attach(receiver_io).await;

        send_blob(
            &mut receiver_peer,
            AppMessage::ReceiverInit {
                public_key: vec![0u8; PUBLIC_KEY_LEN],
            }
            .encode(),
        )
        .await;
        let _ = recv_blob(&mut receiver_peer).await; // receiver-accepted
        let _ = recv_blob(&mut sender_peer).await; // ready

        send_blob(
            &mut sender_peer,
            AppMessage::Metadata {
                filename: "f".to_string(),
                chunk_count: 2,
            }
            .encode(),
        )
        .await;
        let _ = recv_blob(&mut receiver_peer).await; // metadata forwarded
        send_blob(
            &mut receiver_peer,
            AppMessage::Acknowledge {
                index: METADATA_ACK_INDEX,
            }
            .encode(),
        )
        .await;
        let _ = recv_blob(&mut sender_peer).await; // meta-ack forwarded

        // Chunk index 1 sent first, should have been 0.
        send_blob(
            &mut sender_peer,
            AppMessage::DataChunk {
                index: 1,
                payload: b"x".to_vec(),
            }
            .encode(),
        )
        .await;

        let error_blob = recv_blob(&mut sender_peer).await;
        assert!(matches!(
            AppMessage::decode(&error_blob).unwrap(),
            AppMessage::Error { .. }
        ));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("share task to finish")
            .expect("share task to not panic");
    }
}
