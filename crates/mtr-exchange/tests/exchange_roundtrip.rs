//! Exchange-layer behavior over a captured loopback channel.
//!
//! Packets the manager emits are collected by the test channel; inbound
//! packets are hand-crafted plaintext (unsecured session) so every byte is
//! under test control.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use mtr_exchange::{
    ChannelError, CloseCause, Crypto, CryptoError, Exchange, ExchangeConfig, ExchangeError,
    ExchangeManager, NodeId, PacketChannel, ProtocolHandler, SessionManager,
};
use mtr_proto::{
    DestinationId, PacketHeader, PayloadHeader, SecurityFlags, SessionType,
    secure_channel_opcode,
};
use tokio::sync::mpsc;

const TEST_PROTOCOL: u16 = 0xfff0;
const LOCAL_NODE: u64 = 0xa;
const PEER_NODE: u64 = 0xb;

// ---------------------------------------------------------------------------
// Test plumbing
// ---------------------------------------------------------------------------

struct NullCrypto;

impl Crypto for NullCrypto {
    fn encrypt(&self, _key: &[u8], _nonce: &[u8; 13], _aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut out = plaintext.to_vec();
        out.extend_from_slice(&[0u8; 16]);
        out
    }

    fn decrypt(
        &self,
        _key: &[u8],
        _nonce: &[u8; 13],
        _aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < 16 {
            return Err(CryptoError::TooShort);
        }
        Ok(ciphertext[..ciphertext.len() - 16].to_vec())
    }
}

/// Outbound packets land in an unbounded queue the test drains.
struct CaptureChannel {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl PacketChannel for CaptureChannel {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        self.tx.send(data).map_err(|_| ChannelError::Closed)
    }

    fn label(&self) -> String {
        "capture".to_owned()
    }
}

/// A channel that swallows everything (peer never answers).
struct BlackholeChannel;

#[async_trait]
impl PacketChannel for BlackholeChannel {
    async fn send(&self, _data: Bytes) -> Result<(), ChannelError> {
        Ok(())
    }

    fn label(&self) -> String {
        "blackhole".to_owned()
    }
}

/// Counts deliveries; optionally closes the exchange right away.
struct CountingHandler {
    delivered: AtomicUsize,
    close_immediately: bool,
}

#[async_trait]
impl ProtocolHandler for CountingHandler {
    fn protocol_id(&self) -> u16 {
        TEST_PROTOCOL
    }

    fn requires_secure_session(&self) -> bool {
        false
    }

    async fn on_new_exchange(
        &self,
        mut exchange: Exchange,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _first = exchange.next().await?;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        if self.close_immediately {
            exchange.close().await;
            return Ok(());
        }
        // Hold the exchange open; more messages may arrive.
        loop {
            match exchange.next().await {
                Ok(_) => {
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                }
                Err(ExchangeError::Closed(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn make_manager() -> (ExchangeManager, Arc<SessionManager>) {
    let sessions = Arc::new(SessionManager::new(NodeId(LOCAL_NODE)));
    let manager = ExchangeManager::new(
        sessions.clone(),
        Arc::new(NullCrypto),
        ExchangeConfig::default(),
    );
    (manager, sessions)
}

fn inbound_packet(counter: u32, payload_header: &PayloadHeader, payload: &[u8]) -> Bytes {
    let header = PacketHeader {
        session_id: 0,
        session_type: SessionType::Unicast,
        security_flags: SecurityFlags::empty(),
        message_counter: counter,
        source_node_id: Some(PEER_NODE),
        destination: DestinationId::Node(LOCAL_NODE),
    };
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    payload_header.encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_outbound(wire: &Bytes) -> (PacketHeader, PayloadHeader, Bytes) {
    let mut buf = wire.clone();
    let packet = PacketHeader::decode(&mut buf).expect("packet header");
    let payload = PayloadHeader::decode(&mut buf).expect("payload header");
    let rest = buf.copy_to_bytes(buf.remaining());
    (packet, payload, rest)
}

async fn recv_outbound(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> (PacketHeader, PayloadHeader) {
    let wire = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for outbound packet")
        .expect("capture channel closed");
    let (packet, payload, _) = decode_outbound(&wire);
    (packet, payload)
}

fn is_standalone_ack(header: &PayloadHeader) -> bool {
    header.protocol_id == mtr_proto::PROTOCOL_ID_SECURE_CHANNEL
        && header.message_type == secure_channel_opcode::MRP_STANDALONE_ACK
}

// ---------------------------------------------------------------------------
// Scenario: duplicate suppression
// ---------------------------------------------------------------------------

/// The same packet delivered twice dispatches once but is acked both times.
#[tokio::test(start_paused = true)]
async fn duplicate_packet_is_acked_but_not_redispatched() {
    let (manager, _sessions) = make_manager();
    let handler = Arc::new(CountingHandler {
        delivered: AtomicUsize::new(0),
        close_immediately: false,
    });
    manager.add_protocol_handler(handler.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = Arc::new(CaptureChannel { tx });

    let request = PayloadHeader {
        is_initiator: true,
        requires_ack: true,
        message_type: 0x01,
        exchange_id: 5,
        protocol_id: TEST_PROTOCOL,
        vendor_id: None,
        ack_message_id: None,
    };
    let wire = inbound_packet(100, &request, b"hello");

    manager.on_message(channel.clone(), wire.clone()).await;
    manager.on_message(channel.clone(), wire).await;

    // Two acks: the duplicate is acked immediately, the original via the
    // delayed standalone ack.
    let (_, first_ack) = recv_outbound(&mut rx).await;
    assert!(is_standalone_ack(&first_ack));
    assert_eq!(first_ack.ack_message_id, Some(100));
    let (_, second_ack) = recv_outbound(&mut rx).await;
    assert!(is_standalone_ack(&second_ack));
    assert_eq!(second_ack.ack_message_id, Some(100));

    assert_eq!(handler.delivered.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Scenario: ack flushed by close
// ---------------------------------------------------------------------------

/// An exchange closed right after receiving a reliable message still emits
/// the ack before it goes away.
#[tokio::test(start_paused = true)]
async fn close_flushes_owed_ack() {
    let (manager, _sessions) = make_manager();
    let handler = Arc::new(CountingHandler {
        delivered: AtomicUsize::new(0),
        close_immediately: true,
    });
    manager.add_protocol_handler(handler.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = Arc::new(CaptureChannel { tx });

    let request = PayloadHeader {
        is_initiator: true,
        requires_ack: true,
        message_type: 0x01,
        exchange_id: 9,
        protocol_id: TEST_PROTOCOL,
        vendor_id: None,
        ack_message_id: None,
    };
    manager
        .on_message(channel.clone(), inbound_packet(7, &request, b"x"))
        .await;

    let (_, ack) = recv_outbound(&mut rx).await;
    assert!(is_standalone_ack(&ack));
    assert_eq!(ack.ack_message_id, Some(7));
    assert_eq!(handler.delivered.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Reliable send: ack stops retransmission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reliable_send_completes_on_ack() {
    let (manager, sessions) = make_manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = Arc::new(CaptureChannel { tx });

    let session = sessions.unsecured_session(NodeId(PEER_NODE), channel.clone());
    let mut exchange = manager
        .initiate_for_session(&session, TEST_PROTOCOL)
        .unwrap();
    let exchange_id = exchange.exchange_id();

    let manager2 = manager.clone();
    let sender = tokio::spawn(async move { exchange.send(0x01, b"request").await });

    // First transmission appears on the wire.
    let wire = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no transmission")
        .unwrap();
    let (packet, payload, _) = decode_outbound(&wire);
    assert!(payload.requires_ack);
    assert_eq!(payload.exchange_id, exchange_id);

    // Peer acks it with a standalone ack.
    let ack = PayloadHeader {
        is_initiator: false,
        requires_ack: false,
        message_type: secure_channel_opcode::MRP_STANDALONE_ACK,
        exchange_id,
        protocol_id: mtr_proto::PROTOCOL_ID_SECURE_CHANNEL,
        vendor_id: None,
        ack_message_id: Some(packet.message_counter),
    };
    manager2
        .on_message(channel.clone(), inbound_packet(50, &ack, &[]))
        .await;

    sender.await.unwrap().expect("send should complete");
}

// ---------------------------------------------------------------------------
// Reliable send: budget exhaustion fails the peer
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retransmission_budget_exhaustion_is_peer_loss() {
    let (manager, sessions) = make_manager();
    let mut events = sessions.subscribe_events();

    let session = sessions.unsecured_session(NodeId(PEER_NODE), Arc::new(BlackholeChannel));
    let mut exchange = manager
        .initiate_for_session(&session, TEST_PROTOCOL)
        .unwrap();

    let result = exchange.send(0x01, b"anyone there").await;
    assert!(matches!(result, Err(ExchangeError::PeerLost)));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("expected a session event")
        .unwrap();
    assert!(matches!(event, mtr_exchange::SessionEvent::PeerLost(_)));
}

// ---------------------------------------------------------------------------
// Per-session exchange budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oldest_exchange_is_evicted_over_budget() {
    let (manager, sessions) = make_manager();
    let session = sessions.unsecured_session(NodeId(PEER_NODE), Arc::new(BlackholeChannel));

    let mut exchanges = Vec::new();
    for _ in 0..=mtr_exchange::MAX_EXCHANGES_PER_SESSION {
        exchanges.push(
            manager
                .initiate_for_session(&session, TEST_PROTOCOL)
                .unwrap(),
        );
    }

    // The 31st initiation evicted the very first exchange.
    let oldest = &mut exchanges[0];
    match oldest.next().await {
        Err(ExchangeError::Closed(CloseCause::Evicted)) => {}
        other => panic!("expected eviction, got {other:?}"),
    }

    // The newest exchange is still alive (its inbox stays open).
    let newest = exchanges.last_mut().unwrap();
    let alive = tokio::time::timeout(Duration::from_millis(50), newest.next()).await;
    assert!(alive.is_err(), "newest exchange should still be open");
}

// ---------------------------------------------------------------------------
// Unknown sessions and protocols
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Group sessions
// ---------------------------------------------------------------------------

struct SingleGroupKey;

impl mtr_exchange::GroupKeys for SingleGroupKey {
    fn group_key(&self, group_session_id: u16) -> Option<(Vec<u8>, u8)> {
        (group_session_id == 0x0101).then(|| (vec![0u8; 16], 2))
    }
}

fn group_packet(counter: u32, payload_header: &PayloadHeader, payload: &[u8]) -> Bytes {
    let header = PacketHeader {
        session_id: 0x0101,
        session_type: SessionType::Group,
        security_flags: SecurityFlags::empty(),
        message_counter: counter,
        source_node_id: Some(PEER_NODE),
        destination: DestinationId::Group(0x0007),
    };
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    // Group payloads are AEAD-protected; the null crypto appends a zero tag.
    let mut plain = BytesMut::new();
    payload_header.encode(&mut plain);
    plain.put_slice(payload);
    buf.put_slice(&plain);
    buf.put_slice(&[0u8; 16]);
    buf.freeze()
}

#[tokio::test]
async fn group_messages_dispatch_once_per_counter() {
    let (manager, sessions) = make_manager();
    sessions.set_group_keys(Arc::new(SingleGroupKey));
    let handler = Arc::new(CountingHandler {
        delivered: AtomicUsize::new(0),
        close_immediately: false,
    });
    manager.add_protocol_handler(handler.clone()).unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let channel = Arc::new(CaptureChannel { tx });

    let request = PayloadHeader {
        is_initiator: true,
        requires_ack: false,
        message_type: 0x01,
        exchange_id: 77,
        protocol_id: TEST_PROTOCOL,
        vendor_id: None,
        ack_message_id: None,
    };
    let wire = group_packet(12, &request, b"group payload");
    manager.on_message(channel.clone(), wire.clone()).await;
    // The replay window survives across packets of the same (group, source).
    manager.on_message(channel.clone(), wire).await;
    manager
        .on_message(channel, group_packet(13, &request, b"next"))
        .await;

    // Give the handler task a moment to drain its inbox.
    for _ in 0..100 {
        if handler.delivered.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(handler.delivered.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_secure_session_is_dropped_quietly() {
    let (manager, _sessions) = make_manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = Arc::new(CaptureChannel { tx });

    let header = PacketHeader {
        session_id: 0x1234,
        session_type: SessionType::Unicast,
        security_flags: SecurityFlags::empty(),
        message_counter: 1,
        source_node_id: None,
        destination: DestinationId::None,
    };
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    buf.put_slice(b"ciphertext");
    manager.on_message(channel, buf.freeze()).await;

    assert!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err(),
        "nothing should be sent for an unknown session"
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_protocol_is_acked_but_opens_no_exchange() {
    let (manager, _sessions) = make_manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = Arc::new(CaptureChannel { tx });

    let request = PayloadHeader {
        is_initiator: true,
        requires_ack: true,
        message_type: 0x01,
        exchange_id: 3,
        protocol_id: 0xeeee,
        vendor_id: None,
        ack_message_id: None,
    };
    manager
        .on_message(channel, inbound_packet(11, &request, b"?"))
        .await;

    let (_, ack) = recv_outbound(&mut rx).await;
    assert!(is_standalone_ack(&ack));
    assert_eq!(ack.ack_message_id, Some(11));
}
