//! Sessions and the session manager.
//!
//! A session is the long-lived authenticated channel to one peer. The
//! manager owns them; exchanges and subscriptions hold `Arc`s that fail
//! gracefully once the session closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::{BufMut, Bytes, BytesMut};
use mtr_proto::{
    CRYPTO_AEAD_TAG_LENGTH, DestinationId, PacketHeader, PayloadHeader, SecurityFlags,
    SessionParameters, SessionType,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::PacketChannel;
use crate::counter::{CounterVerdict, MessageCounterWindow};
use crate::crypto::{Crypto, SessionKeys, message_nonce};
use crate::error::ExchangeError;
use crate::peer::{FabricIndex, NodeId, PeerAddress};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

pub struct Session {
    id: u16,
    peer_session_id: u16,
    peer: PeerAddress,
    local_node_id: NodeId,
    secure: bool,
    group: bool,
    params: SessionParameters,
    keys: Option<SessionKeys>,
    state: AtomicU8,
    rx_window: Mutex<MessageCounterWindow>,
    tx_counter: AtomicU32,
    channel: Mutex<Arc<dyn PacketChannel>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("secure", &self.secure)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn peer_session_id(&self) -> u16 {
        self.peer_session_id
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_group(&self) -> bool {
        self.group
    }

    pub fn params(&self) -> &SessionParameters {
        &self.params
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    pub(crate) fn begin_close(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }

    pub fn channel(&self) -> Arc<dyn PacketChannel> {
        self.channel.lock().expect("channel lock").clone()
    }

    /// Transports call this when the peer's address roams.
    pub fn update_channel(&self, channel: Arc<dyn PacketChannel>) {
        *self.channel.lock().expect("channel lock") = channel;
    }

    /// Record an inbound counter and classify it against the replay window.
    pub(crate) fn observe_counter(&self, counter: u32) -> CounterVerdict {
        self.rx_window.lock().expect("rx window lock").observe(counter)
    }

    fn next_counter(&self) -> Result<u32, ExchangeError> {
        if self.state.load(Ordering::SeqCst) == STATE_CLOSED {
            return Err(ExchangeError::SessionClosed);
        }
        Ok(self.tx_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Frame, (optionally) encrypt, and serialize one outbound message.
    /// Returns the assigned counter and the wire bytes, which the caller
    /// retransmits verbatim under MRP.
    pub(crate) fn encode_message(
        &self,
        crypto: &dyn Crypto,
        payload_header: &PayloadHeader,
        payload: &[u8],
    ) -> Result<(u32, Bytes), ExchangeError> {
        let counter = self.next_counter()?;

        let (source, destination) = if self.secure {
            (None, DestinationId::None)
        } else {
            // Unsecured messages carry explicit node ids.
            (
                Some(self.local_node_id.0),
                DestinationId::Node(self.peer.node_id.0),
            )
        };
        let packet_header = PacketHeader {
            session_id: self.peer_session_id,
            session_type: if self.group {
                SessionType::Group
            } else {
                SessionType::Unicast
            },
            security_flags: SecurityFlags::empty(),
            message_counter: counter,
            source_node_id: source,
            destination,
        };

        let mut plain = BytesMut::with_capacity(payload_header.encoded_len() + payload.len());
        payload_header.encode(&mut plain);
        plain.put_slice(payload);

        let mut wire = BytesMut::with_capacity(
            packet_header.encoded_len() + plain.len() + CRYPTO_AEAD_TAG_LENGTH,
        );
        packet_header.encode(&mut wire);

        if let Some(keys) = &self.keys {
            let nonce = message_nonce(
                packet_header.security_flags,
                if self.group { 0x01 } else { 0x00 },
                counter,
                self.local_node_id.0,
            );
            let aad = wire.clone();
            let ciphertext = crypto.encrypt(&keys.encrypt_key, &nonce, &aad, &plain);
            wire.put_slice(&ciphertext);
        } else {
            wire.put_slice(&plain);
        }

        if wire.len() > mtr_proto::MAX_MESSAGE_SIZE {
            return Err(ExchangeError::PayloadTooLarge(payload.len()));
        }
        Ok((counter, wire.freeze()))
    }

    /// Decrypt (or pass through) the payload portion of an inbound packet.
    pub(crate) fn decode_payload(
        &self,
        crypto: &dyn Crypto,
        header: &PacketHeader,
        aad: &[u8],
        payload: &[u8],
    ) -> Result<Bytes, ExchangeError> {
        match &self.keys {
            Some(keys) => {
                let nonce = message_nonce(
                    header.security_flags,
                    if header.session_type == SessionType::Group {
                        0x01
                    } else {
                        0x00
                    },
                    header.message_counter,
                    header.source_node_id.unwrap_or(self.peer.node_id.0),
                );
                let plain = crypto.decrypt(&keys.decrypt_key, &nonce, aad, payload)?;
                Ok(Bytes::from(plain))
            }
            None => Ok(Bytes::copy_from_slice(payload)),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Parameters for installing a secure session produced by CASE/PASE.
pub struct SecureSessionConfig {
    pub local_session_id: u16,
    pub peer_session_id: u16,
    pub peer: PeerAddress,
    pub local_node_id: NodeId,
    pub keys: SessionKeys,
    pub params: SessionParameters,
    pub channel: Arc<dyn PacketChannel>,
}

/// Resolver for group session ids to decryption keys.
pub trait GroupKeys: Send + Sync {
    fn group_key(&self, group_session_id: u16) -> Option<(Vec<u8>, FabricIndex)>;
}

/// Cross-cutting session lifecycle signals, fanned out to listeners with
/// explicit subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// MRP gave up on this peer.
    PeerLost(PeerAddress),
    SessionClosed { session_id: u16, peer: PeerAddress },
    FabricRemoved(FabricIndex),
}

pub struct SessionManager {
    local_node_id: NodeId,
    sessions: RwLock<HashMap<u16, Arc<Session>>>,
    unsecured: RwLock<HashMap<NodeId, Arc<Session>>>,
    groups: RwLock<HashMap<(u16, NodeId), Arc<Session>>>,
    group_keys: RwLock<Option<Arc<dyn GroupKeys>>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(local_node_id: NodeId) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        SessionManager {
            local_node_id,
            sessions: RwLock::new(HashMap::new()),
            unsecured: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            group_keys: RwLock::new(None),
            events_tx,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Install a secure session. A previous session with the same id is
    /// replaced (re-key); the caller is responsible for closing its
    /// exchanges via the exchange manager.
    pub fn add_secure_session(&self, config: SecureSessionConfig) -> Arc<Session> {
        let session = Arc::new(Session {
            id: config.local_session_id,
            peer_session_id: config.peer_session_id,
            peer: config.peer,
            local_node_id: config.local_node_id,
            secure: true,
            group: false,
            params: config.params,
            keys: Some(config.keys),
            state: AtomicU8::new(STATE_OPEN),
            rx_window: Mutex::new(MessageCounterWindow::new()),
            // Counters start low; a real node seeds from persisted state.
            tx_counter: AtomicU32::new(1),
            channel: Mutex::new(config.channel),
        });
        let previous = self
            .sessions
            .write()
            .expect("sessions lock")
            .insert(session.id, session.clone());
        if let Some(old) = previous {
            warn!(session_id = old.id, "secure session replaced by re-key");
            old.mark_closed();
        }
        info!(session_id = session.id, peer = %session.peer, "secure session established");
        session
    }

    /// Look up or create the unsecured session for an initiator node id.
    pub fn unsecured_session(
        &self,
        initiator: NodeId,
        channel: Arc<dyn PacketChannel>,
    ) -> Arc<Session> {
        if let Some(existing) = self.unsecured.read().expect("unsecured lock").get(&initiator) {
            return existing.clone();
        }
        let session = Arc::new(Session {
            id: 0,
            peer_session_id: 0,
            peer: PeerAddress {
                fabric_index: 0,
                node_id: initiator,
            },
            local_node_id: self.local_node_id,
            secure: false,
            group: false,
            params: SessionParameters::default(),
            keys: None,
            state: AtomicU8::new(STATE_OPEN),
            rx_window: Mutex::new(MessageCounterWindow::new()),
            tx_counter: AtomicU32::new(rand::random::<u16>() as u32 + 1),
            channel: Mutex::new(channel),
        });
        debug!(initiator = %initiator, "unsecured session created");
        self.unsecured
            .write()
            .expect("unsecured lock")
            .insert(initiator, session.clone());
        session
    }

    pub fn set_group_keys(&self, keys: Arc<dyn GroupKeys>) {
        *self.group_keys.write().expect("group keys lock") = Some(keys);
    }

    /// Resolve a group packet to the session tracking that (group, source)
    /// pair, or `None` when no key matches. Sessions are cached so the
    /// per-source replay window survives across packets.
    pub fn group_session(
        &self,
        group_session_id: u16,
        source_node_id: NodeId,
        channel: Arc<dyn PacketChannel>,
    ) -> Option<Arc<Session>> {
        if let Some(existing) = self
            .groups
            .read()
            .expect("groups lock")
            .get(&(group_session_id, source_node_id))
        {
            return Some(existing.clone());
        }
        let provider = self.group_keys.read().expect("group keys lock").clone()?;
        let (key, fabric_index) = provider.group_key(group_session_id)?;
        let session = Arc::new(Session {
            id: group_session_id,
            peer_session_id: group_session_id,
            peer: PeerAddress {
                fabric_index,
                node_id: source_node_id,
            },
            local_node_id: self.local_node_id,
            secure: true,
            group: true,
            params: SessionParameters::default(),
            keys: Some(SessionKeys {
                encrypt_key: key.clone(),
                decrypt_key: key,
            }),
            state: AtomicU8::new(STATE_OPEN),
            rx_window: Mutex::new(MessageCounterWindow::new()),
            tx_counter: AtomicU32::new(1),
            channel: Mutex::new(channel),
        });
        self.groups
            .write()
            .expect("groups lock")
            .insert((group_session_id, source_node_id), session.clone());
        Some(session)
    }

    pub fn get(&self, session_id: u16) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("sessions lock")
            .get(&session_id)
            .cloned()
    }

    /// Newest open secure session for a peer.
    pub fn session_for_peer(&self, peer: &PeerAddress) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("sessions lock")
            .values()
            .filter(|s| s.peer == *peer && s.is_open())
            .max_by_key(|s| s.id)
            .cloned()
    }

    /// All open sessions to a peer (used when failing the whole peer).
    pub fn sessions_for_peer(&self, peer: &PeerAddress) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("sessions lock")
            .values()
            .filter(|s| s.peer == *peer)
            .cloned()
            .collect()
    }

    /// Close a session. The exchange manager listens for the emitted event
    /// and fails the session's exchanges.
    pub fn close_session(&self, session_id: u16) {
        let removed = self.sessions.write().expect("sessions lock").remove(&session_id);
        if let Some(session) = removed {
            session.begin_close();
            session.mark_closed();
            info!(session_id, peer = %session.peer(), "session closed");
            self.emit(SessionEvent::SessionClosed {
                session_id,
                peer: session.peer(),
            });
        }
    }

    pub fn remove_fabric(&self, fabric_index: FabricIndex) {
        let ids: Vec<u16> = self
            .sessions
            .read()
            .expect("sessions lock")
            .values()
            .filter(|s| s.peer.fabric_index == fabric_index)
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.close_session(id);
        }
        self.emit(SessionEvent::FabricRemoved(fabric_index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SinkChannel;

    #[async_trait]
    impl PacketChannel for SinkChannel {
        async fn send(&self, _data: Bytes) -> Result<(), crate::channel::ChannelError> {
            Ok(())
        }

        fn label(&self) -> String {
            "sink".to_owned()
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(NodeId(0x1))
    }

    fn secure_config(id: u16) -> SecureSessionConfig {
        SecureSessionConfig {
            local_session_id: id,
            peer_session_id: id + 100,
            peer: PeerAddress::new(1, 0xAA),
            local_node_id: NodeId(0x1),
            keys: SessionKeys {
                encrypt_key: vec![0; 16],
                decrypt_key: vec![0; 16],
            },
            params: SessionParameters::default(),
            channel: Arc::new(SinkChannel),
        }
    }

    #[test]
    fn closed_sessions_reject_sends() {
        let mgr = manager();
        let session = mgr.add_secure_session(secure_config(1));
        mgr.close_session(1);
        assert!(matches!(
            session.next_counter(),
            Err(ExchangeError::SessionClosed)
        ));
    }

    #[test]
    fn outbound_counter_strictly_increases() {
        let mgr = manager();
        let session = mgr.add_secure_session(secure_config(2));
        let a = session.next_counter().unwrap();
        let b = session.next_counter().unwrap();
        assert!(b > a);
    }

    #[test]
    fn session_for_peer_prefers_newest() {
        let mgr = manager();
        mgr.add_secure_session(secure_config(1));
        mgr.add_secure_session(secure_config(7));
        let found = mgr.session_for_peer(&PeerAddress::new(1, 0xAA)).unwrap();
        assert_eq!(found.id(), 7);
    }

    #[test]
    fn unsecured_sessions_are_keyed_by_initiator() {
        let mgr = manager();
        let a = mgr.unsecured_session(NodeId(5), Arc::new(SinkChannel));
        let b = mgr.unsecured_session(NodeId(5), Arc::new(SinkChannel));
        assert!(Arc::ptr_eq(&a, &b));
        let c = mgr.unsecured_session(NodeId(6), Arc::new(SinkChannel));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn fabric_removal_closes_matching_sessions_and_emits() {
        let mgr = manager();
        let mut events = mgr.subscribe_events();
        mgr.add_secure_session(secure_config(3));
        mgr.remove_fabric(1);
        assert!(mgr.get(3).is_none());
        // SessionClosed for id 3, then FabricRemoved.
        let first = events.try_recv().unwrap();
        assert!(matches!(first, SessionEvent::SessionClosed { session_id: 3, .. }));
        let second = events.try_recv().unwrap();
        assert_eq!(second, SessionEvent::FabricRemoved(1));
    }
}
