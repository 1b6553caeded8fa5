//! The exchange manager: single ingest point, single exchange factory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes};
use mtr_proto::{
    PROTOCOL_ID_SECURE_CHANNEL, PacketHeader, PayloadHeader, SessionType, mrp,
    secure_channel_opcode,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{PacketChannel, Transport};
use crate::counter::CounterVerdict;
use crate::crypto::Crypto;
use crate::error::{CloseCause, ExchangeError};
use crate::exchange::{Exchange, ExchangeShared, InboundMessage, send_raw_ack};
use crate::peer::{NodeId, PeerAddress};
use crate::session::{Session, SessionEvent, SessionManager};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Live exchanges per session before the oldest is evicted.
    pub max_exchanges_per_session: usize,
    /// Exchanges with no pending work close after this much inactivity.
    pub idle_close_after: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Inbox depth per exchange.
    pub inbox_depth: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            max_exchanges_per_session: crate::MAX_EXCHANGES_PER_SESSION,
            idle_close_after: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
            inbox_depth: 32,
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol handler registration
// ---------------------------------------------------------------------------

/// Consumer of unsolicited exchanges for one protocol id.
#[async_trait::async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn protocol_id(&self) -> u16;

    fn requires_secure_session(&self) -> bool {
        true
    }

    /// Called on a fresh exchange whose first message is already queued in
    /// the exchange inbox. Runs in its own task; errors are logged by the
    /// manager and close the exchange.
    async fn on_new_exchange(
        &self,
        exchange: Exchange,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    async fn on_close(&self) {}
}

fn error_is_shutdown(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(xe) = e.downcast_ref::<ExchangeError>() {
            if xe.is_shutdown() {
                return true;
            }
        }
        cur = e.source();
    }
    false
}

// ---------------------------------------------------------------------------
// Core state
// ---------------------------------------------------------------------------

struct ExchangeEntry {
    tx: mpsc::Sender<InboundMessage>,
    shared: Arc<ExchangeShared>,
    session: Arc<Session>,
    seq: u64,
}

struct ManagerState {
    exchanges: HashMap<(u16, u32), ExchangeEntry>,
    handlers: HashMap<u16, Arc<dyn ProtocolHandler>>,
    transports: Vec<Arc<dyn Transport>>,
    next_exchange_id: u16,
    next_seq: u64,
    closed: bool,
}

pub(crate) struct ManagerCore {
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) crypto: Arc<dyn Crypto>,
    config: ExchangeConfig,
    state: Mutex<ManagerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ManagerCore {
    pub(crate) fn remove_exchange(&self, session_id: u16, index: u32, cause: CloseCause) {
        let entry = {
            let mut state = self.state.lock().expect("manager state");
            state.exchanges.remove(&(session_id, index))
        };
        if let Some(entry) = entry {
            entry.shared.set_closed(cause);
            trace!(session_id, index, %cause, "exchange removed");
        }
    }

    fn close_session_exchanges(&self, session_id: u16, cause: CloseCause) {
        let removed: Vec<ExchangeEntry> = {
            let mut state = self.state.lock().expect("manager state");
            let keys: Vec<(u16, u32)> = state
                .exchanges
                .keys()
                .filter(|(sid, _)| *sid == session_id)
                .copied()
                .collect();
            keys.iter()
                .filter_map(|k| state.exchanges.remove(k))
                .collect()
        };
        for entry in &removed {
            entry.shared.set_closed(cause);
        }
        if !removed.is_empty() {
            debug!(session_id, count = removed.len(), %cause, "session exchanges closed");
        }
    }

    /// MRP retransmissions exhausted: close every session to the peer and
    /// broadcast the loss so subscriptions can react.
    pub(crate) async fn fail_peer(&self, session: &Arc<Session>) {
        let peer = session.peer();
        if session.is_secure() && !session.is_group() {
            for s in self.sessions.sessions_for_peer(&peer) {
                self.close_session_exchanges(s.id(), CloseCause::PeerLost);
                self.sessions.close_session(s.id());
            }
        } else {
            self.close_session_exchanges(session.id(), CloseCause::PeerLost);
        }
        self.sessions.emit(SessionEvent::PeerLost(peer));
    }
}

// ---------------------------------------------------------------------------
// ExchangeManager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ExchangeManager {
    core: Arc<ManagerCore>,
}

impl ExchangeManager {
    pub fn new(
        sessions: Arc<SessionManager>,
        crypto: Arc<dyn Crypto>,
        config: ExchangeConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let core = Arc::new(ManagerCore {
            sessions,
            crypto,
            config,
            state: Mutex::new(ManagerState {
                exchanges: HashMap::new(),
                handlers: HashMap::new(),
                transports: Vec::new(),
                next_exchange_id: rand::random(),
                next_seq: 0,
                closed: false,
            }),
            shutdown_tx,
        });

        let manager = ExchangeManager { core };
        manager.spawn_idle_sweep();
        manager.spawn_session_event_task();
        manager
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.core.sessions
    }

    fn spawn_idle_sweep(&self) {
        let core = self.core.clone();
        let mut shutdown = self.core.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(core.config.sweep_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = tick.tick() => {
                        let cutoff = tokio::time::Instant::now() - core.config.idle_close_after;
                        let idle: Vec<(u16, u32)> = {
                            let state = core.state.lock().expect("manager state");
                            state
                                .exchanges
                                .iter()
                                .filter(|(_, e)| {
                                    let mrp = e.shared.mrp.lock().expect("mrp lock");
                                    mrp.outstanding.is_none()
                                        && mrp.pending_ack.is_none()
                                        && mrp.close_cause.is_none()
                                })
                                .filter(|(_, e)| e.shared.idle_since() <= cutoff)
                                .map(|(k, _)| *k)
                                .collect()
                        };
                        for (session_id, index) in idle {
                            debug!(session_id, index, "closing idle exchange");
                            core.remove_exchange(session_id, index, CloseCause::Idle);
                        }
                    }
                }
            }
        });
    }

    fn spawn_session_event_task(&self) {
        let core = self.core.clone();
        let mut events = self.core.sessions.subscribe_events();
        let mut shutdown = self.core.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    event = events.recv() => match event {
                        Ok(SessionEvent::SessionClosed { session_id, .. }) => {
                            core.close_session_exchanges(session_id, CloseCause::SessionClosed);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "session event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register the handler for one protocol id. Registering the same
    /// protocol twice is an error.
    pub fn add_protocol_handler(
        &self,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), ExchangeError> {
        let mut state = self.core.state.lock().expect("manager state");
        let id = handler.protocol_id();
        if state.handlers.contains_key(&id) {
            return Err(ExchangeError::HandlerExists(id));
        }
        state.handlers.insert(id, handler);
        Ok(())
    }

    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.core
            .state
            .lock()
            .expect("manager state")
            .transports
            .push(transport);
    }

    // -----------------------------------------------------------------------
    // Initiate
    // -----------------------------------------------------------------------

    /// Open an exchange to `peer` on its newest session.
    pub fn initiate(&self, peer: PeerAddress, protocol_id: u16) -> Result<Exchange, ExchangeError> {
        let session = self
            .core
            .sessions
            .session_for_peer(&peer)
            .ok_or(ExchangeError::NoSession(peer))?;
        self.initiate_for_session(&session, protocol_id)
    }

    /// Open an exchange on a specific session.
    pub fn initiate_for_session(
        &self,
        session: &Arc<Session>,
        protocol_id: u16,
    ) -> Result<Exchange, ExchangeError> {
        if !session.is_open() {
            return Err(ExchangeError::SessionClosed);
        }
        let (exchange, evicted) = {
            let mut state = self.core.state.lock().expect("manager state");
            if state.closed {
                return Err(ExchangeError::Shutdown);
            }
            // Allocate a free 16-bit exchange id on this session.
            let mut id = state.next_exchange_id;
            loop {
                let index = u32::from(id) | crate::INITIATED_FLAG;
                if !state.exchanges.contains_key(&(session.id(), index)) {
                    break;
                }
                id = id.wrapping_add(1);
            }
            state.next_exchange_id = id.wrapping_add(1);
            let index = u32::from(id) | crate::INITIATED_FLAG;

            let exchange =
                install_exchange(&self.core, &mut state, session, id, index, true, protocol_id);
            let evicted = over_budget_victim(&self.core, &mut state, session.id());
            (exchange, evicted)
        };
        if let Some((session_id, index)) = evicted {
            warn!(session_id, index, "evicting oldest exchange over per-session budget");
            self.core
                .remove_exchange(session_id, index, CloseCause::Evicted);
        }
        trace!(
            session_id = session.id(),
            exchange_id = exchange.exchange_id(),
            protocol_id,
            "exchange initiated"
        );
        Ok(exchange)
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Feed one raw packet from a transport. Never fails outward; decode
    /// and dispatch problems are logged and the packet dropped.
    pub async fn on_message(&self, channel: Arc<dyn PacketChannel>, data: Bytes) {
        if *self.core.shutdown_tx.borrow() {
            return;
        }
        if let Err(e) = self.ingest(channel, data).await {
            if e.is_shutdown() {
                debug!(error = %e, "packet dropped during shutdown");
            } else {
                warn!(error = %e, "inbound packet dropped");
            }
        }
    }

    async fn ingest(
        &self,
        channel: Arc<dyn PacketChannel>,
        data: Bytes,
    ) -> Result<(), ExchangeError> {
        let mut buf = data.clone();
        let header = PacketHeader::decode(&mut buf)?;
        let aad_len = data.len() - buf.remaining();

        // Resolve the session.
        let session = match (header.session_type, header.session_id) {
            (SessionType::Unicast, 0) => {
                let initiator = header
                    .source_node_id
                    .or(match header.destination {
                        mtr_proto::DestinationId::Node(n) => Some(n),
                        _ => None,
                    })
                    .map(NodeId);
                let Some(initiator) = initiator else {
                    warn!("unsecured packet without node ids");
                    return Ok(());
                };
                self.core.sessions.unsecured_session(initiator, channel.clone())
            }
            (SessionType::Unicast, id) => match self.core.sessions.get(id) {
                Some(s) => s,
                None => {
                    warn!(session_id = id, from = %channel.label(), "packet for unknown session");
                    return Ok(());
                }
            },
            (SessionType::Group, id) => {
                let Some(source) = header.source_node_id.map(NodeId) else {
                    warn!("group packet without source node id");
                    return Ok(());
                };
                match self.core.sessions.group_session(id, source, channel.clone()) {
                    Some(s) => s,
                    None => {
                        warn!(group_session_id = id, "no group key for packet");
                        return Ok(());
                    }
                }
            }
        };

        // Decrypt and parse the payload header.
        let plain = match session.decode_payload(
            self.core.crypto.as_ref(),
            &header,
            &data[..aad_len],
            &buf,
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!(session_id = session.id(), error = %e, "payload decrypt failed");
                return Ok(());
            }
        };
        let mut pbuf = plain.clone();
        let payload_header = PayloadHeader::decode(&mut pbuf)?;
        let payload = pbuf.copy_to_bytes(pbuf.remaining());

        // Replay window: duplicates keep flowing so acks still go out,
        // out-of-window counters stop here.
        let verdict = session.observe_counter(header.message_counter);
        if verdict == CounterVerdict::OutOfWindow {
            warn!(
                session_id = session.id(),
                counter = header.message_counter,
                "counter outside replay window"
            );
            return Ok(());
        }
        let is_duplicate = verdict == CounterVerdict::Duplicate;

        session.update_channel(channel);

        // The peer's initiator flag tells us which side of the index space
        // this exchange lives in: their initiations are ours to respond to.
        let index = if payload_header.is_initiator {
            u32::from(payload_header.exchange_id)
        } else {
            u32::from(payload_header.exchange_id) | crate::INITIATED_FLAG
        };

        self.dispatch(session, header, payload_header, payload, index, is_duplicate)
            .await
    }

    async fn dispatch(
        &self,
        session: Arc<Session>,
        header: PacketHeader,
        payload_header: PayloadHeader,
        payload: Bytes,
        index: u32,
        is_duplicate: bool,
    ) -> Result<(), ExchangeError> {
        let key = (session.id(), index);
        let existing = {
            let state = self.core.state.lock().expect("manager state");
            state
                .exchanges
                .get(&key)
                .map(|e| (e.tx.clone(), e.shared.clone(), e.session.clone()))
        };

        let is_standalone_ack = payload_header.protocol_id == PROTOCOL_ID_SECURE_CHANNEL
            && payload_header.message_type == secure_channel_opcode::MRP_STANDALONE_ACK;

        if let Some((tx, shared, bound_session)) = existing {
            // Re-keyed session: ack on the new session, close the stale exchange.
            if !Arc::ptr_eq(&bound_session, &session) {
                debug!(
                    session_id = session.id(),
                    index, "message for exchange bound to a stale session"
                );
                if payload_header.requires_ack {
                    send_raw_ack(
                        self.core.crypto.as_ref(),
                        &session,
                        payload_header.exchange_id,
                        shared.initiated_by_us,
                        header.message_counter,
                    )
                    .await?;
                }
                self.core
                    .remove_exchange(key.0, key.1, CloseCause::SessionClosed);
                return Ok(());
            }

            if let Some(ack_id) = payload_header.ack_message_id {
                shared.handle_ack(ack_id);
            }

            if is_duplicate {
                if payload_header.requires_ack {
                    send_raw_ack(
                        self.core.crypto.as_ref(),
                        &session,
                        payload_header.exchange_id,
                        shared.initiated_by_us,
                        header.message_counter,
                    )
                    .await?;
                }
                trace!(index, counter = header.message_counter, "duplicate suppressed");
                return Ok(());
            }

            if is_standalone_ack {
                return Ok(());
            }

            if payload_header.requires_ack {
                shared.register_pending_ack(header.message_counter);
                self.spawn_delayed_ack(session.clone(), shared.clone(), header.message_counter);
            }

            shared.touch();
            let message = InboundMessage {
                protocol_id: payload_header.protocol_id,
                message_type: payload_header.message_type,
                payload,
                message_counter: header.message_counter,
            };
            match tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(index, "exchange inbox full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.core.remove_exchange(key.0, key.1, CloseCause::Graceful);
                }
            }
            return Ok(());
        }

        // ------------------------------------------------------------------
        // No such exchange: unsolicited-message handling.
        // ------------------------------------------------------------------

        if is_standalone_ack {
            // Stray ack for an exchange already gone.
            trace!(index, "standalone ack for unknown exchange ignored");
            return Ok(());
        }

        if !payload_header.is_initiator || is_duplicate {
            // Not something that may open an exchange; satisfy MRP and stop.
            if payload_header.requires_ack {
                send_raw_ack(
                    self.core.crypto.as_ref(),
                    &session,
                    payload_header.exchange_id,
                    !payload_header.is_initiator,
                    header.message_counter,
                )
                .await?;
            }
            debug!(
                index,
                initiator = payload_header.is_initiator,
                duplicate = is_duplicate,
                "message for unknown exchange acked and dropped"
            );
            return Ok(());
        }

        let handler = {
            let state = self.core.state.lock().expect("manager state");
            state.handlers.get(&payload_header.protocol_id).cloned()
        };
        let Some(handler) = handler else {
            warn!(
                protocol_id = payload_header.protocol_id,
                "no handler for unsolicited message"
            );
            if payload_header.requires_ack {
                send_raw_ack(
                    self.core.crypto.as_ref(),
                    &session,
                    payload_header.exchange_id,
                    false,
                    header.message_counter,
                )
                .await?;
            }
            return Ok(());
        };
        if handler.requires_secure_session() && !session.is_secure() {
            warn!(
                protocol_id = payload_header.protocol_id,
                "unsolicited message on unsecured session refused"
            );
            return Ok(());
        }

        // Create the responder-side exchange with the first message queued.
        let (exchange, evicted) = {
            let mut state = self.core.state.lock().expect("manager state");
            if state.closed {
                return Err(ExchangeError::Shutdown);
            }
            let exchange = install_exchange(
                &self.core,
                &mut state,
                &session,
                payload_header.exchange_id,
                index,
                false,
                payload_header.protocol_id,
            );
            let evicted = over_budget_victim(&self.core, &mut state, session.id());
            (exchange, evicted)
        };
        if let Some((session_id, victim_index)) = evicted {
            warn!(
                session_id,
                index = victim_index,
                "evicting oldest exchange over per-session budget"
            );
            self.core
                .remove_exchange(session_id, victim_index, CloseCause::Evicted);
        }

        if payload_header.requires_ack {
            exchange.shared.register_pending_ack(header.message_counter);
            self.spawn_delayed_ack(
                session.clone(),
                exchange.shared.clone(),
                header.message_counter,
            );
        }
        let first = InboundMessage {
            protocol_id: payload_header.protocol_id,
            message_type: payload_header.message_type,
            payload,
            message_counter: header.message_counter,
        };
        // Fresh inbox, delivery cannot fail.
        let _ = exchange
            .inbox_sender()
            .try_send(first);

        info!(
            session_id = session.id(),
            exchange_id = payload_header.exchange_id,
            protocol_id = payload_header.protocol_id,
            "unsolicited exchange opened"
        );
        tokio::spawn(async move {
            let exchange_id = exchange.exchange_id();
            if let Err(e) = handler.on_new_exchange(exchange).await {
                if error_is_shutdown(e.as_ref()) {
                    debug!(exchange_id, error = %e, "exchange handler ended by shutdown");
                } else {
                    error!(exchange_id, error = %e, "unhandled protocol handler error");
                }
            }
        });
        Ok(())
    }

    fn spawn_delayed_ack(&self, session: Arc<Session>, shared: Arc<ExchangeShared>, counter: u32) {
        let core = self.core.clone();
        tokio::spawn(async move {
            tokio::time::sleep(mrp::MRP_STANDALONE_ACK_DELAY).await;
            let still_owed = {
                let mut state = shared.mrp.lock().expect("mrp lock");
                if state.pending_ack == Some(counter) {
                    state.pending_ack = None;
                    true
                } else {
                    false
                }
            };
            if still_owed {
                if let Err(e) = send_raw_ack(
                    core.crypto.as_ref(),
                    &session,
                    shared.exchange_id,
                    shared.initiated_by_us,
                    counter,
                )
                .await
                {
                    debug!(error = %e, "standalone ack send failed");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close a session and fail all of its exchanges.
    pub fn close_session(&self, session_id: u16) {
        self.core
            .close_session_exchanges(session_id, CloseCause::SessionClosed);
        self.core.sessions.close_session(session_id);
    }

    /// Shut everything down: exchanges first, then transports, then
    /// protocol handlers. Idempotent.
    pub async fn close(&self) {
        let (entries, transports, handlers) = {
            let mut state = self.core.state.lock().expect("manager state");
            if state.closed {
                return;
            }
            state.closed = true;
            let entries: Vec<ExchangeEntry> = state.exchanges.drain().map(|(_, e)| e).collect();
            let transports = std::mem::take(&mut state.transports);
            let handlers: Vec<Arc<dyn ProtocolHandler>> =
                state.handlers.drain().map(|(_, h)| h).collect();
            (entries, transports, handlers)
        };
        info!(exchanges = entries.len(), "exchange manager closing");
        for entry in &entries {
            entry.shared.set_closed(CloseCause::Shutdown);
        }
        drop(entries);
        for transport in transports {
            transport.close().await;
        }
        for handler in handlers {
            handler.on_close().await;
        }
        let _ = self.core.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Install helpers (call with the state lock held)
// ---------------------------------------------------------------------------

fn install_exchange(
    core: &Arc<ManagerCore>,
    state: &mut ManagerState,
    session: &Arc<Session>,
    exchange_id: u16,
    index: u32,
    initiated_by_us: bool,
    protocol_id: u16,
) -> Exchange {
    let (tx, rx) = mpsc::channel(core.config.inbox_depth);
    let shared = Arc::new(ExchangeShared::new(
        session.id(),
        exchange_id,
        index,
        initiated_by_us,
    ));
    let seq = state.next_seq;
    state.next_seq += 1;
    state.exchanges.insert(
        (session.id(), index),
        ExchangeEntry {
            tx,
            shared: shared.clone(),
            session: session.clone(),
            seq,
        },
    );
    Exchange::new(core.clone(), session.clone(), shared, rx, protocol_id)
}

/// Oldest live exchange of the session when the budget is exceeded.
fn over_budget_victim(
    core: &Arc<ManagerCore>,
    state: &mut ManagerState,
    session_id: u16,
) -> Option<(u16, u32)> {
    let live: Vec<(&(u16, u32), &ExchangeEntry)> = state
        .exchanges
        .iter()
        .filter(|((sid, _), e)| *sid == session_id && e.shared.close_cause().is_none())
        .collect();
    if live.len() <= core.config.max_exchanges_per_session {
        return None;
    }
    live.into_iter()
        .min_by_key(|(_, e)| e.seq)
        .map(|(k, _)| *k)
}

impl Exchange {
    /// The manager-side sender for this exchange's inbox. Used once, to
    /// queue the unsolicited first message before handing off.
    fn inbox_sender(&self) -> mpsc::Sender<InboundMessage> {
        let state = self.core.state.lock().expect("manager state");
        state
            .exchanges
            .get(&(self.session().id(), self.index()))
            .map(|e| e.tx.clone())
            .expect("freshly installed exchange")
    }
}
