//! A single exchange: inbox, MRP state, reliable send.
//!
//! The manager feeds decrypted messages into the inbox; the protocol
//! handler that owns the `Exchange` drives it. MRP state is shared with the
//! manager's ingest path behind a mutex because acks and duplicates are
//! handled there before delivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mtr_proto::{PayloadHeader, mrp, secure_channel_opcode};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::crypto::Crypto;
use crate::error::{CloseCause, ExchangeError};
use crate::manager::ManagerCore;
use crate::session::Session;

/// A decrypted message delivered to an exchange.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub protocol_id: u16,
    pub message_type: u8,
    pub payload: Bytes,
    pub message_counter: u32,
}

// ---------------------------------------------------------------------------
// Shared MRP state
// ---------------------------------------------------------------------------

pub(crate) struct OutstandingSend {
    pub(crate) counter: u32,
    pub(crate) ack_tx: oneshot::Sender<()>,
}

#[derive(Default)]
pub(crate) struct MrpState {
    /// Counter of the last inbound reliable message we still owe an ack.
    pub(crate) pending_ack: Option<u32>,
    /// Our one in-flight reliable message, if any.
    pub(crate) outstanding: Option<OutstandingSend>,
    pub(crate) close_cause: Option<CloseCause>,
}

pub(crate) struct ExchangeShared {
    pub(crate) session_id: u16,
    pub(crate) exchange_id: u16,
    pub(crate) index: u32,
    pub(crate) initiated_by_us: bool,
    pub(crate) mrp: Mutex<MrpState>,
    pub(crate) last_activity: Mutex<Instant>,
}

impl ExchangeShared {
    pub(crate) fn new(session_id: u16, exchange_id: u16, index: u32, initiated_by_us: bool) -> Self {
        ExchangeShared {
            session_id,
            exchange_id,
            index,
            initiated_by_us,
            mrp: Mutex::new(MrpState::default()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    pub(crate) fn idle_since(&self) -> Instant {
        *self.last_activity.lock().expect("activity lock")
    }

    pub(crate) fn close_cause(&self) -> Option<CloseCause> {
        self.mrp.lock().expect("mrp lock").close_cause
    }

    /// Mark closed and drop any in-flight send so its waiter wakes.
    pub(crate) fn set_closed(&self, cause: CloseCause) {
        let mut mrp = self.mrp.lock().expect("mrp lock");
        if mrp.close_cause.is_none() {
            mrp.close_cause = Some(cause);
        }
        mrp.outstanding = None;
    }

    pub(crate) fn take_pending_ack(&self) -> Option<u32> {
        self.mrp.lock().expect("mrp lock").pending_ack.take()
    }

    pub(crate) fn register_pending_ack(&self, counter: u32) {
        self.mrp.lock().expect("mrp lock").pending_ack = Some(counter);
    }

    /// Peer acknowledged `ack_id`; wake the sender if it matches.
    pub(crate) fn handle_ack(&self, ack_id: u32) {
        let mut mrp = self.mrp.lock().expect("mrp lock");
        if mrp
            .outstanding
            .as_ref()
            .is_some_and(|out| out.counter == ack_id)
        {
            let out = mrp.outstanding.take().expect("checked above");
            let _ = out.ack_tx.send(());
        }
    }
}

/// Emit a standalone MRP ack on `session` for exchange `exchange_id`.
pub(crate) async fn send_raw_ack(
    crypto: &dyn Crypto,
    session: &Session,
    exchange_id: u16,
    we_are_initiator: bool,
    ack_counter: u32,
) -> Result<(), ExchangeError> {
    let header = PayloadHeader {
        is_initiator: we_are_initiator,
        requires_ack: false,
        message_type: secure_channel_opcode::MRP_STANDALONE_ACK,
        exchange_id,
        protocol_id: mtr_proto::PROTOCOL_ID_SECURE_CHANNEL,
        vendor_id: None,
        ack_message_id: Some(ack_counter),
    };
    let (_, wire) = session.encode_message(crypto, &header, &[])?;
    session.channel().send(wire).await?;
    trace!(exchange_id, ack_counter, "standalone ack sent");
    Ok(())
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

pub struct Exchange {
    pub(crate) core: Arc<ManagerCore>,
    pub(crate) session: Arc<Session>,
    pub(crate) shared: Arc<ExchangeShared>,
    pub(crate) inbox: mpsc::Receiver<InboundMessage>,
    pub(crate) protocol_id: u16,
    timed_deadline: Option<Instant>,
    defused: bool,
}

impl Exchange {
    pub(crate) fn new(
        core: Arc<ManagerCore>,
        session: Arc<Session>,
        shared: Arc<ExchangeShared>,
        inbox: mpsc::Receiver<InboundMessage>,
        protocol_id: u16,
    ) -> Self {
        Exchange {
            core,
            session,
            shared,
            inbox,
            protocol_id,
            timed_deadline: None,
            defused: false,
        }
    }

    pub fn exchange_id(&self) -> u16 {
        self.shared.exchange_id
    }

    /// 17-bit index: the exchange id, with the high bit set when we
    /// initiated the exchange.
    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn is_initiator(&self) -> bool {
        self.shared.initiated_by_us
    }

    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Application payload budget for one message on this exchange.
    pub fn max_payload_size(&self) -> usize {
        crate::MAX_PAYLOAD_SIZE
    }

    // -----------------------------------------------------------------------
    // Timed-interaction bookkeeping
    // -----------------------------------------------------------------------

    pub fn set_timed_deadline(&mut self, deadline: Instant) {
        self.timed_deadline = Some(deadline);
    }

    pub fn timed_deadline(&self) -> Option<Instant> {
        self.timed_deadline
    }

    pub fn clear_timed_deadline(&mut self) {
        self.timed_deadline = None;
    }

    // -----------------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------------

    /// Next message on this exchange, in arrival order.
    pub async fn next(&mut self) -> Result<InboundMessage, ExchangeError> {
        match self.inbox.recv().await {
            Some(message) => {
                self.shared.touch();
                Ok(message)
            }
            None => Err(ExchangeError::Closed(
                self.shared.close_cause().unwrap_or(CloseCause::Graceful),
            )),
        }
    }

    /// Like [`next`], bounded by a deadline.
    pub async fn next_within(&mut self, limit: Duration) -> Result<InboundMessage, ExchangeError> {
        match tokio::time::timeout(limit, self.next()).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Closed(CloseCause::Idle)),
        }
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Reliable send: retransmits on the MRP schedule until acked, and
    /// fails the peer after the transmission budget.
    pub async fn send(&mut self, message_type: u8, payload: &[u8]) -> Result<(), ExchangeError> {
        self.send_with(message_type, payload, true).await
    }

    /// Fire-and-forget send (group messages, acks piggybacked elsewhere).
    pub async fn send_unreliable(
        &mut self,
        message_type: u8,
        payload: &[u8],
    ) -> Result<(), ExchangeError> {
        self.send_with(message_type, payload, false).await
    }

    async fn send_with(
        &mut self,
        message_type: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), ExchangeError> {
        if let Some(cause) = self.shared.close_cause() {
            return Err(ExchangeError::Closed(cause));
        }
        if payload.len() > self.max_payload_size() {
            return Err(ExchangeError::PayloadTooLarge(payload.len()));
        }
        let requires_ack = reliable && !self.session.is_group();

        // At most one unacknowledged outbound at a time.
        let ack_rx = if requires_ack {
            let mut mrp = self.shared.mrp.lock().expect("mrp lock");
            if mrp.outstanding.is_some() {
                return Err(ExchangeError::SendOutstanding);
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            // Counter filled in below once assigned.
            mrp.outstanding = Some(OutstandingSend { counter: 0, ack_tx });
            Some(ack_rx)
        } else {
            None
        };

        let piggyback = self.shared.take_pending_ack();
        let header = PayloadHeader {
            is_initiator: self.shared.initiated_by_us,
            requires_ack,
            message_type,
            exchange_id: self.shared.exchange_id,
            protocol_id: self.protocol_id,
            vendor_id: None,
            ack_message_id: piggyback,
        };

        let encoded = self
            .session
            .encode_message(self.core.crypto.as_ref(), &header, payload);
        let (counter, wire) = match encoded {
            Ok(ok) => ok,
            Err(e) => {
                self.shared.mrp.lock().expect("mrp lock").outstanding = None;
                return Err(e);
            }
        };
        if let Some(out) = self
            .shared
            .mrp
            .lock()
            .expect("mrp lock")
            .outstanding
            .as_mut()
        {
            out.counter = counter;
        }

        self.shared.touch();
        if let Err(e) = self.session.channel().send(wire.clone()).await {
            self.shared.mrp.lock().expect("mrp lock").outstanding = None;
            return Err(e.into());
        }
        trace!(
            exchange_id = self.shared.exchange_id,
            counter, message_type, requires_ack, "message sent"
        );

        let Some(mut ack_rx) = ack_rx else {
            return Ok(());
        };

        let params = self.session.params().clone();
        let mut send_count = 1u32;
        loop {
            let wait = mrp::mrp_backoff(&params, send_count);
            tokio::select! {
                result = &mut ack_rx => {
                    return match result {
                        Ok(()) => {
                            self.shared.touch();
                            Ok(())
                        }
                        // Outstanding dropped: the exchange was closed under us.
                        Err(_) => Err(ExchangeError::Closed(
                            self.shared.close_cause().unwrap_or(CloseCause::Graceful),
                        )),
                    };
                }
                _ = tokio::time::sleep(wait) => {
                    if send_count >= mrp::MRP_MAX_TRANSMISSIONS {
                        warn!(
                            exchange_id = self.shared.exchange_id,
                            counter,
                            peer = %self.session.peer(),
                            "retransmission budget exhausted, failing peer"
                        );
                        self.shared.set_closed(CloseCause::PeerLost);
                        self.core.fail_peer(&self.session).await;
                        return Err(ExchangeError::PeerLost);
                    }
                    send_count += 1;
                    debug!(
                        exchange_id = self.shared.exchange_id,
                        counter, send_count, "retransmitting"
                    );
                    if let Err(e) = self.session.channel().send(wire.clone()).await {
                        self.shared.mrp.lock().expect("mrp lock").outstanding = None;
                        return Err(e.into());
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Graceful close. Any ack still owed to the peer is flushed as a
    /// standalone ack before the exchange is deregistered.
    pub async fn close(mut self) {
        self.inbox.close();
        if let Some(ack) = self.shared.take_pending_ack() {
            let _ = send_raw_ack(
                self.core.crypto.as_ref(),
                &self.session,
                self.shared.exchange_id,
                self.shared.initiated_by_us,
                ack,
            )
            .await;
        }
        self.core
            .remove_exchange(self.shared.session_id, self.shared.index, CloseCause::Graceful);
        self.defused = true;
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        self.core.remove_exchange(
            self.shared.session_id,
            self.shared.index,
            CloseCause::Graceful,
        );
        // Flush the owed ack if we are still inside a runtime.
        if let Some(ack) = self.shared.take_pending_ack() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let core = self.core.clone();
                let session = self.session.clone();
                let shared = self.shared.clone();
                handle.spawn(async move {
                    let _ = send_raw_ack(
                        core.crypto.as_ref(),
                        &session,
                        shared.exchange_id,
                        shared.initiated_by_us,
                        ack,
                    )
                    .await;
                });
            }
        }
    }
}
