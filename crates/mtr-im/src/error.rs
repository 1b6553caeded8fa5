//! Interaction-layer errors.

use mtr_exchange::{ExchangeError, PeerAddress};
use mtr_proto::Status;
use mtr_tlv::TlvError;

#[derive(Debug, thiserror::Error)]
pub enum InteractionError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Tlv(#[from] TlvError),
    #[error("peer answered with status {0}")]
    PeerStatus(Status),
    #[error("unexpected message type {0:#04x}")]
    UnexpectedMessage(u8),
    #[error("aborted by caller")]
    Aborted,
    #[error("command batcher closed")]
    BatcherClosed,
    #[error("batched invoke failed: {0}")]
    BatchFailed(String),
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("store: {0}")]
    Store(String),
    #[error("subscription establishment already in flight for {0}")]
    EstablishmentInProgress(PeerAddress),
    #[error("subscription {0} is gone")]
    SubscriptionGone(u32),
}

impl InteractionError {
    /// See [`ExchangeError::is_shutdown`]; interaction errors inherit the
    /// classification of the exchange error they wrap.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, InteractionError::Exchange(e) if e.is_shutdown())
    }
}
