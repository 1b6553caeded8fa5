//! Error types for the exchange layer.

use crate::peer::PeerAddress;

/// Why an exchange went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Both sides were done; normal end of conversation.
    Graceful,
    /// No traffic for the inactivity interval.
    Idle,
    /// Evicted to keep the per-session exchange count bounded.
    Evicted,
    /// The underlying session closed.
    SessionClosed,
    /// MRP retransmissions exhausted.
    PeerLost,
    /// The node is shutting down.
    Shutdown,
    /// A protocol handler failed.
    HandlerError,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseCause::Graceful => "graceful",
            CloseCause::Idle => "idle",
            CloseCause::Evicted => "evicted",
            CloseCause::SessionClosed => "session closed",
            CloseCause::PeerLost => "peer lost",
            CloseCause::Shutdown => "shutdown",
            CloseCause::HandlerError => "handler error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("no session for peer {0}")]
    NoSession(PeerAddress),
    #[error("session closed")]
    SessionClosed,
    #[error("exchange closed ({0})")]
    Closed(CloseCause),
    #[error("peer lost after retransmission budget")]
    PeerLost,
    #[error("shutting down")]
    Shutdown,
    #[error("a reliable send is already outstanding")]
    SendOutstanding,
    #[error("protocol handler already registered for protocol {0:#06x}")]
    HandlerExists(u16),
    #[error("payload of {0} bytes exceeds the message budget")]
    PayloadTooLarge(usize),
    #[error(transparent)]
    Channel(#[from] crate::channel::ChannelError),
    #[error(transparent)]
    Codec(#[from] mtr_proto::CodecError),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl ExchangeError {
    /// Shutdown-flavored errors are expected during teardown and are logged
    /// at debug, not error.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            ExchangeError::Shutdown
                | ExchangeError::Closed(CloseCause::Shutdown)
                | ExchangeError::Closed(CloseCause::SessionClosed)
        )
    }
}
