// mtr-exchange: sessions, message counters, exchange multiplexing, and MRP.
//
// The exchange manager is the single entry point for inbound packets and the
// single factory for outbound exchanges. Each live exchange is a small actor:
// the manager routes decrypted messages into its inbox, and the protocol
// handler that owns it drives sends (with MRP retransmission) and receives.

pub mod channel;
pub mod counter;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod manager;
pub mod peer;
pub mod session;

pub use channel::{ChannelError, PacketChannel, Transport};
pub use counter::{CounterVerdict, MessageCounterWindow};
pub use crypto::{Crypto, CryptoError, SessionKeys};
pub use error::{CloseCause, ExchangeError};
pub use exchange::{Exchange, InboundMessage};
pub use manager::{ExchangeConfig, ExchangeManager, ProtocolHandler};
pub use peer::{FabricIndex, NodeId, PeerAddress};
pub use session::{GroupKeys, SecureSessionConfig, Session, SessionEvent, SessionManager};

/// Bit marking an exchange index as locally initiated.
pub const INITIATED_FLAG: u32 = 0x1_0000;

/// Live exchanges allowed on one session before the oldest is evicted.
/// Protects the peer's 32-entry message-counter window.
pub const MAX_EXCHANGES_PER_SESSION: usize = 30;

/// Application payload budget per message: transport MTU minus worst-case
/// packet header, payload header, and AEAD tag.
pub const MAX_PAYLOAD_SIZE: usize = mtr_proto::MAX_MESSAGE_SIZE - 24 - 10 - 16;
