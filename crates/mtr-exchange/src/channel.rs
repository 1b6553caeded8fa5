//! Transport seam.
//!
//! The core consumes an abstract packet-in / packet-out contract. Inbound
//! packets are pushed into [`crate::ExchangeManager::on_message`] by the
//! transport adapter; outbound packets leave through the [`PacketChannel`]
//! a session holds.

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("send failed: {0}")]
    Io(String),
}

/// One direction of a connectionless transport, bound to a single peer
/// address. Cheap to clone behind an `Arc`.
#[async_trait]
pub trait PacketChannel: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError>;

    /// Human-readable peer label for logs (e.g. "udp:192.168.4.20:5540").
    fn label(&self) -> String;
}

/// A whole transport adapter, registered with the exchange manager so
/// `close()` can shut it down after the exchanges.
#[async_trait]
pub trait Transport: Send + Sync {
    fn label(&self) -> &str;
    async fn close(&self);
}
