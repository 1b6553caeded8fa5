//! UDP transport adapter.
//!
//! Implements the packet-in / packet-out contract: datagrams feed the
//! exchange manager, and outbound packets go back to the datagram's
//! source address.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mtr_exchange::{ChannelError, ExchangeManager, PacketChannel, Transport};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outbound half bound to one peer address.
struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl PacketChannel for UdpChannel {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        self.socket
            .send_to(&data, self.peer)
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        Ok(())
    }

    fn label(&self) -> String {
        format!("udp:{}", self.peer)
    }
}

pub struct UdpTransport {
    label: String,
    shutdown_tx: watch::Sender<bool>,
}

impl UdpTransport {
    /// Bind and start the receive loop, feeding the exchange manager.
    pub async fn start(bind: &str, manager: ExchangeManager) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let local = socket.local_addr()?;
        info!(%local, "udp transport bound");
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let transport = Arc::new(UdpTransport {
            label: format!("udp:{local}"),
            shutdown_tx,
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; mtr_proto::MAX_MESSAGE_SIZE];
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, peer)) => {
                                let channel = Arc::new(UdpChannel {
                                    socket: socket.clone(),
                                    peer,
                                });
                                let data = Bytes::copy_from_slice(&buf[..len]);
                                manager.on_message(channel, data).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "udp receive error");
                            }
                        }
                    }
                }
            }
            debug!("udp receive loop ended");
        });

        Ok(transport)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn close(&self) {
        // The receive task owns the socket; it drops when the loop exits.
        let _ = self.shutdown_tx.send(true);
    }
}
