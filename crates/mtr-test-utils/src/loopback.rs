//! In-process loopback transport with fault injection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use mtr_exchange::{ChannelError, Crypto, CryptoError, PacketChannel};
use tokio::sync::mpsc;

/// One-shot fault knobs, armed by tests between operations.
#[derive(Debug, Default)]
pub struct Faults {
    drop_next: AtomicBool,
    duplicate_next: AtomicBool,
}

impl Faults {
    pub fn drop_next(&self) {
        self.drop_next.store(true, Ordering::SeqCst);
    }

    pub fn duplicate_next(&self) {
        self.duplicate_next.store(true, Ordering::SeqCst);
    }
}

/// Outbound half of a loopback link; the paired pump feeds the bytes into
/// the other node's exchange manager.
pub struct LoopbackChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    faults: Arc<Faults>,
    label: String,
}

impl LoopbackChannel {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>, faults: Arc<Faults>, label: &str) -> Self {
        LoopbackChannel {
            tx,
            faults,
            label: label.to_owned(),
        }
    }
}

#[async_trait]
impl PacketChannel for LoopbackChannel {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.faults.drop_next.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(data.clone())
            .map_err(|_| ChannelError::Closed)?;
        if self.faults.duplicate_next.swap(false, Ordering::SeqCst) {
            self.tx.send(data).map_err(|_| ChannelError::Closed)?;
        }
        Ok(())
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// Pass-through AEAD: appends a 16-byte zero tag and verifies it on
/// decrypt. Keeps framing honest without pulling real crypto into tests.
pub struct NullCrypto;

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
        let (body, tag) = ciphertext.split_at(ciphertext.len() - 16);
        if tag != [0u8; 16] {
            return Err(CryptoError::TagMismatch);
        }
        Ok(body.to_vec())
    }
}
