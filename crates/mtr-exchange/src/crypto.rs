//! Crypto seam.
//!
//! AES-CCM itself lives outside the core; sessions only need an AEAD
//! encrypt/decrypt pair and the Matter nonce layout.

use mtr_proto::SecurityFlags;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("authentication tag mismatch")]
    TagMismatch,
    #[error("ciphertext too short")]
    TooShort,
}

/// Keying material for one secure session direction pair.
#[derive(Clone)]
pub struct SessionKeys {
    pub encrypt_key: Vec<u8>,
    pub decrypt_key: Vec<u8>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes never reach logs.
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// AEAD provider. Implementations append/verify the 16-byte tag.
pub trait Crypto: Send + Sync {
    fn encrypt(&self, key: &[u8], nonce: &[u8; NONCE_LENGTH], aad: &[u8], plaintext: &[u8])
    -> Vec<u8>;

    fn decrypt(
        &self,
        key: &[u8],
        nonce: &[u8; NONCE_LENGTH],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

pub const NONCE_LENGTH: usize = 13;

/// Matter message nonce: security flags ‖ counter LE ‖ source node id LE.
pub fn message_nonce(
    security_flags: SecurityFlags,
    session_type_bits: u8,
    counter: u32,
    source_node_id: u64,
) -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    nonce[0] = security_flags.bits() | session_type_bits;
    nonce[1..5].copy_from_slice(&counter.to_le_bytes());
    nonce[5..13].copy_from_slice(&source_node_id.to_le_bytes());
    nonce
}
