//! Crypto seam wiring for the standalone node.
//!
//! Operational AES-CCM session keys come out of CASE/PASE, which this
//! binary does not run; sessions here are unsecured development sessions.
//! The pass-through AEAD keeps the framing honest (tag appended and
//! verified) while performing no encryption, and is only reachable when
//! `interaction.allow_unsecured_sessions` is set.

use mtr_exchange::{Crypto, CryptoError};

pub struct PassthroughCrypto;

impl Crypto for PassthroughCrypto {
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
