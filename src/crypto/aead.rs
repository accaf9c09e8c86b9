//! AES-256-GCM and ChaCha20-Poly1305 envelopes.
//!
//! Token shape for both: `base64(iv_or_nonce).base64(ciphertext||tag)`.

use crate::error::{RelayError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

const IV_LEN: usize = 12;

fn split_token(rest: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let (iv_b64, ct_b64) = rest
        .split_once('.')
        .ok_or_else(|| RelayError::InvalidToken("expected iv.ciphertext".to_string()))?;
    let iv = STANDARD
        .decode(iv_b64)
        .map_err(|e| RelayError::InvalidToken(e.to_string()))?;
    let ct = STANDARD
        .decode(ct_b64)
        .map_err(|e| RelayError::InvalidToken(e.to_string()))?;
    Ok((iv, ct))
}

pub fn encrypt_aes_gcm(plaintext: &[u8], key: &[u8; 32]) -> Result<String> {
    let cipher = Aes256Gcm::new(key.into());
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ct = cipher
        .encrypt(GcmNonce::from_slice(&iv), Payload { msg: plaintext, aad: &[] })
        .map_err(|_| RelayError::InvalidToken("aes-gcm encrypt failed".to_string()))?;
    Ok(format!("{}.{}", STANDARD.encode(iv), STANDARD.encode(ct)))
}

pub fn decrypt_aes_gcm(rest: &str, key: &[u8; 32]) -> Result<Vec<u8>> {
    let (iv, ct) = split_token(rest)?;
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(GcmNonce::from_slice(&iv), Payload { msg: &ct, aad: &[] })
        .map_err(|_| RelayError::AuthTagMismatch)
}

pub fn encrypt_chacha20poly1305(plaintext: &[u8], key: &[u8; 32]) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(
            chacha20poly1305::Nonce::from_slice(&nonce),
            Payload { msg: plaintext, aad: &[] },
        )
        .map_err(|_| RelayError::InvalidToken("chacha20poly1305 encrypt failed".to_string()))?;
    Ok(format!("{}.{}", STANDARD.encode(nonce), STANDARD.encode(ct)))
}

pub fn decrypt_chacha20poly1305(rest: &str, key: &[u8; 32]) -> Result<Vec<u8>> {
    let (nonce, ct) = split_token(rest)?;
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), Payload { msg: &ct, aad: &[] })
        .map_err(|_| RelayError::AuthTagMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcm_round_trip() {
        let key = [7u8; 32];
        let token = encrypt_aes_gcm(b"hunter2", &key).unwrap();
        assert_eq!(decrypt_aes_gcm(&token, &key).unwrap(), b"hunter2");
    }

    #[test]
    fn gcm_tampered_tag_rejected() {
        let key = [7u8; 32];
        let mut token = encrypt_aes_gcm(b"hunter2", &key).unwrap();
        token.push('A');
        assert!(decrypt_aes_gcm(&token, &key).is_err());
    }

    #[test]
    fn chacha_round_trip() {
        let key = [9u8; 32];
        let token = encrypt_chacha20poly1305(b"hunter2", &key).unwrap();
        assert_eq!(decrypt_chacha20poly1305(&token, &key).unwrap(), b"hunter2");
    }

    #[test]
    fn wrong_key_fails() {
        let key = [1u8; 32];
        let other = [2u8; 32];
        let token = encrypt_aes_gcm(b"secret", &key).unwrap();
        assert!(decrypt_aes_gcm(&token, &other).is_err());
    }
}
