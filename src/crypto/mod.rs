//! Credential envelope encryption.
//!
//! Three algorithms share one on-the-wire token shape:
//! `v1.<algorithm>.<algorithm-specific-parts>`. [`encrypt`]/[`decrypt`]
//! dispatch on the middle segment.

pub mod aead;
pub mod cbc_hmac;
pub mod keys;
pub mod reencrypt;

use crate::error::{RelayError, Result};

pub const ALGO_AES_GCM: &str = "aes-256-gcm";
pub const ALGO_CHACHA: &str = "chacha20-poly1305";
pub const ALGO_CBC_HMAC: &str = "aes-256-cbc-hmac";

fn normalize_algorithm(alg: &str) -> Result<&'static str> {
    match alg.to_ascii_lowercase().as_str() {
        "aes-256-gcm" | "aesgcm" | "gcm" => Ok(ALGO_AES_GCM),
        "chacha20-poly1305" | "chacha20poly1305" | "chacha" => Ok(ALGO_CHACHA),
        "aes-256-cbc-hmac" | "aes-cbc-hmac" | "cbc-hmac" => Ok(ALGO_CBC_HMAC),
        other => Err(RelayError::UnsupportedAlgorithm(other.to_string())),
    }
}

/// Encrypt `plaintext` under `key` using `algorithm`, producing a
/// self-describing token safe to store in `client_destination.password_enc`.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32], algorithm: &str, key_id: &str) -> Result<String> {
    let alg = normalize_algorithm(algorithm)?;
    let body = match alg {
        ALGO_AES_GCM => aead::encrypt_aes_gcm(plaintext, key)?,
        ALGO_CHACHA => aead::encrypt_chacha20poly1305(plaintext, key)?,
        ALGO_CBC_HMAC => cbc_hmac::encrypt(plaintext, key, key_id)?,
        _ => unreachable!(),
    };
    Ok(format!("v1.{alg}.{body}"))
}

/// Decrypt a token produced by [`encrypt`]. `key` must be the master key
/// registered under the `key_id` the token was originally sealed with.
pub fn decrypt(token: &str, key: &[u8; 32], key_id: &str) -> Result<Vec<u8>> {
    let mut parts = token.splitn(3, '.');
    let (Some(version), Some(alg), Some(rest)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(RelayError::InvalidToken("expected v1.<algorithm>.<body>".to_string()));
    };
    if version != "v1" {
        return Err(RelayError::InvalidToken(format!("unsupported token version: {version}")));
    }

    match normalize_algorithm(alg)? {
        ALGO_AES_GCM => aead::decrypt_aes_gcm(rest, key),
        ALGO_CHACHA => aead::decrypt_chacha20poly1305(rest, key),
        ALGO_CBC_HMAC => cbc_hmac::decrypt(rest, key, key_id),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_algorithms() {
        let key = [42u8; 32];
        for alg in [ALGO_AES_GCM, ALGO_CHACHA, ALGO_CBC_HMAC] {
            let token = encrypt(b"correct horse battery staple", &key, alg, "PRIMARY").unwrap();
            assert!(token.starts_with(&format!("v1.{alg}.")));
            assert_eq!(decrypt(&token, &key, "PRIMARY").unwrap(), b"correct horse battery staple");
        }
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let key = [1u8; 32];
        assert!(encrypt(b"x", &key, "rot13", "PRIMARY").is_err());
    }

    #[test]
    fn malformed_token_rejected() {
        let key = [1u8; 32];
        assert!(decrypt("not-a-token", &key, "PRIMARY").is_err());
        assert!(decrypt("v2.aes-256-gcm.AAAA.BBBB", &key, "PRIMARY").is_err());
    }
}
