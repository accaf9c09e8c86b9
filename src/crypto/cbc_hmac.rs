//! AES-256-CBC + HMAC-SHA256, encrypt-then-MAC.
//!
//! Token shape: `base64(iv).base64(ciphertext).base64(tag)`. Subkeys are
//! derived from the master key via HKDF-SHA256 so the same master key never
//! touches both the cipher and the MAC directly.

use crate::error::{RelayError, Result};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type Enc = cbc::Encryptor<Aes256>;
type Dec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const DOMAIN: &[u8] = b"v1|aes-256-cbc-hmac|";
const IV_LEN: usize = 16;

fn derive_subkey(master_key: &[u8; 32], info: &[u8], key_id: &str) -> [u8; 32] {
    let salt = Sha256::digest(key_id.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), master_key);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out).expect("32 is a valid HKDF-SHA256 output length");
    out
}

pub fn encrypt(plaintext: &[u8], master_key: &[u8; 32], key_id: &str) -> Result<String> {
    let enc_key = derive_subkey(master_key, b"aes-cbc|enc", key_id);
    let mac_key = derive_subkey(master_key, b"aes-cbc|mac", key_id);

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ct = Enc::new(&enc_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("HMAC accepts any key length");
    mac.update(DOMAIN);
    mac.update(&iv);
    mac.update(&ct);
    let tag = mac.finalize().into_bytes();

    Ok(format!(
        "{}.{}.{}",
        STANDARD.encode(iv),
        STANDARD.encode(&ct),
        STANDARD.encode(tag)
    ))
}

pub fn decrypt(rest: &str, master_key: &[u8; 32], key_id: &str) -> Result<Vec<u8>> {
    let mut parts = rest.splitn(3, '.');
    let (Some(iv_b64), Some(ct_b64), Some(tag_b64)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(RelayError::InvalidToken("expected iv.ciphertext.tag".to_string()));
    };
    let iv = STANDARD.decode(iv_b64).map_err(|e| RelayError::InvalidToken(e.to_string()))?;
    let ct = STANDARD.decode(ct_b64).map_err(|e| RelayError::InvalidToken(e.to_string()))?;
    let tag = STANDARD.decode(tag_b64).map_err(|e| RelayError::InvalidToken(e.to_string()))?;

    let enc_key = derive_subkey(master_key, b"aes-cbc|enc", key_id);
    let mac_key = derive_subkey(master_key, b"aes-cbc|mac", key_id);

    let mut mac = HmacSha256::new_from_slice(&mac_key).expect("HMAC accepts any key length");
    mac.update(DOMAIN);
    mac.update(&iv);
    mac.update(&ct);
    let expected = mac.finalize().into_bytes();
    if expected.ct_eq(&tag).unwrap_u8() != 1 {
        return Err(RelayError::AuthTagMismatch);
    }

    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| RelayError::InvalidToken("bad iv length".to_string()))?;
    Dec::new(&enc_key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|_| RelayError::InvalidToken("bad padding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [3u8; 32];
        let token = encrypt(b"s3cr3t-password", &key, "PRIMARY").unwrap();
        assert_eq!(decrypt(&token, &key, "PRIMARY").unwrap(), b"s3cr3t-password");
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let key = [3u8; 32];
        let token = encrypt(b"s3cr3t-password", &key, "PRIMARY").unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let mut ct = STANDARD.decode(parts[1]).unwrap();
        ct[0] ^= 0xff;
        let tampered_ct = STANDARD.encode(ct);
        parts[1] = &tampered_ct;
        let tampered = parts.join(".");
        assert!(decrypt(&tampered, &key, "PRIMARY").is_err());
    }

    #[test]
    fn different_key_id_yields_different_subkeys() {
        let key = [5u8; 32];
        let a = derive_subkey(&key, b"aes-cbc|enc", "PRIMARY");
        let b = derive_subkey(&key, b"aes-cbc|enc", "SECONDARY");
        assert_ne!(a, b);
    }
}
