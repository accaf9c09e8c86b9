//! Bulk re-encryption support for key rotation.
//!
//! Pure transform: decrypt every `password_enc` token under its recorded
//! `encryption_version` (the compound `"<key_id>.<version>"` string), re-seal
//! under the ring's active key, and report which destinations changed. The
//! caller (a migration binary) is responsible for loading
//! `client_destination` rows and persisting the results; this module never
//! touches the database directly so it stays unit-testable against an
//! in-memory [`KeyRing`](super::keys::KeyRing).

use crate::crypto::keys::{parse_encryption_version, KeyRing};
use crate::db::Repository;
use crate::error::Result;

pub struct ReencryptTarget {
    pub destination_id: i64,
    pub password_enc: String,
    pub encryption_version: String,
}

pub struct ReencryptResult {
    pub destination_id: i64,
    pub password_enc: String,
    pub encryption_version: String,
}

/// Re-seal every target under `ring.active_key_id()`, using `algorithm`
/// for the new envelope. Targets already sealed under the active key are
/// skipped (re-encrypting them would be a no-op and needlessly rotate
/// IVs/nonces on every run).
pub fn reencrypt_all(
    targets: Vec<ReencryptTarget>,
    ring: &KeyRing,
    algorithm: &str,
) -> Result<Vec<ReencryptResult>> {
    let active_encryption_version = ring.active_encryption_version();
    let mut out = Vec::with_capacity(targets.len());

    for target in targets {
        if target.encryption_version == active_encryption_version {
            continue;
        }

        let (key_id, version) = parse_encryption_version(&target.encryption_version)?;
        let old_key = ring.get(&key_id, version)?;
        let plaintext = crate::crypto::decrypt(&target.password_enc, old_key, &key_id)?;

        let new_key = ring.active_key()?;
        let token = crate::crypto::encrypt(&plaintext, new_key, algorithm, ring.active_key_id())?;

        out.push(ReencryptResult {
            destination_id: target.destination_id,
            password_enc: token,
            encryption_version: active_encryption_version.clone(),
        });
    }

    Ok(out)
}

/// Load every ciphertext-bearing `client_destination` row, re-seal the
/// ones sealed under a retired key, and persist the results. Returns
/// `(updated, failed)`.
pub async fn run_reencryption_pass(repo: &dyn Repository, ring: &KeyRing, algorithm: &str) -> Result<(usize, usize)> {
    let rows = repo.client_destinations_for_reencryption().await?;
    let targets: Vec<ReencryptTarget> = rows
        .into_iter()
        .filter_map(|row| {
            let password_enc = row.password_enc.as_ref()?;
            let encryption_version = row.encryption_version.clone()?;
            Some(ReencryptTarget {
                destination_id: row.id,
                password_enc: String::from_utf8_lossy(password_enc).to_string(),
                encryption_version,
            })
        })
        .collect();

    let mut updated = 0usize;
    let mut failed = 0usize;

    // Re-encrypt one at a time instead of batching through reencrypt_all so
    // a single bad row (corrupt ciphertext, missing historical key) can't
    // stop the rest of the walk.
    for target in targets {
        let destination_id = target.destination_id;
        match reencrypt_all(vec![target], ring, algorithm) {
            Ok(results) => {
                for result in results {
                    match repo
                        .update_destination_secret(result.destination_id, &result.password_enc, &result.encryption_version)
                        .await
                    {
                        Ok(()) => updated += 1,
                        Err(_) => failed += 1,
                    }
                }
            }
            Err(_) => failed += 1,
        }
    }

    // Rows already sealed under the active key are silently skipped by
    // reencrypt_all, not failures.
    Ok((updated, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_key;

    fn ring_with(old_id: &str, new_id: &str) -> (KeyRing, [u8; 32], [u8; 32]) {
        let (old_key, old_encoded) = generate_key();
        let mut ring = KeyRing::from_db_rows(
            vec![crate::model::CryptoKeyRow {
                key_id: old_id.to_string(),
                version: 1,
                key_material: old_encoded,
                updated_at: chrono::Utc::now(),
            }],
            old_id,
            1,
        )
        .unwrap();
        let (new_key, _) = generate_key();
        ring.insert(new_id.to_string(), 1, new_key);
        ring.set_active(new_id.to_string(), 1);
        (ring, old_key, new_key)
    }

    #[test]
    fn rotates_targets_sealed_under_retired_key() {
        let (ring, old_key, _new_key) = ring_with("OLD", "NEW");
        let token = crate::crypto::encrypt(b"topsecret", &old_key, "aes-256-gcm", "OLD").unwrap();

        let targets = vec![ReencryptTarget {
            destination_id: 1,
            password_enc: token,
            encryption_version: "OLD.1".to_string(),
        }];

        let results = reencrypt_all(targets, &ring, "aes-256-gcm").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].encryption_version, "NEW.1");

        let new_key = ring.active_key().unwrap();
        let plaintext = crate::crypto::decrypt(&results[0].password_enc, new_key, "NEW").unwrap();
        assert_eq!(plaintext, b"topsecret");
    }

    #[test]
    fn skips_targets_already_on_active_key() {
        let (ring, _old_key, new_key) = ring_with("OLD", "NEW");
        let token = crate::crypto::encrypt(b"already-current", &new_key, "aes-256-gcm", "NEW").unwrap();

        let targets = vec![ReencryptTarget {
            destination_id: 2,
            password_enc: token,
            encryption_version: "NEW.1".to_string(),
        }];

        let results = reencrypt_all(targets, &ring, "aes-256-gcm").unwrap();
        assert!(results.is_empty());
    }

    /// The default `key_source = env` case: rotation bumps the version but
    /// the `key_id` itself stays the same ("PRIMARY"), so the skip check
    /// must compare the full compound string, not just `key_id`.
    #[test]
    fn rotates_when_key_id_is_unchanged_but_version_bumped() {
        let (old_key, old_encoded) = generate_key();
        let (new_key, new_encoded) = generate_key();
        let ring = KeyRing::from_db_rows(
            vec![
                crate::model::CryptoKeyRow { key_id: "PRIMARY".into(), version: 1, key_material: old_encoded, updated_at: chrono::Utc::now() },
                crate::model::CryptoKeyRow { key_id: "PRIMARY".into(), version: 2, key_material: new_encoded, updated_at: chrono::Utc::now() },
            ],
            "PRIMARY",
            2,
        )
        .unwrap();

        let token = crate::crypto::encrypt(b"s3cr3t", &old_key, "aes-256-gcm", "PRIMARY").unwrap();
        let targets = vec![ReencryptTarget {
            destination_id: 4,
            password_enc: token,
            encryption_version: "PRIMARY.1".to_string(),
        }];

        let results = reencrypt_all(targets, &ring, "aes-256-gcm").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].encryption_version, "PRIMARY.2");

        let plaintext = crate::crypto::decrypt(&results[0].password_enc, &new_key, "PRIMARY").unwrap();
        assert_eq!(plaintext, b"s3cr3t");
    }
}
