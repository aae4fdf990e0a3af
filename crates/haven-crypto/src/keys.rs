use std::time::{Duration, Instant};

use dashmap::DashMap;
use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use haven_core::ids::UserId;

use crate::error::CryptoError;

/// Per-user salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Slow key-derivation parameters. The iteration count is deliberately
/// expensive so a stolen salt does not make brute force cheap; tests use
/// a fast profile.
#[derive(Clone, Debug)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP recommendation for PBKDF2-HMAC-SHA256
        Self { iterations: 600_000 }
    }
}

impl KdfParams {
    /// Cheap profile for tests. Never use outside test code.
    pub fn fast_insecure() -> Self {
        Self { iterations: 16 }
    }
}

struct CachedKey {
    key: Zeroizing<[u8; 32]>,
    inserted_at: Instant,
}

/// Derives and caches per-user symmetric keys.
///
/// Keys are a deterministic function of (master secret, user salt,
/// derivation version). The cache is in-memory only, keyed by
/// (user, version), and entries expire after a bounded TTL. Rotation is
/// a store-side version bump; callers invalidate here afterwards.
pub struct KeyManager {
    master: SecretString,
    params: KdfParams,
    cache_ttl: Duration,
    cache: DashMap<(UserId, u32), CachedKey>,
}

impl KeyManager {
    pub fn new(master: SecretString, params: KdfParams, cache_ttl: Duration) -> Self {
        Self {
            master,
            params,
            cache_ttl,
            cache: DashMap::new(),
        }
    }

    /// Derive the key for `user` at `version`, using the cached value when
    /// fresh. An empty salt means the user's key material was never
    /// provisioned; fatal for that user and surfaced, never retried.
    pub fn derive(
        &self,
        user: &UserId,
        salt: &[u8],
        version: u32,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        if salt.is_empty() {
            return Err(CryptoError::MissingKeyMaterial(user.to_string()));
        }

        let cache_key = (user.clone(), version);
        if let Some(entry) = self.cache.get(&cache_key) {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                return Ok(entry.key.clone());
            }
        }

        // Version participates in derivation so a rotation yields a
        // fresh key even with the same salt.
        let mut salted = Vec::with_capacity(salt.len() + 8);
        salted.extend_from_slice(salt);
        salted.extend_from_slice(b":v");
        salted.extend_from_slice(&version.to_le_bytes());

        let mut key_bytes = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            self.master.expose_secret().as_bytes(),
            &salted,
            self.params.iterations,
            &mut key_bytes,
        );
        let key = Zeroizing::new(key_bytes);

        debug!(user_id = %user, version, "derived user key");
        self.cache.insert(
            cache_key,
            CachedKey {
                key: key.clone(),
                inserted_at: Instant::now(),
            },
        );

        Ok(key)
    }

    /// Drop every cached version for `user`. Called after rotation and on
    /// shutdown paths; derivation repopulates on next use.
    pub fn invalidate(&self, user: &UserId) {
        self.cache.retain(|(cached_user, _), _| cached_user != user);
    }

    /// Evict entries past their TTL. Safe to call from a periodic sweep.
    pub fn purge_expired(&self) {
        let ttl = self.cache_ttl;
        self.cache.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }

    /// Generate a fresh per-user salt from OS randomness.
    pub fn generate_salt() -> [u8; SALT_LEN] {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> KeyManager {
        KeyManager::new(
            SecretString::from("test-master-secret"),
            KdfParams::fast_insecure(),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn derivation_is_deterministic() {
        let km = manager();
        let user = UserId::new();
        let salt = [7u8; SALT_LEN];
        let a = km.derive(&user, &salt, 1).unwrap();
        km.invalidate(&user);
        let b = km.derive(&user, &salt, 1).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn different_users_different_keys() {
        let km = manager();
        let a = km.derive(&UserId::new(), &[1u8; SALT_LEN], 1).unwrap();
        let b = km.derive(&UserId::new(), &[2u8; SALT_LEN], 1).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn version_changes_key() {
        let km = manager();
        let user = UserId::new();
        let salt = [9u8; SALT_LEN];
        let v1 = km.derive(&user, &salt, 1).unwrap();
        let v2 = km.derive(&user, &salt, 2).unwrap();
        assert_ne!(*v1, *v2);
    }

    #[test]
    fn master_secret_changes_key() {
        let user = UserId::new();
        let salt = [3u8; SALT_LEN];
        let km1 = KeyManager::new(
            SecretString::from("secret-one"),
            KdfParams::fast_insecure(),
            Duration::from_secs(3600),
        );
        let km2 = KeyManager::new(
            SecretString::from("secret-two"),
            KdfParams::fast_insecure(),
            Duration::from_secs(3600),
        );
        assert_ne!(*km1.derive(&user, &salt, 1).unwrap(), *km2.derive(&user, &salt, 1).unwrap());
    }

    #[test]
    fn empty_salt_is_missing_key_material() {
        let km = manager();
        let result = km.derive(&UserId::new(), &[], 1);
        assert!(matches!(result, Err(CryptoError::MissingKeyMaterial(_))));
    }

    #[test]
    fn cache_populated_and_invalidated() {
        let km = manager();
        let user = UserId::new();
        let salt = [5u8; SALT_LEN];

        assert_eq!(km.cached_keys(), 0);
        km.derive(&user, &salt, 1).unwrap();
        km.derive(&user, &salt, 2).unwrap();
        assert_eq!(km.cached_keys(), 2);

        km.invalidate(&user);
        assert_eq!(km.cached_keys(), 0);
    }

    #[test]
    fn invalidate_leaves_other_users() {
        let km = manager();
        let a = UserId::new();
        let b = UserId::new();
        km.derive(&a, &[1u8; SALT_LEN], 1).unwrap();
        km.derive(&b, &[2u8; SALT_LEN], 1).unwrap();

        km.invalidate(&a);
        assert_eq!(km.cached_keys(), 1);
    }

    #[test]
    fn expired_entries_are_purged() {
        let km = KeyManager::new(
            SecretString::from("test-master-secret"),
            KdfParams::fast_insecure(),
            Duration::from_millis(0),
        );
        let user = UserId::new();
        km.derive(&user, &[4u8; SALT_LEN], 1).unwrap();
        assert_eq!(km.cached_keys(), 1);

        km.purge_expired();
        assert_eq!(km.cached_keys(), 0);
    }

    #[test]
    fn expired_entry_rederives_same_key() {
        let km = KeyManager::new(
            SecretString::from("test-master-secret"),
            KdfParams::fast_insecure(),
            Duration::from_millis(0),
        );
        let user = UserId::new();
        let salt = [6u8; SALT_LEN];
        let a = km.derive(&user, &salt, 1).unwrap();
        let b = km.derive(&user, &salt, 1).unwrap(); // cache entry stale
        assert_eq!(*a, *b);
    }

    #[test]
    fn generated_salts_are_random() {
        let a = KeyManager::generate_salt();
        let b = KeyManager::generate_salt();
        assert_ne!(a, b);
    }

    #[test]
    fn derived_key_works_with_codec() {
        let km = manager();
        let user = UserId::new();
        let salt = KeyManager::generate_salt();
        let key = km.derive(&user, &salt, 1).unwrap();

        let ciphertext = crate::codec::encrypt("a private turn", &key).unwrap();
        assert_eq!(crate::codec::decrypt(&ciphertext, &key).unwrap(), "a private turn");

        // A rotated key must not decrypt old ciphertext.
        let rotated = km.derive(&user, &salt, 2).unwrap();
        assert!(matches!(
            crate::codec::decrypt(&ciphertext, &rotated),
            Err(CryptoError::DecryptionFailed)
        ));
    }
}
