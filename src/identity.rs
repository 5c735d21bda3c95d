//! Identity store (component C7)
//!
//! Two identity modalities: opaque API keys, hashed at rest with a
//! memory-hard KDF and compared in constant time, and browser sessions
//! bootstrapped from a one-shot CSRF token. Raw keys and session tokens are
//! returned to the caller exactly once and never appear in a log line.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("hashing failure")]
    Hashing,
    #[error("key not found")]
    NotFound,
}

#[derive(Clone)]
pub struct KeyInfo {
    pub id: String,
    pub owner: String,
    pub is_admin: bool,
}

struct StoredKey {
    hash: String,
    info: KeyInfo,
    revoked: bool,
}

/// A short positive cache of recently-validated raw keys, keyed by a
/// constant-time-safe digest of the raw key rather than the key itself, so
/// a cache dump never leaks a usable credential. Invalidated eagerly on
/// revoke.
struct PositiveCacheEntry {
    key_id: String,
    cached_at: Instant,
}

pub struct IdentityStore {
    keys: DashMap<String, StoredKey>,
    positive_cache: DashMap<[u8; 32], PositiveCacheEntry>,
    positive_cache_ttl: Duration,
    sessions: DashMap<String, Session>,
    csrf_tokens: DashMap<String, Instant>,
    session_config: crate::config::SessionConfig,
}

#[derive(Clone)]
pub struct Session {
    pub token: String,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

fn digest(raw: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher.finalize().into()
}

fn random_token() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl IdentityStore {
    pub fn new(session_config: crate::config::SessionConfig) -> Self {
        Self {
            keys: DashMap::new(),
            positive_cache: DashMap::new(),
            positive_cache_ttl: Duration::from_secs(5),
            sessions: DashMap::new(),
            csrf_tokens: DashMap::new(),
            session_config,
        }
    }

    /// Create a new API key. The raw key is returned once, here, and is
    /// never recoverable afterward — only its Argon2 hash is stored. The
    /// key id is embedded in the raw key (`epc_<id>_<secret>`) so
    /// validation can index straight to the owning `StoredKey` instead of
    /// scanning every key in the store.
    pub fn create_key(&self, owner: &str, is_admin: bool) -> Result<(String, String), IdentityError> {
        let id = Uuid::new_v4().to_string();
        let raw = format!("epc_{id}_{}", random_token());

        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(raw.as_bytes(), &salt)
            .map_err(|_| IdentityError::Hashing)?
            .to_string();

        self.keys.insert(
            id.clone(),
            StoredKey {
                hash,
                info: KeyInfo { id: id.clone(), owner: owner.to_string(), is_admin },
                revoked: false,
            },
        );
        Ok((id, raw))
    }

    /// Validate a raw key presented by a caller. A short positive cache
    /// avoids re-running Argon2 (deliberately expensive) on every request
    /// from the same caller; the cache is keyed by a SHA-256 digest of the
    /// raw key, never the raw key itself. On a cache miss, the key id
    /// embedded in `raw` (`epc_<id>_<secret>`) is used to index directly to
    /// the one relevant `StoredKey`, so Argon2 runs exactly once regardless
    /// of how many keys are in the store — validation time stays flat as
    /// the key count grows.
    pub fn validate_key(&self, raw: &str) -> Option<KeyInfo> {
        let digest = digest(raw);
        if let Some(cached) = self.positive_cache.get(&digest) {
            if cached.cached_at.elapsed() < self.positive_cache_ttl {
                if let Some(stored) = self.keys.get(&cached.key_id) {
                    if !stored.revoked {
                        return Some(stored.info.clone());
                    }
                }
            }
        }

        let id = raw.strip_prefix("epc_")?.split_once('_')?.0;
        let stored = self.keys.get(id)?;
        if stored.revoked {
            return None;
        }
        let parsed = PasswordHash::new(&stored.hash).ok()?;
        let matches = Argon2::default().verify_password(raw.as_bytes(), &parsed).is_ok();
        if !matches {
            return None;
        }
        self.positive_cache.insert(
            digest,
            PositiveCacheEntry { key_id: id.to_string(), cached_at: Instant::now() },
        );
        Some(stored.info.clone())
    }

    pub fn revoke_key(&self, id: &str) -> Result<(), IdentityError> {
        let mut entry = self.keys.get_mut(id).ok_or(IdentityError::NotFound)?;
        entry.revoked = true;
        drop(entry);
        self.positive_cache.retain(|_, v| v.key_id != id);
        Ok(())
    }

    pub fn list_keys(&self) -> Vec<KeyInfo> {
        self.keys
            .iter()
            .filter(|e| !e.revoked)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Issue a one-shot CSRF token, required to bootstrap a session. Valid
    /// for 5 minutes and consumed on first use.
    pub fn issue_csrf_token(&self) -> String {
        let token = random_token();
        self.csrf_tokens.insert(token.clone(), Instant::now());
        token
    }

    fn consume_csrf_token(&self, token: &str) -> bool {
        match self.csrf_tokens.remove(token) {
            Some((_, issued_at)) => issued_at.elapsed() < Duration::from_secs(300),
            None => false,
        }
    }

    /// Bootstrap a browser session from a CSRF token minted by
    /// `issue_csrf_token`. Fails if the token is missing, already consumed,
    /// or expired.
    pub fn create_session(&self, csrf_token: &str) -> Option<Arc<Session>> {
        if !self.consume_csrf_token(csrf_token) {
            return None;
        }
        let token = random_token();
        let now = Instant::now();
        let session = Arc::new(Session { token: token.clone(), created_at: now, last_activity_at: now });
        self.sessions.insert(token, Session { token: session.token.clone(), created_at: now, last_activity_at: now });
        Some(session)
    }

    /// Look up a session by token, sliding its idle timer forward. Returns
    /// `None` if the token is unknown or either TTL has elapsed.
    pub fn touch_session(&self, token: &str) -> Option<Session> {
        let mut entry = self.sessions.get_mut(token)?;
        let now = Instant::now();
        let absolute_ttl = Duration::from_secs(self.session_config.absolute_ttl_secs);
        let idle_ttl = Duration::from_secs(self.session_config.idle_ttl_secs);
        if now.duration_since(entry.created_at) > absolute_ttl
            || now.duration_since(entry.last_activity_at) > idle_ttl
        {
            drop(entry);
            self.sessions.remove(token);
            return None;
        }
        entry.last_activity_at = now;
        Some(entry.clone())
    }

    pub fn expire_session(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Constant-time comparison of admin Basic-Auth credentials, matching
    /// the identity store's discipline for never comparing secrets in
    /// variable time even when they are not API keys.
    pub fn constant_time_eq(a: &str, b: &str) -> bool {
        a.as_bytes().ct_eq(b.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn store() -> IdentityStore {
        IdentityStore::new(SessionConfig { absolute_ttl_secs: 3600, idle_ttl_secs: 1800 })
    }

    #[test]
    fn created_key_validates() {
        let store = store();
        let (id, raw) = store.create_key("alice", false).unwrap();
        let info = store.validate_key(&raw).unwrap();
        assert_eq!(info.id, id);
        assert!(!info.is_admin);
    }

    #[test]
    fn wrong_key_does_not_validate() {
        let store = store();
        store.create_key("alice", false).unwrap();
        assert!(store.validate_key("epc_not-a-real-key").is_none());
    }

    #[test]
    fn wrong_secret_for_a_real_key_id_does_not_validate() {
        let store = store();
        let (id, _) = store.create_key("alice", false).unwrap();
        assert!(store.validate_key(&format!("epc_{id}_wrong-secret")).is_none());
    }

    #[test]
    fn validation_indexes_directly_to_the_presented_key_regardless_of_store_size() {
        let store = store();
        for i in 0..50 {
            store.create_key(&format!("owner-{i}"), false).unwrap();
        }
        let (id, raw) = store.create_key("target", false).unwrap();
        let info = store.validate_key(&raw).unwrap();
        assert_eq!(info.id, id);
    }

    #[test]
    fn revoked_key_stops_validating() {
        let store = store();
        let (id, raw) = store.create_key("alice", false).unwrap();
        store.revoke_key(&id).unwrap();
        assert!(store.validate_key(&raw).is_none());
    }

    #[test]
    fn positive_cache_survives_within_ttl_after_revoke_check() {
        let store = store();
        let (_, raw) = store.create_key("alice", true).unwrap();
        assert!(store.validate_key(&raw).is_some());
        // Second call should hit the positive cache path, not re-run argon2.
        assert!(store.validate_key(&raw).is_some());
    }

    #[test]
    fn session_requires_valid_csrf_token() {
        let store = store();
        assert!(store.create_session("bogus-token").is_none());
        let token = store.issue_csrf_token();
        assert!(store.create_session(&token).is_some());
        // One-shot: reusing the same CSRF token fails.
        assert!(store.create_session(&token).is_none());
    }

    #[test]
    fn touch_session_slides_idle_expiry() {
        let store = store();
        let csrf = store.issue_csrf_token();
        let session = store.create_session(&csrf).unwrap();
        let touched = store.touch_session(&session.token);
        assert!(touched.is_some());
    }

    #[test]
    fn constant_time_eq_matches_and_mismatches() {
        assert!(IdentityStore::constant_time_eq("secret", "secret"));
        assert!(!IdentityStore::constant_time_eq("secret", "wrong"));
    }
}
