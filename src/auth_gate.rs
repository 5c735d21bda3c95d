//! Authentication gate (component C8)
//!
//! Classifies an incoming request as public, admin, or identified, and
//! resolves the caller's identity accordingly: admin endpoints require
//! Basic-Auth or an admin-flagged API key; other endpoints accept an API
//! key (which wins if both an API key and a session cookie are present) or
//! a session cookie. Every rejection path sleeps a random 50-200ms before
//! returning, so a timing side-channel cannot distinguish "wrong
//! credential" from "no credential" faster than the jitter itself allows.

use crate::error::AppError;
use crate::identity::IdentityStore;
use axum::http::HeaderMap;
use rand::Rng;
use std::time::Duration;

pub enum Identity {
    Anonymous,
    ApiKey { id: String, owner: String, is_admin: bool },
    Session { token: String },
}

const API_KEY_HEADER: &str = "x-api-key";
const SESSION_COOKIE: &str = "epc_session";

async fn jittered_delay() {
    let millis = rand::thread_rng().gen_range(50..=200);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(&format!("{SESSION_COOKIE}=")) {
            return Some(value.to_string());
        }
    }
    None
}

fn extract_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let encoded = raw.strip_prefix("Basic ")?;
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Paths reachable without any identity at all.
pub fn is_public(path: &str) -> bool {
    matches!(
        path,
        "/health" | "/" | "/api/v1" | "/api/v1/auth/session"
    )
}

pub fn is_admin_path(path: &str) -> bool {
    path.starts_with("/api/v1/admin")
}

/// Resolve an identity for an admin-guarded endpoint. Fails with
/// `Forbidden` deliberately for any failure mode — wrong password, unknown
/// admin key, non-admin key — so a caller cannot distinguish "this account
/// doesn't exist" from "this account isn't an admin".
pub async fn authenticate_admin(
    headers: &HeaderMap,
    identity_store: &IdentityStore,
    admin_username: &str,
    admin_password: &str,
) -> Result<Identity, AppError> {
    if let Some((user, pass)) = extract_basic_auth(headers) {
        if IdentityStore::constant_time_eq(&user, admin_username)
            && IdentityStore::constant_time_eq(&pass, admin_password)
            && !admin_password.is_empty()
        {
            return Ok(Identity::ApiKey {
                id: "admin-basic-auth".to_string(),
                owner: admin_username.to_string(),
                is_admin: true,
            });
        }
    }

    if let Some(raw_key) = extract_api_key(headers) {
        if let Some(info) = identity_store.validate_key(&raw_key) {
            if info.is_admin {
                return Ok(Identity::ApiKey { id: info.id, owner: info.owner, is_admin: true });
            }
        }
    }

    jittered_delay().await;
    Err(AppError::Unauthorised { admin_realm: true })
}

/// Resolve an identity for a non-admin, non-public endpoint. An API key
/// wins if both an API key header and a session cookie are present.
pub async fn authenticate_identified(
    headers: &HeaderMap,
    identity_store: &IdentityStore,
) -> Result<Identity, AppError> {
    if let Some(raw_key) = extract_api_key(headers) {
        if let Some(info) = identity_store.validate_key(&raw_key) {
            return Ok(Identity::ApiKey { id: info.id, owner: info.owner, is_admin: info.is_admin });
        }
        jittered_delay().await;
        return Err(AppError::Unauthorised { admin_realm: false });
    }

    if let Some(token) = extract_session_cookie(headers) {
        if identity_store.touch_session(&token).is_some() {
            return Ok(Identity::Session { token });
        }
        jittered_delay().await;
        return Err(AppError::Unauthorised { admin_realm: false });
    }

    jittered_delay().await;
    Err(AppError::Unauthorised { admin_realm: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use axum::http::HeaderValue;

    fn store() -> IdentityStore {
        IdentityStore::new(SessionConfig { absolute_ttl_secs: 3600, idle_ttl_secs: 1800 })
    }

    #[test]
    fn public_paths_are_allow_listed() {
        assert!(is_public("/health"));
        assert!(is_public("/"));
        assert!(!is_public("/api/v1/compute/standard"));
    }

    #[test]
    fn admin_paths_are_recognised() {
        assert!(is_admin_path("/api/v1/admin/keys"));
        assert!(!is_admin_path("/api/v1/compute/standard"));
    }

    #[tokio::test]
    async fn admin_basic_auth_succeeds_with_matching_credentials() {
        let store = store();
        let mut headers = HeaderMap::new();
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:hunter2");
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        let identity = authenticate_admin(&headers, &store, "admin", "hunter2").await;
        assert!(identity.is_ok());
    }

    #[tokio::test]
    async fn admin_basic_auth_rejects_wrong_password() {
        let store = store();
        let mut headers = HeaderMap::new();
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        let result = authenticate_admin(&headers, &store, "admin", "hunter2").await;
        assert!(matches!(
            result,
            Err(AppError::Unauthorised { admin_realm: true })
        ));
    }

    #[tokio::test]
    async fn identified_endpoint_rejects_missing_credentials() {
        let store = store();
        let headers = HeaderMap::new();
        let result = authenticate_identified(&headers, &store).await;
        assert!(matches!(
            result,
            Err(AppError::Unauthorised { admin_realm: false })
        ));
    }

    #[tokio::test]
    async fn api_key_wins_over_session_when_both_present() {
        let store = store();
        let (_, raw) = store.create_key("alice", false).unwrap();
        let csrf = store.issue_csrf_token();
        let session = store.create_session(&csrf).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(&raw).unwrap());
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE}={}", session.token)).unwrap(),
        );

        let identity = authenticate_identified(&headers, &store).await.unwrap();
        assert!(matches!(identity, Identity::ApiKey { .. }));
    }
}
