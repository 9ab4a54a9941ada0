//! C1 — Identity & Key Store (§4.1). Presented credentials are hashed with
//! SHA-256 and looked up by hash; the lookup result is then checked with a
//! `subtle` constant-time compare against the stored hash bytes per §6.2
//! ("constant-time equality on the 32-byte hash"), rather than trusting the
//! `HashMap` bucket match alone.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::data::ApiKey;
use crate::registry::RegistrySnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    Unauthorized,
}

#[derive(Debug, Clone)]
pub struct Authorized {
    pub api_key_id: i64,
    pub allowed_upstream_ids: std::collections::HashSet<i64>,
}

/// SHA-256 of the presented key's UTF-8 bytes, hex-encoded — the storage
/// representation of `apiKeys.key_hash` (§6.2).
pub fn hash_presented_key(presented: &str) -> String {
    let digest = Sha256::digest(presented.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// `authorize(presentedKey) -> {apiKey, allowedUpstreamIds} | Unauthorized`
/// (§4.1). Fails when: no match, `isActive=false`, or `expiresAt<now`.
pub fn authorize(
    snapshot: &RegistrySnapshot,
    presented_key: &str,
    now: OffsetDateTime,
) -> Result<Authorized, AuthFailure> {
    let presented_hash = hash_presented_key(presented_key);
    let entry = find_by_hash(snapshot, &presented_hash).ok_or(AuthFailure::Unauthorized)?;

    if !entry.is_active || entry.is_expired(now) {
        return Err(AuthFailure::Unauthorized);
    }

    Ok(Authorized {
        api_key_id: entry.id,
        allowed_upstream_ids: entry.allowed_upstream_ids.clone(),
    })
}

fn find_by_hash<'a>(snapshot: &'a RegistrySnapshot, presented_hash: &str) -> Option<&'a ApiKey> {
    let candidate = snapshot.api_keys_by_hash.get(presented_hash)?;
    let presented_bytes = presented_hash.as_bytes();
    let stored_bytes = candidate.key_hash.as_bytes();
    if presented_bytes.len() != stored_bytes.len() {
        return None;
    }
    if presented_bytes.ct_eq(stored_bytes).unwrap_u8() == 1 {
        Some(candidate)
    } else {
        None
    }
}

/// Extracts the presented credential per §6.2: `Authorization: Bearer <key>`
/// or `x-api-key: <key>`.
pub fn extract_presented_key(
    authorization: Option<&str>,
    x_api_key: Option<&str>,
) -> Option<String> {
    if let Some(value) = x_api_key {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    let header = authorization?.trim();
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use time::macros::datetime;

    fn key(id: i64, presented: &str, is_active: bool, expires_at: Option<OffsetDateTime>) -> ApiKey {
        ApiKey {
            id,
            key_hash: hash_presented_key(presented),
            key_prefix: presented.chars().take(6).collect(),
            name: "k".to_string(),
            is_active,
            expires_at,
            allowed_upstream_ids: HashSet::from([1, 2]),
        }
    }

    fn snapshot_with(keys: Vec<ApiKey>) -> RegistrySnapshot {
        RegistrySnapshot::build(vec![], keys)
    }

    #[test]
    fn authorizes_known_active_key() {
        let snap = snapshot_with(vec![key(1, "sk-live-abc", true, None)]);
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let result = authorize(&snap, "sk-live-abc", now).unwrap();
        assert_eq!(result.api_key_id, 1);
        assert_eq!(result.allowed_upstream_ids, HashSet::from([1, 2]));
    }

    #[test]
    fn rejects_unknown_key() {
        let snap = snapshot_with(vec![key(1, "sk-live-abc", true, None)]);
        let now = datetime!(2026-01-01 00:00:00 UTC);
        assert_eq!(authorize(&snap, "sk-live-wrong", now), Err(AuthFailure::Unauthorized));
    }

    #[test]
    fn rejects_inactive_key() {
        let snap = snapshot_with(vec![key(1, "sk-live-abc", false, None)]);
        let now = datetime!(2026-01-01 00:00:00 UTC);
        assert_eq!(authorize(&snap, "sk-live-abc", now), Err(AuthFailure::Unauthorized));
    }

    #[test]
    fn rejects_expired_key() {
        let expiry = datetime!(2025-01-01 00:00:00 UTC);
        let snap = snapshot_with(vec![key(1, "sk-live-abc", true, Some(expiry))]);
        let now = datetime!(2026-01-01 00:00:00 UTC);
        assert_eq!(authorize(&snap, "sk-live-abc", now), Err(AuthFailure::Unauthorized));
    }

    #[test]
    fn extracts_from_x_api_key_before_authorization() {
        assert_eq!(
            extract_presented_key(Some("Bearer other"), Some(" sk-1 ")).as_deref(),
            Some("sk-1")
        );
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(
            extract_presented_key(Some("Bearer sk-2"), None).as_deref(),
            Some("sk-2")
        );
        assert_eq!(extract_presented_key(Some("Basic xyz"), None), None);
    }
}
