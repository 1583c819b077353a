//! In-memory TTL cache for data-provider results.
//!
//! Per-process and deliberately not persisted: workers are short-lived, so
//! the cache dies with them. The sync path shares one cache per process.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// A cached data-provider result.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub data: Value,
    pub expires_at: DateTime<Utc>,
}

/// TTL cache keyed by `{scope}:{provider}:{input hash}`.
#[derive(Default)]
pub struct ProviderCache {
    entries: DashMap<String, CachedResult>,
}

impl ProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic cache key: parameters are serialized with sorted keys
    /// and hashed; empty parameters collapse to `{scope}:{provider}`.
    pub fn cache_key(scope: &str, provider: &str, parameters: &BTreeMap<String, Value>) -> String {
        if parameters.is_empty() {
            return format!("{scope}:{provider}");
        }
        // BTreeMap serializes with sorted keys, so the hash is stable under
        // input-key permutation.
        let serialized = serde_json::to_string(parameters).unwrap_or_default();
        let digest = Sha256::digest(serialized.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{scope}:{provider}:{}", &hex[..16])
    }

    /// Valid cached entry for `key`, dropping it if expired.
    pub fn get(&self, key: &str) -> Option<CachedResult> {
        let entry = self.entries.get(key)?;
        if entry.expires_at > Utc::now() {
            debug!(cache_key = key, "Data provider cache hit");
            return Some(entry.clone());
        }
        drop(entry);
        self.entries.remove(key);
        None
    }

    /// Store a result, returning its expiry.
    pub fn put(&self, key: &str, data: Value, ttl_seconds: u64) -> DateTime<Utc> {
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds as i64);
        self.entries.insert(
            key.to_string(),
            CachedResult {
                data,
                expires_at,
            },
        );
        debug!(cache_key = key, ttl_seconds, "Cached data provider result");
        expires_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_deterministic_under_permutation() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), json!(1));
        a.insert("y".to_string(), json!("two"));
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), json!("two"));
        b.insert("x".to_string(), json!(1));
        assert_eq!(
            ProviderCache::cache_key("org-1", "get_licenses", &a),
            ProviderCache::cache_key("org-1", "get_licenses", &b)
        );
    }

    #[test]
    fn test_empty_parameters_collapse() {
        let key = ProviderCache::cache_key("GLOBAL", "get_licenses", &BTreeMap::new());
        assert_eq!(key, "GLOBAL:get_licenses");
    }

    #[test]
    fn test_scope_partitions_keys() {
        let params = BTreeMap::from([("q".to_string(), json!("a"))]);
        assert_ne!(
            ProviderCache::cache_key("org-1", "p", &params),
            ProviderCache::cache_key("org-2", "p", &params)
        );
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = ProviderCache::new();
        cache.put("k", json!([1]), 0);
        // TTL of zero expires immediately.
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_returns_original_expiry() {
        let cache = ProviderCache::new();
        let expires = cache.put("k", json!([1, 2]), 300);
        let hit = cache.get("k").expect("expected hit");
        assert_eq!(hit.expires_at, expires);
        assert_eq!(hit.data, json!([1, 2]));
    }
}
