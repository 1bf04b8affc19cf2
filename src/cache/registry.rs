//! In-process key registry and pattern invalidation
//!
//! Every kv `get`/`set` reference-counts its key under a store name. Pattern
//! invalidation walks this registry rather than scanning Redis: a matcher is
//! either an exact key or a glob where `*` means any run of characters and
//! every other regex metacharacter is taken literally.

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Channel carrying cross-node invalidations
pub const INVALIDATION_CHANNEL: &str = "cache:invalidate";

/// Cross-node invalidation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub store: String,
    pub matcher: String,
}

/// Translate a glob into an anchored regex, escaping everything except `*`
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            out.push_str(".*");
        } else {
            out.push_str(&regex::escape(&ch.to_string()));
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

/// Matcher for invalidation: exact key or glob
#[derive(Debug, Clone)]
pub enum KeyMatcher {
    Exact(String),
    Glob(Regex),
}

impl KeyMatcher {
    pub fn parse(matcher: &str) -> Option<Self> {
        if matcher.contains('*') {
            glob_to_regex(matcher).map(Self::Glob)
        } else {
            Some(Self::Exact(matcher.to_string()))
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Glob(re) => re.is_match(key),
        }
    }
}

/// Reference-count map `store → key → count`
#[derive(Default)]
pub struct KeyRegistry {
    stores: DashMap<String, DashMap<String, usize>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key reference under a store
    pub fn track(&self, store: &str, key: &str) {
        let keys = self
            .stores
            .entry(store.to_string())
            .or_insert_with(DashMap::new);
        *keys.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Drop one reference; the key disappears at zero
    pub fn release(&self, store: &str, key: &str) {
        if let Some(keys) = self.stores.get(store) {
            if let Some(mut count) = keys.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    drop(count);
                    keys.remove(key);
                }
            }
        }
    }

    /// Keys currently tracked under a store that match the matcher
    pub fn matching_keys(&self, store: &str, matcher: &str) -> Vec<String> {
        let Some(matcher) = KeyMatcher::parse(matcher) else {
            return Vec::new();
        };
        let Some(keys) = self.stores.get(store) else {
            return Vec::new();
        };
        keys.iter()
            .filter(|entry| matcher.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove matching entries from the registry
    ///
    /// Returns the number of entries removed. An unregistered store returns
    /// 0 without error.
    pub fn invalidate_local(&self, store: &str, matcher: &str) -> usize {
        let keys = self.matching_keys(store, matcher);
        if keys.is_empty() {
            return 0;
        }
        let mut removed = 0;
        if let Some(entries) = self.stores.get(store) {
            for key in keys {
                if entries.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Number of distinct keys tracked under a store
    pub fn store_len(&self, store: &str) -> usize {
        self.stores.get(store).map(|keys| keys.len()).unwrap_or(0)
    }
}
