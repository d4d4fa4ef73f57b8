// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Session-scoped key cache.
//!
//! Holds at most one derived key per user, as an exported key token, in
//! process memory only. Nothing here is ever written to disk; dropping the
//! cache ends the session.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::privacy::crypto::SymmetricKey;

/// Default number of concurrently unlocked users kept in memory.
pub const DEFAULT_SESSION_CAPACITY: usize = 64;

/// In-process LRU cache of unlocked session keys.
pub struct SessionKeyCache {
    cache: Mutex<LruCache<String, String>>,
}

impl Default for SessionKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}

impl std::fmt::Debug for SessionKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.cache.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("SessionKeyCache").field("entries", &len).finish()
    }
}

impl SessionKeyCache {
    /// Create a cache holding keys for up to `capacity` users (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Store the key for a user. Last write wins.
    pub fn save(&self, user_id: &str, key: &SymmetricKey) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(user_id.to_string(), key.export_b64());
        }
    }

    /// Cached key for a user.
    ///
    /// Returns `None` if absent or if the stored token no longer imports.
    pub fn load(&self, user_id: &str) -> Option<SymmetricKey> {
        let token = {
            let mut cache = self.cache.lock().ok()?;
            cache.get(user_id)?.clone()
        };
        match SymmetricKey::import_b64(&token) {
            Ok(key) => Some(key),
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Dropping unreadable session key entry");
                self.clear(user_id);
                None
            }
        }
    }

    pub fn clear(&self, user_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(user_id);
        }
    }

    #[cfg(test)]
    fn put_raw(&self, user_id: &str, token: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(user_id.to_string(), token.to_string());
        }
    }
}
