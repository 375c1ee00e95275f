//! Per-target protocol cache of the client role

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::debug;

use crate::config::defaults::PROTOCOL_CACHE_TTL_SECS;
use crate::protocol::ProtocolType;

#[derive(Debug, Clone, Copy)]
struct Entry {
    protocol: ProtocolType,
    detected_at: Instant,
}

/// Remembers which protocol a target answered with
///
/// Entries expire after the TTL; there is no other invalidation besides
/// [`ProtocolCache::clear`].
#[derive(Debug)]
pub struct ProtocolCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl Default for ProtocolCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(PROTOCOL_CACHE_TTL_SECS))
    }
}

impl ProtocolCache {
    /// Empty cache with the given entry lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry for `target`, if any
    pub fn get(&self, target: &str) -> Option<ProtocolType> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(target)
            .filter(|entry| entry.detected_at.elapsed() < self.ttl)
            .map(|entry| entry.protocol)
    }

    /// Record the protocol `target` answered with
    pub fn insert(&self, target: &str, protocol: ProtocolType) {
        debug!("Caching protocol {} for {}", protocol, target);
        self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(
            target.to_string(),
            Entry {
                protocol,
                detected_at: Instant::now(),
            },
        );
    }

    /// Forget every target
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
