//! Reference bounds cache
//!
//! Bounds derived from a reference oracle reading are reused until they are
//! older than the TTL, which bounds the oracle call volume.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::Bounds;

#[derive(Debug, Clone, Copy)]
struct BoundsEntry {
    bounds: Bounds,
    computed_at: Instant,
}

#[derive(Debug)]
pub struct BoundsCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, BoundsEntry>>,
}

impl BoundsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached bounds for `symbol`, unless missing or expired
    pub async fn get_fresh(&self, symbol: &str) -> Option<Bounds> {
        let entries = self.entries.read().await;
        entries
            .get(symbol)
            .filter(|entry| entry.computed_at.elapsed() < self.ttl)
            .map(|entry| entry.bounds)
    }

    /// Store freshly computed bounds, stamped now
    pub async fn insert(&self, symbol: &str, bounds: Bounds) {
        self.entries.write().await.insert(
            symbol.to_string(),
            BoundsEntry {
                bounds,
                computed_at: Instant::now(),
            },
        );
    }
}
