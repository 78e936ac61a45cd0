//! Response Cache
//!
//! Content-addressed store of recent decisions so recurring threats are
//! answered without re-running analysis.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{DefenseResponse, ThreatEvent};

pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

struct CacheEntry {
    response: DefenseResponse,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) > ttl
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cache key: category, source and textual payload.
    ///
    /// Identifier and detection time are left out so repeats of the same
    /// threat collide.
    pub fn fingerprint(threat: &ThreatEvent) -> String {
        let payload = match &threat.payload {
            serde_json::Value::String(payload) => payload.as_str(),
            _ => "",
        };

        let mut hasher = Sha256::new();
        for field in [threat.category.as_str(), threat.source.as_str(), payload] {
            // Length prefix keeps field boundaries unambiguous
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Copy of the stored decision, unless missing or expired
    pub fn get(&self, threat: &ThreatEvent) -> Option<DefenseResponse> {
        let key = Self::fingerprint(threat);
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if entry.is_expired(Instant::now(), self.ttl) {
            return None;
        }
        Some(entry.response.clone())
    }

    pub fn insert(&self, threat: &ThreatEvent, response: &DefenseResponse) {
        let key = Self::fingerprint(threat);
        self.entries.write().insert(
            key,
            CacheEntry {
                response: response.clone(),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, self.ttl));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Periodic sweep; stops once the cache is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "Swept expired responses");
                }
            }
        })
    }
}
