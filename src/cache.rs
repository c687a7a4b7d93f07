//! Multi-tier read-through cache in front of the query engine.
//!
//! Three tiers, routed by key namespace and checked in order:
//!
//! | Namespace | Tier | TTL (default) |
//! |-----------|------|---------------|
//! | `query:*` | exact-query results | 1 hour |
//! | `user:*:recent:*` | per-caller recent results | 24 hours |
//! | `static:*` | entity/metadata objects | 7 days |
//!
//! Score and metric churn invalidates only query-tier entries tagged with
//! the touched entity ids; the long-TTL static tier falls only to explicit
//! metadata changes or pattern invalidation, so score updates cannot thrash
//! it. Locking is per tier map; entries expire lazily on read.

use globset::Glob;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
    entity_ids: Vec<String>,
}

struct Tier {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl Tier {
    fn new(ttl_secs: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, value: serde_json::Value, entity_ids: Vec<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
                entity_ids,
            },
        );
    }

    fn invalidate_pattern(&self, matcher: &globset::GlobMatcher) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        (before - entries.len()) as u64
    }

    fn invalidate_entity(&self, entity_id: &str) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| !e.entity_ids.iter().any(|id| id == entity_id));
        (before - entries.len()) as u64
    }
}

/// The three-tier cache. Cheap to share behind an `Arc`.
pub struct TieredCache {
    query: Tier,
    recent: Tier,
    static_tier: Tier,
}

impl TieredCache {
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            query: Tier::new(cfg.query_ttl_secs),
            recent: Tier::new(cfg.recent_ttl_secs),
            static_tier: Tier::new(cfg.static_ttl_secs),
        }
    }

    fn tier_for(&self, key: &str) -> &Tier {
        if key.starts_with("query:") {
            &self.query
        } else if key.starts_with("user:") {
            &self.recent
        } else {
            &self.static_tier
        }
    }

    /// Read a key from its tier. `(value, hit)` semantics: `None` is a miss.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.tier_for(key).get(key)
    }

    /// Store a value in the tier its namespace selects. `entity_ids` tags
    /// the entry for score-churn invalidation (query tier only).
    pub fn put(&self, key: &str, value: serde_json::Value, entity_ids: Vec<String>) {
        self.tier_for(key).put(key.to_string(), value, entity_ids);
    }

    /// Drop every entry (all tiers) whose key matches the glob pattern.
    pub fn invalidate(&self, pattern: &str) -> u64 {
        let Ok(glob) = Glob::new(pattern) else {
            return 0;
        };
        let matcher = glob.compile_matcher();
        self.query.invalidate_pattern(&matcher)
            + self.recent.invalidate_pattern(&matcher)
            + self.static_tier.invalidate_pattern(&matcher)
    }

    /// Drop query-tier entries whose key set references this entity. Called
    /// on metric/score changes; deliberately leaves the static tier alone.
    pub fn invalidate_entity(&self, entity_id: &str) -> u64 {
        self.query.invalidate_entity(entity_id)
    }

    /// Drop the static entry for an entity after an explicit metadata change.
    pub fn invalidate_static(&self, entity_id: &str) -> u64 {
        self.static_tier.invalidate_entity(entity_id)
    }
}
