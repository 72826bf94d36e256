// =============================================================================
// ToolCache — per-decision-run memoization of tool results
// =============================================================================
//
// Created fresh by the pipeline at the start of every decision run and
// dropped at the end. Distinct from `MarketCache`, which lives for the life
// of the process: this cache exists only to avoid calling the same tool
// twice for the same symbol within one agent loop, and to produce the audit
// snapshot attached to `DecisionPipelineResult`.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

struct ToolCacheEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
}

/// One row of the audit snapshot: what was memoized, when, and its shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCacheRecord {
    pub key: String,
    pub stored_at: DateTime<Utc>,
    pub age_seconds: f64,
    pub value_type: String,
}

fn value_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[derive(Default)]
pub struct ToolCache {
    entries: RwLock<HashMap<String, ToolCacheEntry>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: &str, value: serde_json::Value) {
        self.entries.write().insert(
            key.to_string(),
            ToolCacheEntry {
                value,
                stored_at: Utc::now(),
            },
        );
    }

    /// Build the audit record: one row per memoized key, sorted by key for
    /// deterministic output.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<ToolCacheRecord> {
        let entries = self.entries.read();
        let mut rows: Vec<ToolCacheRecord> = entries
            .iter()
            .map(|(key, entry)| ToolCacheRecord {
                key: key.clone(),
                stored_at: entry.stored_at,
                age_seconds: now.signed_duration_since(entry.stored_at).num_milliseconds() as f64 / 1000.0,
                value_type: value_type_name(&entry.value).to_string(),
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_empty_cache_is_none() {
        let cache = ToolCache::new();
        assert!(cache.get("live_market_data:BTC-USDT-SWAP").is_none());
    }

    #[test]
    fn put_then_get_roundtrips() {
        let cache = ToolCache::new();
        cache.put("derivatives_data:BTC-USDT-SWAP", serde_json::json!({"funding_rate": 0.0001}));
        let v = cache.get("derivatives_data:BTC-USDT-SWAP").unwrap();
        assert_eq!(v["funding_rate"], 0.0001);
    }

    #[test]
    fn snapshot_reports_value_types_sorted_by_key() {
        let cache = ToolCache::new();
        cache.put("indicator_calculator:ETH-USDT-SWAP", serde_json::json!({"rsi14": 55.0}));
        cache.put("derivatives_data:ETH-USDT-SWAP", serde_json::json!(42));
        let snapshot = cache.snapshot(Utc::now());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, "derivatives_data:ETH-USDT-SWAP");
        assert_eq!(snapshot[0].value_type, "number");
        assert_eq!(snapshot[1].value_type, "object");
    }

    #[test]
    fn snapshot_age_seconds_is_nonnegative() {
        let cache = ToolCache::new();
        cache.put("k", serde_json::json!(1));
        let snapshot = cache.snapshot(Utc::now());
        assert!(snapshot[0].age_seconds >= 0.0);
    }

    #[test]
    fn len_and_is_empty_track_entry_count() {
        let cache = ToolCache::new();
        assert!(cache.is_empty());
        cache.put("k", serde_json::json!(1));
        assert_eq!(cache.len(), 1);
        assert!(!cache.is_empty());
    }
}
