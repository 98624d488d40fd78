//! In-memory key-value sink.
//!
//! Each identity maps to a hash of fields, the way a key-value cache stores
//! aggregates: the key fields, `name` and `partition` are set on every
//! upsert, `count` and value fields are incremented. With an expiry
//! configured, every upsert pushes the identity's deadline forward, expired
//! entries disappear on read, and each flush sweeps them out of memory.

use super::{upsert_each, FlushReport, Sink};
use crate::aggregation::{AggregationRecord, Identity};
use crate::error::Result;
use crate::metrics::{key_label, MetricValue};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// One cached hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    /// Key fields plus `name` and `partition`.
    pub fields: BTreeMap<String, String>,
    /// `count` plus every value field.
    pub counters: BTreeMap<String, MetricValue>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| now >= deadline)
    }

    pub fn count(&self) -> i64 {
        match self.counters.get("count") {
            Some(MetricValue::Int(c)) => *c,
            Some(MetricValue::Float(c)) => *c as i64,
            None => 0,
        }
    }
}

#[derive(Clone)]
pub struct MemorySink {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    expire: Option<Duration>,
}

impl MemorySink {
    pub fn new(expire: Option<Duration>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            expire: expire.filter(|d| !d.is_zero()),
        }
    }

    pub async fn get(&self, identity: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        entries
            .get(identity)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    /// Drops expired entries, returning how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upsert(&self, identity: &str, record: &AggregationRecord) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(identity.to_string()).or_default();
        if entry.is_expired(now) {
            *entry = CacheEntry::default();
        }

        for (field, value) in &record.key {
            entry.fields.insert(field.clone(), key_label(value));
        }
        entry.fields.insert("name".to_string(), record.name.clone());
        entry.fields.insert("partition".to_string(), record.partition.clone());

        increment(&mut entry.counters, "count", MetricValue::Int(record.count));
        if let Some(values) = &record.value {
            for (field, value) in values {
                increment(&mut entry.counters, field, *value);
            }
        }

        entry.expires_at = self.expire.map(|ttl| now + ttl);
        Ok(())
    }

    async fn flush_all(&self, drained: Vec<(Identity, AggregationRecord)>) -> FlushReport {
        let evicted = self.evict_expired().await;
        if evicted > 0 {
            debug!(evicted, "swept expired entries");
        }
        upsert_each(self, drained).await
    }

    fn name(&self) -> &str {
        "memory"
    }
}

fn increment(counters: &mut BTreeMap<String, MetricValue>, field: &str, by: MetricValue) {
    counters
        .entry(field.to_string())
        .and_modify(|v| *v += by)
        .or_insert(by);
}
