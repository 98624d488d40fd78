//! Identity and merge of aggregation records.
//!
//! This module provides the accumulation side of the engine:
//! - A deterministic identity over (name, partition, ordered key values)
//! - The drained record shape handed to sinks and forwarded between nodes
//! - An [`AggregationStore`] that sums counts and value fields per identity
//! - A [`PartitionedStore`] keeping one store per routing partition
//!
//! Merging is commutative and associative over `count` and every value
//! field; `name`, `partition` and `key` are set by the first record of an
//! identity and never altered afterwards. A store is owned by one
//! accumulation window: it is mutated only through `&mut self` and drained
//! in one move, so a merge can never interleave with a drain.

use crate::metrics::{key_label, Evaluation, MetricDefinition, MetricValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Hex digest identifying one aggregation bucket.
pub type Identity = String;

const SEPARATOR: &[u8] = &[0x1f];

/// Computes the identity of `(name, partition, keys)`.
///
/// Components are joined with a unit separator before hashing, so
/// `["ab", "c"]` and `["a", "bc"]` never share an identity.
pub fn compute_identity<S: AsRef<str>>(name: &str, partition: &str, keys: &[S]) -> Identity {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(SEPARATOR);
    hasher.update(partition.as_bytes());
    for key in keys {
        hasher.update(SEPARATOR);
        hasher.update(key.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// An accumulated aggregate, in the shape sinks and peers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRecord {
    pub name: String,
    pub partition: String,
    /// Key field to raw key value, in `each_key` order.
    #[serde(with = "key_text")]
    pub key: Vec<(String, Value)>,
    /// Saturates at `i64::MAX` when merged.
    pub count: i64,
    /// Present only for definitions with a `value_key`.
    pub value: Option<BTreeMap<String, MetricValue>>,
}

impl AggregationRecord {
    /// Builds the drained shape of one evaluation.
    pub fn from_evaluation(definition: &MetricDefinition, evaluation: Evaluation) -> Self {
        let key = definition
            .key_fields()
            .iter()
            .cloned()
            .zip(evaluation.keys)
            .collect();
        let value = definition.value_field().map(|field| {
            let mut values = BTreeMap::new();
            values.insert(field.to_string(), evaluation.value);
            values
        });

        Self {
            name: definition.name().to_string(),
            partition: evaluation.partition,
            key,
            count: evaluation.count,
            value,
        }
    }

    /// Key values as text, the form identities and partition ids hash.
    pub fn key_values(&self) -> Vec<String> {
        self.key.iter().map(|(_, v)| key_label(v)).collect()
    }

    pub fn identity(&self) -> Identity {
        compute_identity(&self.name, &self.partition, self.key_values().as_slice())
    }

    /// Adds another record's count and value fields into this one.
    pub fn absorb(&mut self, other: &AggregationRecord) {
        self.count = self.count.saturating_add(other.count);
        if let Some(incoming) = &other.value {
            let values = self.value.get_or_insert_with(BTreeMap::new);
            for (field, v) in incoming {
                values
                    .entry(field.clone())
                    .and_modify(|existing| *existing += *v)
                    .or_insert(*v);
            }
        }
    }

    /// JSON form: `{name, partition, key, count, value?}`.
    pub fn to_json(&self) -> Value {
        let key: Map<String, Value> = self
            .key
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut obj = json!({
            "name": self.name,
            "partition": self.partition,
            "key": key,
            "count": self.count,
        });
        if let Some(values) = &self.value {
            let values: Map<String, Value> = values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            obj["value"] = Value::Object(values);
        }
        obj
    }
}

/// Key values cross the binary codec as JSON text, which keeps numbers and
/// booleans typed without needing a self-describing format.
mod key_text {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(key: &[(String, Value)], serializer: S) -> Result<S::Ok, S::Error> {
        let text: Vec<(&str, String)> = key.iter().map(|(k, v)| (k.as_str(), v.to_string())).collect();
        text.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(String, Value)>, D::Error> {
        Vec::<(String, String)>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, text)| serde_json::from_str(&text).map(|v| (k, v)).map_err(D::Error::custom))
            .collect()
    }
}

/// Identity to accumulated record, for one accumulation window.
#[derive(Debug, Default)]
pub struct AggregationStore {
    entries: HashMap<Identity, AggregationRecord>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a record; an unseen identity is inserted as-is.
    pub fn merge(&mut self, record: AggregationRecord) {
        let identity = record.identity();
        self.merge_with_identity(identity, record);
    }

    pub fn merge_with_identity(&mut self, identity: Identity, record: AggregationRecord) {
        match self.entries.get_mut(&identity) {
            Some(existing) => existing.absorb(&record),
            None => {
                self.entries.insert(identity, record);
            }
        }
    }

    pub fn merge_evaluation(&mut self, definition: &MetricDefinition, evaluation: Evaluation) {
        self.merge(AggregationRecord::from_evaluation(definition, evaluation));
    }

    /// Merges every entry of another store into this one.
    pub fn merge_store(&mut self, other: AggregationStore) {
        for (identity, record) in other.entries {
            self.merge_with_identity(identity, record);
        }
    }

    pub fn get(&self, identity: &str) -> Option<&AggregationRecord> {
        self.entries.get(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &AggregationRecord)> {
        self.entries.iter()
    }

    /// Empties the store, returning everything accumulated so far.
    pub fn drain(&mut self) -> Vec<(Identity, AggregationRecord)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

/// One [`AggregationStore`] per routing partition, so identities never
/// collide across partitions.
#[derive(Debug, Default)]
pub struct PartitionedStore {
    partitions: BTreeMap<usize, AggregationStore>,
}

impl PartitionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, partition_id: usize, record: AggregationRecord) {
        self.partitions.entry(partition_id).or_default().merge(record);
    }

    /// Merges a whole partition store, e.g. one handed back after a failed
    /// transmission.
    pub fn merge_partition(&mut self, partition_id: usize, store: AggregationStore) {
        self.partitions.entry(partition_id).or_default().merge_store(store);
    }

    pub fn partition(&self, partition_id: usize) -> Option<&AggregationStore> {
        self.partitions.get(&partition_id)
    }

    pub fn partition_ids(&self) -> Vec<usize> {
        self.partitions.keys().copied().collect()
    }

    /// Number of records across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.values().map(AggregationStore::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(AggregationStore::is_empty)
    }

    /// Empties every partition at once.
    pub fn drain(&mut self) -> BTreeMap<usize, AggregationStore> {
        std::mem::take(&mut self.partitions)
    }
}
