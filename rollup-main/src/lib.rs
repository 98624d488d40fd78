/*!
# Rollup: keyed metric aggregation with partitioned forwarding

Rollup turns a stream of structured records into keyed, time-partitioned
aggregates. A set of declarative metric definitions is evaluated against
every record; each definition that matches yields a key tuple, a value, a
count and a time-bucket label. Results sharing an identity (metric name,
time bucket and key values) are merged by summing counts and values, then
periodically drained into a sink.

## Key Features

### Metric definitions
- Key fields, value field with `int`/`float` typing and a default
- Optional count field, where a count of zero is counted once
- Daily, hourly, minutely or secondly buckets in UTC or local time,
  or a bucket label read straight from the record

### Accumulation
- Commutative, associative merge keyed by a stable identity digest
- One store per routing partition on the forwarding side

### Distributed mode
- Hash-based assignment of key tuples to a sorted node list
- Deterministic failover to the next lower-indexed live node
- Length-prefixed bincode payloads of `(partition_id, record)` pairs
- A receiving node service that merges forwarded payloads

### Sinks
- DuckDB tables with additive upserts and an Arrow snapshot
- An in-memory key-value sink with per-identity expiry
- JSON lines on stdout

## Usage

```rust,no_run
use rollup_core::aggregation::AggregationStore;
use rollup_core::config::MetricSpec;
use rollup_core::metrics::{MetricsRegistry, Record};
use serde_json::json;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = MetricsRegistry::from_specs(&[MetricSpec {
        name: Some("req_count".to_string()),
        each_key: Some("host".to_string()),
        utc: Some(true),
        ..Default::default()
    }])?;

    let record: Record = json!({"host": "a"}).as_object().cloned().unwrap_or_default();
    let mut store = AggregationStore::new();
    for (definition, evaluation) in registry.evaluate_all(1_709_647_200, &record) {
        store.merge_evaluation(definition, evaluation);
    }

    for (identity, record) in store.drain() {
        println!("{} {}", identity, record.to_json());
    }
    Ok(())
}
```

For configuration details see the [`config`](crate::config) module, and
[`storage`](crate::storage) for the available sinks.
*/

pub mod aggregation;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod service;
pub mod storage;

pub use aggregation::{compute_identity, AggregationRecord, AggregationStore, Identity, PartitionedStore};
pub use error::{Result, RollupError};
pub use metrics::{MetricDefinition, MetricsRegistry};
pub use partition::{compute_partition_id, select_node, Node, PartitionRouter};
pub use service::AggregationService;
pub use storage::Sink;
