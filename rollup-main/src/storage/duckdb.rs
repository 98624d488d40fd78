//! DuckDB sink implementation.
//!
//! Aggregates are kept document-style: one row per identity holding
//! `name`, `partition`, the key mapping (JSON text) and the running
//! `count`, plus a side table with one row per (identity, value field).
//! Every upsert adds to the stored numbers inside a single transaction.
//!
//! # Configuration
//!
//! ```toml
//! [sink]
//! engine = "duckdb"
//! connection = "aggregates.db"  # or ":memory:"
//! options = {
//!     table = "aggregation",     # Optional: table name (default: aggregation)
//!     threads = "4"              # Optional: DuckDB worker threads
//! }
//! ```
//!
//! Value fields are stored as `DOUBLE` regardless of the metric's type.

use super::Sink;
use crate::aggregation::AggregationRecord;
use crate::error::{Result, RollupError};
use arrow_array::builder::{Int64Builder, StringBuilder};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use duckdb::{params, Config, Connection};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

const DEFAULT_TABLE: &str = "aggregation";

/// Arrow schema of [`DuckDbSink::snapshot`].
pub fn aggregation_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("partition", DataType::Utf8, false),
        Field::new("key", DataType::Utf8, false),
        Field::new("count", DataType::Int64, false),
    ])
}

#[derive(Clone)]
pub struct DuckDbSink {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl DuckDbSink {
    /// Opens the database; `connection` is a file path or `:memory:`.
    pub fn new_with_options(connection: &str, options: &HashMap<String, String>) -> Result<Self> {
        if connection.trim().is_empty() {
            return Err(RollupError::invalid_config(
                "'connection' parameter is required on duckdb sink",
            ));
        }

        let table = options
            .get("table")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RollupError::invalid_config(format!(
                "invalid table name {:?} on duckdb sink",
                table
            )));
        }

        let mut config = Config::default();
        if let Some(threads) = options.get("threads") {
            let threads: i64 = threads.parse().map_err(|_| {
                RollupError::invalid_config(format!("invalid 'threads' option {:?}", threads))
            })?;
            config = config.threads(threads).map_err(RollupError::sink)?;
        }

        let conn = Connection::open_with_flags(connection, config).map_err(RollupError::sink)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::new_with_options(":memory:", &HashMap::new())
    }

    /// Current aggregates, ordered by identity.
    pub async fn snapshot(&self) -> Result<RecordBatch> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                r#"SELECT id, name, "partition", "key", "count" FROM {} ORDER BY id"#,
                self.table
            ))
            .map_err(RollupError::sink)?;
        let mut rows = stmt.query(params![]).map_err(RollupError::sink)?;

        let mut ids = StringBuilder::new();
        let mut names = StringBuilder::new();
        let mut partitions = StringBuilder::new();
        let mut keys = StringBuilder::new();
        let mut counts = Int64Builder::new();

        while let Some(row) = rows.next().map_err(RollupError::sink)? {
            ids.append_value(row.get::<_, String>(0).map_err(RollupError::sink)?);
            names.append_value(row.get::<_, String>(1).map_err(RollupError::sink)?);
            partitions.append_value(row.get::<_, String>(2).map_err(RollupError::sink)?);
            keys.append_value(row.get::<_, String>(3).map_err(RollupError::sink)?);
            counts.append_value(row.get::<_, i64>(4).map_err(RollupError::sink)?);
        }

        let arrays: Vec<ArrayRef> = vec![
            Arc::new(ids.finish()),
            Arc::new(names.finish()),
            Arc::new(partitions.finish()),
            Arc::new(keys.finish()),
            Arc::new(counts.finish()),
        ];
        RecordBatch::try_new(Arc::new(aggregation_schema()), arrays).map_err(RollupError::sink)
    }

    /// Stored value fields of one identity.
    pub async fn values(&self, identity: &str) -> Result<BTreeMap<String, f64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                r#"SELECT field, "value" FROM {}_values WHERE id = ?"#,
                self.table
            ))
            .map_err(RollupError::sink)?;
        let mut rows = stmt.query(params![identity]).map_err(RollupError::sink)?;

        let mut values = BTreeMap::new();
        while let Some(row) = rows.next().map_err(RollupError::sink)? {
            let field: String = row.get(0).map_err(RollupError::sink)?;
            let value: f64 = row.get(1).map_err(RollupError::sink)?;
            values.insert(field, value);
        }
        Ok(values)
    }
}

#[async_trait]
impl Sink for DuckDbSink {
    async fn init(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id VARCHAR PRIMARY KEY,
                name VARCHAR NOT NULL,
                "partition" VARCHAR NOT NULL,
                "key" VARCHAR NOT NULL,
                "count" BIGINT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {t}_values (
                id VARCHAR NOT NULL,
                field VARCHAR NOT NULL,
                "value" DOUBLE NOT NULL,
                PRIMARY KEY (id, field)
            );
            "#,
            t = self.table
        ))
        .map_err(|e| RollupError::sink(format!("Failed to create tables: {}", e)))?;
        Ok(())
    }

    async fn upsert(&self, identity: &str, record: &AggregationRecord) -> Result<()> {
        let key = record.to_json()["key"].to_string();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(RollupError::sink)?;

        tx.execute(
            &format!(
                r#"
                INSERT INTO {t} (id, name, "partition", "key", "count") VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    "partition" = EXCLUDED."partition",
                    "key" = EXCLUDED."key",
                    "count" = {t}."count" + EXCLUDED."count"
                "#,
                t = self.table
            ),
            params![identity, record.name, record.partition, key, record.count],
        )
        .map_err(|e| RollupError::sink(format!("Failed to upsert {}: {}", identity, e)))?;

        if let Some(values) = &record.value {
            let mut stmt = tx
                .prepare(&format!(
                    r#"
                    INSERT INTO {t}_values (id, field, "value") VALUES (?, ?, ?)
                    ON CONFLICT (id, field) DO UPDATE
                    SET "value" = {t}_values."value" + EXCLUDED."value"
                    "#,
                    t = self.table
                ))
                .map_err(RollupError::sink)?;
            for (field, value) in values {
                stmt.execute(params![identity, field, value.as_f64()])
                    .map_err(|e| RollupError::sink(format!("Failed to upsert {}.{}: {}", identity, field, e)))?;
            }
        }

        tx.commit().map_err(RollupError::sink)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "duckdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;
    use arrow_array::{Int64Array, StringArray};

    fn record(host: &str, count: i64, ms: i64) -> AggregationRecord {
        AggregationRecord {
            name: "req".to_string(),
            partition: "2024-03-05 14".to_string(),
            key: vec![("host".to_string(), host.into())],
            count,
            value: Some(BTreeMap::from([("ms".to_string(), MetricValue::Int(ms))])),
        }
    }

    #[tokio::test]
    async fn test_upsert_adds_counts_and_values() {
        let sink = DuckDbSink::new_in_memory().unwrap();
        sink.init().await.unwrap();

        let a = record("a", 2, 10);
        let id = a.identity();
        sink.upsert(&id, &a).await.unwrap();
        sink.upsert(&id, &record("a", 3, 5)).await.unwrap();
        sink.upsert(&record("b", 1, 1).identity(), &record("b", 1, 1)).await.unwrap();

        let batch = sink.snapshot().await.unwrap();
        assert_eq!(batch.num_rows(), 2);

        let ids = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        let keys = batch.column(3).as_any().downcast_ref::<StringArray>().unwrap();
        let counts = batch.column(4).as_any().downcast_ref::<Int64Array>().unwrap();
        let row = (0..batch.num_rows()).find(|i| ids.value(*i) == id).unwrap();
        assert_eq!(counts.value(row), 5);
        assert_eq!(keys.value(row), r#"{"host":"a"}"#);

        let values = sink.values(&id).await.unwrap();
        assert_eq!(values.get("ms"), Some(&15.0));
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let mut options = HashMap::new();
        options.insert("table".to_string(), "agg; DROP".to_string());
        assert!(matches!(
            DuckDbSink::new_with_options(":memory:", &options),
            Err(RollupError::InvalidConfig(_))
        ));
    }
}
