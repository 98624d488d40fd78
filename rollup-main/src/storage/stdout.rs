//! JSON-lines sink, mostly for debugging and piping into other tools.

use super::Sink;
use crate::aggregation::AggregationRecord;
use crate::error::{Result, RollupError};
use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;

pub struct StdoutSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn upsert(&self, identity: &str, record: &AggregationRecord) -> Result<()> {
        let mut line = record.to_json();
        line["id"] = Value::String(identity.to_string());
        let mut out = self
            .out
            .lock()
            .map_err(|_| RollupError::sink("stdout writer poisoned"))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_one_json_line_per_record() {
        let buffer = Shared::default();
        let sink = StdoutSink::with_writer(Box::new(buffer.clone()));
        let record = AggregationRecord {
            name: "req".to_string(),
            partition: "2024-03-05".to_string(),
            key: vec![("host".to_string(), "a".into())],
            count: 2,
            value: None,
        };
        sink.upsert("abc", &record).await.unwrap();
        sink.upsert("def", &record).await.unwrap();

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], "abc");
        assert_eq!(lines[0]["key"]["host"], "a");
        assert_eq!(lines[1]["count"], 2);
    }
}
