use crate::pipeline::{Event, RecordSource};
use async_stream::stream;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tracing::warn;

/// Reads one JSON object per line.
///
/// The event time is taken from `time_key` (unix seconds, integer, float or
/// numeric string); records without it are stamped with the wall clock.
/// The reader is consumed by the first call to [`RecordSource::stream`].
pub struct JsonLinesSource<R> {
    reader: Mutex<Option<R>>,
    time_key: String,
}

impl<R> JsonLinesSource<R> {
    pub fn new(reader: R, time_key: impl Into<String>) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            time_key: time_key.into(),
        }
    }
}

impl JsonLinesSource<BufReader<Stdin>> {
    pub fn stdin(time_key: impl Into<String>) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), time_key)
    }
}

impl<R> RecordSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    fn stream(&self) -> BoxStream<'static, Event> {
        let reader = self.reader.lock().ok().and_then(|mut reader| reader.take());
        let time_key = self.time_key.clone();

        Box::pin(stream! {
            if let Some(reader) = reader {
                let mut lines = reader.lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_line(&line, &time_key) {
                                yield event;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "stopped reading records");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Parses one line into an event; blank or non-object lines yield `None`.
pub fn parse_line(line: &str, time_key: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let record = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(record)) => record,
        Ok(_) => {
            warn!("ignoring non-object record");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "ignoring malformed record");
            return None;
        }
    };

    let timestamp = record
        .get(time_key)
        .and_then(|value| match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
            _ => None,
        })
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    Some(Event { timestamp, record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_parse_line_time_field() {
        let event = parse_line(r#"{"time": 1709647200, "host": "a"}"#, "time").unwrap();
        assert_eq!(event.timestamp, 1_709_647_200);
        assert_eq!(event.record["host"], "a");

        let event = parse_line(r#"{"ts": "1709647200.5"}"#, "ts").unwrap();
        assert_eq!(event.timestamp, 1_709_647_200);
    }

    #[test]
    fn test_parse_line_skips_garbage() {
        assert!(parse_line("", "time").is_none());
        assert!(parse_line("[1, 2]", "time").is_none());
        assert!(parse_line("{not json", "time").is_none());
    }

    #[test]
    fn test_parse_line_without_time_uses_clock() {
        let before = chrono::Utc::now().timestamp();
        let event = parse_line(r#"{"host": "a"}"#, "time").unwrap();
        assert!(event.timestamp >= before);
    }

    #[tokio::test]
    async fn test_stream_reads_all_lines_once() {
        let input: &[u8] = b"{\"time\": 1, \"host\": \"a\"}\n\nnope\n{\"time\": 2}\n";
        let source = JsonLinesSource::new(input, "time");

        let events: Vec<Event> = source.stream().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].timestamp, 2);

        // The reader is gone after the first stream.
        assert_eq!(source.stream().count().await, 0);
    }
}
