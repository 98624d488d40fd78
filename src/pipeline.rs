use async_trait::async_trait;
use futures::stream::BoxStream;
use rollup_core::aggregation::AggregationStore;
use rollup_core::metrics::{MetricsRegistry, Record};
use rollup_core::storage::{FlushReport, Sink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::{debug, info};

/// A record together with its event time in unix seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: i64,
    pub record: Record,
}

pub trait RecordSource: Send + Sync {
    fn stream(&self) -> BoxStream<'static, Event>;
}

/// Something that accumulates events and periodically hands them on.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Evaluates every metric against the event, returning how many
    /// definitions matched.
    async fn emit(&self, event: &Event) -> usize;

    /// Drains the accumulated window.
    async fn flush(&self) -> FlushReport;
}

/// Single-node mode: evaluate, merge, flush into a local sink.
pub struct Pipeline {
    registry: MetricsRegistry,
    store: Arc<Mutex<AggregationStore>>,
    sink: Arc<dyn Sink>,
}

impl Pipeline {
    pub fn new(registry: MetricsRegistry, sink: Arc<dyn Sink>) -> Self {
        Self {
            registry,
            store: Arc::new(Mutex::new(AggregationStore::new())),
            sink,
        }
    }

    pub async fn pending(&self) -> usize {
        self.store.lock().await.len()
    }
}

#[async_trait]
impl Aggregator for Pipeline {
    async fn emit(&self, event: &Event) -> usize {
        let mut store = self.store.lock().await;
        let mut matched = 0;
        for (definition, evaluation) in self.registry.evaluate_all(event.timestamp, &event.record) {
            store.merge_evaluation(definition, evaluation);
            matched += 1;
        }
        matched
    }

    async fn flush(&self) -> FlushReport {
        // Swap the window out so emits are not blocked by the sink.
        let drained = self.store.lock().await.drain();
        if drained.is_empty() {
            return FlushReport::default();
        }
        let report = self.sink.flush_all(drained).await;
        info!(
            sink = self.sink.name(),
            written = report.written,
            failed = report.failed,
            "flushed window"
        );
        report
    }
}

/// Feeds `source` into `aggregator`, flushing every `interval` and once
/// more when the source ends. Returns the sum of every flush.
pub async fn run<A>(aggregator: &A, source: &dyn RecordSource, interval: Duration) -> FlushReport
where
    A: Aggregator + ?Sized,
{
    let mut events = source.stream();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    let mut total = FlushReport::default();
    let mut received = 0usize;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    aggregator.emit(&event).await;
                    received += 1;
                }
                None => break,
            },
            _ = ticker.tick() => total.add(aggregator.flush().await),
        }
    }
    total.add(aggregator.flush().await);
    debug!(received, written = total.written, failed = total.failed, "source exhausted");
    total
}
