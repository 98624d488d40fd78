//! Distributed mode: records are pre-aggregated per routing partition and
//! forwarded to the node that owns the partition.
//!
//! A flush selects a node for every partition before anything is sent, so
//! running out of nodes up front never leaves a half-delivered window. Once
//! sending starts, a partition whose connect or write failed fails over to
//! the next live node. A partition that was written but never acknowledged
//! is not resent, since the node may already have merged it. Partitions no
//! node accepted go back into the store and the flush reports
//! [`RollupError::NoAvailableNodes`].

use crate::pipeline::{Aggregator, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use rollup_core::aggregation::{AggregationRecord, AggregationStore, PartitionedStore};
use rollup_core::codec::{self, FRAME_ACK};
use rollup_core::error::{Result, RollupError};
use rollup_core::metrics::MetricsRegistry;
use rollup_core::partition::{Node, PartitionRouter};
use rollup_core::storage::FlushReport;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A node that accepts encoded payloads.
#[async_trait]
pub trait Transport: Node + Send + Sync {
    /// Delivers one payload. A node that fails a send should report itself
    /// unavailable until it recovers.
    ///
    /// Fails with [`RollupError::Unacknowledged`] once the payload may have
    /// reached the node, and with any other error only when it cannot have.
    async fn send(&self, payload: Bytes) -> Result<()>;
}

/// A rollup node reached over TCP.
pub struct TcpNode {
    address: String,
    recover_wait: Duration,
    timeout: Duration,
    failed_at: StdMutex<Option<Instant>>,
}

impl TcpNode {
    pub fn new(address: impl Into<String>, recover_wait: Duration, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            recover_wait,
            timeout,
            failed_at: StdMutex::new(None),
        }
    }

    fn set_failed(&self, failed: bool) {
        if let Ok(mut failed_at) = self.failed_at.lock() {
            *failed_at = failed.then(Instant::now);
        }
    }

    fn timed_out(&self, phase: &str) -> RollupError {
        RollupError::Io(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("{} to {} took longer than {:?}", phase, self.address, self.timeout),
        ))
    }

    async fn deliver(&self, payload: &[u8]) -> Result<()> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.timed_out("connect"))??;
        // A frame cut short by a timeout is never merged by the node.
        tokio::time::timeout(self.timeout, codec::write_frame(&mut stream, payload))
            .await
            .map_err(|_| self.timed_out("write"))??;

        match tokio::time::timeout(self.timeout, stream.read_u8()).await {
            Ok(Ok(FRAME_ACK)) => Ok(()),
            Ok(Ok(other)) => Err(RollupError::Unacknowledged(format!(
                "unexpected ack byte {:#04x} from {}",
                other, self.address
            ))),
            Ok(Err(e)) => Err(RollupError::Unacknowledged(format!("{}: {}", self.address, e))),
            Err(_) => Err(RollupError::Unacknowledged(format!(
                "no ack from {} within {:?}",
                self.address, self.timeout
            ))),
        }
    }
}

impl Node for TcpNode {
    fn address(&self) -> &str {
        &self.address
    }

    fn available(&self) -> bool {
        match self.failed_at.lock() {
            Ok(failed_at) => failed_at.map_or(true, |at| at.elapsed() >= self.recover_wait),
            Err(_) => true,
        }
    }
}

#[async_trait]
impl Transport for TcpNode {
    async fn send(&self, payload: Bytes) -> Result<()> {
        let result = self.deliver(&payload).await;
        self.set_failed(result.is_err());
        result
    }
}

/// Outcome of forwarding one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// Records a node acknowledged.
    pub delivered: usize,
    /// Records written to a node that never acknowledged them; not resent.
    pub unconfirmed: usize,
}

enum Outcome {
    Delivered,
    Unconfirmed,
    /// Encoding failed; kept for the next flush.
    Unsent(AggregationStore),
    /// Every node failed before the payload was written.
    Exhausted(AggregationStore),
}

/// Evaluates records, routes them by key and forwards each partition.
pub struct ForwardPipeline<N> {
    registry: MetricsRegistry,
    router: PartitionRouter<N>,
    store: Mutex<PartitionedStore>,
}

impl<N: Transport> ForwardPipeline<N> {
    pub fn new(registry: MetricsRegistry, nodes: Vec<N>) -> Result<Self> {
        Ok(Self {
            registry,
            router: PartitionRouter::new(nodes)?,
            store: Mutex::new(PartitionedStore::new()),
        })
    }

    pub fn router(&self) -> &PartitionRouter<N> {
        &self.router
    }

    pub async fn pending(&self) -> usize {
        self.store.lock().await.len()
    }

    /// Drains and forwards every partition.
    ///
    /// Fails with [`RollupError::NoAvailableNodes`] when some partition has
    /// no live node before sending, in which case nothing is sent, or when
    /// failover runs out of nodes for a partition, in which case the
    /// partitions already delivered stay delivered. Either way every
    /// undelivered partition is merged back for the next flush.
    pub async fn flush_batch(&self) -> Result<ForwardReport> {
        let drained = self.store.lock().await.drain();
        if drained.is_empty() {
            return Ok(ForwardReport::default());
        }

        let selected: Result<Vec<&N>> = drained
            .keys()
            .map(|partition_id| self.router.select(*partition_id))
            .collect();
        let nodes = match selected {
            Ok(nodes) => nodes,
            Err(e) => {
                self.requeue(drained).await;
                return Err(e);
            }
        };

        let deliveries = drained
            .into_iter()
            .zip(nodes)
            .map(|((partition_id, store), node)| self.forward_partition(partition_id, store, node));
        let outcomes = join_all(deliveries).await;

        let mut report = ForwardReport::default();
        let mut requeued = 0;
        let mut exhausted = false;
        let mut undelivered = BTreeMap::new();
        for (partition_id, records, outcome) in outcomes {
            match outcome {
                Outcome::Delivered => report.delivered += records,
                Outcome::Unconfirmed => report.unconfirmed += records,
                Outcome::Unsent(store) => {
                    requeued += records;
                    undelivered.insert(partition_id, store);
                }
                Outcome::Exhausted(store) => {
                    exhausted = true;
                    requeued += records;
                    undelivered.insert(partition_id, store);
                }
            }
        }
        if !undelivered.is_empty() {
            self.requeue(undelivered).await;
        }
        if exhausted {
            warn!(
                delivered = report.delivered,
                requeued, "ran out of nodes, keeping undelivered partitions for the next flush"
            );
            return Err(RollupError::NoAvailableNodes);
        }
        Ok(report)
    }

    async fn forward_partition(
        &self,
        partition_id: usize,
        store: AggregationStore,
        first: &N,
    ) -> (usize, usize, Outcome) {
        let records = store.len();
        let payload = match codec::encode_partition(partition_id, &store) {
            Ok(payload) => payload,
            Err(e) => {
                error!(partition_id, error = %e, "failed to encode partition");
                return (partition_id, records, Outcome::Unsent(store));
            }
        };

        let mut node = first;
        for _ in 0..self.router.len() {
            match node.send(payload.clone()).await {
                Ok(()) => {
                    debug!(partition_id, records, node = node.address(), "forwarded partition");
                    return (partition_id, records, Outcome::Delivered);
                }
                Err(RollupError::Unacknowledged(reason)) => {
                    error!(
                        partition_id,
                        records,
                        node = node.address(),
                        reason = %reason,
                        "partition written but not acknowledged, not resending"
                    );
                    return (partition_id, records, Outcome::Unconfirmed);
                }
                Err(e) => {
                    warn!(partition_id, node = node.address(), error = %e, "forward failed");
                    match self.router.select(partition_id) {
                        Ok(next) => node = next,
                        Err(_) => break,
                    }
                }
            }
        }
        (partition_id, records, Outcome::Exhausted(store))
    }

    async fn requeue(&self, partitions: BTreeMap<usize, AggregationStore>) {
        let mut store = self.store.lock().await;
        for (partition_id, partition) in partitions {
            store.merge_partition(partition_id, partition);
        }
    }
}

#[async_trait]
impl<N: Transport> Aggregator for ForwardPipeline<N> {
    async fn emit(&self, event: &Event) -> usize {
        let records: Vec<(usize, AggregationRecord)> = self
            .registry
            .evaluate_all(event.timestamp, &event.record)
            .map(|(definition, evaluation)| {
                let record = AggregationRecord::from_evaluation(definition, evaluation);
                (self.router.partition_for(&record), record)
            })
            .collect();

        let matched = records.len();
        let mut store = self.store.lock().await;
        for (partition_id, record) in records {
            store.merge(partition_id, record);
        }
        matched
    }

    /// Unconfirmed records count as failed; they are not retried.
    async fn flush(&self) -> FlushReport {
        match self.flush_batch().await {
            Ok(report) => {
                if report.delivered > 0 || report.unconfirmed > 0 {
                    info!(
                        forwarded = report.delivered,
                        unconfirmed = report.unconfirmed,
                        "flushed window"
                    );
                }
                FlushReport {
                    written: report.delivered,
                    failed: report.unconfirmed,
                }
            }
            Err(e) => {
                let pending = self.pending().await;
                error!(error = %e, pending, "flush postponed");
                FlushReport {
                    written: 0,
                    failed: pending,
                }
            }
        }
    }
}
