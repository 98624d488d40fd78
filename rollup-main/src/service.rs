//! Receiving node service.
//!
//! A node accepts forwarded payloads over TCP, merges every decoded
//! `(partition_id, record)` pair into its [`PartitionedStore`] and, on each
//! flush tick, drains the store into the configured [`Sink`].
//!
//! A connection may carry any number of frames. A frame is merged only after
//! its whole payload decoded cleanly, then acknowledged with [`FRAME_ACK`];
//! a frame that fails to decode closes the connection without an ack so the
//! sender fails over.

use crate::aggregation::PartitionedStore;
use crate::codec::{self, FRAME_ACK};
use crate::error::Result;
use crate::storage::{FlushReport, Sink};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AggregationService {
    store: Arc<Mutex<PartitionedStore>>,
    sink: Arc<dyn Sink>,
}

impl AggregationService {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            store: Arc::new(Mutex::new(PartitionedStore::new())),
            sink,
        }
    }

    /// Decodes a payload and merges it, returning the number of records
    /// applied. Nothing is merged when decoding fails.
    pub async fn ingest_payload(&self, payload: &[u8]) -> Result<usize> {
        let pairs = codec::decode_payload(payload)?;
        let applied = pairs.len();
        let mut store = self.store.lock().await;
        for (partition_id, record) in pairs {
            store.merge(partition_id, record);
        }
        debug!(records = applied, pending = store.len(), "merged payload");
        Ok(applied)
    }

    /// Number of accumulated records not yet flushed.
    pub async fn pending(&self) -> usize {
        self.store.lock().await.len()
    }

    /// Drains every partition into the sink.
    pub async fn flush(&self) -> FlushReport {
        let drained = self.store.lock().await.drain();

        let mut report = FlushReport::default();
        for (partition_id, mut store) in drained {
            let records = store.drain();
            debug!(partition_id, records = records.len(), "flushing partition");
            report.add(self.sink.flush_all(records).await);
        }
        if report.written > 0 || report.failed > 0 {
            info!(
                sink = self.sink.name(),
                written = report.written,
                failed = report.failed,
                "flush complete"
            );
        }
        report
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut incoming = TcpListenerStream::new(listener);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                conn = incoming.next() => match conn {
                    Some(Ok(stream)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.handle_connection(stream).await {
                                warn!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Some(Err(e)) => warn!(error = %e, "accept failed"),
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Runs [`flush`](Self::flush) every `interval` until `shutdown`
    /// resolves, then flushes one last time.
    pub async fn flush_loop<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
        self.flush().await;
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr().ok();
        while let Some(payload) = codec::read_frame(&mut stream).await? {
            let applied = self.ingest_payload(&payload).await?;
            stream.write_u8(FRAME_ACK).await?;
            debug!(?peer, records = applied, "acknowledged frame");
        }
        Ok(())
    }
}
