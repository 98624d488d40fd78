#[cfg(test)]
mod tests {
    use crate::forward::{ForwardPipeline, TcpNode};
    use crate::pipeline::{run, Aggregator, Event, Pipeline, RecordSource};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use mockall::predicate::*;
    use mockall::*;
    use rollup_core::aggregation::AggregationRecord;
    use rollup_core::config::MetricSpec;
    use rollup_core::error::{Result, RollupError};
    use rollup_core::storage::cache::MemorySink;
    use rollup_core::storage::{FlushReport, Sink};
    use rollup_core::{compute_identity, AggregationService, MetricsRegistry};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    mock! {
        pub RecordSource {}
        impl RecordSource for RecordSource {
            fn stream(&self) -> BoxStream<'static, Event>;
        }
    }

    mock! {
        pub Sink {}
        #[async_trait]
        impl Sink for Sink {
            async fn upsert(&self, identity: &str, record: &AggregationRecord) -> Result<()>;
        }
    }

    const T: i64 = 1_709_647_200;

    fn registry() -> MetricsRegistry {
        MetricsRegistry::from_specs(&[
            MetricSpec {
                name: Some("req_count".to_string()),
                each_key: Some("host".to_string()),
                utc: Some(true),
                ..Default::default()
            },
            MetricSpec {
                name: Some("bytes".to_string()),
                value_key: Some("bytes".to_string()),
                partition_by: Some("daily".to_string()),
                utc: Some(true),
                ..Default::default()
            },
        ])
        .unwrap()
    }

    fn event(host: &str, bytes: i64) -> Event {
        Event {
            timestamp: T,
            record: json!({ "host": host, "bytes": bytes }).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_run_flushes_every_identity_once() {
        let mut mock_source = MockRecordSource::new();
        let mut mock_sink = MockSink::new();

        mock_source.expect_stream().times(1).return_once(|| {
            Box::pin(stream::iter(vec![event("a", 10), event("a", 5), event("b", 1)]))
        });

        let host_a = compute_identity("req_count", "2024-03-05 14", &["a"]);
        mock_sink
            .expect_upsert()
            .with(eq(host_a), always())
            .times(1)
            .returning(|_, record| {
                assert_eq!(record.count, 2);
                Ok(())
            });
        mock_sink.expect_upsert().times(2).returning(|_, _| Ok(()));

        let pipeline = Pipeline::new(registry(), Arc::new(mock_sink));
        let report = run(&pipeline, &mock_source, Duration::from_secs(3600)).await;
        assert_eq!(report, FlushReport { written: 3, failed: 0 });
    }

    #[tokio::test]
    async fn test_value_metric_is_summed_across_keys() {
        let mut mock_source = MockRecordSource::new();
        let mut mock_sink = MockSink::new();

        mock_source.expect_stream().times(1).return_once(|| {
            Box::pin(stream::iter(vec![event("a", 10), event("b", 32)]))
        });

        mock_sink
            .expect_upsert()
            .withf(|_, record| record.name == "bytes")
            .times(1)
            .returning(|_, record| {
                let value = record.value.as_ref().unwrap();
                assert_eq!(value["bytes"].as_f64(), 42.0);
                assert_eq!(record.partition, "2024-03-05");
                assert!(record.key.is_empty());
                Ok(())
            });
        mock_sink.expect_upsert().returning(|_, _| Ok(()));

        let pipeline = Pipeline::new(registry(), Arc::new(mock_sink));
        run(&pipeline, &mock_source, Duration::from_secs(3600)).await;
    }

    #[tokio::test]
    async fn test_sink_failure_is_counted() {
        let mut mock_source = MockRecordSource::new();
        let mut mock_sink = MockSink::new();

        mock_source
            .expect_stream()
            .times(1)
            .return_once(|| Box::pin(stream::iter(vec![event("a", 1)])));
        mock_sink
            .expect_upsert()
            .withf(|_, record| record.name == "bytes")
            .returning(|_, _| Err(RollupError::sink("unavailable")));
        mock_sink.expect_upsert().returning(|_, _| Ok(()));

        let pipeline = Pipeline::new(registry(), Arc::new(mock_sink));
        let report = run(&pipeline, &mock_source, Duration::from_secs(3600)).await;
        assert_eq!(report, FlushReport { written: 1, failed: 1 });
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut mock_source = MockRecordSource::new();
        let mock_sink = MockSink::new();

        mock_source
            .expect_stream()
            .times(1)
            .return_once(|| Box::pin(stream::iter(Vec::<Event>::new())));

        let pipeline = Pipeline::new(registry(), Arc::new(mock_sink));
        let report = run(&pipeline, &mock_source, Duration::from_secs(3600)).await;
        assert_eq!(report, FlushReport::default());
    }

    async fn start_node() -> (String, Arc<MemorySink>, AggregationService) {
        let sink = Arc::new(MemorySink::new(None));
        let service = AggregationService::new(sink.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = service.clone();
        tokio::spawn(async move { server.serve(listener, std::future::pending()).await });
        (address, sink, service)
    }

    async fn closed_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn tcp_node(address: &str) -> TcpNode {
        TcpNode::new(address, Duration::from_secs(60), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_forward_to_node_end_to_end() {
        let (address, sink, service) = start_node().await;
        let pipeline = ForwardPipeline::new(registry(), vec![tcp_node(&address)]).unwrap();

        for bytes in [10, 20, 30] {
            pipeline.emit(&event("a", bytes)).await;
        }
        let report = pipeline.flush().await;
        assert_eq!(report, FlushReport { written: 2, failed: 0 });

        service.flush().await;
        let host_a = compute_identity("req_count", "2024-03-05 14", &["a"]);
        assert_eq!(sink.get(&host_a).await.unwrap().count(), 3);
        let bytes = compute_identity::<&str>("bytes", "2024-03-05", &[]);
        assert_eq!(sink.get(&bytes).await.unwrap().counters["bytes"].as_f64(), 60.0);
    }

    #[tokio::test]
    async fn test_forward_fails_over_to_live_node() {
        let (live, sink, service) = start_node().await;
        let dead = closed_address().await;
        let pipeline = ForwardPipeline::new(registry(), vec![tcp_node(&live), tcp_node(&dead)]).unwrap();

        for i in 0..20 {
            pipeline.emit(&event(&format!("host-{}", i), 1)).await;
        }
        let report = pipeline.flush().await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.written, 21);
        assert_eq!(pipeline.pending().await, 0);

        service.flush().await;
        assert_eq!(sink.len().await, 21);
    }

    #[tokio::test]
    async fn test_forward_keeps_window_when_every_node_is_down() {
        let dead = closed_address().await;
        let pipeline = ForwardPipeline::new(registry(), vec![tcp_node(&dead)]).unwrap();

        pipeline.emit(&event("a", 1)).await;
        // Selected while up, refused on connect: failover finds nobody.
        assert!(matches!(pipeline.flush_batch().await, Err(RollupError::NoAvailableNodes)));
        assert_eq!(pipeline.pending().await, 2);

        // The node stays out of rotation, so the next flush does not send.
        let report = pipeline.flush().await;
        assert_eq!(report, FlushReport { written: 0, failed: 2 });
        assert_eq!(pipeline.pending().await, 2);
    }

    #[tokio::test]
    async fn test_forward_without_ack_is_not_resent_to_other_node() {
        let (live, sink, service) = start_node().await;
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_address = silent.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = silent.accept().await {
                let _ = rollup_core::codec::read_frame(&mut stream).await;
            }
        });

        let pipeline =
            ForwardPipeline::new(registry(), vec![tcp_node(&live), tcp_node(&silent_address)]).unwrap();
        for i in 0..20 {
            pipeline.emit(&event(&format!("host-{}", i), 1)).await;
        }
        let report = pipeline.flush().await;
        assert_eq!(report.written + report.failed, 21);
        assert!(report.failed > 0);
        assert_eq!(pipeline.pending().await, 0);

        // The live node only holds what it was sent directly.
        service.flush().await;
        assert_eq!(sink.len().await, report.written);
    }
}
