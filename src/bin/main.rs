use dotenv::dotenv;
use rollup_agent::{run, Aggregator, AgentSettings, ForwardPipeline, JsonLinesSource, Pipeline, TcpNode};
use rollup_core::storage::sink_from_config;
use rollup_core::MetricsRegistry;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Initialize settings
    let settings = AgentSettings::new()?;
    let registry = MetricsRegistry::from_specs(&settings.metrics)?;
    if registry.is_empty() {
        warn!("no metrics configured, records will be read and dropped");
    }

    let source = JsonLinesSource::stdin(settings.source.time_key.clone());
    let interval = Duration::from_secs(settings.flush.interval_secs.max(1));

    if settings.forward.nodes.is_empty() {
        let sink = sink_from_config(&settings.sink)?;
        sink.init().await?;
        info!(metrics = registry.len(), sink = sink.name(), "aggregating locally");

        let pipeline = Pipeline::new(registry, sink);
        drive(&pipeline, &source, interval).await;
    } else {
        let recover_wait = Duration::from_secs(settings.forward.recover_wait_secs);
        let timeout = Duration::from_millis(settings.forward.connect_timeout_ms);
        let nodes: Vec<TcpNode> = settings
            .forward
            .nodes
            .iter()
            .map(|node| TcpNode::new(node.address.clone(), recover_wait, timeout))
            .collect();
        info!(metrics = registry.len(), nodes = nodes.len(), "forwarding to rollup nodes");

        let pipeline = ForwardPipeline::new(registry, nodes)?;
        drive(&pipeline, &source, interval).await;
        let pending = pipeline.pending().await;
        if pending > 0 {
            warn!(pending, "exiting with undelivered aggregates");
        }
    }

    Ok(())
}

/// Runs until stdin closes or Ctrl-C, flushing on the way out.
async fn drive<A: Aggregator>(aggregator: &A, source: &JsonLinesSource<tokio::io::BufReader<tokio::io::Stdin>>, interval: Duration) {
    tokio::select! {
        report = run(aggregator, source, interval) => {
            info!(written = report.written, failed = report.failed, "input closed");
        }
        _ = tokio::signal::ctrl_c() => {
            let report = aggregator.flush().await;
            info!(written = report.written, failed = report.failed, "interrupted");
        }
    }
}
