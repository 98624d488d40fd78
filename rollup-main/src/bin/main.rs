//! Rollup node binary.
//!
//! Listens for payloads forwarded by `rollup-agent` instances, merges them
//! per routing partition and drains the merged aggregates into a sink on a
//! fixed interval.
//!
//! # Configuration
//!
//! Configuration can be provided through multiple sources, in order of precedence:
//!
//! 1. Command-line arguments (highest precedence)
//! 2. Environment variables (prefixed with `ROLLUP_`)
//! 3. User-specified configuration file (via `--config`)
//! 4. System-wide configuration (`/etc/rollup/config.toml`)
//! 5. Default configuration (embedded in binary)
//!
//! ## Command-line Options
//!
//! ```text
//! Options:
//!   -c, --config <FILE>              Path to configuration file
//!       --host <HOST>                Listen address [env: ROLLUP_SERVER_HOST]
//!       --port <PORT>                Listen port [env: ROLLUP_SERVER_PORT]
//!       --sink-engine <TYPE>         duckdb, memory or stdout [env: ROLLUP_SINK_ENGINE]
//!       --sink-connection <STR>      Sink connection string [env: ROLLUP_SINK_CONNECTION]
//!       --sink-options <KEY=VAL>     Sink options [env: ROLLUP_SINK_OPTIONS]
//!       --sink-expire <SECS>         Per-identity expiry [env: ROLLUP_SINK_EXPIRE]
//!       --flush-interval <SECS>      Seconds between flushes [env: ROLLUP_FLUSH_INTERVAL]
//! ```
//!
//! ## Configuration File Format (TOML)
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 24285
//!
//! [flush]
//! interval_secs = 60
//!
//! [sink]
//! engine = "duckdb"
//! connection = "aggregates.db"
//! options = { table = "aggregation", threads = "2" }
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Run with default configuration (stdout sink)
//! rollup
//!
//! # Persist into DuckDB, flushing every 10 seconds
//! rollup --sink-engine duckdb --sink-connection aggregates.db --flush-interval 10
//!
//! # Keep aggregates in memory for one hour after their last update
//! ROLLUP_SINK_ENGINE=memory ROLLUP_SINK_EXPIRE=3600 rollup
//! ```

use clap::Parser;
use rollup_core::{
    config::{CliArgs, Settings},
    service::AggregationService,
    storage::sink_from_config,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_args = CliArgs::parse();

    // Load settings from config file and CLI args
    let settings = Settings::new(cli_args)?;

    // Create and initialize the sink
    let sink = sink_from_config(&settings.sink)?;
    sink.init().await?;

    let service = AggregationService::new(sink);

    let addr = settings.server.address();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, sink = %settings.sink.engine, "rollup node listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    let wait_stop = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stopped| *stopped).await;
    };

    let flusher = {
        let service = service.clone();
        let interval = Duration::from_secs(settings.flush.interval_secs.max(1));
        let stop = wait_stop(stop_rx.clone());
        tokio::spawn(async move { service.flush_loop(interval, stop).await })
    };

    let server = service.serve(listener, wait_stop(stop_rx));
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = stop_tx.send(true);
            server.await?;
        }
    }
    let _ = stop_tx.send(true);

    // The flush loop drains once more before returning.
    flusher.await?;
    Ok(())
}
