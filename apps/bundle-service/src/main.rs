use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use bundle_model::{Bundle, Payload, Priority};
use bundle_service_core::{BundleClient, ChannelListener, EndpointRegistry, ServiceConfig};
use clap::{Parser, ValueEnum};
use engine_boundary::LoopbackEngine;
use tokio::time::timeout;
use tracing::{info, warn};

mod telemetry;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Bulk,
    Standard,
    Expedited,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Bulk => Priority::Bulk,
            PriorityArg::Standard => Priority::Standard,
            PriorityArg::Expedited => Priority::Expedited,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "bundle-service",
    author,
    version,
    about = "Drive an endpoint session against the in-process loopback engine"
)]
struct Cli {
    /// Endpoint identifier to open.
    #[arg(long, env = "BUNDLE_SERVICE_ENDPOINT", default_value = "ipn:1.1")]
    endpoint: String,

    /// Destination endpoint; defaults to the opened endpoint so bundles loop back.
    #[arg(long)]
    destination: Option<String>,

    /// Payload text for each bundle.
    #[arg(long, default_value = "hello")]
    message: String,

    /// Send this file instead of `--message`.
    #[arg(long, conflicts_with = "message")]
    file: Option<PathBuf>,

    /// Number of bundles to send.
    #[arg(long, default_value_t = 1)]
    count: u32,

    #[arg(long, value_enum, default_value_t = PriorityArg::Standard)]
    priority: PriorityArg,

    /// Bundle lifetime handed to the engine.
    #[arg(long, default_value_t = 300)]
    ttl: u32,

    /// Parent directory for session spool directories.
    /// Overrides `BUNDLE_SERVICE_SPOOL_ROOT`.
    #[arg(long)]
    spool_root: Option<PathBuf>,

    /// Overrides `BUNDLE_SERVICE_SEND_TIMEOUT_MS`.
    #[arg(long)]
    send_timeout_ms: Option<u64>,

    /// Overrides `BUNDLE_SERVICE_CLOSE_TIMEOUT_MS`.
    #[arg(long)]
    close_timeout_ms: Option<u64>,

    /// Inbound payloads at least this many bytes arrive as files; 0 disables.
    /// Overrides `BUNDLE_SERVICE_INBOUND_FILE_THRESHOLD`.
    #[arg(long)]
    inbound_file_threshold: Option<usize>,

    /// Send from the null endpoint when no endpoint is open.
    #[arg(long, default_value_t = false)]
    allow_anonymous_send: bool,

    /// How long to wait for looped-back deliveries.
    #[arg(long, default_value_t = 5)]
    wait_secs: u64,

    #[arg(long, env = "RUST_LOG")]
    log_filter: Option<String>,

    /// Print Prometheus metrics before exiting.
    #[arg(long, default_value_t = false)]
    dump_metrics: bool,
}

#[derive(Debug)]
struct RunConfig {
    service: ServiceConfig,
    endpoint: String,
    destination: String,
    payload: Payload,
    count: u32,
    priority: Priority,
    ttl: u32,
    wait: Duration,
    dump_metrics: bool,
}

impl TryFrom<Cli> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        ensure!(!cli.endpoint.trim().is_empty(), "endpoint must not be empty");

        let mut service = ServiceConfig::from_env();
        if let Some(root) = cli.spool_root {
            service.spool_root = root;
        }
        if let Some(ms) = cli.send_timeout_ms {
            service.send_acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = cli.close_timeout_ms {
            service.close_acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = cli.inbound_file_threshold {
            service.inbound_file_threshold = threshold;
        }
        if cli.allow_anonymous_send {
            service.allow_anonymous_send = true;
        }
        if let Some(filter) = cli.log_filter {
            service.log_filter = filter;
        }

        ensure!(
            !service.send_acquire_timeout.is_zero(),
            "send timeout must be positive"
        );
        ensure!(
            service.close_acquire_timeout >= service.send_acquire_timeout,
            "close timeout ({} ms) must not be shorter than send timeout ({} ms)",
            service.close_acquire_timeout.as_millis(),
            service.send_acquire_timeout.as_millis()
        );

        let payload = match cli.file {
            Some(path) => {
                ensure!(path.is_file(), "payload file not found: {}", path.display());
                Payload::File(path)
            }
            None => Payload::from(cli.message.into_bytes()),
        };

        Ok(RunConfig {
            service,
            destination: cli.destination.unwrap_or_else(|| cli.endpoint.clone()),
            endpoint: cli.endpoint,
            payload,
            count: cli.count,
            priority: cli.priority.into(),
            ttl: cli.ttl,
            wait: Duration::from_secs(cli.wait_secs),
            dump_metrics: cli.dump_metrics,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RunConfig::try_from(cli)?;
    let telemetry = telemetry::Telemetry::init(&config.service.log_filter)?;
    info!(
        endpoint = %config.endpoint,
        destination = %config.destination,
        count = config.count,
        spool_root = %config.service.spool_root.display(),
        "starting bundle-service demo"
    );

    run(&config).await?;

    if config.dump_metrics {
        println!("{}", telemetry.render());
    }
    Ok(())
}

async fn run(config: &RunConfig) -> Result<()> {
    let engine = LoopbackEngine::started();
    let registry = EndpointRegistry::new(engine.clone(), config.service.clone());
    let client = BundleClient::new(registry.clone());

    let (listener, mut deliveries) = ChannelListener::new();
    client
        .open_endpoint(&config.endpoint, listener)
        .await
        .with_context(|| format!("failed to open endpoint {}", config.endpoint))?;

    for seq in 0..config.count {
        let bundle = Bundle::new(
            config.destination.clone(),
            config.priority,
            config.ttl,
            config.payload.clone(),
        );
        let receipt = client
            .send_bundle(&bundle)
            .await
            .with_context(|| format!("failed to send bundle {seq}"))?;
        info!(seq, code = receipt.code, "bundle sent");
    }

    let expected = if config.destination == config.endpoint {
        config.count
    } else {
        0
    };
    let mut received = 0u32;
    while received < expected {
        match timeout(config.wait, deliveries.recv()).await {
            Ok(Some(bundle)) => {
                received += 1;
                match bundle.payload() {
                    Payload::Bytes(bytes) => info!(
                        source = %bundle.endpoint_id,
                        ttl = bundle.time_to_live,
                        bytes = bytes.len(),
                        text = %String::from_utf8_lossy(bytes),
                        "bundle received"
                    ),
                    Payload::File(path) => info!(
                        source = %bundle.endpoint_id,
                        ttl = bundle.time_to_live,
                        path = %path.display(),
                        "bundle received as file"
                    ),
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!(received, expected, "timed out waiting for deliveries");
                break;
            }
        }
    }

    let report = client
        .close_endpoint()
        .await
        .context("failed to close endpoint")?;
    info!(
        forced = report.forced,
        artifacts_removed = report.artifacts_removed,
        artifact_failures = report.artifact_failures,
        received,
        "endpoint closed"
    );

    registry.close_all().await;
    engine.stop();
    Ok(())
}
