//! Multi-Cloud Orchestrator daemon
//!
//! Runs the control plane core in standalone mode: simulated provider
//! control planes, static credentials from the configuration file, the
//! event bus, the reconciliation sweep and health / metrics endpoints.

use anyhow::Context;
use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multicloud_orchestrator::domain::ports::AuditSinkRef;
use multicloud_orchestrator::{
    ControlPlaneConfig, EventBus, EventPublisher, ProviderFactory, Reconciler,
    ResourceOrchestrator, StaticCredentialResolver, SubscriptionRegistry, TracingAuditSink,
    VERSION,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Multi-Cloud Orchestrator - cluster and network control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Multi-Cloud Orchestrator");
    info!("  Version: {}", VERSION);
    info!("  Health: {}", args.health_addr);
    info!("  Metrics: {}", args.metrics_addr);

    let config = match &args.config {
        Some(path) => ControlPlaneConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            info!("No config file given, using defaults");
            ControlPlaneConfig::default()
        }
    };

    let providers = ProviderFactory::create(&config.providers)
        .context("failed to build provider registry")?;
    info!("Providers: {:?}", providers.providers());

    let credentials = StaticCredentialResolver::new(config.credentials.clone())
        .context("invalid credentials section")?;
    if credentials.is_empty() {
        warn!("No credentials configured; every provider call will fail with NotFound");
    }

    // Event propagation
    let subscriptions = SubscriptionRegistry::new();
    let bus = EventBus::new(config.event_bus.clone(), subscriptions.clone());
    bus.start()?;

    let audit: Option<AuditSinkRef> = if config.orchestrator.audit_enabled {
        Some(Arc::new(TracingAuditSink))
    } else {
        None
    };
    let orchestrator = ResourceOrchestrator::new(
        config.orchestrator.clone(),
        Arc::new(providers),
        Arc::new(credentials),
        audit,
        EventPublisher::new(bus.clone()),
    );

    let reconciler = Reconciler::with_baseline(
        config.reconcile.clone(),
        orchestrator.clone(),
        subscriptions.clone(),
        config.baseline_credentials(),
    );
    if config.reconcile.enabled {
        reconciler.start()?;
    } else {
        info!("Reconciliation sweep disabled");
    }

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(ExportedMetrics::register().context("failed to register metrics")?);

    let health_server = tokio::spawn(run_health_server(
        args.health_addr,
        orchestrator.clone(),
        bus.clone(),
        shutdown.clone(),
    ));
    let metrics_server = tokio::spawn(run_metrics_server(
        args.metrics_addr,
        metrics,
        orchestrator.clone(),
        bus.clone(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    reconciler.stop().await;
    bus.stop().await;

    for (name, server) in [("health", health_server), ("metrics", metrics_server)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("audit=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(
    addr: SocketAddr,
    orchestrator: Arc<ResourceOrchestrator>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        let bus = bus.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                let bus = bus.clone();
                async move { Ok::<_, Infallible>(health_response(req.uri().path(), &orchestrator, &bus).await) }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("failed to bind health server to {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("health server error")?;
    Ok(())
}

async fn health_response(
    path: &str,
    orchestrator: &ResourceOrchestrator,
    bus: &EventBus,
) -> hyper::Response<hyper::Body> {
    use hyper::StatusCode;

    match path {
        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
        "/readyz" => {
            if !bus.is_running() {
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "event bus stopped");
            }
            let unhealthy: Vec<String> = orchestrator
                .health()
                .await
                .into_iter()
                .filter(|(_, healthy)| !healthy)
                .map(|(provider, _)| provider.to_string())
                .collect();
            if unhealthy.is_empty() {
                text_response(StatusCode::OK, "ok")
            } else {
                text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("unreachable providers: {}", unhealthy.join(", ")),
                )
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Gauges mirrored from the bus and registry counters on every scrape
struct ExportedMetrics {
    bus_events: prometheus::IntGaugeVec,
    queue_depth: prometheus::IntGauge,
    observers: prometheus::IntGauge,
    subscriptions: prometheus::IntGauge,
    provider_up: prometheus::IntGaugeVec,
}

impl ExportedMetrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            bus_events: prometheus::register_int_gauge_vec!(
                "multicloud_event_bus_events",
                "Events seen by the bus, by outcome",
                &["outcome"]
            )?,
            queue_depth: prometheus::register_int_gauge!(
                "multicloud_event_bus_queue_depth",
                "Events waiting in the submission queue"
            )?,
            observers: prometheus::register_int_gauge!(
                "multicloud_subscription_observers",
                "Connected observers"
            )?,
            subscriptions: prometheus::register_int_gauge!(
                "multicloud_subscription_patterns",
                "Registered subscriptions across all observers"
            )?,
            provider_up: prometheus::register_int_gauge_vec!(
                "multicloud_provider_up",
                "Provider control plane reachability",
                &["provider"]
            )?,
        })
    }

    async fn refresh(&self, orchestrator: &ResourceOrchestrator, bus: &EventBus) {
        let snapshot = bus.metrics();
        for (outcome, value) in [
            ("published", snapshot.published),
            ("rejected", snapshot.rejected),
            ("delivered", snapshot.delivered),
            ("filtered", snapshot.filtered),
            ("dropped", snapshot.dropped()),
        ] {
            self.bus_events
                .with_label_values(&[outcome])
                .set(value as i64);
        }
        self.queue_depth.set(bus.queue_depth() as i64);

        let stats = bus.registry().stats();
        self.observers.set(stats.observers as i64);
        self.subscriptions.set(stats.subscriptions as i64);

        for (provider, healthy) in orchestrator.health().await {
            self.provider_up
                .with_label_values(&[provider.as_str()])
                .set(i64::from(healthy));
        }
    }
}

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<ExportedMetrics>,
    orchestrator: Arc<ResourceOrchestrator>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        let orchestrator = orchestrator.clone();
        let bus = bus.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                let orchestrator = orchestrator.clone();
                let bus = bus.clone();
                async move {
                    Ok::<_, Infallible>(
                        metrics_response(req.uri().path(), &metrics, &orchestrator, &bus).await,
                    )
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("failed to bind metrics server to {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("metrics server error")?;
    Ok(())
}

async fn metrics_response(
    path: &str,
    metrics: &ExportedMetrics,
    orchestrator: &ResourceOrchestrator,
    bus: &EventBus,
) -> hyper::Response<hyper::Body> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::StatusCode;
    use prometheus::{Encoder, TextEncoder};

    if path != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }

    metrics.refresh(orchestrator, bus).await;

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed");
    }

    let mut response = text_response(StatusCode::OK, buffer);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}
