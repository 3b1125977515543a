use std::net::SocketAddr;
use std::sync::Arc;

use gantry_core::prelude::*;
use gantry_core::{drain, signal, telemetry};
use prometheus_client::registry::Registry;

use gantry::controller::Controller;
use gantry::gateway::Gateway;
use gantry::management::metrics_server;
use gantry::plugins::default_plugins;
use gantry::source::{ClusterSource, FsSource, ResourceSource};
use gantry::telemetry::Metrics;
use gantry::{BackendKind, config};

const METRICS_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9187);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	rustls::crypto::ring::default_provider()
		.install_default()
		.expect("installing the process-level crypto provider cannot fail");

	let config = Arc::new(config::load()?);

	info!("gantry-ingress-controller");
	info!("http_port: {}", config.http_port);
	info!("https_port: {}", config.https_port);
	info!(
		"pod_namespace: {}",
		config.pod_namespace.as_deref().unwrap_or_default()
	);
	info!(
		"watch_namespace: {}",
		config.watch_namespace.as_deref().unwrap_or_default()
	);
	info!("ingress_class: {}", config.ingress_class);
	if let Some(name) = &config.profiler {
		info!("profiler {name} requested; no exporter is built in, ignoring");
	}

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(gantry_core::metrics::sub_registry(
		&mut registry,
	)));

	let source: Arc<dyn ResourceSource> = match &config.backend {
		BackendKind::Fs(dir) => Arc::new(FsSource::new(dir.clone())?),
		BackendKind::Cluster => {
			Arc::new(ClusterSource::new(config.watch_namespace.clone()).await?)
		},
	};

	let controller = Controller::new(
		config.ingress_class.clone(),
		source,
		default_plugins(),
		metrics.clone(),
		config.max_idle_conns_per_host,
	);
	controller.watch().await;

	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();

	let metrics_server =
		metrics_server::Server::bind(SocketAddr::from(METRICS_ADDR), drain_rx.clone(), registry)
			.await
			.context("stats server starts")?;
	metrics_server.spawn();

	let gateway = Gateway::new(
		config.clone(),
		controller.clone(),
		metrics.clone(),
		drain_rx.clone(),
	);
	gateway.run().await.context("gateway starts")?;
	drop(drain_rx);

	// wait for a shutdown signal
	shutdown.wait().await;

	// readiness reports unhealthy immediately so the load balancer stops
	// sending new traffic, then the configured grace period passes before
	// connections drain
	controller.set_shutting_down();
	info!(
		"waiting {:?} before shutting down listeners",
		config.wait_before_shutdown
	);
	tokio::time::sleep(config.wait_before_shutdown).await;

	let _ = tokio::time::timeout(
		config.shutdown_grace,
		drain_tx.start_drain_and_wait(drain::DrainMode::Graceful),
	)
	.await;
	info!("shutdown complete");
	Ok(())
}
