// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use gantry_core::drain::DrainWatcher;
use gantry_core::prelude::*;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;

use crate::http::{Body, Response, StatusCode, empty_response};

/// Server exposes the Prometheus registry over plaintext HTTP/1.1 on a
/// dedicated listener, draining with the rest of the process.
pub struct Server {
	bind: TcpListener,
	drain_rx: DrainWatcher,
	registry: Arc<Mutex<Registry>>,
}

impl Server {
	pub async fn bind(
		addr: SocketAddr,
		drain_rx: DrainWatcher,
		registry: Registry,
	) -> anyhow::Result<Self> {
		let bind = TcpListener::bind(addr).await?;
		Ok(Server {
			bind,
			drain_rx,
			registry: Arc::new(Mutex::new(registry)),
		})
	}

	pub fn address(&self) -> SocketAddr {
		self.bind.local_addr().expect("local address must be ready")
	}

	pub fn spawn(self) {
		let address = self.address();
		info!(%address, component = "stats", "listener established");
		let registry = self.registry;
		let drain = self.drain_rx;
		let bind = self.bind;
		tokio::spawn(async move {
			loop {
				let socket = tokio::select! {
					res = bind.accept() => match res {
						Ok((socket, _)) => socket,
						Err(err) => {
							debug!("stats accept error: {err}");
							continue;
						},
					},
					_ = drain.clone().wait_for_drain() => break,
				};
				let _ = socket.set_nodelay(true);
				let registry = registry.clone();
				tokio::spawn(async move {
					let served = hyper::server::conn::http1::Builder::new()
						.timer(TokioTimer::new())
						.serve_connection(
							TokioIo::new(socket),
							hyper::service::service_fn(move |req| {
								let registry = registry.clone();
								async move { Ok::<_, Infallible>(handle(&registry, req)) }
							}),
						)
						.await;
					if let Err(err) = served {
						debug!("stats connection error: {err}");
					}
				});
			}
			info!(%address, component = "stats", "listener drained");
		});
	}
}

fn handle(registry: &Mutex<Registry>, req: Request<Incoming>) -> Response {
	match req.uri().path() {
		"/metrics" | "/stats/prometheus" => handle_metrics(registry),
		_ => empty_response(StatusCode::NOT_FOUND),
	}
}

fn handle_metrics(registry: &Mutex<Registry>) -> Response {
	let mut buf = String::new();
	let registry = registry.lock().expect("mutex");
	if let Err(err) = encode(&mut buf, &registry) {
		return ::http::Response::builder()
			.status(StatusCode::INTERNAL_SERVER_ERROR)
			.body(Body::from(err.to_string()))
			.expect("builder with known status code should not fail");
	}

	::http::Response::builder()
		.status(StatusCode::OK)
		.header(
			hyper::header::CONTENT_TYPE,
			"application/openmetrics-text;charset=utf-8;version=1.0.0",
		)
		.body(Body::from(buf))
		.expect("builder with known status code should not fail")
}
