use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gantry_core::drain::DrainWatcher;
use gantry_core::metrics::DefaultedUnknown;
use gantry_core::prelude::*;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo};
use prometheus_client::metrics::gauge::Gauge;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::compression::Compression;

use crate::controller::Controller;
use crate::http::{
	Body, Request, Response, StatusCode, empty_response, header, plaintext_response, request_host,
	request_uri, strip_port,
};
use crate::proxy::DownstreamUpgrade;
use crate::telemetry::Metrics;
use crate::telemetry::metrics::{HostActiveLabels, RequestLabels};
use crate::{cert, state};
use crate::{Config, ConcurrencyLimit};

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

/// The peer (or trusted-proxy-forwarded) address of the request, stored in
/// the request extensions.
#[derive(Clone, Copy, Debug)]
pub struct ClientAddr(pub SocketAddr);

/// Gateway owns the two traffic listeners and the outer middleware chain:
/// healthz, host normalisation, concurrency limits, access log, state
/// injection, request counting and compression, ahead of the controller mux.
pub struct Gateway {
	config: Arc<Config>,
	controller: Controller,
	metrics: Arc<Metrics>,
	drain_rx: DrainWatcher,
	host_limiter: Option<KeyedLimiter>,
	host_country_limiter: Option<KeyedLimiter>,
}

impl Gateway {
	pub fn new(
		config: Arc<Config>,
		controller: Controller,
		metrics: Arc<Metrics>,
		drain_rx: DrainWatcher,
	) -> Gateway {
		Gateway {
			host_limiter: config.host_concurrency.map(KeyedLimiter::new),
			host_country_limiter: config.host_country_concurrency.map(KeyedLimiter::new),
			config,
			controller,
			metrics,
			drain_rx,
		}
	}

	/// Binds both listeners and starts serving. Returns once the listeners
	/// are established; connections drain with the drain watcher.
	pub async fn run(self) -> anyhow::Result<()> {
		let this = Arc::new(self);

		let http_addr = SocketAddr::from(([0, 0, 0, 0], this.config.http_port));
		let http = TcpListener::bind(http_addr)
			.await
			.with_context(|| format!("binding {http_addr}"))?;
		info!(address = %http_addr, component = "http", "listener established");

		let https_addr = SocketAddr::from(([0, 0, 0, 0], this.config.https_port));
		let https = TcpListener::bind(https_addr)
			.await
			.with_context(|| format!("binding {https_addr}"))?;
		info!(address = %https_addr, component = "https", "listener established");

		let acceptor = TlsAcceptor::from(this.tls_config()?);

		tokio::spawn(this.clone().serve_listener(http, None));
		tokio::spawn(this.serve_listener(https, Some(acceptor)));
		Ok(())
	}

	fn tls_config(&self) -> anyhow::Result<Arc<ServerConfig>> {
		let fallback = cert::self_signed("gantry-ingress-controller")?;
		let resolver = self.controller.cert_resolver(fallback);
		let mut cfg = ServerConfig::builder_with_protocol_versions(ALL_TLS_VERSIONS)
			.with_no_client_auth()
			.with_cert_resolver(resolver);
		cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
		cfg.ticketer = rustls::crypto::ring::Ticketer::new()?;
		if let Some(key) = &self.config.tls_session_ticket_key {
			// rustls rotates ticket keys internally and does not accept
			// externally provisioned key material
			if key.len() == 32 {
				warn!("TLS_SESSION_TICKET_KEY is set but custom ticket keys are not supported");
			} else {
				error!("invalid TLS_SESSION_TICKET_KEY");
			}
		}
		Ok(Arc::new(cfg))
	}

	async fn serve_listener(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) {
		let drain = self.drain_rx.clone();
		loop {
			let (socket, peer) = tokio::select! {
				res = listener.accept() => match res {
					Ok(conn) => conn,
					Err(err) => {
						debug!("accept error: {err}");
						continue;
					},
				},
				_ = drain.clone().wait_for_drain() => break,
			};
			let this = self.clone();
			let tls = tls.clone();
			tokio::spawn(async move {
				if let Err(err) = this.handle_connection(socket, peer, tls).await {
					debug!("connection error: {err}");
				}
			});
		}
		info!("listener drained");
	}

	async fn handle_connection(
		self: Arc<Self>,
		socket: TcpStream,
		peer: SocketAddr,
		tls: Option<TlsAcceptor>,
	) -> anyhow::Result<()> {
		let _ = socket.set_nodelay(true);
		let secure = tls.is_some();

		let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
		if let Some(max) = self.config.max_header_bytes {
			builder.http1().max_buf_size(max);
		}

		let this = self.clone();
		let service = hyper::service::service_fn(move |req: ::http::Request<Incoming>| {
			let this = this.clone();
			async move { Ok::<_, Infallible>(this.handle(req, peer, secure).await) }
		});

		let drain = self.drain_rx.clone();
		macro_rules! serve {
			($io:expr) => {{
				let conn = builder.serve_connection_with_upgrades($io, service);
				tokio::pin!(conn);
				tokio::select! {
					res = conn.as_mut() => res.map_err(|e| anyhow::anyhow!("{e}"))?,
					_ = drain.clone().wait_for_drain() => {
						conn.as_mut().graceful_shutdown();
						let _ = conn.as_mut().await;
					},
				}
			}};
		}

		match tls {
			Some(acceptor) => {
				let stream = acceptor.accept(socket).await.context("tls handshake")?;
				serve!(TokioIo::new(stream));
			},
			None => serve!(TokioIo::new(socket)),
		}
		Ok(())
	}

	async fn handle(
		self: Arc<Self>,
		req: ::http::Request<Incoming>,
		peer: SocketAddr,
		secure: bool,
	) -> Response {
		let mut req = req.map(Body::new);

		// healthz runs ahead of everything, on both listeners
		if req.uri().path() == "/healthz" {
			return self.healthz(&req);
		}

		// host normalisation: lowercase, no port
		let host: Strng = request_host(&req).unwrap_or_default().into();

		let client = self.forwarded_client(&mut req, peer, secure);
		req.extensions_mut().insert(ClientAddr(client));

		// stash the downstream upgrade handle for the proxy
		if req.headers().contains_key(header::UPGRADE) {
			let upgrade = req.extensions_mut().remove::<OnUpgrade>();
			req
				.extensions_mut()
				.insert(DownstreamUpgrade(Arc::new(Mutex::new(upgrade))));
		}

		let upgrade: Strng = req
			.headers()
			.get(header::UPGRADE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.trim()
			.to_ascii_lowercase()
			.into();
		let _active = ActiveGuard::new(
			&self.metrics,
			HostActiveLabels {
				host: DefaultedUnknown::from(host.clone()),
				upgrade: DefaultedUnknown::from(upgrade),
			},
		);

		// per-host and per-host-per-country concurrency limits
		let mut _permits: Vec<tokio::sync::OwnedSemaphorePermit> = Vec::new();
		if let Some(limiter) = &self.host_limiter {
			match limiter.acquire(host.clone()).await {
				Some(permit) => _permits.push(permit),
				None => {
					return plaintext_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
				},
			}
		}
		if let Some(limiter) = &self.host_country_limiter {
			let country = self
				.config
				.host_country_header
				.as_ref()
				.and_then(|h| req.headers().get(h.as_str()))
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default();
			let key = strng::format!("{host}|{country}");
			match limiter.acquire(key).await {
				Some(permit) => _permits.push(permit),
				None => {
					return plaintext_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
				},
			}
		}

		let method = req.method().clone();
		let uri = request_uri(&req);
		let s = state::inject(&mut req);
		let start = Instant::now();

		// compression wraps the controller mux
		let controller = self.controller.clone();
		let mux = tower::service_fn(move |req: Request| {
			let controller = controller.clone();
			async move { Ok::<_, Infallible>(controller.serve(req).await) }
		});
		let resp = match Compression::new(mux).oneshot(req).await {
			Ok(resp) => resp.map(Body::new),
			Err(err) => match err {},
		};

		let status = resp.status().as_u16();
		self
			.metrics
			.requests
			.get_or_create(&RequestLabels {
				host: DefaultedUnknown::from(host.clone()),
				status: DefaultedUnknown::from(Some(gantry_core::metrics::EncodeDisplay(status))),
				method: DefaultedUnknown::from(Strng::from(method.as_str())),
				ingress_name: DefaultedUnknown::from(s.get("ingress").unwrap_or_default()),
				ingress_namespace: DefaultedUnknown::from(s.get("namespace").unwrap_or_default()),
			})
			.inc();

		if !self.config.disable_access_log {
			info!(
				target: "access",
				%method,
				uri = %uri,
				host = %host,
				status,
				client = %client,
				duration = ?start.elapsed(),
				namespace = %s.get("namespace").unwrap_or_default(),
				ingress = %s.get("ingress").unwrap_or_default(),
				service_target = %s.get("serviceTarget").unwrap_or_default(),
			);
		}

		resp
	}

	fn healthz(&self, req: &Request) -> Response {
		let wants_ready = req
			.uri()
			.query()
			.is_some_and(|q| q.split('&').any(|kv| kv == "ready=1"));
		if wants_ready && !self.controller.ready() {
			return plaintext_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
		}
		plaintext_response(StatusCode::OK, "OK")
	}

	/// Resolves the effective client address and rewrites the forwarding
	/// headers. Forwarded values are only believed when the peer is a
	/// trusted proxy.
	fn forwarded_client(&self, req: &mut Request, peer: SocketAddr, secure: bool) -> SocketAddr {
		let trusted = self.config.trust_proxy.trusts(peer.ip());

		let client = if trusted {
			req
				.headers()
				.get("x-forwarded-for")
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.split(',').next())
				.and_then(|v| strip_port(v.trim()).parse::<IpAddr>().ok())
				.map(|ip| SocketAddr::new(ip, peer.port()))
				.unwrap_or(peer)
		} else {
			peer
		};

		if trusted {
			let appended = match req
				.headers()
				.get("x-forwarded-for")
				.and_then(|v| v.to_str().ok())
			{
				Some(existing) => format!("{existing}, {}", peer.ip()),
				None => peer.ip().to_string(),
			};
			if let Ok(value) = header::HeaderValue::from_str(&appended) {
				req.headers_mut().insert("x-forwarded-for", value);
			}
		} else {
			if let Ok(value) = header::HeaderValue::from_str(&peer.ip().to_string()) {
				req.headers_mut().insert("x-forwarded-for", value);
			}
			let proto = if secure { "https" } else { "http" };
			req
				.headers_mut()
				.insert("x-forwarded-proto", header::HeaderValue::from_static(proto));
		}
		if !req.headers().contains_key("x-forwarded-proto") {
			let proto = if secure { "https" } else { "http" };
			req
				.headers_mut()
				.insert("x-forwarded-proto", header::HeaderValue::from_static(proto));
		}

		client
	}
}

struct ActiveGuard {
	gauge: Gauge,
}

impl ActiveGuard {
	fn new(metrics: &Metrics, labels: HostActiveLabels) -> ActiveGuard {
		let gauge = metrics.host_active_requests.get_or_create(&labels).clone();
		gauge.inc();
		ActiveGuard { gauge }
	}
}

impl Drop for ActiveGuard {
	fn drop(&mut self) {
		self.gauge.dec();
	}
}

/// KeyedLimiter bounds in-flight requests per key: `capacity` concurrent
/// slots, and at most `queue_size` callers waiting for one. Beyond that,
/// requests are rejected.
struct KeyedLimiter {
	limit: ConcurrencyLimit,
	keys: Mutex<HashMap<Strng, LimiterEntry>>,
}

#[derive(Clone)]
struct LimiterEntry {
	semaphore: Arc<Semaphore>,
	waiting: Arc<AtomicUsize>,
}

impl KeyedLimiter {
	fn new(limit: ConcurrencyLimit) -> KeyedLimiter {
		KeyedLimiter {
			limit,
			keys: Mutex::new(HashMap::new()),
		}
	}

	async fn acquire(&self, key: Strng) -> Option<tokio::sync::OwnedSemaphorePermit> {
		let entry = {
			let mut keys = self.keys.lock().unwrap();
			keys
				.entry(key)
				.or_insert_with(|| LimiterEntry {
					semaphore: Arc::new(Semaphore::new(self.limit.capacity)),
					waiting: Arc::new(AtomicUsize::new(0)),
				})
				.clone()
		};

		if let Ok(permit) = entry.semaphore.clone().try_acquire_owned() {
			return Some(permit);
		}
		if entry.waiting.fetch_add(1, Ordering::SeqCst) >= self.limit.queue_size {
			entry.waiting.fetch_sub(1, Ordering::SeqCst);
			return None;
		}
		let permit = entry.semaphore.clone().acquire_owned().await.ok();
		entry.waiting.fetch_sub(1, Ordering::SeqCst);
		permit
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::TrustProxy;

	#[tokio::test]
	async fn keyed_limiter_capacity_and_queue() {
		let limiter = KeyedLimiter::new(ConcurrencyLimit {
			capacity: 1,
			queue_size: 0,
		});
		let first = limiter.acquire("example.com".into()).await;
		assert!(first.is_some());
		// no queue slots left; second caller is rejected
		assert!(limiter.acquire("example.com".into()).await.is_none());
		// a different key has its own capacity
		assert!(limiter.acquire("other.com".into()).await.is_some());
		drop(first);
		assert!(limiter.acquire("example.com".into()).await.is_some());
	}

	#[test]
	fn trust_proxy_matching() {
		let none = TrustProxy::None;
		assert!(!none.trusts("10.0.0.1".parse().unwrap()));

		let all = TrustProxy::All;
		assert!(all.trusts("10.0.0.1".parse().unwrap()));

		let cidrs = TrustProxy::Cidrs(vec!["10.0.0.0/8".parse().unwrap()]);
		assert!(cidrs.trusts("10.1.2.3".parse().unwrap()));
		assert!(!cidrs.trusts("192.168.0.1".parse().unwrap()));
	}
}
