mod dial;
pub mod retry;

use std::sync::{Arc, Mutex};

pub use dial::{DIAL_TIMEOUT, Dialer};
use gantry_core::prelude::*;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};

use crate::http::{
	Body, Request, Response, STATUS_CLIENT_CLOSED_REQUEST, Scheme, StatusCode, empty_response,
	header, plaintext_response,
};
use crate::route;
use crate::telemetry::Metrics;

/// How long to wait for upstream response headers.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// How long pooled upstream connections stay idle.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	/// Upstream answered 502; surfaced as an error so the retry layer can
	/// fail over to the next backend.
	#[error("bad gateway")]
	BadGateway,
	/// Upstream answered 503.
	#[error("service unavailable")]
	ServiceUnavailable,
	#[error("client canceled request")]
	Canceled,
	#[error("upstream response deadline exceeded")]
	ResponseHeaderTimeout,
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(#[from] hyper_util::client::legacy::Error),
	#[error("processing failed: {0}")]
	Processing(#[source] anyhow::Error),
}

impl ProxyError {
	pub fn is_retryable(&self) -> bool {
		match self {
			ProxyError::BadGateway | ProxyError::ServiceUnavailable => true,
			// deadline exceeded counts as a dial-class failure
			ProxyError::ResponseHeaderTimeout => true,
			ProxyError::UpstreamCallFailed(err) => err.is_connect(),
			_ => false,
		}
	}

	pub fn into_response(self) -> Response {
		match self {
			ProxyError::Canceled => {
				// client went away
				empty_response(StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).expect("valid status"))
			},
			_ => plaintext_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n"),
		}
	}
}

/// The downstream connection's upgrade handle, carried through the retry
/// layer so a 101 response can splice the two connections together.
#[derive(Clone, Default)]
pub struct DownstreamUpgrade(pub Arc<Mutex<Option<OnUpgrade>>>);

/// Proxy is the engine forwarding requests to upstream pods. It holds two
/// pooled clients behind a scheme gateway: HTTP/1.1 (also used for https
/// upstreams) and HTTP/2 cleartext.
pub struct Proxy {
	default_client: Client<Dialer, Body>,
	h2c_client: Client<Dialer, Body>,
}

impl Proxy {
	pub fn new(
		route_table: Arc<route::Table>,
		metrics: Arc<Metrics>,
		max_idle_conns_per_host: usize,
	) -> Proxy {
		let dialer = Dialer::new(route_table, metrics);
		let default_client = Client::builder(TokioExecutor::new())
			.pool_timer(TokioTimer::new())
			.pool_idle_timeout(IDLE_TIMEOUT)
			.pool_max_idle_per_host(max_idle_conns_per_host)
			.build(dialer.clone());
		let h2c_client = Client::builder(TokioExecutor::new())
			.pool_timer(TokioTimer::new())
			.timer(TokioTimer::new())
			.pool_idle_timeout(IDLE_TIMEOUT)
			.http2_only(true)
			.build(dialer);
		Proxy {
			default_client,
			h2c_client,
		}
	}

	/// Forwards the request to the upstream selected by its URI, routing by
	/// scheme: `h2c` goes over the HTTP/2 cleartext client, everything else
	/// over the default transport. Upstream 502/503 are surfaced as errors
	/// so the retry layer can treat them as retryable.
	pub async fn serve(&self, mut req: Request) -> Result<Response, ProxyError> {
		let is_h2c = req.uri().scheme_str() == Some("h2c");
		let has_upgrade = req.headers().contains_key(header::UPGRADE);
		// h2c cannot serve upgrades; fall back to the default transport
		let use_h2c = is_h2c && !has_upgrade;

		let downstream_upgrade = req.extensions_mut().remove::<DownstreamUpgrade>();

		if is_h2c {
			crate::http::modify_req_uri(&mut req, |uri| {
				uri.scheme = Some(Scheme::HTTP);
				Ok(())
			})
			.map_err(ProxyError::Processing)?;
		}
		if req.uri().scheme().is_none() {
			crate::http::modify_req_uri(&mut req, |uri| {
				uri.scheme = Some(Scheme::HTTP);
				Ok(())
			})
			.map_err(ProxyError::Processing)?;
		}
		strip_hop_by_hop(&mut req, has_upgrade);
		if use_h2c {
			// h2 has no hop-by-hop connection management headers
			*req.version_mut() = hyper::Version::HTTP_2;
		} else {
			*req.version_mut() = hyper::Version::HTTP_11;
		}

		let client = if use_h2c {
			&self.h2c_client
		} else {
			&self.default_client
		};

		let host = req.uri().host().unwrap_or_default().to_string();
		let resp = match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, client.request(req)).await {
			Ok(Ok(resp)) => resp,
			Ok(Err(err)) => {
				warn!("proxy: upstream error; host={host}, err={err}");
				return Err(ProxyError::UpstreamCallFailed(err));
			},
			Err(_) => {
				warn!("proxy: upstream response deadline exceeded; host={host}");
				return Err(ProxyError::ResponseHeaderTimeout);
			},
		};

		match resp.status() {
			StatusCode::BAD_GATEWAY => Err(ProxyError::BadGateway),
			StatusCode::SERVICE_UNAVAILABLE => Err(ProxyError::ServiceUnavailable),
			StatusCode::SWITCHING_PROTOCOLS => {
				Ok(splice_upgrade(downstream_upgrade, resp))
			},
			_ => Ok(resp.map(Body::new)),
		}
	}
}

/// Splices the downstream and upstream connections together once both sides
/// complete the protocol switch.
fn splice_upgrade(
	downstream: Option<DownstreamUpgrade>,
	mut resp: hyper::Response<hyper::body::Incoming>,
) -> Response {
	let downstream = downstream.and_then(|d| d.0.lock().unwrap().take());
	let Some(downstream) = downstream else {
		warn!("proxy: upstream switched protocols but downstream cannot upgrade");
		return plaintext_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n");
	};
	let upstream = hyper::upgrade::on(&mut resp);
	tokio::spawn(async move {
		let (down, up) = match tokio::try_join!(downstream, upstream) {
			Ok(pair) => pair,
			Err(err) => {
				warn!("proxy: upgrade failed: {err}");
				return;
			},
		};
		let mut down = TokioIo::new(down);
		let mut up = TokioIo::new(up);
		if let Err(err) = tokio::io::copy_bidirectional(&mut down, &mut up).await {
			debug!("proxy: upgraded connection closed: {err}");
		}
	});
	resp.map(Body::new)
}

/// Removes hop-by-hop headers before forwarding. When the client requested
/// an upgrade, the Connection and Upgrade headers are preserved so the
/// upstream sees the protocol switch.
fn strip_hop_by_hop(req: &mut Request, keep_upgrade: bool) {
	const HOP_BY_HOP: &[header::HeaderName] = &[
		header::PROXY_AUTHENTICATE,
		header::PROXY_AUTHORIZATION,
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
	];
	for h in HOP_BY_HOP {
		req.headers_mut().remove(h);
	}
	if !keep_upgrade {
		req.headers_mut().remove(header::CONNECTION);
		req.headers_mut().remove(header::UPGRADE);
	}
	req.headers_mut().remove("keep-alive");
}
