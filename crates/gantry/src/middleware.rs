use std::net::IpAddr;
use std::time::Duration;

use base64::Engine;
use gantry_core::metrics::DefaultedUnknown;
use gantry_core::prelude::*;
use once_cell::sync::Lazy;
use tracing::Span;

use crate::http::{
	Body, Request, Response, StatusCode, empty_response, header, modify_req_uri,
	plaintext_response, redirect_response, request_uri,
};
use crate::plugins::RoutePolicies;
use crate::telemetry::Metrics;
use crate::telemetry::metrics::HostLabels;

/// Paths under this prefix are never redirected or blocked, so certificate
/// issuance keeps working on locked-down hosts.
const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge";

static AUTH_HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
	reqwest::Client::builder()
		.timeout(Duration::from_secs(10))
		.pool_idle_timeout(Duration::from_secs(5))
		.pool_max_idle_per_host(10)
		.build()
		.expect("building auth client cannot fail")
});

/// Outcome of the request-side policy chain.
pub enum Applied {
	/// The chain produced a response; do not proxy.
	Respond(Response),
	/// Continue with the (possibly rewritten) request. The span, when
	/// present, should cover the remaining request handling.
	Continue(Request, Option<Span>),
}

/// Applies the per-route policy chain to the request, in registration order.
pub async fn apply(
	policies: &RoutePolicies,
	mut req: Request,
	client_ip: IpAddr,
	metrics: &Metrics,
) -> Applied {
	let state = crate::state::get(&req);
	if !policies.namespace.is_empty() {
		state.set("namespace", policies.namespace.clone());
	}
	if !policies.ingress.is_empty() {
		state.set("ingress", policies.ingress.clone());
	}

	let acme_exempt = req.uri().path().starts_with(ACME_CHALLENGE_PREFIX);

	// http to https redirect
	if policies.redirect_https && !acme_exempt {
		let proto = req
			.headers()
			.get("x-forwarded-proto")
			.and_then(|v| v.to_str().ok());
		if proto == Some("http") {
			let host = req
				.headers()
				.get(header::HOST)
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default();
			let location = format!("https://{host}{}", request_uri(&req));
			return Applied::Respond(redirect_response(StatusCode::MOVED_PERMANENTLY, &location));
		}
	}

	// remote allow list
	if let Some(allowed) = &policies.allow_remote {
		if !acme_exempt && !allowed.iter().any(|net| net.contains(&client_ip)) {
			return Applied::Respond(plaintext_response(StatusCode::FORBIDDEN, "Forbidden\n"));
		}
	}

	// fixed window rate limits
	for rl in &policies.rate_limits {
		if !rl.allow() {
			if let Some(host) = crate::http::request_host(&req) {
				metrics
					.host_ratelimit_requests
					.get_or_create(&HostLabels {
						host: DefaultedUnknown::from(host),
					})
					.inc();
			}
			return Applied::Respond(plaintext_response(
				StatusCode::TOO_MANY_REQUESTS,
				"Too Many Requests\n",
			));
		}
	}

	// request body limit
	if let Some(limit) = policies.body_limit {
		let too_large = req
			.headers()
			.get(header::CONTENT_LENGTH)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse::<u64>().ok())
			.is_some_and(|len| len > limit);
		if too_large {
			return Applied::Respond(empty_response(StatusCode::PAYLOAD_TOO_LARGE));
		}
		req = req.map(|body| Body::new(http_body_util::Limited::new(body, limit as usize)));
	}

	// basic auth
	if let Some(auth) = &policies.basic_auth {
		if !basic_auth_ok(&req, &auth.user, &auth.pass) {
			let mut resp = empty_response(StatusCode::UNAUTHORIZED);
			resp.headers_mut().insert(
				header::WWW_AUTHENTICATE,
				header::HeaderValue::from_static("Basic realm=\"restricted\""),
			);
			return Applied::Respond(resp);
		}
	}

	// forward auth
	if let Some(fa) = &policies.forward_auth {
		match forward_auth(fa, req.headers()).await {
			ForwardAuthResult::Allowed(headers) => {
				for (name, value) in headers {
					if let Some(name) = name {
						req.headers_mut().insert(name, value);
					}
				}
			},
			ForwardAuthResult::Denied(resp) => return Applied::Respond(resp),
		}
	}

	// strip prefix
	if let Some(prefix) = &policies.strip_prefix {
		if let Some(rest) = req.uri().path().strip_prefix(prefix.as_str()) {
			let mut path = rest.to_string();
			if !path.starts_with('/') {
				path.insert(0, '/');
			}
			let query = req.uri().query().map(|q| q.to_string());
			if let Err(err) = set_path_and_query(&mut req, &path, query.as_deref()) {
				debug!("strip-prefix rewrite failed: {err}");
			}
		}
	}

	// upstream overrides
	if let Some(proto) = &policies.upstream_protocol {
		let scheme = proto.to_string();
		if let Err(err) = modify_req_uri(&mut req, |uri| {
			uri.scheme = Some(scheme.parse()?);
			Ok(())
		}) {
			debug!("upstream-protocol rewrite failed: {err}");
		}
	}
	if let Some(host) = &policies.upstream_host {
		if let Ok(value) = header::HeaderValue::from_str(host) {
			req.headers_mut().insert(header::HOST, value);
		}
	}
	if let Some(upstream_path) = &policies.upstream_path {
		let (ann_path, ann_query) = match upstream_path.split_once('?') {
			Some((p, q)) => (p, Some(q)),
			None => (upstream_path.as_str(), None),
		};
		let path = single_slash_join(ann_path, req.uri().path());
		let query = merge_query(ann_query, req.uri().query());
		if let Err(err) = set_path_and_query(&mut req, &path, query.as_deref()) {
			debug!("upstream-path rewrite failed: {err}");
		}
	}

	// trace sampling
	let span = policies.trace.and_then(|t| {
		if rand::random::<f64>() < t.sampler {
			Some(tracing::info_span!(
				"ingress",
				namespace = %policies.namespace,
				ingress = %policies.ingress,
				method = %req.method(),
				path = %req.uri().path(),
			))
		} else {
			None
		}
	});

	Applied::Continue(req, span)
}

/// Applies the response side of the chain.
pub fn apply_response(policies: &RoutePolicies, resp: &mut Response) {
	if let Some(hsts) = &policies.hsts {
		resp.headers_mut().insert(
			header::STRICT_TRANSPORT_SECURITY,
			header::HeaderValue::from_static(hsts.header_value()),
		);
	}
}

fn basic_auth_ok(req: &Request, user: &str, pass: &str) -> bool {
	let Some(value) = req
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
	else {
		return false;
	};
	let Some(encoded) = value.strip_prefix("Basic ") else {
		return false;
	};
	let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
		return false;
	};
	let Ok(decoded) = String::from_utf8(decoded) else {
		return false;
	};
	decoded == format!("{user}:{pass}")
}

enum ForwardAuthResult {
	Allowed(crate::http::HeaderMap),
	Denied(Response),
}

async fn forward_auth(
	fa: &crate::plugins::ForwardAuth,
	req_headers: &header::HeaderMap,
) -> ForwardAuthResult {
	let mut sub = AUTH_HTTP_CLIENT.get(&fa.url);
	for name in &fa.auth_request_headers {
		if let Some(value) = req_headers.get(name.as_str()) {
			sub = sub.header(name.as_str(), value.clone());
		}
	}
	let resp = match sub.send().await {
		Ok(resp) => resp,
		Err(err) => {
			warn!("forward-auth request failed: {err}");
			return ForwardAuthResult::Denied(empty_response(StatusCode::INTERNAL_SERVER_ERROR));
		},
	};

	let mut headers = crate::http::HeaderMap::new();
	for name in &fa.auth_response_headers {
		if let (Ok(name), Some(value)) = (
			name.parse::<header::HeaderName>(),
			resp.headers().get(name.as_str()),
		) {
			headers.insert(name, value.clone());
		}
	}

	if resp.status().is_success() {
		return ForwardAuthResult::Allowed(headers);
	}

	let status = resp.status();
	let body = resp.bytes().await.unwrap_or_default();
	let mut denied = ::http::Response::builder()
		.status(status)
		.body(Body::from(body))
		.unwrap_or_else(|_| empty_response(StatusCode::UNAUTHORIZED));
	denied.headers_mut().extend(headers);
	ForwardAuthResult::Denied(denied)
}

fn set_path_and_query(req: &mut Request, path: &str, query: Option<&str>) -> anyhow::Result<()> {
	let pq = match query {
		Some(q) if !q.is_empty() => format!("{path}?{q}"),
		_ => path.to_string(),
	};
	modify_req_uri(req, |uri| {
		uri.path_and_query = Some(pq.parse()?);
		Ok(())
	})
}

/// Joins two path segments with exactly one slash between them.
fn single_slash_join(a: &str, b: &str) -> String {
	match (a.ends_with('/'), b.starts_with('/')) {
		(true, true) => format!("{a}{}", &b[1..]),
		(false, false) => format!("{a}/{b}"),
		_ => format!("{a}{b}"),
	}
}

fn merge_query(a: Option<&str>, b: Option<&str>) -> Option<String> {
	match (a, b) {
		(Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
		(Some(a), _) if !a.is_empty() => Some(a.to_string()),
		(_, Some(b)) if !b.is_empty() => Some(b.to_string()),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use prometheus_client::registry::Registry;

	use super::*;
	use crate::plugins::{BasicAuth, Hsts, RateLimiter};

	fn metrics() -> Metrics {
		Metrics::new(&mut Registry::default())
	}

	fn request(path: &str) -> Request {
		::http::Request::builder()
			.uri(format!("http://example.com{path}"))
			.header(header::HOST, "example.com")
			.body(Body::empty())
			.unwrap()
	}

	const CLIENT: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 7));

	#[tokio::test]
	async fn redirect_https_preserves_uri_and_exempts_acme() {
		let policies = RoutePolicies {
			redirect_https: true,
			..Default::default()
		};

		let mut req = request("/foo?x=1");
		req
			.headers_mut()
			.insert("x-forwarded-proto", header::HeaderValue::from_static("http"));
		match apply(&policies, req, CLIENT, &metrics()).await {
			Applied::Respond(resp) => {
				assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
				assert_eq!(
					resp.headers().get(header::LOCATION).unwrap(),
					"https://example.com/foo?x=1"
				);
			},
			_ => panic!("expected redirect"),
		}

		let mut req = request("/.well-known/acme-challenge/token");
		req
			.headers_mut()
			.insert("x-forwarded-proto", header::HeaderValue::from_static("http"));
		assert!(matches!(
			apply(&policies, req, CLIENT, &metrics()).await,
			Applied::Continue(..)
		));
	}

	#[tokio::test]
	async fn allow_remote_blocks_outside_cidrs() {
		let policies = RoutePolicies {
			allow_remote: Some(vec!["192.168.0.0/16".parse().unwrap()]),
			..Default::default()
		};
		match apply(&policies, request("/"), CLIENT, &metrics()).await {
			Applied::Respond(resp) => assert_eq!(resp.status(), StatusCode::FORBIDDEN),
			_ => panic!("expected 403"),
		}

		let allowed = RoutePolicies {
			allow_remote: Some(vec!["10.0.0.0/8".parse().unwrap()]),
			..Default::default()
		};
		assert!(matches!(
			apply(&allowed, request("/"), CLIENT, &metrics()).await,
			Applied::Continue(..)
		));
	}

	#[tokio::test]
	async fn rate_limit_rejects_with_429() {
		let policies = RoutePolicies {
			rate_limits: vec![Arc::new(RateLimiter::new(1, Duration::from_secs(60)))],
			..Default::default()
		};
		assert!(matches!(
			apply(&policies, request("/"), CLIENT, &metrics()).await,
			Applied::Continue(..)
		));
		match apply(&policies, request("/"), CLIENT, &metrics()).await {
			Applied::Respond(resp) => assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS),
			_ => panic!("expected 429"),
		}
	}

	#[tokio::test]
	async fn body_limit_rejects_large_content_length() {
		let policies = RoutePolicies {
			body_limit: Some(10),
			..Default::default()
		};
		let mut req = request("/");
		req
			.headers_mut()
			.insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("11"));
		match apply(&policies, req, CLIENT, &metrics()).await {
			Applied::Respond(resp) => assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE),
			_ => panic!("expected 413"),
		}
	}

	#[tokio::test]
	async fn basic_auth_challenge_and_accept() {
		let policies = RoutePolicies {
			basic_auth: Some(BasicAuth {
				user: "user".into(),
				pass: "secret".into(),
			}),
			..Default::default()
		};
		match apply(&policies, request("/"), CLIENT, &metrics()).await {
			Applied::Respond(resp) => {
				assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
				assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));
			},
			_ => panic!("expected 401"),
		}

		let mut req = request("/");
		let encoded = base64::engine::general_purpose::STANDARD.encode("user:secret");
		req.headers_mut().insert(
			header::AUTHORIZATION,
			header::HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
		);
		assert!(matches!(
			apply(&policies, req, CLIENT, &metrics()).await,
			Applied::Continue(..)
		));
	}

	#[tokio::test]
	async fn strip_prefix_rewrites_path() {
		let policies = RoutePolicies {
			strip_prefix: Some("/api".into()),
			..Default::default()
		};
		match apply(&policies, request("/api/users?page=2"), CLIENT, &metrics()).await {
			Applied::Continue(req, _) => {
				assert_eq!(req.uri().path(), "/users");
				assert_eq!(req.uri().query(), Some("page=2"));
			},
			_ => panic!("expected continue"),
		}
	}

	#[tokio::test]
	async fn upstream_path_joins_and_merges_query() {
		let policies = RoutePolicies {
			upstream_path: Some("/base?a=1".into()),
			..Default::default()
		};
		match apply(&policies, request("/orig?b=2"), CLIENT, &metrics()).await {
			Applied::Continue(req, _) => {
				assert_eq!(req.uri().path(), "/base/orig");
				assert_eq!(req.uri().query(), Some("a=1&b=2"));
			},
			_ => panic!("expected continue"),
		}
	}

	#[tokio::test]
	async fn upstream_protocol_and_host_overrides() {
		let policies = RoutePolicies {
			upstream_protocol: Some("h2c".into()),
			upstream_host: Some("internal.example.com".into()),
			..Default::default()
		};
		match apply(&policies, request("/"), CLIENT, &metrics()).await {
			Applied::Continue(req, _) => {
				assert_eq!(req.uri().scheme_str(), Some("h2c"));
				assert_eq!(req.headers().get(header::HOST).unwrap(), "internal.example.com");
			},
			_ => panic!("expected continue"),
		}
	}

	#[test]
	fn hsts_response_header() {
		let policies = RoutePolicies {
			hsts: Some(Hsts { preload: true }),
			..Default::default()
		};
		let mut resp = empty_response(StatusCode::OK);
		apply_response(&policies, &mut resp);
		assert_eq!(
			resp.headers().get(header::STRICT_TRANSPORT_SECURITY).unwrap(),
			"max-age=63072000; includeSubDomains; preload"
		);
	}

	#[test]
	fn join_and_merge_helpers() {
		assert_eq!(single_slash_join("/a/", "/b"), "/a/b");
		assert_eq!(single_slash_join("/a", "b"), "/a/b");
		assert_eq!(single_slash_join("/a", "/b"), "/a/b");
		assert_eq!(merge_query(Some("a=1"), Some("b=2")).as_deref(), Some("a=1&b=2"));
		assert_eq!(merge_query(None, Some("b=2")).as_deref(), Some("b=2"));
		assert_eq!(merge_query(None, None), None);
	}
}
