use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gantry_core::prelude::*;
use ipnet::IpNet;
use k8s_openapi::api::networking::v1::Ingress;
use serde::Deserialize;

use crate::ANNOTATION_PREFIX;
use crate::http::StatusCode;
use crate::mux::{Route, RouteAction};

/// A plugin inspects one annotation on the Ingress and either contributes to
/// the per-route policy chain or injects a synthetic route into the route
/// map. Plugins are order-independent with respect to each other; the
/// controller invokes them in a fixed registration order so chain
/// composition is deterministic.
pub type Plugin = fn(&mut PluginContext);

pub struct PluginContext<'a> {
	pub policies: &'a mut RoutePolicies,
	pub routes: &'a mut HashMap<Strng, Arc<Route>>,
	pub ingress: &'a Ingress,
}

impl<'a> PluginContext<'a> {
	// the returned borrow is tied to the ingress, so plugins can keep
	// mutating policies and routes while holding it
	fn annotation(&self, name: &str) -> Option<&'a str> {
		self
			.ingress
			.metadata
			.annotations
			.as_ref()?
			.get(&format!("{ANNOTATION_PREFIX}{name}"))
			.map(|s| s.as_str())
	}
}

/// The per-route policy chain assembled from annotations. Applied in a fixed
/// order by the middleware layer.
#[derive(Debug, Clone, Default)]
pub struct RoutePolicies {
	pub namespace: Strng,
	pub ingress: Strng,
	pub redirect_https: bool,
	pub hsts: Option<Hsts>,
	pub rate_limits: Vec<Arc<RateLimiter>>,
	pub body_limit: Option<u64>,
	pub upstream_protocol: Option<Strng>,
	pub upstream_host: Option<Strng>,
	pub upstream_path: Option<Strng>,
	pub strip_prefix: Option<Strng>,
	pub basic_auth: Option<BasicAuth>,
	pub forward_auth: Option<Arc<ForwardAuth>>,
	pub allow_remote: Option<Vec<IpNet>>,
	pub trace: Option<TraceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hsts {
	pub preload: bool,
}

impl Hsts {
	pub fn header_value(&self) -> &'static str {
		if self.preload {
			"max-age=63072000; includeSubDomains; preload"
		} else {
			"max-age=31536000"
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
	pub user: Strng,
	pub pass: Strng,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAuth {
	pub url: String,
	#[serde(default)]
	pub auth_request_headers: Vec<String>,
	#[serde(default)]
	pub auth_response_headers: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TraceConfig {
	pub sampler: f64,
}

/// Fixed-window rate limiter shared by every request on a route.
#[derive(Debug)]
pub struct RateLimiter {
	max: u64,
	window: Duration,
	state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
	start: Instant,
	count: u64,
}

impl RateLimiter {
	pub fn new(max: u64, window: Duration) -> RateLimiter {
		RateLimiter {
			max,
			window,
			state: Mutex::new(Window {
				start: Instant::now(),
				count: 0,
			}),
		}
	}

	pub fn allow(&self) -> bool {
		let mut w = self.state.lock().unwrap();
		if w.start.elapsed() >= self.window {
			w.start = Instant::now();
			w.count = 0;
		}
		if w.count < self.max {
			w.count += 1;
			true
		} else {
			false
		}
	}
}

/// All plugins in their registration order.
pub fn default_plugins() -> Vec<Plugin> {
	vec![
		inject_ingress_state,
		redirect_https,
		inject_hsts,
		redirect_rules,
		rate_limit,
		body_limit,
		upstream_protocol,
		upstream_host,
		upstream_path,
		strip_prefix,
		basic_auth,
		forward_auth,
		allow_remote,
		trace,
	]
}

/// Records ingress name and namespace so the access log and the requests
/// counter can label by ingress.
pub fn inject_ingress_state(ctx: &mut PluginContext) {
	ctx.policies.namespace = ctx
		.ingress
		.metadata
		.namespace
		.clone()
		.unwrap_or_default()
		.into();
	ctx.policies.ingress = ctx.ingress.metadata.name.clone().unwrap_or_default().into();
}

/// Redirects http to https, except /.well-known/acme-challenge.
pub fn redirect_https(ctx: &mut PluginContext) {
	if ctx.annotation("redirect-https") == Some("true") {
		ctx.policies.redirect_https = true;
	}
}

pub fn inject_hsts(ctx: &mut PluginContext) {
	match ctx.annotation("hsts") {
		None | Some("") => {},
		Some("preload") => ctx.policies.hsts = Some(Hsts { preload: true }),
		Some(_) => ctx.policies.hsts = Some(Hsts { preload: false }),
	}
}

/// Loads redirect rules from the annotation and injects synthetic routes
/// into the route map. Value is a YAML map of srcHost to `[code,]targetURL`;
/// the default status is 302.
pub fn redirect_rules(ctx: &mut PluginContext) {
	let Some(a) = ctx.annotation("redirect") else {
		return;
	};
	let rules: HashMap<String, String> = match serde_yaml::from_str(a) {
		Ok(rules) => rules,
		Err(err) => {
			warn!("invalid redirect annotation: {err}");
			return;
		},
	};
	for (src_host, target_url) in rules {
		if src_host.is_empty() || target_url.is_empty() || src_host.starts_with('/') {
			continue;
		}
		let mut src = src_host;
		if !src.ends_with('/') {
			src.push('/');
		}

		let mut target = target_url.as_str();
		let mut status = StatusCode::FOUND;
		if let Some((code, rest)) = target_url.split_once(',') {
			if let Ok(st) = code.parse::<u16>() {
				if let Ok(st) = StatusCode::from_u16(st) {
					status = st;
					target = rest;
				}
			}
		}

		// capture the target by value per key
		let route = Route {
			policies: Arc::new(ctx.policies.clone()),
			action: RouteAction::Redirect {
				location: target.into(),
				status,
			},
		};
		ctx.routes.insert(src.as_str().into(), Arc::new(route));
		debug!("registered: {src} ==> {status},{target}");
	}
}

pub fn rate_limit(ctx: &mut PluginContext) {
	let windows = [
		("ratelimit-s", Duration::from_secs(1)),
		("ratelimit-m", Duration::from_secs(60)),
		("ratelimit-h", Duration::from_secs(60 * 60)),
	];
	for (name, window) in windows {
		if let Some(a) = ctx.annotation(name) {
			if let Ok(rate) = a.parse::<u64>() {
				if rate > 0 {
					ctx
						.policies
						.rate_limits
						.push(Arc::new(RateLimiter::new(rate, window)));
				}
			}
		}
	}
}

pub fn body_limit(ctx: &mut PluginContext) {
	if let Some(a) = ctx.annotation("body-limitrequest") {
		if let Ok(size) = a.parse::<i64>() {
			if size > 0 {
				ctx.policies.body_limit = Some(size as u64);
			}
		}
	}
}

/// Changes the upstream protocol. Recognized values are http, https and h2c.
pub fn upstream_protocol(ctx: &mut PluginContext) {
	match ctx.annotation("upstream-protocol") {
		None | Some("") | Some("http") => {},
		Some(p @ ("https" | "h2c")) => ctx.policies.upstream_protocol = Some(p.into()),
		Some(p) => warn!("unknown protocol {p}"),
	}
}

pub fn upstream_host(ctx: &mut PluginContext) {
	if let Some(a) = ctx.annotation("upstream-host") {
		if !a.is_empty() {
			ctx.policies.upstream_host = Some(a.into());
		}
	}
}

pub fn upstream_path(ctx: &mut PluginContext) {
	if let Some(a) = ctx.annotation("upstream-path") {
		if !a.is_empty() {
			ctx.policies.upstream_path = Some(a.into());
		}
	}
}

pub fn strip_prefix(ctx: &mut PluginContext) {
	if let Some(a) = ctx.annotation("strip-prefix") {
		if !a.is_empty() {
			ctx.policies.strip_prefix = Some(a.into());
		}
	}
}

pub fn basic_auth(ctx: &mut PluginContext) {
	let Some(ba) = ctx.annotation("basic-auth") else {
		return;
	};
	let Some((user, pass)) = ba.split_once(':') else {
		return;
	};
	if user.is_empty() || pass.is_empty() {
		return;
	}
	ctx.policies.basic_auth = Some(BasicAuth {
		user: user.into(),
		pass: pass.into(),
	});
}

pub fn forward_auth(ctx: &mut PluginContext) {
	let Some(a) = ctx.annotation("forward-auth") else {
		return;
	};
	let fa: ForwardAuth = match serde_yaml::from_str(a) {
		Ok(fa) => fa,
		Err(err) => {
			warn!("invalid forward-auth annotation: {err}");
			return;
		},
	};
	if reqwest::Url::parse(&fa.url).is_err() {
		warn!("invalid forward-auth url {}", fa.url);
		return;
	}
	ctx.policies.forward_auth = Some(Arc::new(fa));
}

/// Blocks requests whose remote IP is outside the allowed CIDRs, exempting
/// acme-challenge paths.
pub fn allow_remote(ctx: &mut PluginContext) {
	let Some(a) = ctx.annotation("allow-remote") else {
		return;
	};
	let mut nets = Vec::new();
	for part in a.split(',') {
		let part = part.trim();
		if part.is_empty() {
			continue;
		}
		match part.parse::<IpNet>() {
			Ok(net) => nets.push(net),
			Err(_) => match part.parse::<IpAddr>() {
				Ok(ip) => nets.push(IpNet::from(ip)),
				Err(err) => {
					warn!("invalid allow-remote entry {part}: {err}");
					return;
				},
			},
		}
	}
	ctx.policies.allow_remote = Some(nets);
}

pub fn trace(ctx: &mut PluginContext) {
	fn sampler(ctx: &PluginContext, name: &str) -> f64 {
		ctx
			.annotation(name)
			.and_then(|s| s.parse::<f64>().ok())
			.unwrap_or(1.0)
	}
	if ctx.annotation("operations-trace") == Some("true") {
		let sampler = sampler(ctx, "operations-trace-sampler");
		ctx.policies.trace = Some(TraceConfig { sampler });
		return;
	}
	if ctx.annotation("jaeger-trace") == Some("true") {
		// the collector endpoint is a prerequisite; skip when missing
		if ctx
			.annotation("jaeger-trace-collector-endpoint")
			.is_none_or(|e| e.is_empty())
		{
			debug!("jaeger-trace enabled without collector endpoint, skipping");
			return;
		}
		let sampler = sampler(ctx, "jaeger-trace-sampler");
		ctx.policies.trace = Some(TraceConfig { sampler });
	}
}

#[cfg(test)]
mod tests {
	use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

	use super::*;

	fn ingress(annotations: &[(&str, &str)]) -> Ingress {
		Ingress {
			metadata: ObjectMeta {
				name: Some("web".to_string()),
				namespace: Some("default".to_string()),
				annotations: Some(
					annotations
						.iter()
						.map(|(k, v)| (format!("{ANNOTATION_PREFIX}{k}"), v.to_string()))
						.collect(),
				),
				..Default::default()
			},
			..Default::default()
		}
	}

	fn run(ing: &Ingress) -> (RoutePolicies, HashMap<Strng, Arc<Route>>) {
		let mut policies = RoutePolicies::default();
		let mut routes = HashMap::new();
		for p in default_plugins() {
			p(&mut PluginContext {
				policies: &mut policies,
				routes: &mut routes,
				ingress: ing,
			});
		}
		(policies, routes)
	}

	#[test]
	fn basic_annotations() {
		let ing = ingress(&[
			("redirect-https", "true"),
			("hsts", "preload"),
			("ratelimit-s", "10"),
			("body-limitrequest", "1048576"),
			("upstream-protocol", "h2c"),
			("upstream-host", "internal.example.com"),
			("strip-prefix", "/api"),
			("basic-auth", "user:secret"),
		]);
		let (p, routes) = run(&ing);
		assert!(routes.is_empty());
		assert_eq!(p.namespace, "default");
		assert_eq!(p.ingress, "web");
		assert!(p.redirect_https);
		assert_eq!(p.hsts, Some(Hsts { preload: true }));
		assert_eq!(p.rate_limits.len(), 1);
		assert_eq!(p.body_limit, Some(1048576));
		assert_eq!(p.upstream_protocol.as_deref(), Some("h2c"));
		assert_eq!(p.upstream_host.as_deref(), Some("internal.example.com"));
		assert_eq!(p.strip_prefix.as_deref(), Some("/api"));
		assert_eq!(
			p.basic_auth,
			Some(BasicAuth {
				user: "user".into(),
				pass: "secret".into(),
			})
		);
	}

	#[test]
	fn redirect_rules_register_synthetic_routes() {
		let ing = ingress(&[(
			"redirect",
			"old.example.com: https://new.example.com\nmoved.example.com: 301,https://other.example.com",
		)]);
		let (_, routes) = run(&ing);
		assert_eq!(routes.len(), 2);

		let r = routes.get("old.example.com/").unwrap();
		match &r.action {
			RouteAction::Redirect { location, status } => {
				assert_eq!(location.as_str(), "https://new.example.com");
				assert_eq!(*status, StatusCode::FOUND);
			},
			_ => panic!("expected redirect"),
		}

		let r = routes.get("moved.example.com/").unwrap();
		match &r.action {
			RouteAction::Redirect { location, status } => {
				assert_eq!(location.as_str(), "https://other.example.com");
				assert_eq!(*status, StatusCode::MOVED_PERMANENTLY);
			},
			_ => panic!("expected redirect"),
		}
	}

	#[test]
	fn allow_remote_parses_cidrs() {
		let ing = ingress(&[("allow-remote", "10.0.0.0/8, 192.168.1.1")]);
		let (p, _) = run(&ing);
		let nets = p.allow_remote.unwrap();
		assert_eq!(nets.len(), 2);
		assert!(nets[0].contains(&"10.1.2.3".parse::<IpAddr>().unwrap()));
		assert!(nets[1].contains(&"192.168.1.1".parse::<IpAddr>().unwrap()));
	}

	#[test]
	fn malformed_annotations_disable_plugin() {
		let ing = ingress(&[
			("allow-remote", "not-a-cidr"),
			("forward-auth", "url: ::not a url::"),
			("redirect", "{invalid yaml"),
			("basic-auth", "missing-separator"),
		]);
		let (p, routes) = run(&ing);
		assert!(p.allow_remote.is_none());
		assert!(p.forward_auth.is_none());
		assert!(p.basic_auth.is_none());
		assert!(routes.is_empty());
	}

	#[test]
	fn forward_auth_parses_yaml() {
		let ing = ingress(&[(
			"forward-auth",
			"url: http://auth.default.svc/check\nauthRequestHeaders:\n- Cookie\nauthResponseHeaders:\n- X-User",
		)]);
		let (p, _) = run(&ing);
		let fa = p.forward_auth.unwrap();
		assert_eq!(fa.url, "http://auth.default.svc/check");
		assert_eq!(fa.auth_request_headers, vec!["Cookie"]);
		assert_eq!(fa.auth_response_headers, vec!["X-User"]);
	}

	#[test]
	fn jaeger_trace_requires_collector_endpoint() {
		let (p, _) = run(&ingress(&[("jaeger-trace", "true")]));
		assert!(p.trace.is_none());

		let (p, _) = run(&ingress(&[
			("jaeger-trace", "true"),
			("jaeger-trace-collector-endpoint", "http://jaeger:14268"),
			("jaeger-trace-sampler", "0.5"),
		]));
		assert_eq!(p.trace.unwrap().sampler, 0.5);
	}

	#[test]
	fn rate_limiter_fixed_window() {
		let rl = RateLimiter::new(2, Duration::from_secs(60));
		assert!(rl.allow());
		assert!(rl.allow());
		assert!(!rl.allow());
	}
}
