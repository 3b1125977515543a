use std::env;
use std::str::FromStr;

use base64::Engine;
use gantry_core::prelude::*;
use ipnet::IpNet;

use crate::{BackendKind, ConcurrencyLimit, Config, TrustProxy};

/// CIDRs announced by Cloudflare; used by the `cloudflare` TRUST_PROXY
/// preset.
const CLOUDFLARE_CIDRS: &[&str] = &[
	"173.245.48.0/20",
	"103.21.244.0/22",
	"103.22.200.0/22",
	"103.31.4.0/22",
	"141.101.64.0/18",
	"108.162.192.0/18",
	"190.93.240.0/20",
	"188.114.96.0/20",
	"197.234.240.0/22",
	"198.41.128.0/17",
	"162.158.0.0/15",
	"104.16.0.0/13",
	"104.24.0.0/14",
	"172.64.0.0/13",
	"131.0.72.0/22",
	"2400:cb00::/32",
	"2606:4700::/32",
	"2803:f800::/32",
	"2405:b500::/32",
	"2405:8100::/32",
	"2a06:98c0::/29",
	"2c0f:f248::/32",
];

/// Loads configuration from the environment.
pub fn load() -> anyhow::Result<Config> {
	let http_port = parse_default("HTTP_PORT", 80u16)?;
	let https_port = parse_default("HTTPS_PORT", 443u16)?;
	let pod_namespace = empty_to_none(parse::<String>("POD_NAMESPACE")?).map(Strng::from);
	let watch_namespace = empty_to_none(parse::<String>("WATCH_NAMESPACE")?).map(Strng::from);
	let ingress_class: Strng = parse_default("INGRESS_CLASS", "parapet".to_string())?.into();
	let disable_access_log = parse_default("DISABLE_LOG", false)?;
	let wait_before_shutdown = Duration::from_secs(parse_default("WAIT_BEFORE_SHUTDOWN", 15u64)?);
	let max_header_bytes = parse::<usize>("HTTP_SERVER_MAX_HEADER_BYTES")?;

	let trust_proxy = parse_trust_proxy(
		parse::<String>("TRUST_PROXY")?.as_deref().unwrap_or_default(),
	);

	let max_idle_conns_per_host = parse_default("TR_MAX_IDLE_CONNS_PER_HOST", 100usize)?;
	if parse::<usize>("TR_MAX_CONNS_PER_HOST")?.is_some() {
		warn!("TR_MAX_CONNS_PER_HOST is not supported by the upstream pool and is ignored");
	}

	let host_concurrency = concurrency_limit("HOST_CONCURRENT_CAPACITY", "HOST_CONCURRENT_SIZE")?;
	let host_country_concurrency = concurrency_limit(
		"HOST_COUNTRY_CONCURRENT_CAPACITY",
		"HOST_COUNTRY_CONCURRENT_SIZE",
	)?;
	let host_country_header = empty_to_none(parse::<String>("HOST_COUNTRY_HEADER")?)
		.map(|h| Strng::from(h.to_ascii_lowercase()));

	let tls_session_ticket_key = match empty_to_none(parse::<String>("TLS_SESSION_TICKET_KEY")?) {
		Some(encoded) => match base64::engine::general_purpose::STANDARD.decode(&encoded) {
			Ok(key) => Some(key),
			Err(err) => {
				error!("invalid TLS_SESSION_TICKET_KEY: {err}");
				None
			},
		},
		None => None,
	};

	let backend = if parse::<String>("KUBERNETES_BACKEND")?.as_deref() == Some("fs") {
		BackendKind::Fs(parse_default("KUBERNETES_FS", "k8s".to_string())?.into())
	} else {
		BackendKind::Cluster
	};

	let profiler = if parse_default("PROFILER", false)? {
		Some(
			parse_default("PROFILER_NAME", "gantry-ingress-controller".to_string())?.into(),
		)
	} else {
		None
	};

	Ok(Config {
		http_port,
		https_port,
		pod_namespace,
		watch_namespace,
		ingress_class,
		disable_access_log,
		wait_before_shutdown,
		shutdown_grace: Duration::from_secs(60),
		max_header_bytes,
		trust_proxy,
		max_idle_conns_per_host,
		host_concurrency,
		host_country_concurrency,
		host_country_header,
		tls_session_ticket_key,
		backend,
		profiler,
	})
}

/// TRUST_PROXY accepts `true`, `false`, or a CSV of CIDRs and named presets.
pub fn parse_trust_proxy(value: &str) -> TrustProxy {
	match value {
		"true" => TrustProxy::All,
		"" | "false" => TrustProxy::None,
		csv => {
			let mut nets = Vec::new();
			for part in csv.split(',') {
				let part = part.trim();
				if part.is_empty() {
					continue;
				}
				if part.eq_ignore_ascii_case("cloudflare") {
					nets.extend(
						CLOUDFLARE_CIDRS
							.iter()
							.map(|c| c.parse::<IpNet>().expect("built-in cidr is valid")),
					);
					continue;
				}
				match part.parse::<IpNet>() {
					Ok(net) => nets.push(net),
					Err(_) => match part.parse::<IpAddr>() {
						Ok(ip) => nets.push(IpNet::from(ip)),
						Err(err) => warn!("invalid TRUST_PROXY entry {part}: {err}"),
					},
				}
			}
			if nets.is_empty() {
				TrustProxy::None
			} else {
				TrustProxy::Cidrs(nets)
			}
		},
	}
}

fn concurrency_limit(capacity_env: &str, size_env: &str) -> anyhow::Result<Option<ConcurrencyLimit>> {
	let Some(capacity) = parse::<usize>(capacity_env)? else {
		return Ok(None);
	};
	if capacity == 0 {
		return Ok(None);
	}
	let queue_size = parse_default(size_env, 0usize)?;
	Ok(Some(ConcurrencyLimit {
		capacity,
		queue_size,
	}))
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(|v| Some(v))
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(env: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: ToString,
{
	parse(env).map(|v| v.unwrap_or(default))
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
	if let Some(inner) = &inp {
		if inner.as_ref().is_empty() {
			return None;
		}
	}
	inp
}
