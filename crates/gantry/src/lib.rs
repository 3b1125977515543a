use std::path::PathBuf;

use gantry_core::prelude::*;
use ipnet::IpNet;

pub mod cert;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod gateway;
pub mod http;
pub mod management;
pub mod middleware;
pub mod mux;
pub mod plugins;
pub mod proxy;
pub mod route;
pub mod source;
pub mod state;
pub mod telemetry;

/// Annotation namespace recognized on Ingress objects.
pub const ANNOTATION_PREFIX: &str = "parapet.moonrhythm.io/";

/// Which source the controller reads cluster state from.
#[derive(Debug, Clone)]
pub enum BackendKind {
	/// Live cluster API (list/watch).
	Cluster,
	/// YAML documents from a directory; watch streams never fire.
	Fs(PathBuf),
}

/// Trusted proxy configuration for X-Forwarded-* handling.
#[derive(Debug, Clone, Default)]
pub enum TrustProxy {
	#[default]
	None,
	All,
	Cidrs(Vec<IpNet>),
}

impl TrustProxy {
	pub fn trusts(&self, ip: IpAddr) -> bool {
		match self {
			TrustProxy::None => false,
			TrustProxy::All => true,
			TrustProxy::Cidrs(nets) => nets.iter().any(|n| n.contains(&ip)),
		}
	}
}

/// Per-key concurrency limit: capacity slots, queue_size waiters beyond that.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimit {
	pub capacity: usize,
	pub queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub http_port: u16,
	pub https_port: u16,
	pub pod_namespace: Option<Strng>,
	/// Namespace to watch; None watches all namespaces.
	pub watch_namespace: Option<Strng>,
	pub ingress_class: Strng,
	pub disable_access_log: bool,
	pub wait_before_shutdown: Duration,
	pub shutdown_grace: Duration,
	pub max_header_bytes: Option<usize>,
	pub trust_proxy: TrustProxy,
	pub max_idle_conns_per_host: usize,
	pub host_concurrency: Option<ConcurrencyLimit>,
	pub host_country_concurrency: Option<ConcurrencyLimit>,
	pub host_country_header: Option<Strng>,
	pub tls_session_ticket_key: Option<Vec<u8>>,
	pub backend: BackendKind,
	pub profiler: Option<Strng>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			http_port: 80,
			https_port: 443,
			pod_namespace: None,
			watch_namespace: None,
			ingress_class: strng::literal!("parapet"),
			disable_access_log: false,
			wait_before_shutdown: Duration::from_secs(15),
			shutdown_grace: Duration::from_secs(60),
			max_header_bytes: None,
			trust_proxy: TrustProxy::None,
			max_idle_conns_per_host: 100,
			host_concurrency: None,
			host_country_concurrency: None,
			host_country_header: None,
			tls_session_ticket_key: None,
			backend: BackendKind::Cluster,
			profiler: None,
		}
	}
}
