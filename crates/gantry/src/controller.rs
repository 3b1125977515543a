use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use gantry_core::prelude::*;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::debounce::Debounce;
use crate::gateway::ClientAddr;
use crate::http::{
	Request, Response, StatusCode, plaintext_response, redirect_response, request_host,
};
use crate::mux::{Matched, Mux, ProxyTarget, Route, RouteAction};
use crate::plugins::{Plugin, PluginContext, RoutePolicies};
use crate::source::{ResourceEvent, ResourceSource};
use crate::telemetry::Metrics;
use crate::{cert, middleware, proxy, route, state};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);
const WATCH_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Controller watches Ingress, Service, Endpoints and Secret objects and
/// materialises them into the live mux, route table and certificate table
/// that serve traffic.
#[derive(Clone)]
pub struct Controller {
	inner: Arc<Inner>,
}

struct Inner {
	ingress_class: Strng,
	source: Arc<dyn ResourceSource>,
	plugins: Vec<Plugin>,
	metrics: Arc<Metrics>,

	ingresses: Store<Ingress>,
	services: Store<Service>,
	secrets: Store<Secret>,
	endpoints: Store<Endpoints>,

	mux: ArcSwapOption<Mux>,
	cert_table: Arc<cert::Table>,
	route_table: Arc<route::Table>,
	proxy: proxy::Proxy,

	ready: AtomicBool,
	shutting_down: AtomicBool,

	reload_ingress_debounce: OnceLock<Debounce>,
	reload_service_debounce: OnceLock<Debounce>,
	reload_secret_debounce: OnceLock<Debounce>,
	reload_endpoint_debounce: OnceLock<Debounce>,
}

/// Store holds the watched objects of one resource kind, keyed by
/// `namespace/name`. Watch loops write while reloads read snapshots.
struct Store<T>(RwLock<HashMap<Strng, Arc<T>>>);

impl<T> Default for Store<T> {
	fn default() -> Self {
		Store(RwLock::new(HashMap::new()))
	}
}

impl<T> Store<T> {
	fn insert(&self, key: Strng, value: T) {
		self.0.write().unwrap().insert(key, Arc::new(value));
	}

	fn remove(&self, key: &str) {
		self.0.write().unwrap().remove(key);
	}

	fn get(&self, key: &str) -> Option<Arc<T>> {
		self.0.read().unwrap().get(key).cloned()
	}

	fn values(&self) -> Vec<Arc<T>> {
		self.0.read().unwrap().values().cloned().collect()
	}
}

fn meta_key(meta: &ObjectMeta) -> Strng {
	strng::format!(
		"{}/{}",
		meta.namespace.as_deref().unwrap_or_default(),
		meta.name.as_deref().unwrap_or_default()
	)
}

fn build_host(namespace: &str, name: &str) -> Strng {
	// service.namespace.svc.cluster.local
	strng::format!("{name}.{namespace}.svc.cluster.local")
}

fn build_host_port(namespace: &str, name: &str, port: i32) -> Strng {
	// service.namespace.svc.cluster.local:port
	strng::format!("{name}.{namespace}.svc.cluster.local:{port}")
}

impl Controller {
	pub fn new(
		ingress_class: Strng,
		source: Arc<dyn ResourceSource>,
		plugins: Vec<Plugin>,
		metrics: Arc<Metrics>,
		max_idle_conns_per_host: usize,
	) -> Controller {
		let route_table = Arc::new(route::Table::default());
		let proxy = proxy::Proxy::new(route_table.clone(), metrics.clone(), max_idle_conns_per_host);
		let inner = Arc::new(Inner {
			ingress_class,
			source,
			plugins,
			metrics,
			ingresses: Store::default(),
			services: Store::default(),
			secrets: Store::default(),
			endpoints: Store::default(),
			mux: ArcSwapOption::empty(),
			cert_table: Arc::new(cert::Table::default()),
			route_table,
			proxy,
			ready: AtomicBool::new(false),
			shutting_down: AtomicBool::new(false),
			reload_ingress_debounce: OnceLock::new(),
			reload_service_debounce: OnceLock::new(),
			reload_secret_debounce: OnceLock::new(),
			reload_endpoint_debounce: OnceLock::new(),
		});

		fn debounce(inner: &Arc<Inner>, f: fn(&Inner)) -> Debounce {
			let weak: Weak<Inner> = Arc::downgrade(inner);
			Debounce::new(
				move || {
					if let Some(inner) = weak.upgrade() {
						f(&inner);
					}
				},
				RELOAD_DEBOUNCE,
			)
		}
		let _ = inner
			.reload_ingress_debounce
			.set(debounce(&inner, Inner::reload_ingress_debounced));
		let _ = inner
			.reload_service_debounce
			.set(debounce(&inner, Inner::reload_service_debounced));
		let _ = inner
			.reload_secret_debounce
			.set(debounce(&inner, Inner::reload_secret_debounced));
		let _ = inner
			.reload_endpoint_debounce
			.set(debounce(&inner, Inner::reload_endpoint_debounced));

		Controller { inner }
	}

	/// Starts watching cluster resources: preload, synchronous first reload,
	/// then one watch loop per resource kind.
	pub async fn watch(&self) {
		self.inner.preload_resources().await;
		self.inner.first_reload();

		tokio::spawn(watch_ingresses(self.inner.clone()));
		tokio::spawn(watch_services(self.inner.clone()));
		tokio::spawn(watch_secrets(self.inner.clone()));
		tokio::spawn(watch_endpoints(self.inner.clone()));
	}

	pub fn ready(&self) -> bool {
		self.inner.ready.load(Ordering::SeqCst) && !self.inner.shutting_down.load(Ordering::SeqCst)
	}

	pub fn set_shutting_down(&self) {
		self.inner.shutting_down.store(true, Ordering::SeqCst);
	}

	/// The SNI resolver backed by the certificate table.
	pub fn cert_resolver(
		&self,
		fallback: Arc<rustls::sign::CertifiedKey>,
	) -> Arc<cert::Resolver> {
		Arc::new(cert::Resolver {
			table: self.inner.cert_table.clone(),
			fallback,
		})
	}

	/// Dispatches a request through the currently published mux.
	pub async fn serve(&self, req: Request) -> Response {
		let Some(mux) = self.inner.mux.load_full() else {
			// readiness gates traffic until the first reload publishes a mux
			return plaintext_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
		};

		let host = request_host(&req).unwrap_or_default();
		let path = req.uri().path().to_string();
		match mux.matches(&host, &path) {
			None => plaintext_response(StatusCode::NOT_FOUND, "404 page not found\n"),
			Some(Matched::RedirectTrailingSlash) => {
				let location = match req.uri().query() {
					Some(q) => format!("{path}/?{q}"),
					None => format!("{path}/"),
				};
				redirect_response(StatusCode::MOVED_PERMANENTLY, &location)
			},
			Some(Matched::Route(route)) => self.handle_route(route, req).await,
		}
	}

	async fn handle_route(&self, route: Arc<Route>, req: Request) -> Response {
		let client_ip = req
			.extensions()
			.get::<ClientAddr>()
			.map(|a| a.0.ip())
			.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

		match middleware::apply(&route.policies, req, client_ip, &self.inner.metrics).await {
			middleware::Applied::Respond(mut resp) => {
				middleware::apply_response(&route.policies, &mut resp);
				resp
			},
			middleware::Applied::Continue(req, span) => {
				let fut = async {
					match &route.action {
						RouteAction::Redirect { location, status } => redirect_response(*status, location),
						RouteAction::Proxy(target) => self.proxy_handler(target, req).await,
					}
				};
				let mut resp = match span {
					Some(span) => fut.instrument(span).await,
					None => fut.await,
				};
				middleware::apply_response(&route.policies, &mut resp);
				resp
			},
		}
	}

	async fn proxy_handler(&self, target: &ProxyTarget, mut req: Request) -> Response {
		let s = state::get(&req);
		s.set("serviceType", target.service_type.clone());
		s.set("serviceName", target.service_name.clone());

		let resolved = self.inner.route_table.lookup(&target.target);
		if resolved.is_empty() {
			// fail fast
			return plaintext_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
		}

		let app_protocol = target.app_protocol.clone();
		let authority = resolved.to_string();
		let rewrite = crate::http::modify_req_uri(&mut req, |uri| {
			if let Some(proto) = &app_protocol {
				uri.scheme = Some(proto.as_str().parse()?);
			}
			uri.authority = Some(authority.parse()?);
			Ok(())
		});
		if let Err(err) = rewrite {
			warn!("proxy: can not rewrite request uri to {resolved}: {err}");
			return plaintext_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n");
		}

		s.set("serviceTarget", resolved);

		proxy::retry::serve(req, |req| self.inner.proxy.serve(req)).await
	}
}

impl Inner {
	async fn preload_resources(&self) {
		if let Ok(list) = self.source.get_ingresses().await {
			for obj in list {
				self.ingresses.insert(meta_key(&obj.metadata), obj);
			}
		}
		if let Ok(list) = self.source.get_services().await {
			for obj in list {
				self.services.insert(meta_key(&obj.metadata), obj);
			}
		}
		if let Ok(list) = self.source.get_secrets().await {
			for obj in list {
				self.secrets.insert(meta_key(&obj.metadata), obj);
			}
		}
		if let Ok(list) = self.source.get_endpoints().await {
			for obj in list {
				self.endpoints.insert(meta_key(&obj.metadata), obj);
			}
		}
	}

	fn first_reload(&self) {
		self.reload_service();
		self.reload_ingress();
		self.reload_secret();
		self.reload_endpoint();

		// ready to serve requests
		self.ready.store(true, Ordering::SeqCst);
	}

	fn reload_ingress(&self) {
		self.reload_ingress_debounce.get().unwrap().call();
	}

	fn reload_service(&self) {
		self.reload_service_debounce.get().unwrap().call();
	}

	fn reload_secret(&self) {
		self.reload_secret_debounce.get().unwrap().call();
	}

	fn reload_endpoint(&self) {
		self.reload_endpoint_debounce.get().unwrap().call();
	}

	fn reload_ingress_debounced(&self) {
		info!("reload ingresses");

		match catch_unwind(AssertUnwindSafe(|| self.reload_ingress_now())) {
			Ok(()) => self.metrics.record_reload(true),
			Err(err) => {
				error!("reload ingresses failed: {}", panic_message(&err));
				self.metrics.record_reload(false);
			},
		}
	}

	fn reload_ingress_now(&self) {
		let mut routes: HashMap<Strng, Arc<Route>> = HashMap::new();

		for ing in self.ingresses.values() {
			let namespace = ing.metadata.namespace.as_deref().unwrap_or_default();
			let name = ing.metadata.name.as_deref().unwrap_or_default();

			if ingress_class(&ing) != self.ingress_class {
				info!("skip ingress; namespace={namespace}, name={name}");
				continue;
			}
			info!("load ingress; namespace={namespace}, name={name}");

			let mut policies = RoutePolicies::default();
			for plugin in &self.plugins {
				plugin(&mut PluginContext {
					policies: &mut policies,
					routes: &mut routes,
					ingress: &ing,
				});
			}
			let policies = Arc::new(policies);

			let Some(spec) = &ing.spec else {
				continue;
			};
			if spec.default_backend.is_some() {
				warn!("ingress spec.defaultBackend not support; namespace={namespace}, name={name}");
			}

			for rule in spec.rules.iter().flatten() {
				let Some(http_rule) = &rule.http else {
					continue;
				};
				let host = rule
					.host
					.as_deref()
					.unwrap_or_default()
					.to_ascii_lowercase();

				for http_path in &http_rule.paths {
					let Some(backend) = &http_path.backend.service else {
						warn!("ingress backend service empty; namespace={namespace}, name={name}");
						continue;
					};

					// path can not be empty and must start with /
					let mut path = http_path.path.clone().unwrap_or_default();
					if path.is_empty() {
						path = "/".to_string();
					}
					if !path.starts_with('/') {
						path.insert(0, '/');
					}

					let svc_key = format!("{namespace}/{}", backend.name);
					let Some(svc) = self.services.get(&svc_key) else {
						error!(
							"service not found; namespace={namespace}, name={}",
							backend.name
						);
						continue;
					};

					// find port
					let Some(config) = backend_config(backend, &svc) else {
						error!(
							"port not found; namespace={namespace}, name={}, port={}",
							backend.name,
							backend.port.as_ref().and_then(|p| p.name.as_deref()).unwrap_or_default()
						);
						continue;
					};
					if config.port_number <= 0 {
						// missing port
						continue;
					}
					if let Some(anns) = &svc.metadata.annotations {
						if anns.contains_key(&format!("{}backend-config", crate::ANNOTATION_PREFIX)) {
							debug!("legacy backend-config annotation found on service {svc_key}");
						}
					}

					let target = build_host_port(namespace, &backend.name, config.port_number);
					let route = Arc::new(Route {
						policies: policies.clone(),
						action: RouteAction::Proxy(ProxyTarget {
							target: target.clone(),
							app_protocol: config.protocol.clone(),
							service_name: backend.name.as_str().into(),
							service_type: svc
								.spec
								.as_ref()
								.and_then(|s| s.type_.as_deref())
								.unwrap_or_default()
								.into(),
						}),
					});

					let path_type = http_path.path_type.as_str();
					match path_type {
						"Prefix" => {
							// register path as prefix
							let trimmed = path.strip_suffix('/').unwrap_or(&path);
							if path != "/" {
								routes.insert(strng::format!("{host}{trimmed}"), route.clone());
							}
							let src = strng::format!("{host}{trimmed}/");
							routes.insert(src.clone(), route);
							debug!("registered path; type=prefix, path={src}, target={target}");
						},
						"Exact" => {
							let trimmed = path.strip_suffix('/').unwrap_or(&path);
							let src = if path == "/" {
								let src = strng::format!("{host}{path}");
								warn!(
									"register path type exact at root path is not supported, switch to prefix; path={src}, target={target}"
								);
								src
							} else {
								strng::format!("{host}{trimmed}")
							};
							routes.insert(src.clone(), route);
							debug!("registered path; type=exact, path={src}, target={target}");
						},
						_ => {
							let src = strng::format!("{host}{path}");
							routes.insert(src.clone(), route);
							debug!("registered path; type=specific, path={src}, target={target}");
						},
					}
				}
			}
		}

		let mux = Mux::build(routes);
		self.mux.store(Some(Arc::new(mux)));
		// certificates depend on the ingress TLS references
		self.reload_secret();
	}

	fn reload_service_debounced(&self) {
		info!("reload services");

		if let Err(err) = catch_unwind(AssertUnwindSafe(|| self.reload_service_now())) {
			error!("reload services failed: {}", panic_message(&err));
		}
	}

	fn reload_service_now(&self) {
		let mut addr_to_port: HashMap<Strng, Strng> = HashMap::new();

		for svc in self.services.values() {
			let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
			let name = svc.metadata.name.as_deref().unwrap_or_default();

			// build route target port
			for p in svc
				.spec
				.iter()
				.flat_map(|s| s.ports.iter())
				.flatten()
			{
				let target = match &p.target_port {
					Some(IntOrString::Int(i)) => *i,
					// named target ports resolve on the pod, not here
					Some(IntOrString::String(_)) => continue,
					None => p.port,
				};
				let addr = build_host_port(namespace, name, p.port);
				addr_to_port.insert(addr, strng::format!("{target}"));
			}
		}

		self.route_table.set_port_routes(addr_to_port);
	}

	fn reload_secret_debounced(&self) {
		info!("reload secrets");

		if let Err(err) = catch_unwind(AssertUnwindSafe(|| self.reload_secret_now())) {
			error!("reload secrets failed: {}", panic_message(&err));
		}
	}

	fn reload_secret_now(&self) {
		let mut secrets_to_build: HashSet<Strng> = HashSet::new();

		for ing in self.ingresses.values() {
			let namespace = ing.metadata.namespace.as_deref().unwrap_or_default();
			for tls in ing.spec.iter().flat_map(|s| s.tls.iter()).flatten() {
				if let Some(secret_name) = tls.secret_name.as_deref() {
					secrets_to_build.insert(strng::format!("{namespace}/{secret_name}"));
				}
			}
		}

		// build certs
		let mut certs = Vec::new();
		for key in secrets_to_build {
			let Some(secret) = self.secrets.get(&key) else {
				error!("secret not found; key={key}");
				continue;
			};
			let data = secret.data.clone().unwrap_or_default();
			let (Some(crt), Some(pk)) = (data.get("tls.crt"), data.get("tls.key")) else {
				error!("secret missing tls.crt or tls.key; key={key}");
				continue;
			};
			match cert::from_pem(&crt.0, &pk.0) {
				Ok(cert) => certs.push(cert),
				Err(err) => {
					error!("can not load x509 certificate; key={key}, error={err}");
					continue;
				},
			}
		}

		self.cert_table.set(certs);
	}

	fn reload_endpoint_debounced(&self) {
		info!("reload endpoints");

		if let Err(err) = catch_unwind(AssertUnwindSafe(|| self.reload_endpoint_now())) {
			error!("reload endpoints failed: {}", panic_message(&err));
		}
	}

	fn reload_endpoint_now(&self) {
		let mut routes: HashMap<Strng, Arc<route::RoundRobin>> = HashMap::new();
		for ep in self.endpoints.values() {
			if let Some(lb) = endpoint_to_rrlb(&ep) {
				let namespace = ep.metadata.namespace.as_deref().unwrap_or_default();
				let name = ep.metadata.name.as_deref().unwrap_or_default();
				routes.insert(build_host(namespace, name), Arc::new(lb));
			}
		}

		self.route_table.set_host_routes(routes);
	}

	fn reload_single_endpoint(&self, ep: &Endpoints) {
		let namespace = ep.metadata.namespace.as_deref().unwrap_or_default();
		let name = ep.metadata.name.as_deref().unwrap_or_default();
		info!("reload single endpoint; namespace={namespace}, name={name}");

		self
			.route_table
			.set_host_route(build_host(namespace, name), endpoint_to_rrlb(ep).map(Arc::new));
	}
}

async fn watch_ingresses(inner: Arc<Inner>) {
	loop {
		let stream = match inner.source.watch_ingresses().await {
			Ok(stream) => stream,
			Err(err) => {
				error!("can not watch ingresses; error={err}");
				tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
				continue;
			},
		};
		let mut stream = stream;
		while let Some(event) = stream.next().await {
			match event {
				ResourceEvent::Added(obj) | ResourceEvent::Modified(obj) => {
					inner.ingresses.insert(meta_key(&obj.metadata), obj);
				},
				ResourceEvent::Deleted(obj) => {
					inner.ingresses.remove(&meta_key(&obj.metadata));
				},
			}
			inner.reload_ingress();
		}
		info!("restart ingresses watcher");
	}
}

async fn watch_services(inner: Arc<Inner>) {
	loop {
		let stream = match inner.source.watch_services().await {
			Ok(stream) => stream,
			Err(err) => {
				error!("can not watch services; error={err}");
				tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
				continue;
			},
		};
		let mut stream = stream;
		while let Some(event) = stream.next().await {
			match event {
				ResourceEvent::Added(obj) | ResourceEvent::Modified(obj) => {
					inner.services.insert(meta_key(&obj.metadata), obj);
				},
				ResourceEvent::Deleted(obj) => {
					inner.services.remove(&meta_key(&obj.metadata));
				},
			}
			inner.reload_service();
			inner.reload_ingress();
		}
		info!("restart services watcher");
	}
}

async fn watch_secrets(inner: Arc<Inner>) {
	loop {
		let stream = match inner.source.watch_secrets().await {
			Ok(stream) => stream,
			Err(err) => {
				error!("can not watch secrets; error={err}");
				tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
				continue;
			},
		};
		let mut stream = stream;
		while let Some(event) = stream.next().await {
			match event {
				ResourceEvent::Added(obj) | ResourceEvent::Modified(obj) => {
					inner.secrets.insert(meta_key(&obj.metadata), obj);
				},
				ResourceEvent::Deleted(obj) => {
					inner.secrets.remove(&meta_key(&obj.metadata));
				},
			}
			inner.reload_secret();
		}
		info!("restart secrets watcher");
	}
}

async fn watch_endpoints(inner: Arc<Inner>) {
	loop {
		let stream = match inner.source.watch_endpoints().await {
			Ok(stream) => stream,
			Err(err) => {
				error!("can not watch endpoints; error={err}");
				tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
				continue;
			},
		};
		let mut stream = stream;
		while let Some(event) = stream.next().await {
			match event {
				ResourceEvent::Added(obj) | ResourceEvent::Modified(obj) => {
					// fast path: update only the affected host's balancer
					inner.reload_single_endpoint(&obj);
					inner.endpoints.insert(meta_key(&obj.metadata), obj);
					continue;
				},
				ResourceEvent::Deleted(obj) => {
					inner.endpoints.remove(&meta_key(&obj.metadata));
				},
			}
			inner.reload_endpoint();
		}
		info!("restart endpoints watcher");
	}
}

fn ingress_class(ing: &Ingress) -> &str {
	if let Some(class) = ing.spec.as_ref().and_then(|s| s.ingress_class_name.as_deref()) {
		return class;
	}
	ing
		.metadata
		.annotations
		.as_ref()
		.and_then(|a| a.get("kubernetes.io/ingress.class"))
		.map(String::as_str)
		.unwrap_or_default()
}

struct BackendConfig {
	protocol: Option<Strng>,
	#[allow(dead_code)]
	port_name: Strng,
	port_number: i32,
}

fn backend_config(backend: &IngressServiceBackend, svc: &Service) -> Option<BackendConfig> {
	let ports = svc.spec.as_ref().and_then(|s| s.ports.as_deref());
	let port = backend.port.as_ref()?;

	// specifies port by name
	if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
		let mut config = BackendConfig {
			protocol: None,
			port_name: name.into(),
			port_number: 0,
		};
		for p in ports.into_iter().flatten() {
			if p.name.as_deref() == Some(name) {
				config.port_number = p.port;
				config.protocol = p.app_protocol.as_deref().map(Into::into);
			}
		}
		if config.port_number == 0 {
			return None;
		}
		return Some(config);
	}

	// specifies port by number
	let number = port.number?;
	let mut config = BackendConfig {
		protocol: None,
		port_name: "".into(),
		port_number: number,
	};
	// find port name; port names are required in kubernetes when there is
	// more than one port, so this is normally available
	for p in ports.into_iter().flatten() {
		if p.port == number {
			config.port_name = p.name.as_deref().unwrap_or_default().into();
			config.protocol = p.app_protocol.as_deref().map(Into::into);
		}
	}
	Some(config)
}

fn endpoint_to_rrlb(ep: &Endpoints) -> Option<route::RoundRobin> {
	let mut ips: Vec<Strng> = Vec::new();
	for subset in ep.subsets.iter().flatten() {
		for addr in subset.addresses.iter().flatten() {
			ips.push(addr.ip.as_str().into());
		}
	}
	if ips.is_empty() {
		return None;
	}
	Some(route::RoundRobin::new(ips))
}

fn panic_message(err: &Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = err.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = err.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}

#[cfg(test)]
mod tests;
