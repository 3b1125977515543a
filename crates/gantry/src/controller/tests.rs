use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
	EndpointAddress, EndpointSubset, Endpoints, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
	HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressSpec,
	IngressServiceBackend, IngressTLS, ServiceBackendPort,
};
use prometheus_client::registry::Registry;

use super::*;
use crate::plugins::default_plugins;
use crate::source::ResourceStream;

#[derive(Default)]
struct TestSource {
	ingresses: Vec<Ingress>,
	services: Vec<Service>,
	endpoints: Vec<Endpoints>,
	secrets: Vec<Secret>,
}

fn pending<T: Send + 'static>() -> anyhow::Result<ResourceStream<T>> {
	Ok(Box::pin(futures::stream::pending()))
}

#[async_trait::async_trait]
impl ResourceSource for TestSource {
	async fn get_ingresses(&self) -> anyhow::Result<Vec<Ingress>> {
		Ok(self.ingresses.clone())
	}

	async fn watch_ingresses(&self) -> anyhow::Result<ResourceStream<Ingress>> {
		pending()
	}

	async fn get_services(&self) -> anyhow::Result<Vec<Service>> {
		Ok(self.services.clone())
	}

	async fn watch_services(&self) -> anyhow::Result<ResourceStream<Service>> {
		pending()
	}

	async fn get_secrets(&self) -> anyhow::Result<Vec<Secret>> {
		Ok(self.secrets.clone())
	}

	async fn watch_secrets(&self) -> anyhow::Result<ResourceStream<Secret>> {
		pending()
	}

	async fn get_endpoints(&self) -> anyhow::Result<Vec<Endpoints>> {
		Ok(self.endpoints.clone())
	}

	async fn watch_endpoints(&self) -> anyhow::Result<ResourceStream<Endpoints>> {
		pending()
	}
}

fn ingress(host: &str, path: &str, path_type: &str, svc: &str, port: i32) -> Ingress {
	Ingress {
		metadata: ObjectMeta {
			name: Some("web".to_string()),
			namespace: Some("default".to_string()),
			..Default::default()
		},
		spec: Some(IngressSpec {
			ingress_class_name: Some("parapet".to_string()),
			rules: Some(vec![IngressRule {
				host: Some(host.to_string()),
				http: Some(HTTPIngressRuleValue {
					paths: vec![HTTPIngressPath {
						backend: IngressBackend {
							service: Some(IngressServiceBackend {
								name: svc.to_string(),
								port: Some(ServiceBackendPort {
									number: Some(port),
									name: None,
								}),
							}),
							resource: None,
						},
						path: Some(path.to_string()),
						path_type: path_type.to_string(),
					}],
				}),
			}]),
			..Default::default()
		}),
		..Default::default()
	}
}

fn service(name: &str, port: i32, target_port: i32) -> Service {
	Service {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			namespace: Some("default".to_string()),
			..Default::default()
		},
		spec: Some(ServiceSpec {
			type_: Some("ClusterIP".to_string()),
			ports: Some(vec![ServicePort {
				port,
				target_port: Some(IntOrString::Int(target_port)),
				..Default::default()
			}]),
			..Default::default()
		}),
		..Default::default()
	}
}

fn endpoints(name: &str, ips: &[&str]) -> Endpoints {
	Endpoints {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			namespace: Some("default".to_string()),
			..Default::default()
		},
		subsets: Some(vec![EndpointSubset {
			addresses: Some(
				ips
					.iter()
					.map(|ip| EndpointAddress {
						ip: ip.to_string(),
						..Default::default()
					})
					.collect(),
			),
			..Default::default()
		}]),
	}
}

async fn controller(source: TestSource) -> Controller {
	let metrics = Arc::new(Metrics::new(&mut Registry::default()));
	let ctrl = Controller::new(
		"parapet".into(),
		Arc::new(source),
		default_plugins(),
		metrics,
		100,
	);
	ctrl.watch().await;
	ctrl
}

fn matched_target(ctrl: &Controller, host: &str, path: &str) -> Option<Strng> {
	let mux = ctrl.inner.mux.load_full()?;
	match mux.matches(host, path)? {
		Matched::Route(route) => match &route.action {
			RouteAction::Proxy(t) => Some(t.target.clone()),
			RouteAction::Redirect { .. } => None,
		},
		Matched::RedirectTrailingSlash => None,
	}
}

#[tokio::test]
async fn exact_path_routes_to_target() {
	let ctrl = controller(TestSource {
		ingresses: vec![ingress("example.com", "/api", "Exact", "svc-a", 8080)],
		services: vec![service("svc-a", 8080, 9000)],
		endpoints: vec![endpoints("svc-a", &["10.0.0.1"])],
		..Default::default()
	})
	.await;

	assert!(ctrl.ready());
	assert_eq!(
		matched_target(&ctrl, "example.com", "/api").as_deref(),
		Some("svc-a.default.svc.cluster.local:8080")
	);
	// exact does not match the trailing slash form
	assert!(matched_target(&ctrl, "example.com", "/api/").is_none());

	assert_eq!(
		ctrl
			.inner
			.route_table
			.lookup("svc-a.default.svc.cluster.local:8080"),
		"10.0.0.1:9000"
	);
}

#[tokio::test]
async fn prefix_path_matches_subtree() {
	let ctrl = controller(TestSource {
		ingresses: vec![ingress("example.com", "/api", "Prefix", "svc-a", 8080)],
		services: vec![service("svc-a", 8080, 9000)],
		endpoints: vec![endpoints("svc-a", &["10.0.0.1"])],
		..Default::default()
	})
	.await;

	assert!(matched_target(&ctrl, "example.com", "/api").is_some());
	assert!(matched_target(&ctrl, "example.com", "/api/x").is_some());
	assert!(matched_target(&ctrl, "example.com", "/apix").is_none());
}

#[tokio::test]
async fn exact_root_downgrades_to_prefix() {
	let ctrl = controller(TestSource {
		ingresses: vec![ingress("example.com", "/", "Exact", "svc-a", 8080)],
		services: vec![service("svc-a", 8080, 9000)],
		..Default::default()
	})
	.await;

	// downgraded: the whole host matches
	assert!(matched_target(&ctrl, "example.com", "/").is_some());
	assert!(matched_target(&ctrl, "example.com", "/anything").is_some());
}

#[tokio::test]
async fn other_ingress_class_is_skipped() {
	let mut other = ingress("example.com", "/", "Prefix", "svc-a", 8080);
	other.spec.as_mut().unwrap().ingress_class_name = Some("nginx".to_string());

	let mut legacy = ingress("legacy.example.com", "/", "Prefix", "svc-a", 8080);
	legacy.metadata.name = Some("legacy".to_string());
	legacy.spec.as_mut().unwrap().ingress_class_name = None;
	legacy.metadata.annotations = Some(
		[("kubernetes.io/ingress.class".to_string(), "parapet".to_string())]
			.into_iter()
			.collect(),
	);

	let ctrl = controller(TestSource {
		ingresses: vec![other, legacy],
		services: vec![service("svc-a", 8080, 9000)],
		..Default::default()
	})
	.await;

	assert!(matched_target(&ctrl, "example.com", "/").is_none());
	// legacy annotation selects the class
	assert!(matched_target(&ctrl, "legacy.example.com", "/").is_some());
}

#[tokio::test]
async fn missing_service_skips_route_but_reconciles_rest() {
	let good = ingress("good.example.com", "/", "Prefix", "svc-a", 8080);
	let mut bad = ingress("bad.example.com", "/", "Prefix", "missing", 8080);
	bad.metadata.name = Some("bad".to_string());

	let ctrl = controller(TestSource {
		ingresses: vec![good, bad],
		services: vec![service("svc-a", 8080, 9000)],
		..Default::default()
	})
	.await;

	assert!(matched_target(&ctrl, "good.example.com", "/").is_some());
	assert!(matched_target(&ctrl, "bad.example.com", "/").is_none());
}

#[tokio::test]
async fn empty_endpoint_subsets_yield_no_balancer() {
	let mut ep = endpoints("svc-a", &[]);
	ep.subsets = Some(vec![]);

	let ctrl = controller(TestSource {
		ingresses: vec![ingress("example.com", "/", "Prefix", "svc-a", 8080)],
		services: vec![service("svc-a", 8080, 9000)],
		endpoints: vec![ep],
		..Default::default()
	})
	.await;

	// no balancer entry: lookup falls through to name resolution
	assert_eq!(
		ctrl
			.inner
			.route_table
			.lookup("svc-a.default.svc.cluster.local:8080"),
		"svc-a.default.svc.cluster.local:8080"
	);
}

#[tokio::test]
async fn reconcile_is_idempotent() {
	let ctrl = controller(TestSource {
		ingresses: vec![ingress("example.com", "/api", "Prefix", "svc-a", 8080)],
		services: vec![service("svc-a", 8080, 9000)],
		endpoints: vec![endpoints("svc-a", &["10.0.0.1"])],
		..Default::default()
	})
	.await;

	let before = matched_target(&ctrl, "example.com", "/api/x");
	ctrl.inner.reload_ingress_now();
	ctrl.inner.reload_service_now();
	ctrl.inner.reload_endpoint_now();
	let after = matched_target(&ctrl, "example.com", "/api/x");

	assert_eq!(before, after);
	assert_eq!(
		ctrl
			.inner
			.route_table
			.lookup("svc-a.default.svc.cluster.local:8080"),
		"10.0.0.1:9000"
	);
}

#[tokio::test]
async fn tls_secrets_build_the_cert_table() {
	let rcgen::CertifiedKey { cert, key_pair } =
		rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();

	let mut ing = ingress("example.com", "/", "Prefix", "svc-a", 8080);
	ing.spec.as_mut().unwrap().tls = Some(vec![IngressTLS {
		hosts: Some(vec!["example.com".to_string()]),
		secret_name: Some("example-tls".to_string()),
	}]);

	let secret = Secret {
		metadata: ObjectMeta {
			name: Some("example-tls".to_string()),
			namespace: Some("default".to_string()),
			..Default::default()
		},
		data: Some(
			[
				(
					"tls.crt".to_string(),
					ByteString(cert.pem().into_bytes()),
				),
				(
					"tls.key".to_string(),
					ByteString(key_pair.serialize_pem().into_bytes()),
				),
			]
			.into_iter()
			.collect(),
		),
		..Default::default()
	};

	let ctrl = controller(TestSource {
		ingresses: vec![ing],
		services: vec![service("svc-a", 8080, 9000)],
		secrets: vec![secret],
		..Default::default()
	})
	.await;

	assert!(ctrl.inner.cert_table.get("example.com", &[]).is_some());
	assert!(ctrl.inner.cert_table.get("other.com", &[]).is_none());
}

#[tokio::test]
async fn single_endpoint_fast_path_updates_one_host() {
	let ctrl = controller(TestSource {
		ingresses: vec![ingress("example.com", "/", "Prefix", "svc-a", 8080)],
		services: vec![service("svc-a", 8080, 9000)],
		endpoints: vec![endpoints("svc-a", &["10.0.0.1"])],
		..Default::default()
	})
	.await;

	ctrl
		.inner
		.reload_single_endpoint(&endpoints("svc-a", &["10.0.0.9"]));
	assert_eq!(
		ctrl
			.inner
			.route_table
			.lookup("svc-a.default.svc.cluster.local:8080"),
		"10.0.0.9:9000"
	);

	// an endpoint that lost all addresses removes the balancer
	let mut empty = endpoints("svc-a", &[]);
	empty.subsets = None;
	ctrl.inner.reload_single_endpoint(&empty);
	assert_eq!(
		ctrl
			.inner
			.route_table
			.lookup("svc-a.default.svc.cluster.local:8080"),
		"svc-a.default.svc.cluster.local:8080"
	);
}
