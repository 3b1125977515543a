use std::path::{Path, PathBuf};

use gantry_core::prelude::*;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ResourceSource, ResourceStream};

/// FsSource parses multi-document YAML files under a directory into the same
/// resource types the cluster adapter serves. Only the initial listing is
/// provided; the watch streams never fire.
pub struct FsSource {
	ingresses: Vec<Ingress>,
	services: Vec<Service>,
	endpoints: Vec<Endpoints>,
	secrets: Vec<Secret>,
}

impl FsSource {
	pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<FsSource> {
		let dir = dir.into();
		let mut source = FsSource {
			ingresses: Vec::new(),
			services: Vec::new(),
			endpoints: Vec::new(),
			secrets: Vec::new(),
		};
		source.load_dir(&dir)?;
		info!(
			"loaded filesystem backend from {}: {} ingresses, {} services, {} endpoints, {} secrets",
			dir.display(),
			source.ingresses.len(),
			source.services.len(),
			source.endpoints.len(),
			source.secrets.len(),
		);
		Ok(source)
	}

	fn load_dir(&mut self, dir: &Path) -> anyhow::Result<()> {
		for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
			let entry = entry?;
			let path = entry.path();
			if path.is_dir() {
				self.load_dir(&path)?;
				continue;
			}
			let content = std::fs::read_to_string(&path)
				.with_context(|| format!("reading {}", path.display()))?;
			for doc in serde_yaml::Deserializer::from_str(&content) {
				match serde_yaml::Value::deserialize(doc) {
					Ok(value) => self.add_object(value),
					Err(err) => warn!("can not parse document in {}: {err}", path.display()),
				}
			}
		}
		Ok(())
	}

	fn add_object(&mut self, value: serde_yaml::Value) {
		let api_version = value
			.get("apiVersion")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();
		let kind = value
			.get("kind")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();

		match (api_version.as_str(), kind.as_str()) {
			("v1", "List") => {
				if let Some(items) = value.get("items").and_then(|v| v.as_sequence()) {
					for item in items.clone() {
						self.add_object(item);
					}
				}
			},
			("v1", "Service") => {
				if let Some(mut svc) = decode::<Service>(value) {
					autofill_meta(&mut svc.metadata);
					self.services.push(svc);
				}
			},
			("v1", "Endpoints") => {
				if let Some(mut ep) = decode::<Endpoints>(value) {
					autofill_meta(&mut ep.metadata);
					self.endpoints.push(ep);
				}
			},
			("v1", "Secret") => {
				if let Some(mut s) = decode::<Secret>(value) {
					autofill_meta(&mut s.metadata);
					self.secrets.push(s);
				}
			},
			("networking.k8s.io/v1", "Ingress") => {
				if let Some(mut ing) = decode::<Ingress>(value) {
					autofill_meta(&mut ing.metadata);
					self.ingresses.push(ing);
				}
			},
			("extensions/v1beta1", "Ingress") => {
				warn!("extensions/v1beta1 Ingress is no longer served, convert to networking.k8s.io/v1");
			},
			_ => {
				warn!("unsupported object {api_version}.{kind}");
			},
		}
	}
}

fn decode<T: DeserializeOwned>(value: serde_yaml::Value) -> Option<T> {
	match serde_yaml::from_value(value) {
		Ok(obj) => Some(obj),
		Err(err) => {
			warn!("can not add object: {err}");
			None
		},
	}
}

fn autofill_meta(meta: &mut ObjectMeta) {
	if meta.namespace.as_deref().unwrap_or_default().is_empty() {
		meta.namespace = Some("default".to_string());
	}
}

fn pending<T: Send + 'static>() -> ResourceStream<T> {
	Box::pin(futures::stream::pending())
}

#[async_trait::async_trait]
impl ResourceSource for FsSource {
	async fn get_ingresses(&self) -> anyhow::Result<Vec<Ingress>> {
		Ok(self.ingresses.clone())
	}

	async fn watch_ingresses(&self) -> anyhow::Result<ResourceStream<Ingress>> {
		Ok(pending())
	}

	async fn get_services(&self) -> anyhow::Result<Vec<Service>> {
		Ok(self.services.clone())
	}

	async fn watch_services(&self) -> anyhow::Result<ResourceStream<Service>> {
		Ok(pending())
	}

	async fn get_secrets(&self) -> anyhow::Result<Vec<Secret>> {
		Ok(self.secrets.clone())
	}

	async fn watch_secrets(&self) -> anyhow::Result<ResourceStream<Secret>> {
		Ok(pending())
	}

	async fn get_endpoints(&self) -> anyhow::Result<Vec<Endpoints>> {
		Ok(self.endpoints.clone())
	}

	async fn watch_endpoints(&self) -> anyhow::Result<ResourceStream<Endpoints>> {
		Ok(pending())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_fixture(name: &str, content: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("gantry-fs-{name}-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(dir.join("objects.yaml"), content).unwrap();
		dir
	}

	#[tokio::test]
	async fn parses_multi_document_yaml() {
		let dir = write_fixture(
			"multi",
			r#"
apiVersion: v1
kind: Service
metadata:
  name: svc-a
spec:
  ports:
  - port: 8080
    targetPort: 9000
---
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: web
  namespace: prod
spec:
  rules:
  - host: example.com
---
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: Endpoints
  metadata:
    name: svc-a
  subsets:
  - addresses:
    - ip: 10.0.0.1
"#,
		);
		let source = FsSource::new(&dir).unwrap();
		std::fs::remove_dir_all(&dir).unwrap();

		let services = source.get_services().await.unwrap();
		assert_eq!(services.len(), 1);
		// namespace defaults to "default"
		assert_eq!(services[0].metadata.namespace.as_deref(), Some("default"));

		let ingresses = source.get_ingresses().await.unwrap();
		assert_eq!(ingresses.len(), 1);
		assert_eq!(ingresses[0].metadata.namespace.as_deref(), Some("prod"));

		let endpoints = source.get_endpoints().await.unwrap();
		assert_eq!(endpoints.len(), 1);
	}

	#[tokio::test]
	async fn unknown_kinds_are_skipped() {
		let dir = write_fixture(
			"unknown",
			"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: x\n",
		);
		let source = FsSource::new(&dir).unwrap();
		std::fs::remove_dir_all(&dir).unwrap();
		assert!(source.get_ingresses().await.unwrap().is_empty());
		assert!(source.get_services().await.unwrap().is_empty());
	}
}
