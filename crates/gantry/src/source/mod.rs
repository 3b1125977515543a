mod cluster;
mod fs;

use std::pin::Pin;

pub use cluster::ClusterSource;
pub use fs::FsSource;
use futures::Stream;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;

/// A single change observed on a watched resource kind.
#[derive(Clone, Debug)]
pub enum ResourceEvent<T> {
	Added(T),
	Modified(T),
	Deleted(T),
}

pub type ResourceStream<T> = Pin<Box<dyn Stream<Item = ResourceEvent<T>> + Send>>;

/// ResourceSource abstracts where the controller reads cluster state from:
/// the live cluster API, or YAML files on disk. `get_*` lists the current
/// objects; `watch_*` yields changes until the stream ends, at which point
/// the caller restarts it.
#[async_trait::async_trait]
pub trait ResourceSource: Send + Sync + 'static {
	async fn get_ingresses(&self) -> anyhow::Result<Vec<Ingress>>;
	async fn watch_ingresses(&self) -> anyhow::Result<ResourceStream<Ingress>>;

	async fn get_services(&self) -> anyhow::Result<Vec<Service>>;
	async fn watch_services(&self) -> anyhow::Result<ResourceStream<Service>>;

	async fn get_secrets(&self) -> anyhow::Result<Vec<Secret>>;
	async fn watch_secrets(&self) -> anyhow::Result<ResourceStream<Secret>>;

	async fn get_endpoints(&self) -> anyhow::Result<Vec<Endpoints>>;
	async fn watch_endpoints(&self) -> anyhow::Result<ResourceStream<Endpoints>>;
}
