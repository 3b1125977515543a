use futures::StreamExt;
use gantry_core::prelude::*;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use super::{ResourceEvent, ResourceSource, ResourceStream};

/// ClusterSource reads resources from the live cluster API via list/watch.
pub struct ClusterSource {
	client: Client,
	namespace: Option<Strng>,
}

impl ClusterSource {
	/// Connects using in-cluster configuration, falling back to the local
	/// kubeconfig. Watches the given namespace, or all namespaces when None.
	pub async fn new(namespace: Option<Strng>) -> anyhow::Result<ClusterSource> {
		let client = Client::try_default()
			.await
			.context("building cluster client")?;
		Ok(ClusterSource { client, namespace })
	}

	fn api<K>(&self) -> Api<K>
	where
		K: Resource<Scope = NamespaceResourceScope>,
		K::DynamicType: Default,
	{
		match &self.namespace {
			Some(ns) => Api::namespaced(self.client.clone(), ns),
			None => Api::all(self.client.clone()),
		}
	}
}

async fn list<K>(api: Api<K>) -> anyhow::Result<Vec<K>>
where
	K: Resource + Clone + DeserializeOwned + Debug,
{
	Ok(api.list(&ListParams::default()).await?.items)
}

async fn watch<K>(api: Api<K>) -> anyhow::Result<ResourceStream<K>>
where
	K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
	let stream = api.watch(&WatchParams::default(), "0").await?;
	let stream = stream.filter_map(|event| {
		futures::future::ready(match event {
			Ok(WatchEvent::Added(obj)) => Some(ResourceEvent::Added(obj)),
			Ok(WatchEvent::Modified(obj)) => Some(ResourceEvent::Modified(obj)),
			Ok(WatchEvent::Deleted(obj)) => Some(ResourceEvent::Deleted(obj)),
			Ok(WatchEvent::Bookmark(_)) => None,
			Ok(WatchEvent::Error(err)) => {
				warn!("watch stream server error: {err}");
				None
			},
			Err(err) => {
				// the stream ends shortly after; the watch loop restarts it
				warn!("watch stream error: {err}");
				None
			},
		})
	});
	Ok(Box::pin(stream))
}

#[async_trait::async_trait]
impl ResourceSource for ClusterSource {
	async fn get_ingresses(&self) -> anyhow::Result<Vec<Ingress>> {
		list(self.api()).await
	}

	async fn watch_ingresses(&self) -> anyhow::Result<ResourceStream<Ingress>> {
		watch(self.api()).await
	}

	async fn get_services(&self) -> anyhow::Result<Vec<Service>> {
		list(self.api()).await
	}

	async fn watch_services(&self) -> anyhow::Result<ResourceStream<Service>> {
		watch(self.api()).await
	}

	async fn get_secrets(&self) -> anyhow::Result<Vec<Secret>> {
		list(self.api()).await
	}

	async fn watch_secrets(&self) -> anyhow::Result<ResourceStream<Secret>> {
		watch(self.api()).await
	}

	async fn get_endpoints(&self) -> anyhow::Result<Vec<Endpoints>> {
		list(self.api()).await
	}

	async fn watch_endpoints(&self) -> anyhow::Result<ResourceStream<Endpoints>> {
		watch(self.api()).await
	}
}
