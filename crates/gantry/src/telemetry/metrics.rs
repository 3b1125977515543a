use gantry_core::metrics::{DefaultedUnknown, EncodeDisplay};
use gantry_core::strng::RichStrng;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub host: DefaultedUnknown<RichStrng>,
	pub status: DefaultedUnknown<EncodeDisplay<u16>>,
	pub method: DefaultedUnknown<RichStrng>,
	pub ingress_name: DefaultedUnknown<RichStrng>,
	pub ingress_namespace: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
	pub success: EncodeDisplay<u8>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct HostActiveLabels {
	pub host: DefaultedUnknown<RichStrng>,
	pub upgrade: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct HostLabels {
	pub host: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct AddrLabels {
	pub addr: DefaultedUnknown<RichStrng>,
}

#[derive(Debug)]
pub struct Metrics {
	pub requests: Family<RequestLabels, Counter>,
	pub reload: Family<ReloadLabels, Counter>,
	pub host_active_requests: Family<HostActiveLabels, Gauge>,
	pub host_ratelimit_requests: Family<HostLabels, Counter>,
	pub backend_connections: Family<AddrLabels, Gauge>,
	pub backend_read_bytes: Family<AddrLabels, Counter>,
	pub backend_write_bytes: Family<AddrLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::<RequestLabels, Counter>::default();
		registry.register(
			"requests",
			"The total number of HTTP requests served",
			requests.clone(),
		);

		let reload = Family::<ReloadLabels, Counter>::default();
		registry.register("reload", "The total number of reconcile runs", reload.clone());

		let host_active_requests = Family::<HostActiveLabels, Gauge>::default();
		registry.register(
			"host_active_requests",
			"The number of in-flight requests per host",
			host_active_requests.clone(),
		);

		let host_ratelimit_requests = Family::<HostLabels, Counter>::default();
		registry.register(
			"host_ratelimit_requests",
			"The total number of rate limited requests",
			host_ratelimit_requests.clone(),
		);

		let backend_connections = Family::<AddrLabels, Gauge>::default();
		registry.register(
			"backend_connections",
			"The number of open backend connections",
			backend_connections.clone(),
		);

		let backend_read_bytes = Family::<AddrLabels, Counter>::default();
		registry.register(
			"backend_network_read_bytes",
			"The total bytes read from backends",
			backend_read_bytes.clone(),
		);

		let backend_write_bytes = Family::<AddrLabels, Counter>::default();
		registry.register(
			"backend_network_write_bytes",
			"The total bytes written to backends",
			backend_write_bytes.clone(),
		);

		Metrics {
			requests,
			reload,
			host_active_requests,
			host_ratelimit_requests,
			backend_connections,
			backend_read_bytes,
			backend_write_bytes,
		}
	}

	pub fn record_reload(&self, success: bool) {
		self
			.reload
			.get_or_create(&ReloadLabels {
				success: EncodeDisplay(success as u8),
			})
			.inc();
	}
}
