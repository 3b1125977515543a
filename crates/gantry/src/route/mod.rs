mod badaddr;
mod rrlb;

use std::collections::HashMap;
use std::sync::{Arc, Once, RwLock};

use gantry_core::strng::Strng;

pub use badaddr::BadAddrTable;
pub use rrlb::RoundRobin;

/// Table resolves a service address (`svc.ns.svc.cluster.local:port`) to a
/// pod address (`ip:targetPort`) using two maps plus per-service round-robin.
pub struct Table {
	start_bg_job: Once,
	addr_to_target_host: RwLock<HashMap<Strng, Arc<RoundRobin>>>,
	addr_to_target_port: RwLock<HashMap<Strng, Strng>>,
	bad_addr: Arc<BadAddrTable>,
}

impl Default for Table {
	fn default() -> Self {
		Self {
			start_bg_job: Once::new(),
			addr_to_target_host: RwLock::default(),
			addr_to_target_port: RwLock::default(),
			bad_addr: Arc::default(),
		}
	}
}

impl Table {
	fn run_background_job(&self) {
		let bad = self.bad_addr.clone();
		tokio::spawn(async move { bad.clear_loop().await });
	}

	/// Lookup returns the target pod's addr to connect to.
	/// If the target pod's addr is not found in the table, addr is returned
	/// as is and the dialer resolves it by name.
	pub fn lookup(&self, addr: &str) -> Strng {
		// addr only in dns name service.namespace.svc.cluster.local:port
		let Some((host, _)) = addr.rsplit_once(':') else {
			// invalid format
			return addr.into();
		};

		let target_host = self.addr_to_target_host.read().unwrap().get(host).cloned();
		let target_port = self.addr_to_target_port.read().unwrap().get(addr).cloned();

		let (Some(lb), Some(port)) = (target_host, target_port) else {
			// host or port not found in table, lets proxy try to resolve it from dialer
			return addr.into();
		};

		// found host and port, proxy will connect to pod directly
		match lb.get(Some(&self.bad_addr)) {
			Some(ip) => gantry_core::strng::format!("{ip}:{port}"),
			// not found any pod, lets proxy try to resolve it from dialer
			// this case should not happen, if set_host_route is called correctly
			None => addr.into(),
		}
	}

	/// Replaces the host routes wholesale.
	///
	/// In a Kubernetes cluster, host is the dns name
	/// service.namespace.svc.cluster.local and IPs are the pod IPs from the
	/// service's endpoints.
	pub fn set_host_routes(&self, routes: HashMap<Strng, Arc<RoundRobin>>) {
		self.start_bg_job.call_once(|| self.run_background_job());

		*self.addr_to_target_host.write().unwrap() = routes;
	}

	pub fn set_host_route(&self, host: Strng, lb: Option<Arc<RoundRobin>>) {
		self.start_bg_job.call_once(|| self.run_background_job());

		let mut routes = self.addr_to_target_host.write().unwrap();
		match lb {
			Some(lb) => {
				routes.insert(host, lb);
			},
			None => {
				routes.remove(&host);
			},
		}
	}

	/// Replaces the service-addr to pod-port map wholesale, making the proxy
	/// connect directly to pods.
	pub fn set_port_routes(&self, routes: HashMap<Strng, Strng>) {
		*self.addr_to_target_port.write().unwrap() = routes;
	}

	pub fn mark_bad(&self, addr: &str) {
		self.bad_addr.mark_bad(addr);
	}
}

#[cfg(test)]
mod tests {
	use gantry_core::strng;

	use super::*;

	fn lb(ips: &[&str]) -> Arc<RoundRobin> {
		Arc::new(RoundRobin::new(ips.iter().map(strng::new).collect()))
	}

	#[tokio::test]
	async fn table_lookup() {
		let tb = Table::default();
		tb.set_host_routes(HashMap::from([
			(strng::new("api.default.svc.cluster.local"), lb(&["192.168.0.1"])),
			(
				strng::new("backoffice.default.svc.cluster.local"),
				lb(&["192.168.0.2"]),
			),
			(
				strng::new("api.service.svc.cluster.local"),
				lb(&["192.168.1.1", "192.168.1.2"]),
			),
			(
				strng::new("payment.service.svc.cluster.local"),
				lb(&["192.168.2.1", "192.168.2.2"]),
			),
		]));
		tb.set_port_routes(HashMap::from([
			(strng::new("api.default.svc.cluster.local:8080"), strng::new("9000")),
			(strng::new("api.service.svc.cluster.local:8000"), strng::new("9001")),
			(
				strng::new("payment.service.svc.cluster.local:8000"),
				strng::new("9002"),
			),
			(
				strng::new("about.service.svc.cluster.local:8000"),
				strng::new("9003"),
			),
		]));

		// not found
		assert_eq!(
			tb.lookup("frontend.default.svc.cluster.local:8080"),
			"frontend.default.svc.cluster.local:8080"
		);

		// invalid format
		assert_eq!(
			tb.lookup("api.default.svc.cluster.local"),
			"api.default.svc.cluster.local"
		);

		// found host and port
		assert_eq!(tb.lookup("api.default.svc.cluster.local:8080"), "192.168.0.1:9000");

		// found only host
		assert_eq!(
			tb.lookup("backoffice.default.svc.cluster.local:8080"),
			"backoffice.default.svc.cluster.local:8080"
		);

		// some bad
		tb.mark_bad("192.168.1.1");
		for _ in 0..3 {
			assert_eq!(tb.lookup("api.service.svc.cluster.local:8000"), "192.168.1.2:9001");
		}

		// set_host_route replaces a single entry
		tb.set_host_route(
			strng::new("about.service.svc.cluster.local"),
			Some(lb(&["192.168.3.1"])),
		);
		assert_eq!(tb.lookup("about.service.svc.cluster.local:8000"), "192.168.3.1:9003");

		tb.set_host_route(
			strng::new("about.service.svc.cluster.local"),
			Some(lb(&["192.168.3.2"])),
		);
		assert_eq!(tb.lookup("about.service.svc.cluster.local:8000"), "192.168.3.2:9003");

		// delete
		tb.set_host_route(strng::new("about.service.svc.cluster.local"), None);
		assert_eq!(
			tb.lookup("about.service.svc.cluster.local:8000"),
			"about.service.svc.cluster.local:8000"
		);
	}
}
