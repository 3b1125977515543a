use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use gantry_core::strng::Strng;
use tracing::{info, warn};

const BAD_DURATION: Duration = Duration::from_secs(2);
const CLEAR_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// BadAddrTable quarantines hosts that recently failed to dial. Entries are
/// bad for a short window; expired entries may linger until a sweep and are
/// ignored by queries.
#[derive(Debug, Default)]
pub struct BadAddrTable {
	addrs: RwLock<HashMap<Strng, Instant>>,
}

impl BadAddrTable {
	/// Marks the host of addr (port stripped, if any) bad as of now.
	pub fn mark_bad(&self, addr: &str) {
		let host = split_host(addr);
		warn!("badAddrTable: mark bad {host}");
		self
			.addrs
			.write()
			.unwrap()
			.insert(host.into(), Instant::now());
	}

	pub fn is_bad(&self, host: &str) -> bool {
		let addrs = self.addrs.read().unwrap();
		match addrs.get(host) {
			Some(at) => at.elapsed() <= BAD_DURATION,
			None => false,
		}
	}

	/// Removes expired entries. Correctness does not depend on this running;
	/// it only bounds memory.
	pub fn clear(&self) {
		let start = Instant::now();
		let mut addrs = self.addrs.write().unwrap();
		let before = addrs.len();
		addrs.retain(|_, at| at.elapsed() <= BAD_DURATION);
		let cleared = before - addrs.len();
		if cleared > 0 {
			info!(
				"badAddrTable: cleared table in {:?}, removed {cleared} records",
				start.elapsed()
			);
		}
	}

	pub(super) async fn clear_loop(&self) {
		info!("badAddrTable: clear loop started");
		loop {
			tokio::time::sleep(CLEAR_INTERVAL).await;
			self.clear();
		}
	}
}

/// Splits host from a host:port pair, tolerating bare hosts and IPv6 forms.
fn split_host(addr: &str) -> &str {
	if let Some(rest) = addr.strip_prefix('[') {
		if let Some(i) = rest.find(']') {
			return &rest[..i];
		}
	}
	match addr.rsplit_once(':') {
		Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => host,
		_ => addr,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mark_and_query() {
		let bad = BadAddrTable::default();
		bad.mark_bad("192.168.0.10:8080");
		assert!(bad.is_bad("192.168.0.10"));
		// clear without expire, should still be bad
		bad.clear();
		assert!(bad.is_bad("192.168.0.10"));

		// mark bad without port
		bad.mark_bad("192.168.0.11");
		assert!(bad.is_bad("192.168.0.11"));

		assert!(!bad.is_bad("192.168.0.1"));
	}
}
