use std::sync::atomic::{AtomicU32, Ordering};

use gantry_core::strng::Strng;

use super::badaddr::BadAddrTable;

/// RoundRobin is a round-robin load balancer over an immutable list of
/// backend IPs. Replacement is whole-value; the list is never mutated in
/// place. Only the cursor is touched concurrently.
#[derive(Debug, Default)]
pub struct RoundRobin {
	ips: Vec<Strng>,
	current: AtomicU32,
}

impl RoundRobin {
	pub fn new(ips: Vec<Strng>) -> RoundRobin {
		RoundRobin {
			ips,
			current: AtomicU32::new(0),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.ips.is_empty()
	}

	/// Returns the next IP, skipping addresses the bad table currently marks
	/// bad. When every address is bad, the IP at the unadjusted cursor is
	/// returned so callers keep round-robining among failed backends.
	pub fn get(&self, bad: Option<&BadAddrTable>) -> Option<Strng> {
		let l = self.ips.len();
		if l == 0 {
			return None;
		}
		if l == 1 {
			return Some(self.ips[0].clone());
		}

		let p = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as usize % l;
		for k in 0..l {
			// try gets not bad address
			let i = (p + k) % l;
			let ip = &self.ips[i];
			if !bad.is_some_and(|b| b.is_bad(ip)) {
				return Some(ip.clone());
			}
		}
		Some(self.ips[p].clone()) // all bad, return first
	}
}
