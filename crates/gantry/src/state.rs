use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gantry_core::strng::Strng;

use crate::http::Request;

/// State is a per-request string map threaded through the request extensions.
/// The state middleware injects an empty map; plugins and the proxy handler
/// populate it, and the metrics and access-log layers read it after the
/// response is written.
#[derive(Clone, Debug, Default)]
pub struct State(Arc<Mutex<HashMap<Strng, Strng>>>);

impl State {
	pub fn new() -> State {
		State::default()
	}

	pub fn set(&self, key: impl Into<Strng>, value: impl Into<Strng>) {
		self.0.lock().unwrap().insert(key.into(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<Strng> {
		self.0.lock().unwrap().get(key).cloned()
	}

	pub fn snapshot(&self) -> HashMap<Strng, Strng> {
		self.0.lock().unwrap().clone()
	}
}

/// Returns the request's state map, or a detached empty map when the state
/// middleware did not run.
pub fn get(req: &Request) -> State {
	req.extensions().get::<State>().cloned().unwrap_or_default()
}

/// Creates a fresh state map and attaches it to the request.
pub fn inject(req: &mut Request) -> State {
	let s = State::new();
	req.extensions_mut().insert(s.clone());
	s
}
