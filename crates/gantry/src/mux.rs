use std::collections::HashMap;
use std::sync::Arc;

use gantry_core::strng::Strng;
use tracing::error;

use crate::http::StatusCode;
use crate::plugins::RoutePolicies;

/// A registered route: the per-route policy chain plus what to do with the
/// request once matched.
#[derive(Debug)]
pub struct Route {
	pub policies: Arc<RoutePolicies>,
	pub action: RouteAction,
}

#[derive(Debug)]
pub enum RouteAction {
	Proxy(ProxyTarget),
	Redirect { location: Strng, status: StatusCode },
}

#[derive(Debug, Clone)]
pub struct ProxyTarget {
	/// service.namespace.svc.cluster.local:port
	pub target: Strng,
	pub app_protocol: Option<Strng>,
	pub service_name: Strng,
	pub service_type: Strng,
}

/// Result of a mux lookup.
pub enum Matched {
	Route(Arc<Route>),
	/// A subtree exists at path + "/"; the caller should 301 there.
	RedirectTrailingSlash,
}

/// Mux is a host+path request multiplexer. Patterns are `host/path`; a
/// pattern ending in `/` matches the whole subtree, others match exactly.
/// Patterns without a host match any host. Immutable after build; the
/// controller replaces the whole value on reload.
#[derive(Debug, Default)]
pub struct Mux {
	hosts: HashMap<Strng, PathMux>,
	any_host: PathMux,
}

#[derive(Debug, Default)]
struct PathMux {
	exact: HashMap<Strng, Arc<Route>>,
	// sorted longest-first after build
	prefix: Vec<(Strng, Arc<Route>)>,
}

impl Mux {
	/// Compiles a route map into a mux. A bad entry is logged and skipped so
	/// one bad route does not prevent others from being published.
	pub fn build(routes: HashMap<Strng, Arc<Route>>) -> Mux {
		let mut mux = Mux::default();
		for (pattern, route) in routes {
			if let Err(err) = mux.register(&pattern, route) {
				error!("register handler failed; path={pattern}, error={err}");
			}
		}
		mux.any_host.sort();
		for pm in mux.hosts.values_mut() {
			pm.sort();
		}
		mux
	}

	fn register(&mut self, pattern: &str, route: Arc<Route>) -> anyhow::Result<()> {
		let Some(i) = pattern.find('/') else {
			anyhow::bail!("pattern must contain a path");
		};
		let (host, path) = pattern.split_at(i);
		let pm = if host.is_empty() {
			&mut self.any_host
		} else {
			self.hosts.entry(host.into()).or_default()
		};
		pm.add(path, route)
	}

	/// Looks up the handler for host + path. Host patterns take precedence;
	/// hostless patterns are the fallback.
	pub fn matches(&self, host: &str, path: &str) -> Option<Matched> {
		let path = clean_path(path);
		if let Some(pm) = self.hosts.get(host) {
			if let Some(m) = pm.matches(&path) {
				return Some(m);
			}
		}
		self.any_host.matches(&path)
	}
}

impl PathMux {
	fn add(&mut self, path: &str, route: Arc<Route>) -> anyhow::Result<()> {
		if self.exact.contains_key(path) {
			anyhow::bail!("duplicate pattern {path}");
		}
		self.exact.insert(path.into(), route.clone());
		if path.ends_with('/') {
			self.prefix.push((path.into(), route));
		}
		Ok(())
	}

	fn sort(&mut self) {
		self.prefix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
	}

	fn matches(&self, path: &str) -> Option<Matched> {
		// exact match (subtree roots are also registered exact)
		if let Some(route) = self.exact.get(path) {
			return Some(Matched::Route(route.clone()));
		}

		// a subtree registered at path + "/" redirects the bare path
		if !path.ends_with('/') {
			let with_slash = format!("{path}/");
			if self.exact.contains_key(with_slash.as_str()) {
				return Some(Matched::RedirectTrailingSlash);
			}
		}

		// longest registered prefix wins
		self
			.prefix
			.iter()
			.find(|(p, _)| path.starts_with(p.as_str()))
			.map(|(_, route)| Matched::Route(route.clone()))
	}
}

/// Resolves `.` and `..` segments and collapses duplicate slashes, keeping a
/// trailing slash.
fn clean_path(p: &str) -> String {
	if p.is_empty() {
		return "/".to_string();
	}
	let trailing = p.ends_with('/');
	let mut segments: Vec<&str> = Vec::new();
	for seg in p.split('/') {
		match seg {
			"" | "." => {},
			".." => {
				segments.pop();
			},
			s => segments.push(s),
		}
	}
	let mut out = String::with_capacity(p.len());
	out.push('/');
	out.push_str(&segments.join("/"));
	if trailing && !out.ends_with('/') {
		out.push('/');
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn route() -> Arc<Route> {
		Arc::new(Route {
			policies: Arc::new(RoutePolicies::default()),
			action: RouteAction::Redirect {
				location: "https://example.com".into(),
				status: StatusCode::FOUND,
			},
		})
	}

	fn build(patterns: &[&str]) -> Mux {
		Mux::build(
			patterns
				.iter()
				.map(|p| (Strng::from(*p), route()))
				.collect(),
		)
	}

	fn is_route(m: Option<Matched>) -> bool {
		matches!(m, Some(Matched::Route(_)))
	}

	#[test]
	fn host_root_prefix_catches_all_paths() {
		let mux = build(&["example.com/"]);
		assert!(is_route(mux.matches("example.com", "/")));
		assert!(is_route(mux.matches("example.com", "/test/path")));
		assert!(mux.matches("other.com", "/").is_none());
	}

	#[test]
	fn prefix_path() {
		let mux = build(&["example.com/path/"]);
		// bare path redirects into the subtree
		assert!(matches!(
			mux.matches("example.com", "/path"),
			Some(Matched::RedirectTrailingSlash)
		));
		assert!(is_route(mux.matches("example.com", "/path/")));
		assert!(is_route(mux.matches("example.com", "/path/sub")));
		assert!(mux.matches("example.com", "/pathx").is_none());
	}

	#[test]
	fn exact_path() {
		let mux = build(&["example.com/path"]);
		assert!(is_route(mux.matches("example.com", "/path")));
		assert!(mux.matches("example.com", "/path/").is_none());
		assert!(mux.matches("example.com", "/path/sub").is_none());
	}

	#[test]
	fn longest_prefix_wins() {
		let mut routes = HashMap::new();
		let shallow = route();
		let deep = route();
		routes.insert(Strng::from("example.com/"), shallow.clone());
		routes.insert(Strng::from("example.com/api/"), deep.clone());
		let mux = Mux::build(routes);
		match mux.matches("example.com", "/api/v1") {
			Some(Matched::Route(r)) => assert!(Arc::ptr_eq(&r, &deep)),
			_ => panic!("expected deep route"),
		}
		match mux.matches("example.com", "/other") {
			Some(Matched::Route(r)) => assert!(Arc::ptr_eq(&r, &shallow)),
			_ => panic!("expected shallow route"),
		}
	}

	#[test]
	fn hostless_pattern_matches_any_host() {
		let mux = build(&["/fallback"]);
		assert!(is_route(mux.matches("example.com", "/fallback")));
		assert!(is_route(mux.matches("other.com", "/fallback")));
	}

	#[test]
	fn path_is_cleaned_before_match() {
		let mux = build(&["example.com/api/"]);
		assert!(is_route(mux.matches("example.com", "/api/../api/x")));
		assert!(is_route(mux.matches("example.com", "//api//x")));
	}

	#[test]
	fn bad_registrations_do_not_poison_the_build() {
		let mut mux = Mux::default();
		assert!(mux.register("example.com/a", route()).is_ok());
		// a duplicate pattern is rejected, not panicked on
		assert!(mux.register("example.com/a", route()).is_err());
		// a pattern without a path is rejected
		assert!(mux.register("example.com", route()).is_err());
		mux.any_host.sort();
		for pm in mux.hosts.values_mut() {
			pm.sort();
		}
		assert!(is_route(mux.matches("example.com", "/a")));
	}
}
