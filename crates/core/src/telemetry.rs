use std::sync::LazyLock;
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub static APPLICATION_START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Initializes the global tracing subscriber. Filtering is controlled with
/// RUST_LOG; the default level is info.
pub fn setup_logging() {
	// Accessed for the side effect: pin process start before anything else runs.
	let _ = *APPLICATION_START_TIME;
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}
