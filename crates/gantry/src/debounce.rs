use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Debounce coalesces bursts of calls into a single delayed invocation of `f`.
///
/// The first ever call runs `f` synchronously before returning; every later
/// call cancels any pending timer and arms a new one, so `f` runs once `delay`
/// after the last call of a burst.
pub struct Debounce {
	f: Arc<dyn Fn() + Send + Sync>,
	delay: Duration,
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	started: bool,
	pending: Option<JoinHandle<()>>,
}

impl Debounce {
	pub fn new(f: impl Fn() + Send + Sync + 'static, delay: Duration) -> Debounce {
		Debounce {
			f: Arc::new(f),
			delay,
			state: Mutex::new(State::default()),
		}
	}

	/// Must be called from within a tokio runtime.
	pub fn call(&self) {
		let mut state = self.state.lock().unwrap();

		// first reload always blocks
		if !state.started {
			state.started = true;
			(self.f)();
			return;
		}

		if let Some(pending) = state.pending.take() {
			pending.abort();
		}
		let f = self.f.clone();
		let delay = self.delay;
		state.pending = Some(tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			f();
		}));
	}
}

impl Drop for Debounce {
	fn drop(&mut self) {
		if let Some(pending) = self.state.lock().unwrap().pending.take() {
			pending.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn first_call_is_synchronous_and_bursts_coalesce() {
		let cnt = Arc::new(AtomicUsize::new(0));
		let c = cnt.clone();
		let d = Debounce::new(
			move || {
				c.fetch_add(1, Ordering::SeqCst);
			},
			Duration::from_millis(10),
		);
		assert_eq!(cnt.load(Ordering::SeqCst), 0);
		d.call(); // blocks
		assert_eq!(cnt.load(Ordering::SeqCst), 1);
		d.call(); // non-blocking
		assert_eq!(cnt.load(Ordering::SeqCst), 1);
		tokio::time::sleep(Duration::from_millis(15)).await;
		assert_eq!(cnt.load(Ordering::SeqCst), 2);

		d.call();
		d.call();
		d.call();
		tokio::time::sleep(Duration::from_millis(15)).await;
		assert_eq!(cnt.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn timer_resets_on_each_call() {
		let cnt = Arc::new(AtomicUsize::new(0));
		let c = cnt.clone();
		let d = Debounce::new(
			move || {
				c.fetch_add(1, Ordering::SeqCst);
			},
			Duration::from_millis(10),
		);
		d.call(); // sync first call
		for _ in 0..5 {
			d.call();
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		assert_eq!(cnt.load(Ordering::SeqCst), 1);
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(cnt.load(Ordering::SeqCst), 2);
	}
}
