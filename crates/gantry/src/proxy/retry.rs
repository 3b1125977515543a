use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use gantry_core::prelude::*;
use http_body::Body as _;
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;

use super::ProxyError;
use crate::http::{Body, Request, Response, StatusCode, plaintext_response};

/// Bodies up to this size are buffered so every retry replays the original
/// bytes. Content-Length exactly equal to the bound is still buffered.
pub const MAX_BUFFERED_BODY: u64 = 16 * 1024;
/// Attempts for buffered (freely replayable) requests.
const MAX_RETRY: usize = 15;
/// Attempts once the body can only be streamed.
const MAX_RETRY_STREAMING: usize = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Wraps an attempt function with the retry loop. Retryable failures (dial
/// errors, upstream 502/503, deadline exceeded) are replayed with backoff as
/// long as the request body is still replayable; everything else maps to a
/// response immediately.
pub async fn serve<F, Fut>(req: Request, f: F) -> Response
where
	F: Fn(Request) -> Fut,
	Fut: Future<Output = Result<Response, ProxyError>>,
{
	let (parts, body) = req.into_parts();

	let mode = match body.size_hint().exact() {
		Some(n) if n <= MAX_BUFFERED_BODY => match body.collect().await {
			Ok(collected) => Mode::Buffered(collected.to_bytes()),
			Err(err) => {
				debug!("retry: failed reading request body: {err}");
				return plaintext_response(StatusCode::BAD_REQUEST, "Bad Request\n");
			},
		},
		_ => Mode::Streaming(SharedBody::new(body)),
	};
	let max_retry = match mode {
		Mode::Buffered(_) => MAX_RETRY,
		Mode::Streaming(_) => MAX_RETRY_STREAMING,
	};

	let mut last = None;
	for i in 0..max_retry {
		let req = rebuild(&parts, &mode);
		match f(req).await {
			Ok(resp) => return resp,
			Err(ProxyError::Canceled) => return ProxyError::Canceled.into_response(),
			Err(err) => {
				if !err.is_retryable() {
					return err.into_response();
				}
				if let Mode::Streaming(shared) = &mode {
					if shared.touched() {
						// the attempt started streaming; the body is gone
						return err.into_response();
					}
				}
				debug!("retry: attempt {i} failed: {err}");
				last = Some(err);
				tokio::time::sleep(backoff(i)).await;
			},
		}
	}
	last
		.map(ProxyError::into_response)
		.unwrap_or_else(|| plaintext_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n"))
}

fn backoff(round: usize) -> Duration {
	let d = Duration::from_millis(10u64.saturating_mul(1u64 << round.min(16)));
	d.min(MAX_BACKOFF)
}

enum Mode {
	Buffered(Bytes),
	Streaming(Arc<SharedBody>),
}

fn rebuild(parts: &::http::request::Parts, mode: &Mode) -> Request {
	let body = match mode {
		Mode::Buffered(bytes) => Body::from(bytes.clone()),
		Mode::Streaming(shared) => Body::new(TrackedBody {
			shared: shared.clone(),
			taken: None,
		}),
	};
	Request::from_parts(clone_parts(parts), body)
}

/// http::request::Parts is not Clone; rebuild one from its pieces. The
/// extensions our chain relies on (state map, client address, downstream
/// upgrade handle) are all Clone and survive the copy.
fn clone_parts(parts: &::http::request::Parts) -> ::http::request::Parts {
	let mut req = ::http::Request::builder()
		.method(parts.method.clone())
		.uri(parts.uri.clone())
		.version(parts.version)
		.body(())
		.expect("rebuilding request from valid parts cannot fail");
	*req.headers_mut() = parts.headers.clone();
	if let Some(state) = parts.extensions.get::<crate::state::State>() {
		req.extensions_mut().insert(state.clone());
	}
	if let Some(addr) = parts.extensions.get::<crate::gateway::ClientAddr>() {
		req.extensions_mut().insert(*addr);
	}
	if let Some(up) = parts.extensions.get::<super::DownstreamUpgrade>() {
		req.extensions_mut().insert(up.clone());
	}
	req.into_parts().0
}

/// SharedBody keeps the not-yet-consumed request body available across
/// attempts. The first poll takes it, forfeiting further retries.
struct SharedBody {
	inner: Mutex<Option<Body>>,
	hint: SizeHint,
	touched: AtomicBool,
}

impl SharedBody {
	fn new(body: Body) -> Arc<SharedBody> {
		let hint = body.size_hint();
		Arc::new(SharedBody {
			inner: Mutex::new(Some(body)),
			hint,
			touched: AtomicBool::new(false),
		})
	}

	fn touched(&self) -> bool {
		self.touched.load(Ordering::SeqCst)
	}
}

struct TrackedBody {
	shared: Arc<SharedBody>,
	taken: Option<Body>,
}

impl http_body::Body for TrackedBody {
	type Data = Bytes;
	type Error = crate::http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
		let this = self.get_mut();
		if this.taken.is_none() {
			let mut inner = this.shared.inner.lock().unwrap();
			match inner.take() {
				Some(body) => {
					this.shared.touched.store(true, Ordering::SeqCst);
					this.taken = Some(body);
				},
				// consumed by an earlier attempt; nothing to stream
				None => return Poll::Ready(None),
			}
		}
		Pin::new(this.taken.as_mut().expect("taken set above")).poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		match &self.taken {
			Some(body) => body.is_end_stream(),
			None => self.shared.inner.lock().unwrap().is_none(),
		}
	}

	fn size_hint(&self) -> SizeHint {
		match &self.taken {
			Some(body) => body.size_hint(),
			None => self.shared.hint.clone(),
		}
	}
}
