pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

/// Status reported when the client went away before the upstream answered.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

pub fn plaintext_response(code: StatusCode, body: impl Into<Body>) -> Response {
	::http::Response::builder()
		.status(code)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(body.into())
		.expect("builder with known status code should not fail")
}

pub fn empty_response(code: StatusCode) -> Response {
	::http::Response::builder()
		.status(code)
		.body(Body::empty())
		.expect("builder with known status code should not fail")
}

pub fn redirect_response(code: StatusCode, location: &str) -> Response {
	::http::Response::builder()
		.status(code)
		.header(header::LOCATION, location)
		.body(Body::empty())
		.unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Request host, lowercased, without the port. Prefers the URI authority
/// (HTTP/2) and falls back to the Host header (HTTP/1.1).
pub fn request_host(req: &Request) -> Option<String> {
	let raw = req
		.uri()
		.host()
		.map(|h| h.to_string())
		.or_else(|| {
			req
				.headers()
				.get(header::HOST)
				.and_then(|h| h.to_str().ok())
				.map(|h| h.to_string())
		})?;
	Some(strip_port(&raw).to_ascii_lowercase())
}

// copied from private `http` method
pub fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");

	if host_port.as_bytes().first() == Some(&b'[') {
		let i = host_port
			.find(']')
			.expect("parsing should validate brackets");
		&host_port[0..i + 1]
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

/// Request path + query, as sent by the client.
pub fn request_uri(req: &Request) -> String {
	req
		.uri()
		.path_and_query()
		.map(|pq| pq.as_str().to_string())
		.unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_port_from_host() {
		assert_eq!(strip_port("example.com:8080"), "example.com");
		assert_eq!(strip_port("example.com"), "example.com");
		assert_eq!(strip_port("[::1]:443"), "[::1]");
	}

	#[test]
	fn request_host_lowercases() {
		let req = ::http::Request::builder()
			.uri("/")
			.header(header::HOST, "Example.COM:8443")
			.body(Body::empty())
			.unwrap();
		assert_eq!(request_host(&req).as_deref(), Some("example.com"));
	}
}
