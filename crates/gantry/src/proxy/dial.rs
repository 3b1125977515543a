use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use gantry_core::metrics::DefaultedUnknown;
use gantry_core::prelude::*;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::http::Uri;
use crate::route;
use crate::telemetry::Metrics;
use crate::telemetry::metrics::AddrLabels;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum DialError {
	#[error("dial {0}: deadline exceeded")]
	Timeout(String),
	#[error("dial {0}: {1}")]
	Connect(String, io::Error),
	#[error("tls handshake with {0}: {1}")]
	Tls(String, io::Error),
	#[error("invalid address: {0}")]
	Address(String),
}

/// Dialer connects to upstream pods with a hard deadline, marking addresses
/// that fail to dial bad in the route table. Successful connections are
/// wrapped with the backend connection metrics.
#[derive(Clone)]
pub struct Dialer {
	route_table: Arc<route::Table>,
	metrics: Arc<Metrics>,
	tls: Arc<ClientConfig>,
}

impl Dialer {
	pub fn new(route_table: Arc<route::Table>, metrics: Arc<Metrics>) -> Dialer {
		Dialer {
			route_table,
			metrics,
			tls: insecure_client_config(),
		}
	}

	async fn dial(self, dst: Uri) -> Result<Outbound, DialError> {
		let host = dst
			.host()
			.ok_or_else(|| DialError::Address(dst.to_string()))?
			.to_string();
		let https = dst.scheme_str() == Some("https");
		let port = dst.port_u16().unwrap_or(if https { 443 } else { 80 });
		let addr = format!("{host}:{port}");

		let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(err)) => {
				self.route_table.mark_bad(&addr);
				error!("proxy: can not connect; addr={addr}, err={err}");
				return Err(DialError::Connect(addr, err));
			},
			Err(_) => {
				self.route_table.mark_bad(&addr);
				error!("proxy: can not connect; addr={addr}, err=deadline exceeded");
				return Err(DialError::Timeout(addr));
			},
		};
		let _ = stream.set_nodelay(true);
		let _ = SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEP_ALIVE));

		let inner = if https {
			let server_name = match host.parse::<IpAddr>() {
				Ok(ip) => ServerName::IpAddress(ip.into()),
				Err(_) => ServerName::try_from(host.clone())
					.map_err(|_| DialError::Address(addr.clone()))?,
			};
			let stream = TlsConnector::from(self.tls.clone())
				.connect(server_name, stream)
				.await
				.map_err(|err| DialError::Tls(addr.clone(), err))?;
			MaybeTls::Tls(Box::new(stream))
		} else {
			MaybeTls::Plain(stream)
		};

		Ok(Outbound(TokioIo::new(Counted::new(
			inner,
			addr,
			self.metrics.clone(),
		))))
	}
}

impl tower::Service<Uri> for Dialer {
	type Response = Outbound;
	type Error = DialError;
	type Future = Pin<Box<dyn Future<Output = Result<Outbound, DialError>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, dst: Uri) -> Self::Future {
		Box::pin(self.clone().dial(dst))
	}
}

/// Upstream TLS with no verification: upstreams are in-cluster pods serving
/// certificates that do not chain to any public root.
fn insecure_client_config() -> Arc<ClientConfig> {
	let mut cfg = ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
		.with_no_client_auth();
	cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
	Arc::new(cfg)
}

enum MaybeTls {
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

/// Counted decorates a backend connection with the connection gauge and
/// byte counters.
struct Counted {
	inner: MaybeTls,
	labels: AddrLabels,
	metrics: Arc<Metrics>,
}

impl Counted {
	fn new(inner: MaybeTls, addr: String, metrics: Arc<Metrics>) -> Counted {
		let labels = AddrLabels {
			addr: DefaultedUnknown::from(addr),
		};
		metrics.backend_connections.get_or_create(&labels).inc();
		Counted {
			inner,
			labels,
			metrics,
		}
	}
}

impl Drop for Counted {
	fn drop(&mut self) {
		self
			.metrics
			.backend_connections
			.get_or_create(&self.labels)
			.dec();
	}
}

impl AsyncRead for Counted {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let before = buf.filled().len();
		let res = match &mut self.inner {
			MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
			MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		};
		if let Poll::Ready(Ok(())) = &res {
			let n = buf.filled().len() - before;
			if n > 0 {
				self
					.metrics
					.backend_read_bytes
					.get_or_create(&self.labels)
					.inc_by(n as u64);
			}
		}
		res
	}
}

impl AsyncWrite for Counted {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let res = match &mut self.inner {
			MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
			MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		};
		if let Poll::Ready(Ok(n)) = &res {
			self
				.metrics
				.backend_write_bytes
				.get_or_create(&self.labels)
				.inc_by(*n as u64);
		}
		res
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match &mut self.inner {
			MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
			MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match &mut self.inner {
			MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
			MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

/// Outbound is the connection type handed to the pooled clients.
pub struct Outbound(TokioIo<Counted>);

impl Connection for Outbound {
	fn connected(&self) -> Connected {
		Connected::new()
	}
}

impl hyper::rt::Read for Outbound {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: hyper::rt::ReadBufCursor<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.0).poll_read(cx, buf)
	}
}

impl hyper::rt::Write for Outbound {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.0).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.0).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.0).poll_shutdown(cx)
	}
}

mod insecure {
	use rustls::DigitallySignedStruct;
	use rustls::SignatureScheme;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA1,
				SignatureScheme::ECDSA_SHA1_Legacy,
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
				SignatureScheme::ED448,
			]
		}
	}
}
