use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use gantry_core::strng::Strng;
use rustls::SignatureScheme;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Table is the SNI certificate table: DNS SAN to certificate, with exact
/// and single-label wildcard lookup.
#[derive(Debug, Default)]
pub struct Table {
	name_to_certificate: RwLock<HashMap<Strng, Vec<Arc<CertifiedKey>>>>,
}

impl Table {
	/// Replaces the table contents, indexing each certificate under every DNS
	/// SAN of its leaf. Certificates whose leaf cannot be parsed are skipped.
	pub fn set(&self, certs: Vec<Arc<CertifiedKey>>) {
		let name_to_cert = build_name_to_certificate(&certs);

		*self.name_to_certificate.write().unwrap() = name_to_cert;
	}

	/// Resolves a certificate for the client hello's server name.
	///
	/// The name is lowercased, then matched exactly; failing that, the
	/// leftmost label is replaced with `*` and the wildcard is matched. The
	/// first certificate supporting the client's offered signature schemes
	/// wins. None means the caller should fall back to its default cert.
	pub fn get(&self, server_name: &str, schemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
		let certs = self.name_to_certificate.read().unwrap();

		let name = server_name.to_ascii_lowercase();

		// exact name
		if let Some(cands) = certs.get(name.as_str()) {
			if let Some(c) = find_supported_cert(cands, schemes) {
				return Some(c);
			}
		}

		// wildcard name
		if !name.is_empty() {
			let mut labels: Vec<&str> = name.split('.').collect();
			labels[0] = "*";
			let wildcard = labels.join(".");
			if let Some(cands) = certs.get(wildcard.as_str()) {
				return find_supported_cert(cands, schemes);
			}
		}

		None
	}
}

fn find_supported_cert(
	certs: &[Arc<CertifiedKey>],
	schemes: &[SignatureScheme],
) -> Option<Arc<CertifiedKey>> {
	certs.iter().find(|c| supports_schemes(c, schemes)).cloned()
}

/// A certificate supports a hello when the client offered no signature
/// schemes (legacy TLS 1.2) or at least one offered scheme matches the
/// certificate's key algorithm. TLS 1.3 clients always offer schemes.
fn supports_schemes(cert: &CertifiedKey, schemes: &[SignatureScheme]) -> bool {
	if schemes.is_empty() {
		return true;
	}
	use rustls::SignatureAlgorithm;
	let alg = cert.key.algorithm();
	schemes.iter().any(|s| match alg {
		SignatureAlgorithm::RSA => matches!(
			s,
			SignatureScheme::RSA_PKCS1_SHA256
				| SignatureScheme::RSA_PKCS1_SHA384
				| SignatureScheme::RSA_PKCS1_SHA512
				| SignatureScheme::RSA_PSS_SHA256
				| SignatureScheme::RSA_PSS_SHA384
				| SignatureScheme::RSA_PSS_SHA512
		),
		SignatureAlgorithm::ECDSA => matches!(
			s,
			SignatureScheme::ECDSA_NISTP256_SHA256
				| SignatureScheme::ECDSA_NISTP384_SHA384
				| SignatureScheme::ECDSA_NISTP521_SHA512
		),
		SignatureAlgorithm::ED25519 => matches!(s, SignatureScheme::ED25519),
		_ => false,
	})
}

fn build_name_to_certificate(
	certs: &[Arc<CertifiedKey>],
) -> HashMap<Strng, Vec<Arc<CertifiedKey>>> {
	let mut m: HashMap<Strng, Vec<Arc<CertifiedKey>>> = HashMap::new();
	for cert in certs {
		let Some(leaf) = cert.cert.first() else {
			continue;
		};
		let names = match dns_names(leaf.as_ref()) {
			Ok(names) => names,
			Err(err) => {
				debug!("skipping certificate with unparsable leaf: {err}");
				continue;
			},
		};
		// use only SAN, CN already deprecated
		for san in names {
			m.entry(san).or_default().push(cert.clone());
		}
	}
	m
}

fn dns_names(leaf: &[u8]) -> anyhow::Result<Vec<Strng>> {
	let (_, parsed) =
		X509Certificate::from_der(leaf).map_err(|e| anyhow::anyhow!("parse certificate: {e}"))?;
	let mut names = Vec::new();
	if let Some(san) = parsed
		.subject_alternative_name()
		.map_err(|e| anyhow::anyhow!("parse subject alternative name: {e}"))?
	{
		for name in &san.value.general_names {
			if let GeneralName::DNSName(dns) = name {
				names.push(Strng::from(*dns));
			}
		}
	}
	Ok(names)
}

/// Builds a certified key from PEM-encoded chain and private key, as stored
/// in Kubernetes TLS secrets (`tls.crt` / `tls.key`).
pub fn from_pem(crt: &[u8], key: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
	let chain = rustls_pemfile::certs(&mut &crt[..])
		.collect::<Result<Vec<_>, _>>()
		.context("invalid certificate chain")?;
	if chain.is_empty() {
		anyhow::bail!("no certificates in tls.crt");
	}
	let key = rustls_pemfile::private_key(&mut &key[..])
		.context("invalid private key")?
		.context("no private key in tls.key")?;
	let signing_key = any_supported_type(&key).context("unsupported private key type")?;
	Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Generates the self-signed fallback certificate served when SNI matches
/// nothing.
pub fn self_signed(common_name: &str) -> anyhow::Result<Arc<CertifiedKey>> {
	let rcgen::CertifiedKey { cert, key_pair } =
		rcgen::generate_simple_self_signed(vec![common_name.to_string()])?;
	let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
	let signing_key = any_supported_type(&key)?;
	Ok(Arc::new(CertifiedKey::new(
		vec![cert.der().clone()],
		signing_key,
	)))
}

/// Resolver plugs the table into rustls SNI resolution, falling back to the
/// self-signed certificate when nothing matches.
#[derive(Debug)]
pub struct Resolver {
	pub table: Arc<Table>,
	pub fallback: Arc<CertifiedKey>,
}

impl ResolvesServerCert for Resolver {
	fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
		let name = client_hello.server_name().unwrap_or_default();
		self
			.table
			.get(name, client_hello.signature_schemes())
			.or_else(|| Some(self.fallback.clone()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn generate(sans: &[&str]) -> Arc<CertifiedKey> {
		let rcgen::CertifiedKey { cert, key_pair } =
			rcgen::generate_simple_self_signed(
				sans.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
			)
			.unwrap();
		from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes()).unwrap()
	}

	const TLS13_ECDSA: &[SignatureScheme] = &[SignatureScheme::ECDSA_NISTP256_SHA256];

	#[test]
	fn empty_table() {
		let table = Table::default();
		assert!(table.get("example.com", TLS13_ECDSA).is_none());
	}

	#[test]
	fn exact_match_wins_over_wildcard() {
		let table = Table::default();
		let exact = generate(&["example.com"]);
		let wildcard = generate(&["*.example.com"]);
		table.set(vec![exact.clone(), wildcard.clone()]);

		let got = table.get("example.com", TLS13_ECDSA).unwrap();
		assert!(Arc::ptr_eq(&got, &exact));
	}

	#[test]
	fn wildcard_matches_single_label_only() {
		let table = Table::default();
		let wildcard = generate(&["*.example.com"]);
		table.set(vec![wildcard.clone()]);

		// uppercase server name is lowercased first
		let got = table.get("www.Example.com", TLS13_ECDSA).unwrap();
		assert!(Arc::ptr_eq(&got, &wildcard));

		// wildcard replaces exactly one label
		assert!(table.get("example.com", TLS13_ECDSA).is_none());
		assert!(table.get("a.b.example.com", TLS13_ECDSA).is_none());
	}

	#[test]
	fn unsupported_signature_schemes_are_skipped() {
		let table = Table::default();
		// rcgen generates ECDSA P-256 keys
		table.set(vec![generate(&["example.com"])]);

		assert!(
			table
				.get("example.com", &[SignatureScheme::RSA_PKCS1_SHA256])
				.is_none()
		);
		// no schemes offered means any certificate is acceptable
		assert!(table.get("example.com", &[]).is_some());
	}

	#[test]
	fn cleared_table_returns_nothing() {
		let table = Table::default();
		table.set(vec![generate(&["example.com"])]);
		assert!(table.get("example.com", TLS13_ECDSA).is_some());
		table.set(Vec::new());
		assert!(table.get("example.com", TLS13_ECDSA).is_none());
	}
}
