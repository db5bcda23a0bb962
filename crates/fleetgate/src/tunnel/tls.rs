use std::io::{BufReader, Cursor};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::Error;

/// The one crypto provider this crate uses. Named explicitly because the
/// dependency graph links more than one rustls provider, which makes the
/// provider-less builders refuse to guess.
pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Installs the process-default provider. Call once at startup: libraries
/// that build rustls configs without naming a provider (the Kubernetes
/// client among them) need an unambiguous default.
pub fn install_default_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn pem_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
	let mut reader = BufReader::new(Cursor::new(pem.as_bytes()));
	let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
	let certs = certs.map_err(|e| Error::internal(format!("parse certificate PEM: {e}")))?;
	if certs.is_empty() {
		return Err(Error::internal("no certificates in PEM"));
	}
	Ok(certs)
}

fn pem_key(pem: &str) -> Result<PrivateKeyDer<'static>, Error> {
	let mut reader = BufReader::new(Cursor::new(pem.as_bytes()));
	rustls_pemfile::private_key(&mut reader)
		.map_err(|e| Error::internal(format!("parse key PEM: {e}")))?
		.ok_or_else(|| Error::internal("no private key in PEM"))
}

fn root_store(ca_pem: &str) -> Result<RootCertStore, Error> {
	let mut roots = RootCertStore::empty();
	for cert in pem_certs(ca_pem)? {
		roots
			.add(cert)
			.map_err(|e| Error::internal(format!("add CA root: {e}")))?;
	}
	Ok(roots)
}

/// mTLS server config for the tunnel listener: clients must present a cert
/// chaining to the fleet CA.
pub fn tunnel_server_config(
	cert_pem: &str,
	key_pem: &str,
	ca_pem: &str,
) -> Result<ServerConfig, Error> {
	let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
		Arc::new(root_store(ca_pem)?),
		provider(),
	)
	.build()
	.map_err(|e| Error::internal(format!("client cert verifier: {e}")))?;
	let config = ServerConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()
		.map_err(|e| Error::internal(format!("tunnel server TLS versions: {e}")))?
		.with_client_cert_verifier(verifier)
		.with_single_cert(pem_certs(cert_pem)?, pem_key(key_pem)?)
		.map_err(|e| Error::internal(format!("tunnel server TLS: {e}")))?;
	Ok(config)
}

/// Client config for an agent dialing the tunnel: trusts only the fleet CA
/// and authenticates with its freshly signed client cert.
pub fn tunnel_client_config(
	ca_pem: &str,
	cert_pem: &str,
	key_pem: &str,
) -> Result<ClientConfig, Error> {
	let config = ClientConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()
		.map_err(|e| Error::internal(format!("tunnel client TLS versions: {e}")))?
		.with_root_certificates(root_store(ca_pem)?)
		.with_client_auth_cert(pem_certs(cert_pem)?, pem_key(key_pem)?)
		.map_err(|e| Error::internal(format!("tunnel client TLS: {e}")))?;
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pki::{Ca, CsrOptions};

	#[test]
	fn configs_build_from_ca_material() {
		let ca = Ca::generate().unwrap();
		let (server_cert, server_key) = ca
			.generate_server_cert(&["localhost".to_string()])
			.unwrap();
		tunnel_server_config(&server_cert, &server_key, ca.cert_pem()).unwrap();

		let csr = CsrOptions {
			common_name: "agent".into(),
		}
		.generate()
		.unwrap();
		let client_cert = ca.sign_csr(&csr.csr_pem).unwrap();
		tunnel_client_config(ca.cert_pem(), &client_cert, &csr.key_pem).unwrap();
	}

	#[test]
	fn garbage_pem_is_rejected() {
		assert!(pem_certs("not pem").is_err());
		assert!(pem_key("not pem").is_err());
	}
}
