use std::io::Write;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rcgen::{
	BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
	DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;
use tracing::info;

use crate::errors::Error;

/// HKDF info label for the manifest-token HMAC key.
pub const MANIFEST_TOKEN_LABEL: &[u8] = b"fleet-manifest-token";

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca-key.pem";

const CA_VALIDITY: time::Duration = time::Duration::days(3650);
const SERVER_CERT_VALIDITY: time::Duration = time::Duration::days(365);
const CLIENT_CERT_VALIDITY: time::Duration = time::Duration::hours(24);
// Issued certs are backdated to tolerate clock skew between server and agents.
const CLIENT_CERT_BACKDATE: time::Duration = time::Duration::minutes(5);

/// The fleet certificate authority. Signs agent client certs and the
/// server's own TLS cert, and is the root of the manifest-token HMAC key
/// derivation.
pub struct Ca {
	issuer: Issuer<'static, KeyPair>,
	cert_pem: String,
	key_pem: String,
	key_der: Vec<u8>,
}

impl std::fmt::Debug for Ca {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Ca").finish_non_exhaustive()
	}
}

impl Ca {
	/// Generates a fresh ECDSA P-256 CA with a self-signed 10-year cert.
	pub fn generate() -> Result<Ca, Error> {
		let kp = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
			.map_err(|e| Error::internal(format!("generate CA key: {e}")))?;
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, "fleet-ca");
		params.distinguished_name = dn;
		params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
		params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
		params.not_before = OffsetDateTime::now_utc();
		params.not_after = params.not_before + CA_VALIDITY;
		let cert = params
			.self_signed(&kp)
			.map_err(|e| Error::internal(format!("self-sign CA cert: {e}")))?;
		Self::assemble(cert.pem(), kp)
	}

	/// Loads a persisted CA, verifying that the certificate is a CA cert and
	/// that the private key matches its public key.
	pub fn load(cert_pem: &str, key_pem: &str) -> Result<Ca, Error> {
		let kp =
			KeyPair::from_pem(key_pem).map_err(|e| Error::CorruptCa(format!("CA key: {e}")))?;
		let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
			.map_err(|e| Error::CorruptCa(format!("CA cert PEM: {e}")))?;
		let cert = pem
			.parse_x509()
			.map_err(|e| Error::CorruptCa(format!("CA cert: {e}")))?;
		let is_ca = cert
			.basic_constraints()
			.map_err(|e| Error::CorruptCa(format!("CA basic constraints: {e}")))?
			.map(|bc| bc.value.ca)
			.unwrap_or(false);
		if !is_ca {
			return Err(Error::CorruptCa("certificate is not a CA".to_string()));
		}
		if cert.public_key().raw != kp.public_key_raw() {
			return Err(Error::CorruptCa(
				"private key does not match certificate".to_string(),
			));
		}
		Self::assemble(cert_pem.to_string(), kp)
	}

	fn assemble(cert_pem: String, kp: KeyPair) -> Result<Ca, Error> {
		let key_pem = kp.serialize_pem();
		let key_der = kp.serialize_der();
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, kp)
			.map_err(|e| Error::CorruptCa(format!("CA issuer: {e}")))?;
		Ok(Ca {
			issuer,
			cert_pem,
			key_pem,
			key_der,
		})
	}

	pub fn cert_pem(&self) -> &str {
		&self.cert_pem
	}

	pub fn key_pem(&self) -> &str {
		&self.key_pem
	}

	/// Signs a PKCS#10 CSR into a 24-hour client-auth certificate. The CN is
	/// taken from the CSR; parsing also checks the CSR's self-signature.
	pub fn sign_csr(&self, csr_pem: &str) -> Result<String, Error> {
		let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
			.map_err(|e| Error::invalid_input("csr", format!("invalid CSR: {e}")))?;
		let now = OffsetDateTime::now_utc();
		csr.params.not_before = now - CLIENT_CERT_BACKDATE;
		csr.params.not_after = now + CLIENT_CERT_VALIDITY;
		csr.params.serial_number = Some(SerialNumber::from(rand::random::<[u8; 16]>().to_vec()));
		csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
		csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
		let cert = csr
			.signed_by(&self.issuer)
			.map_err(|e| Error::invalid_input("csr", format!("sign CSR: {e}")))?;
		Ok(cert.pem())
	}

	/// Issues a fresh server-auth cert with the given SANs. Called on every
	/// server start; server certs are never persisted.
	pub fn generate_server_cert(&self, hosts: &[String]) -> Result<(String, String), Error> {
		let kp = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
			.map_err(|e| Error::internal(format!("generate server key: {e}")))?;
		let mut params = CertificateParams::new(hosts.to_vec())
			.map_err(|e| Error::internal(format!("server cert SANs: {e}")))?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, "fleet-server");
		params.distinguished_name = dn;
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.not_before = OffsetDateTime::now_utc();
		params.not_after = params.not_before + SERVER_CERT_VALIDITY;
		let cert = params
			.signed_by(&kp, &self.issuer)
			.map_err(|e| Error::internal(format!("sign server cert: {e}")))?;
		Ok((cert.pem(), kp.serialize_pem()))
	}

	/// Derives a 32-byte HMAC key from the CA private key via HKDF-SHA256.
	/// Deterministic for the same CA, so restarts keep issued manifest
	/// tokens valid.
	pub fn derive_hmac_key(&self, label: &[u8]) -> Result<[u8; 32], Error> {
		use aws_lc_rs::hkdf;

		struct OutLen(usize);
		impl hkdf::KeyType for OutLen {
			fn len(&self) -> usize {
				self.0
			}
		}

		let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
		let prk = salt.extract(&self.key_der);
		let info = [label];
		let okm = prk
			.expand(&info, OutLen(32))
			.map_err(|_| Error::internal("HKDF expand"))?;
		let mut out = [0u8; 32];
		okm.fill(&mut out).map_err(|_| Error::internal("HKDF fill"))?;
		Ok(out)
	}
}

/// Computes the tunnel-auth shared secret from a signed certificate:
/// `agentID:base64url(sha256(cert_der))[..24]`. Both sides hold the cert, so
/// both derive the same credential without a dedicated exchange.
pub fn derive_auth(agent_id: &str, cert_pem: &str) -> Result<String, Error> {
	let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
		.map_err(|e| Error::invalid_input("cert", format!("invalid certificate PEM: {e}")))?;
	let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, &pem.contents);
	let encoded = URL_SAFE_NO_PAD.encode(digest.as_ref());
	Ok(format!("{agent_id}:{}", &encoded[..24]))
}

/// Loads the CA from `dir`, generating and persisting a fresh one when the
/// directory is empty. A leftover key without a cert means a crash landed
/// between the two writes; the material was never used, so it is replaced.
/// A cert without its key is unrecoverable.
pub fn provide_ca(dir: &Path) -> Result<Ca, Error> {
	let cert_path = dir.join(CA_CERT_FILE);
	let key_path = dir.join(CA_KEY_FILE);
	let have_cert = cert_path.exists();
	let have_key = key_path.exists();

	if have_cert && have_key {
		let cert_pem = fs_err::read_to_string(&cert_path)
			.map_err(|e| Error::CorruptCa(format!("read {CA_CERT_FILE}: {e}")))?;
		let key_pem = fs_err::read_to_string(&key_path)
			.map_err(|e| Error::CorruptCa(format!("read {CA_KEY_FILE}: {e}")))?;
		return Ca::load(&cert_pem, &key_pem);
	}
	if have_cert {
		return Err(Error::CorruptCa(format!(
			"{CA_CERT_FILE} present without {CA_KEY_FILE}"
		)));
	}

	let ca = Ca::generate()?;
	fs_err::create_dir_all(dir).map_err(|e| Error::internal(format!("create CA dir: {e}")))?;
	// Key first, then cert: a crash in between leaves only an unused key,
	// which the load path above treats as absent.
	write_atomic(dir, &key_path, ca.key_pem().as_bytes())?;
	write_atomic(dir, &cert_path, ca.cert_pem().as_bytes())?;
	info!("generated new fleet CA in {}", dir.display());
	Ok(ca)
}

fn write_atomic(dir: &Path, path: &Path, contents: &[u8]) -> Result<(), Error> {
	let mut tmp = tempfile::NamedTempFile::new_in(dir)
		.map_err(|e| Error::internal(format!("create temp file: {e}")))?;
	tmp
		.write_all(contents)
		.map_err(|e| Error::internal(format!("write {}: {e}", path.display())))?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
			.map_err(|e| Error::internal(format!("chmod {}: {e}", path.display())))?;
	}
	tmp
		.persist(path)
		.map_err(|e| Error::internal(format!("persist {}: {e}", path.display())))?;
	Ok(())
}
