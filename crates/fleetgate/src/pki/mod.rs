mod ca;

pub use ca::{Ca, MANIFEST_TOKEN_LABEL, derive_auth, provide_ca};

/// Options for the CSR an agent submits at registration.
pub struct CsrOptions {
	pub common_name: String,
}

pub struct CertSign {
	pub csr_pem: String,
	pub key_pem: String,
}

impl CsrOptions {
	pub fn generate(&self) -> anyhow::Result<CertSign> {
		use rcgen::{CertificateParams, DistinguishedName, DnType};
		let kp = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let key_pem = kp.serialize_pem();
		let mut params = CertificateParams::default();
		params.key_identifier_method = rcgen::KeyIdMethod::Sha256;
		// rcgen defaults the CN to "rcgen self signed cert"; replace it with
		// the agent identity the server will copy into the signed cert.
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, &self.common_name);
		params.distinguished_name = dn;
		let csr_pem = params.serialize_request(&kp)?.pem()?;

		Ok(CertSign { csr_pem, key_pem })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn csr_roundtrips_through_signing() {
		let ca = Ca::generate().unwrap();
		let csr = CsrOptions {
			common_name: "agent-host-1".into(),
		}
		.generate()
		.unwrap();
		let cert_pem = ca.sign_csr(&csr.csr_pem).unwrap();
		assert!(cert_pem.contains("BEGIN CERTIFICATE"));

		let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).unwrap();
		let cert = pem.parse_x509().unwrap();
		let cn = cert
			.subject()
			.iter_common_name()
			.next()
			.unwrap()
			.as_str()
			.unwrap();
		assert_eq!(cn, "agent-host-1");
	}
}
