use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_lc_rs::hmac;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use fleet_core::{Strng, strng};

use crate::errors::Error;

/// How long an issued manifest token stays valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(3600);
/// Tolerated clock skew between issuer and verifier.
pub const CLOCK_SKEW: Duration = Duration::from_secs(300);

#[derive(serde::Serialize, serde::Deserialize)]
struct Claims {
	sub: String,
	cluster: String,
	iat: i64,
	exp: i64,
}

/// Stateless HMAC-SHA256 manifest tokens:
/// `base64url(payload_json) "." base64url(hmac(payload_json))`.
///
/// No server-side token store exists; the key is derived from the CA, so a
/// restart keeps outstanding tokens valid.
pub struct TokenSigner {
	key: hmac::Key,
}

impl std::fmt::Debug for TokenSigner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenSigner").finish_non_exhaustive()
	}
}

impl TokenSigner {
	pub fn new(key: &[u8; 32]) -> Self {
		TokenSigner {
			key: hmac::Key::new(hmac::HMAC_SHA256, key),
		}
	}

	pub fn issue(&self, cluster: &str, user: &str) -> String {
		self.issue_at(cluster, user, unix_now())
	}

	pub(crate) fn issue_at(&self, cluster: &str, user: &str, now: i64) -> String {
		let claims = Claims {
			sub: user.to_string(),
			cluster: cluster.to_string(),
			iat: now,
			exp: now + TOKEN_TTL.as_secs() as i64,
		};
		let payload = serde_json::to_vec(&claims).expect("claims always serialize");
		let sig = hmac::sign(&self.key, &payload);
		format!(
			"{}.{}",
			URL_SAFE_NO_PAD.encode(&payload),
			URL_SAFE_NO_PAD.encode(sig.as_ref())
		)
	}

	/// Verifies a token and returns `(cluster, subject)`.
	///
	/// Every failure is the same opaque `Error::InvalidToken`: the verifier
	/// must not act as an oracle for which check rejected the token.
	pub fn verify(&self, token: &str) -> Result<(Strng, Strng), Error> {
		self.verify_at(token, unix_now())
	}

	pub(crate) fn verify_at(&self, token: &str, now: i64) -> Result<(Strng, Strng), Error> {
		let mut parts = token.split('.');
		let (payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
			(Some(p), Some(s), None) => (p, s),
			_ => return Err(Error::InvalidToken),
		};
		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|_| Error::InvalidToken)?;
		let sig = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|_| Error::InvalidToken)?;
		hmac::verify(&self.key, &payload, &sig).map_err(|_| Error::InvalidToken)?;
		let claims: Claims = serde_json::from_slice(&payload).map_err(|_| Error::InvalidToken)?;

		let skew = CLOCK_SKEW.as_secs() as i64;
		let ttl = TOKEN_TTL.as_secs() as i64;
		if now > claims.exp {
			return Err(Error::InvalidToken);
		}
		if claims.iat > now + skew {
			return Err(Error::InvalidToken);
		}
		if now - claims.iat > ttl + skew {
			return Err(Error::InvalidToken);
		}
		Ok((strng::new(&claims.cluster), strng::new(&claims.sub)))
	}
}

fn unix_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_secs() as i64
}
