use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{Code, DomainError, Error};
use crate::identity::UserInfo;

#[derive(serde::Deserialize)]
struct DiscoveryDocument {
	jwks_uri: String,
}

struct Jwk {
	decoding: DecodingKey,
	validation: Validation,
}

/// Verifies OIDC ID tokens against the issuer's JWKS, fetched once at
/// startup. A verification failure is always `Unauthenticated`; the precise
/// reason goes to debug logs only.
pub struct OidcVerifier {
	issuer: String,
	keys: HashMap<String, Jwk>,
}

impl std::fmt::Debug for OidcVerifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OidcVerifier")
			.field("issuer", &self.issuer)
			.finish_non_exhaustive()
	}
}

impl OidcVerifier {
	/// Startup-time discovery: `{issuer}/.well-known/openid-configuration`,
	/// then the advertised JWKS. Failures here are fatal for the server.
	pub async fn discover(issuer: &str, client_id: &str) -> Result<Self, Error> {
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_provider_and_native_roots(crate::tunnel::tls_provider())
			.map_err(|e| Error::internal(format!("TLS roots for OIDC discovery: {e}")))?
			.https_or_http()
			.enable_http1()
			.build();
		let client: Client<_, Empty<Bytes>> =
			Client::builder(TokioExecutor::new()).build(https);

		let discovery_url = format!(
			"{}/.well-known/openid-configuration",
			issuer.trim_end_matches('/')
		);
		let doc: DiscoveryDocument =
			serde_json::from_slice(&fetch(&client, &discovery_url).await?)
				.map_err(|e| Error::internal(format!("OIDC discovery document: {e}")))?;
		let jwks: JwkSet = serde_json::from_slice(&fetch(&client, &doc.jwks_uri).await?)
			.map_err(|e| Error::internal(format!("JWKS: {e}")))?;
		Self::from_jwks(jwks, issuer, client_id)
	}

	/// Builds the verifier from an already-fetched key set.
	pub fn from_jwks(jwks: JwkSet, issuer: &str, client_id: &str) -> Result<Self, Error> {
		let mut keys = HashMap::new();
		let to_supported_alg = |key_algorithm: Option<KeyAlgorithm>| match key_algorithm {
			Some(alg) => alg.to_string().parse::<jsonwebtoken::Algorithm>().ok(),
			None => None,
		};
		for jwk in jwks.keys {
			let Some(alg) = to_supported_alg(jwk.common.key_algorithm) else {
				warn!(
					"JWK algorithm {:?} is not supported; tokens signed with it will be rejected",
					jwk.common.key_algorithm
				);
				continue;
			};
			let Some(kid) = jwk.common.key_id else {
				return Err(Error::internal("JWKS key is missing `kid`"));
			};
			let decoding = match &jwk.algorithm {
				AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
					.map_err(|e| Error::internal(format!("JWKS key {kid}: {e}")))?,
				AlgorithmParameters::EllipticCurve(ec) => {
					DecodingKey::from_ec_components(&ec.x, &ec.y)
						.map_err(|e| Error::internal(format!("JWKS key {kid}: {e}")))?
				},
				AlgorithmParameters::OctetKey(oct) => {
					let secret = URL_SAFE_NO_PAD
						.decode(oct.value.as_bytes())
						.map_err(|e| Error::internal(format!("JWKS key {kid}: {e}")))?;
					DecodingKey::from_secret(&secret)
				},
				other => {
					return Err(Error::internal(format!(
						"JWKS key {kid} uses unsupported parameters {other:?}"
					)));
				},
			};
			let mut validation = Validation::new(alg);
			validation.set_audience(&[client_id]);
			validation.set_issuer(&[issuer]);
			keys.insert(kid, Jwk {
				decoding,
				validation,
			});
		}
		if keys.is_empty() {
			return Err(Error::internal("JWKS contains no usable keys"));
		}
		Ok(OidcVerifier {
			issuer: issuer.to_string(),
			keys,
		})
	}

	/// Validates the bearer token and produces the caller identity: `sub`
	/// plus namespaced `groups`.
	pub fn verify(&self, token: &str) -> Result<UserInfo, Error> {
		let unauthenticated = || {
			Error::from(DomainError::new(
				Code::Unauthenticated,
				"invalid bearer token",
			))
		};
		let header = decode_header(token).map_err(|e| {
			debug!("token header rejected: {e}");
			unauthenticated()
		})?;
		let kid = header.kid.as_deref().ok_or_else(|| {
			debug!("token header has no kid");
			unauthenticated()
		})?;
		let key = self.keys.get(kid).ok_or_else(|| {
			debug!(%kid, "token signed with unknown key");
			unauthenticated()
		})?;
		let decoded = decode::<Map<String, Value>>(token, &key.decoding, &key.validation)
			.map_err(|e| {
				debug!("token rejected: {e}");
				unauthenticated()
			})?;

		let claims = decoded.claims;
		let subject = claims
			.get("sub")
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
			.ok_or_else(|| {
				debug!("token has no subject");
				unauthenticated()
			})?;
		let groups: Vec<String> = claims
			.get("groups")
			.and_then(Value::as_array)
			.map(|a| {
				a.iter()
					.filter_map(Value::as_str)
					.map(str::to_string)
					.collect()
			})
			.unwrap_or_default();
		Ok(UserInfo::with_oidc_groups(subject, groups))
	}
}

async fn fetch(
	client: &Client<
		hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
		Empty<Bytes>,
	>,
	url: &str,
) -> Result<Bytes, Error> {
	let request = http::Request::builder()
		.method(http::Method::GET)
		.uri(url)
		.body(Empty::new())
		.map_err(|e| Error::internal(format!("build request for {url}: {e}")))?;
	let response = client
		.request(request)
		.await
		.map_err(|e| Error::internal(format!("fetch {url}: {e}")))?;
	if !response.status().is_success() {
		return Err(Error::internal(format!(
			"fetch {url}: HTTP {}",
			response.status()
		)));
	}
	let body = response
		.into_body()
		.collect()
		.await
		.map_err(|e| Error::internal(format!("read {url}: {e}")))?;
	Ok(body.to_bytes())
}

#[cfg(test)]
mod tests {
	use jsonwebtoken::{EncodingKey, Header, encode};

	use super::*;

	const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

	fn jwks() -> JwkSet {
		let secret_b64 = URL_SAFE_NO_PAD.encode(SECRET);
		serde_json::from_value(serde_json::json!({
			"keys": [{
				"kty": "oct",
				"kid": "test-key",
				"alg": "HS256",
				"k": secret_b64,
			}]
		}))
		.unwrap()
	}

	fn verifier() -> OidcVerifier {
		OidcVerifier::from_jwks(jwks(), "https://issuer.test", "fleet").unwrap()
	}

	fn token(claims: serde_json::Value) -> String {
		let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
		header.kid = Some("test-key".into());
		encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
	}

	fn exp() -> i64 {
		(std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.unwrap()
			.as_secs()
			+ 600) as i64
	}

	#[test]
	fn valid_token_yields_user_with_groups() {
		let token = token(serde_json::json!({
			"iss": "https://issuer.test",
			"aud": "fleet",
			"sub": "alice",
			"groups": ["admins"],
			"exp": exp(),
		}));
		let user = verifier().verify(&token).unwrap();
		assert_eq!(user.subject.as_str(), "alice");
		assert!(user.groups.iter().any(|g| g == "oidc:admins"));
		assert!(user.groups.iter().any(|g| g == "system:authenticated"));
	}

	#[test]
	fn wrong_audience_or_issuer_rejected() {
		let v = verifier();
		for claims in [
			serde_json::json!({"iss": "https://other", "aud": "fleet", "sub": "a", "exp": exp()}),
			serde_json::json!({"iss": "https://issuer.test", "aud": "other", "sub": "a", "exp": exp()}),
			serde_json::json!({"iss": "https://issuer.test", "aud": "fleet", "sub": "a", "exp": 1}),
		] {
			let err = v.verify(&token(claims)).unwrap_err();
			assert_eq!(err.code(), Code::Unauthenticated);
		}
	}

	#[test]
	fn garbage_token_rejected() {
		assert_eq!(
			verifier().verify("not-a-token").unwrap_err().code(),
			Code::Unauthenticated
		);
	}
}
