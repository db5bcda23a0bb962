mod oidc;

pub use oidc::OidcVerifier;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::errors::{Code, DomainError, Error};
use crate::handlers::RpcError;
use crate::identity::UserInfo;
use crate::rpc::{SUBJECT_HEADER, paths};

/// Paths reachable without a bearer token: health and metrics probes, the
/// token-authenticated manifest download, and agent registration (agents
/// hold no OIDC identity; the CSR flow plus the tunnel's derived secret is
/// their authenticator).
pub fn is_public_path(path: &str) -> bool {
	path == "/healthz"
		|| path == "/metrics"
		|| path == paths::FLEET_REGISTER
		|| path.starts_with("/fleet/manifest/")
}

#[derive(Clone)]
pub struct AuthState {
	pub verifier: Arc<OidcVerifier>,
}

/// Server-side boundary: `Authorization: Bearer <OIDC ID token>` becomes a
/// request-scoped `UserInfo`. The sole producer of identity on the public
/// listener.
pub async fn oidc_auth(
	State(state): State<AuthState>,
	mut req: Request,
	next: Next,
) -> Response {
	if is_public_path(req.uri().path()) {
		return next.run(req).await;
	}
	let token = bearer_token(req.headers());
	let user = match token {
		Some(token) => state.verifier.verify(&token),
		None => Err(unauthenticated("missing bearer token")),
	};
	match user {
		Ok(user) => {
			// Strip the credential so nothing downstream can replay it.
			req.headers_mut().remove(http::header::AUTHORIZATION);
			req.extensions_mut().insert(user);
			next.run(req).await
		},
		Err(e) => {
			debug!("request rejected: {e}");
			RpcError::from(e).into_response()
		},
	}
}

/// Agent-side boundary: trusts `X-Fleet-Subject` because the loopback
/// listener is reachable only through the authenticated reverse tunnel.
/// Requests without the header are refused outright.
pub async fn trusted_subject(mut req: Request, next: Next) -> Response {
	let subject = req
		.headers()
		.get(SUBJECT_HEADER)
		.and_then(|v| v.to_str().ok())
		.filter(|s| !s.trim().is_empty())
		.map(str::to_string);
	match subject {
		Some(subject) => {
			req.extensions_mut().insert(UserInfo::new(subject));
			next.run(req).await
		},
		None => RpcError::from(unauthenticated("missing trusted subject header")).into_response(),
	}
}

fn unauthenticated(message: &str) -> Error {
	DomainError::new(Code::Unauthenticated, message).into()
}

fn bearer_token(headers: &http::HeaderMap) -> Option<String> {
	let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
	let (scheme, token) = value.split_once(' ')?;
	if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
		return None;
	}
	Some(token.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn public_paths() {
		assert!(is_public_path("/healthz"));
		assert!(is_public_path("/metrics"));
		assert!(is_public_path("/fleet/manifest/abc.def"));
		assert!(is_public_path(paths::FLEET_REGISTER));
		assert!(!is_public_path(paths::FLEET_LIST_CLUSTERS));
		assert!(!is_public_path(paths::RESOURCE_LIST));
	}

	#[test]
	fn bearer_extraction() {
		let mut headers = http::HeaderMap::new();
		assert!(bearer_token(&headers).is_none());
		headers.insert(
			http::header::AUTHORIZATION,
			http::HeaderValue::from_static("Bearer abc"),
		);
		assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
		headers.insert(
			http::header::AUTHORIZATION,
			http::HeaderValue::from_static("Basic abc"),
		);
		assert!(bearer_token(&headers).is_none());
	}
}
