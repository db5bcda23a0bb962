use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::{HeaderValue, StatusCode, header};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::authn::{AuthState, OidcVerifier, oidc_auth, trusted_subject};
use crate::errors::Error;
use crate::fleet::FleetUseCase;
use crate::handlers::fleet::FleetState;
use crate::handlers::forward::ForwardState;
use crate::handlers::local::AgentState;
use crate::proxy::RpcProxy;
use crate::telemetry::SharedMetrics;

/// Budget for in-flight requests after a shutdown signal.
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(30);

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

pub struct ServerParts {
	pub fleet: Arc<FleetUseCase>,
	pub proxy: Arc<RpcProxy>,
	pub verifier: Arc<OidcVerifier>,
	pub metrics: SharedMetrics,
	/// CORS allow-list; empty allows any origin.
	pub allowed_origins: Vec<String>,
}

/// The public listener's router: fleet RPCs served locally, resource and
/// runtime RPCs forwarded through the proxy, plus the non-RPC endpoints.
/// OIDC authentication wraps everything except the public carve-outs.
pub fn server_router(parts: ServerParts) -> anyhow::Result<Router> {
	let fleet_state = FleetState {
		fleet: parts.fleet.clone(),
	};
	let misc = Router::new()
		.route("/healthz", get(healthz))
		.route("/metrics", get(metrics_text))
		.with_state(parts.metrics.clone());
	let manifest = Router::new()
		.route("/fleet/manifest/{token}", get(manifest_yaml))
		.with_state(fleet_state.clone());

	let router = crate::handlers::fleet::router(fleet_state)
		.merge(crate::handlers::forward::router(ForwardState {
			proxy: parts.proxy.clone(),
		}))
		.merge(misc)
		.merge(manifest)
		.layer(axum::middleware::from_fn_with_state(
			AuthState {
				verifier: parts.verifier.clone(),
			},
			oidc_auth,
		))
		.layer(cors_layer(&parts.allowed_origins)?);
	Ok(router)
}

/// The agent's loopback router: the same RPC surface served locally, behind
/// the trusted-subject boundary.
pub fn agent_router(state: AgentState) -> Router {
	crate::handlers::local::router(state)
		.layer(axum::middleware::from_fn(trusted_subject))
}

fn cors_layer(allowed_origins: &[String]) -> anyhow::Result<CorsLayer> {
	if allowed_origins.is_empty() {
		return Ok(CorsLayer::new()
			.allow_origin(Any)
			.allow_methods(Any)
			.allow_headers(Any));
	}
	let origins: Result<Vec<HeaderValue>, _> = allowed_origins
		.iter()
		.map(|o| HeaderValue::from_str(o))
		.collect();
	let origins = origins.map_err(|e| anyhow::anyhow!("invalid allowed origin: {e}"))?;
	Ok(CorsLayer::new()
		.allow_origin(AllowOrigin::list(origins))
		.allow_methods(Any)
		.allow_headers(Any))
}

async fn healthz() -> &'static str {
	"ok"
}

async fn metrics_text(State(metrics): State<SharedMetrics>) -> Response {
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
		.body(axum::body::Body::from(metrics.encode_text()))
		.expect("static response")
}

/// `GET /fleet/manifest/{token}`: the only authentication is the HMAC token
/// in the path. Rejections are deliberately uniform.
async fn manifest_yaml(State(state): State<FleetState>, Path(token): Path<String>) -> Response {
	match state.fleet.manifest_for_token(&token) {
		Ok(yaml) => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/yaml")
			.body(axum::body::Body::from(yaml))
			.expect("static response"),
		Err(Error::InvalidToken) => Response::builder()
			.status(StatusCode::UNAUTHORIZED)
			.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(axum::body::Body::from("invalid or expired token"))
			.expect("static response"),
		Err(e) => crate::handlers::RpcError::from(e).into_response(),
	}
}

/// Serves a router until shutdown, allowing `GRACEFUL_SHUTDOWN` for
/// in-flight requests to drain. The listener speaks HTTP/1.1 and h2c.
pub async fn serve(
	listener: TcpListener,
	router: Router,
	shutdown: CancellationToken,
) -> std::io::Result<()> {
	let graceful = {
		let shutdown = shutdown.clone();
		async move { shutdown.cancelled().await }
	};
	let server = axum::serve(listener, router)
		.with_graceful_shutdown(graceful)
		.into_future();
	tokio::select! {
		res = server => res,
		_ = async {
			shutdown.cancelled().await;
			tokio::time::sleep(GRACEFUL_SHUTDOWN).await;
		} => {
			warn!("graceful shutdown window elapsed; dropping remaining connections");
			Ok(())
		},
	}
}

#[cfg(test)]
mod tests {
	use axum::body::Body;
	use http::Request;
	use tower::ServiceExt;

	use super::*;
	use crate::config::ManifestConfig;
	use crate::pki::{Ca, MANIFEST_TOKEN_LABEL};
	use crate::telemetry::Metrics;
	use crate::tunnel::{TunnelOptions, TunnelProvider};

	fn fleet_state() -> FleetState {
		let ca = Arc::new(Ca::generate().unwrap());
		let hmac = ca.derive_hmac_key(MANIFEST_TOKEN_LABEL).unwrap();
		let provider = TunnelProvider::new(
			ca,
			TunnelOptions::default(),
			Arc::new(Metrics::new()),
		);
		let fleet = FleetUseCase::new(
			provider,
			&hmac,
			&ManifestConfig {
				server_url: "https://fleet.example.com".into(),
				tunnel_url: "tunnel.example.com:8300".into(),
			},
			None,
		)
		.unwrap();
		FleetState {
			fleet: Arc::new(fleet),
		}
	}

	fn manifest_router(state: FleetState) -> Router {
		Router::new()
			.route("/fleet/manifest/{token}", get(manifest_yaml))
			.with_state(state)
	}

	#[tokio::test]
	async fn manifest_get_serves_yaml_for_valid_token() {
		let state = fleet_state();
		let url = state.fleet.issue_manifest_url("dev", "alice").unwrap();
		let token = url.rsplit('/').next().unwrap().to_string();
		let router = manifest_router(state);

		let resp = router
			.oneshot(
				Request::builder()
					.uri(format!("/fleet/manifest/{token}"))
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/yaml");
		let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
		let yaml = std::str::from_utf8(&body).unwrap();
		assert!(yaml.contains("kind: Deployment"));
		assert!(yaml.contains("fleetgate.io/cluster: dev"));
	}

	#[tokio::test]
	async fn manifest_get_is_opaque_for_bad_tokens() {
		let router = manifest_router(fleet_state());
		for bad in ["nonsense", "YQ.YQ", "a.b.c"] {
			let resp = router
				.clone()
				.oneshot(
					Request::builder()
						.uri(format!("/fleet/manifest/{bad}"))
						.body(Body::empty())
						.unwrap(),
				)
				.await
				.unwrap();
			assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
			let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
			assert_eq!(&body[..], b"invalid or expired token");
		}
	}

	#[test]
	fn cors_rejects_malformed_origins() {
		assert!(cors_layer(&[]).is_ok());
		assert!(cors_layer(&["https://console.example.com".to_string()]).is_ok());
		assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
	}
}
