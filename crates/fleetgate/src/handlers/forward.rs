//! Server-side forwarding handlers: every Resource and Runtime RPC is
//! relayed verbatim to the owning cluster's agent. Requests and responses
//! stay as raw JSON here so upstream status codes and payloads pass through
//! untouched.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;

use crate::errors::Error;
use crate::handlers::{RpcError, stream_response};
use crate::identity::UserInfo;
use crate::proxy::RpcProxy;
use crate::rpc::paths;

/// Server-streaming methods; everything else is unary.
const STREAMING_PATHS: &[&str] = &[
	paths::RESOURCE_WATCH,
	paths::RUNTIME_POD_LOG,
	paths::RUNTIME_EXECUTE_TTY,
	paths::RUNTIME_PORT_FORWARD,
];

/// Largest accepted request body.
const MAX_BODY: usize = 2_097_152;

#[derive(Clone)]
pub struct ForwardState {
	pub proxy: Arc<RpcProxy>,
}

pub fn router(state: ForwardState) -> axum::Router {
	axum::Router::new()
		.route("/resource.v1.Resource/{method}", post(forward))
		.route("/runtime.v1.Runtime/{method}", post(forward))
		.with_state(state)
}

async fn forward(
	State(state): State<ForwardState>,
	user: Option<axum::Extension<UserInfo>>,
	req: axum::extract::Request,
) -> Result<Response, RpcError> {
	let path = req.uri().path().to_string();
	let body = axum::body::to_bytes(req.into_body(), MAX_BODY)
		.await
		.map_err(|e| Error::invalid_input("request", format!("unreadable body: {e}")))?;
	let value: serde_json::Value = serde_json::from_slice(&body)
		.map_err(|e| Error::invalid_input("request", format!("invalid JSON: {e}")))?;
	let cluster = value
		.get("cluster")
		.and_then(|v| v.as_str())
		.filter(|c| !c.is_empty())
		.ok_or_else(|| Error::invalid_input("cluster", "is required"))?
		.to_string();
	let user = user.map(|e| e.0);

	if STREAMING_PATHS.contains(&path.as_str()) {
		let upstream = state
			.proxy
			.streaming::<_, serde_json::Value>(user.as_ref(), &cluster, &path, &value)
			.await?;
		Ok(stream_response(upstream))
	} else {
		let response: serde_json::Value = state
			.proxy
			.unary(user.as_ref(), &cluster, &path, &value)
			.await?;
		Ok(Json(response).into_response())
	}
}
