use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::routing::post;
use itertools::Itertools;

use crate::fleet::FleetUseCase;
use crate::handlers::{RpcError, require_user};
use crate::identity::UserInfo;
use crate::rpc::paths;
use crate::rpc::types::{
	ClusterSummary, GetAgentManifestRequest, GetAgentManifestResponse, ListClustersResponse,
	RegisterRequest, RegisterResponse,
};

#[derive(Clone)]
pub struct FleetState {
	pub fleet: Arc<FleetUseCase>,
}

/// Fleet service: served by the control server only.
pub fn router(state: FleetState) -> axum::Router {
	axum::Router::new()
		.route(paths::FLEET_LIST_CLUSTERS, post(list_clusters))
		.route(paths::FLEET_REGISTER, post(register))
		.route(paths::FLEET_GET_AGENT_MANIFEST, post(get_agent_manifest))
		.with_state(state)
}

async fn list_clusters(
	State(state): State<FleetState>,
	user: Option<axum::Extension<UserInfo>>,
) -> Result<Json<ListClustersResponse>, RpcError> {
	require_user(user)?;
	let clusters = state
		.fleet
		.list_clusters()
		.into_values()
		.sorted_by(|a, b| a.name.cmp(&b.name))
		.map(|c| ClusterSummary {
			name: c.name,
			endpoint: c.endpoint.to_string(),
			agent_version: c.agent_version,
			connected: c.connected,
		})
		.collect();
	Ok(Json(ListClustersResponse { clusters }))
}

async fn register(
	State(state): State<FleetState>,
	Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, RpcError> {
	let registration = state
		.fleet
		.register(&req.cluster, &req.agent_id, &req.agent_version, &req.csr_pem)
		.await?;
	Ok(Json(RegisterResponse {
		endpoint: registration.endpoint,
		cert_pem: registration.cert_pem,
		ca_cert_pem: registration.ca_cert_pem,
		server_version: registration.server_version,
	}))
}

async fn get_agent_manifest(
	State(state): State<FleetState>,
	user: Option<axum::Extension<UserInfo>>,
	Json(req): Json<GetAgentManifestRequest>,
) -> Result<Json<GetAgentManifestResponse>, RpcError> {
	let user = require_user(user)?;
	let url = state
		.fleet
		.issue_manifest_url(&req.cluster, &user.subject)?;
	Ok(Json(GetAgentManifestResponse { url }))
}
