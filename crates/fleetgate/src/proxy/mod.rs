use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_core::{Strng, strng};
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{Code, DomainError, Error};
use crate::identity::UserInfo;
use crate::rpc::{SharedTransport, UpstreamClient, shared_transport};
use crate::telemetry::SharedMetrics;
use crate::tunnel::{DEFAULT_WAIT_FOR, TunnelProvider};

/// Externally supplied leadership capability. In a single-replica
/// deployment the default `AlwaysLeader` is used.
pub trait LeaderElector: Send + Sync + 'static {
	fn is_leader(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLeader;

impl LeaderElector for AlwaysLeader {
	fn is_leader(&self) -> bool {
		true
	}
}

/// Forwards RPCs to the owning agent over its reverse tunnel. Keeps one
/// typed client per cluster over a shared transport; upstream status codes
/// pass through unchanged in both directions.
pub struct RpcProxy {
	provider: Arc<TunnelProvider>,
	transport: SharedTransport,
	clients: Mutex<HashMap<Strng, UpstreamClient>>,
	leader: Arc<dyn LeaderElector>,
	wait_for: Duration,
	metrics: SharedMetrics,
}

impl std::fmt::Debug for RpcProxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RpcProxy").finish_non_exhaustive()
	}
}

impl RpcProxy {
	pub fn new(
		provider: Arc<TunnelProvider>,
		leader: Arc<dyn LeaderElector>,
		metrics: SharedMetrics,
	) -> Self {
		RpcProxy {
			provider,
			transport: shared_transport(),
			clients: Mutex::new(HashMap::new()),
			leader,
			wait_for: DEFAULT_WAIT_FOR,
			metrics,
		}
	}

	/// The caller must be authenticated before anything else happens; an
	/// anonymous forward must not even resolve the tunnel.
	fn require_subject<'a>(user: Option<&'a UserInfo>) -> Result<&'a UserInfo, Error> {
		match user {
			Some(u) if !u.subject.trim().is_empty() => Ok(u),
			_ => Err(DomainError::new(
				Code::Unauthenticated,
				"no subject available for upstream call",
			)
			.into()),
		}
	}

	async fn upstream(&self, cluster: &str) -> Result<UpstreamClient, Error> {
		if !self.leader.is_leader() {
			return Err(Error::unavailable("not leader"));
		}
		let base = self.provider.agent_base_url(cluster, self.wait_for).await?;
		Ok(self.cached_client(cluster, &base))
	}

	/// Lookup-or-create with the check under one short lock. A cluster's
	/// base URL only changes on eviction + re-registration, in which case
	/// the stale client is replaced in place.
	fn cached_client(&self, cluster: &str, base: &str) -> UpstreamClient {
		let mut clients = self.clients.lock().expect("client cache poisoned");
		if let Some(existing) = clients.get(cluster) {
			if existing.base() == base {
				return existing.clone();
			}
		}
		let client = UpstreamClient::new(self.transport.clone(), base);
		clients.insert(strng::new(cluster), client.clone());
		client
	}

	pub async fn unary<Req: Serialize, Resp: DeserializeOwned>(
		&self,
		user: Option<&UserInfo>,
		cluster: &str,
		path: &str,
		req: &Req,
	) -> Result<Resp, Error> {
		let user = Self::require_subject(user)?;
		let client = self.upstream(cluster).await?;
		self.metrics.proxied_rpcs.inc();
		client.unary(Some(user), path, req).await
	}

	pub async fn streaming<Req: Serialize, Item: DeserializeOwned + Send + Default + 'static>(
		&self,
		user: Option<&UserInfo>,
		cluster: &str,
		path: &str,
		req: &Req,
	) -> Result<BoxStream<'static, Result<Item, Error>>, Error> {
		let user = Self::require_subject(user)?;
		let client = self.upstream(cluster).await?;
		self.metrics.proxied_rpcs.inc();
		client.streaming(Some(user), path, req).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pki::Ca;
	use crate::telemetry::Metrics;
	use crate::tunnel::TunnelOptions;

	struct NeverLeader;
	impl LeaderElector for NeverLeader {
		fn is_leader(&self) -> bool {
			false
		}
	}

	fn proxy_with(leader: Arc<dyn LeaderElector>) -> RpcProxy {
		let ca = Arc::new(Ca::generate().unwrap());
		let provider =
			TunnelProvider::new(ca, TunnelOptions::default(), Arc::new(Metrics::new()));
		RpcProxy::new(provider, leader, Arc::new(Metrics::new()))
	}

	#[tokio::test]
	async fn missing_subject_fails_before_tunnel_resolution() {
		let proxy = proxy_with(Arc::new(AlwaysLeader));
		// "ghost" is unknown; if the tunnel were resolved first this would
		// be ClusterNotFound instead of Unauthenticated.
		let err = proxy
			.unary::<_, serde_json::Value>(None, "ghost", "/resource.v1.Resource/List", &())
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::Unauthenticated);
	}

	#[tokio::test]
	async fn non_leader_refuses_to_forward() {
		let proxy = proxy_with(Arc::new(NeverLeader));
		let user = UserInfo::new("alice");
		let err = proxy
			.unary::<_, serde_json::Value>(
				Some(&user),
				"dev",
				"/resource.v1.Resource/List",
				&(),
			)
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::Unavailable);
		assert!(err.to_string().contains("not leader"));
	}

	#[tokio::test]
	async fn unknown_cluster_is_not_found() {
		let proxy = proxy_with(Arc::new(AlwaysLeader));
		let user = UserInfo::new("alice");
		let err = proxy
			.unary::<_, serde_json::Value>(
				Some(&user),
				"ghost",
				"/resource.v1.Resource/List",
				&(),
			)
			.await
			.unwrap_err();
		assert!(matches!(err, Error::ClusterNotFound(_)), "got {err}");
	}

	#[test]
	fn client_cache_reuses_and_replaces() {
		let proxy = proxy_with(Arc::new(AlwaysLeader));
		let a = proxy.cached_client("dev", "http://127.0.0.1:21001");
		let b = proxy.cached_client("dev", "http://127.0.0.1:21001");
		assert_eq!(a.base(), b.base());
		assert_eq!(proxy.clients.lock().unwrap().len(), 1);

		let c = proxy.cached_client("dev", "http://127.0.0.1:21002");
		assert_eq!(c.base(), "http://127.0.0.1:21002");
		assert_eq!(proxy.clients.lock().unwrap().len(), 1);
	}
}
