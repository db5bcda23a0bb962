use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fleet_core::{Strng, strng};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Error;
use crate::fleet::validate_cluster_name;
use crate::pki::{Ca, derive_auth};
use crate::telemetry::SharedMetrics;
use crate::tunnel::h2stream::H2Stream;

/// Default budget for the tunnel readiness probe.
pub const DEFAULT_WAIT_FOR: Duration = Duration::from_secs(3);

const PROBE_INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const PROBE_MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TunnelOptions {
	/// SANs for the tunnel listener's TLS cert.
	pub server_cert_hosts: Vec<String>,
	/// Loopback port range used for per-cluster endpoints.
	pub port_base: u16,
	pub port_range: u16,
}

impl Default for TunnelOptions {
	fn default() -> Self {
		TunnelOptions {
			server_cert_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
			port_base: 21000,
			port_range: 2000,
		}
	}
}

/// Public view of a managed cluster.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
	pub name: Strng,
	pub endpoint: SocketAddr,
	pub tunnel_user: String,
	pub agent_version: String,
	pub connected: bool,
}

#[derive(Clone)]
pub(crate) struct TunnelHandle {
	pub send: h2::client::SendRequest<Bytes>,
	pub shutdown: CancellationToken,
	generation: u64,
}

struct ClusterEntry {
	endpoint: SocketAddr,
	tunnel_user: String,
	tunnel_password: String,
	agent_version: String,
	listener_shutdown: CancellationToken,
	tunnel: Option<TunnelHandle>,
}

#[derive(Default)]
struct Inner {
	clusters: HashMap<Strng, ClusterEntry>,
	next_generation: u64,
}

/// Owns the `name → cluster` table, the per-cluster loopback endpoints, and
/// the live tunnel handles. The single mutex guards the table only; dials,
/// binds and probe waits all happen outside it.
pub struct TunnelProvider {
	ca: Arc<Ca>,
	opts: TunnelOptions,
	metrics: SharedMetrics,
	inner: Mutex<Inner>,
}

impl std::fmt::Debug for TunnelProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TunnelProvider").finish_non_exhaustive()
	}
}

impl TunnelProvider {
	pub fn new(ca: Arc<Ca>, opts: TunnelOptions, metrics: SharedMetrics) -> Arc<Self> {
		Arc::new(TunnelProvider {
			ca,
			opts,
			metrics,
			inner: Mutex::new(Inner::default()),
		})
	}

	pub fn ca(&self) -> &Arc<Ca> {
		&self.ca
	}

	pub fn options(&self) -> &TunnelOptions {
		&self.opts
	}

	pub fn ca_cert_pem(&self) -> &str {
		self.ca.cert_pem()
	}

	/// Signs the CSR and (re)binds the cluster's tunnel-user entry. A
	/// re-registration under the same name rotates the credentials and
	/// severs any live tunnel, enforcing at most one active tunnel per
	/// cluster.
	pub async fn register_cluster(
		self: &Arc<Self>,
		cluster: &str,
		agent_id: &str,
		agent_version: &str,
		csr_pem: &str,
	) -> Result<(SocketAddr, String), Error> {
		validate_cluster_name(cluster)?;
		if agent_id.trim().is_empty() {
			return Err(Error::invalid_input("agentId", "must not be empty"));
		}
		let cert_pem = self.ca.sign_csr(csr_pem)?;
		self.metrics.signed_csrs.inc();
		let auth = derive_auth(agent_id, &cert_pem)?;
		let (user, password) = auth
			.split_once(':')
			.map(|(u, p)| (u.to_string(), p.to_string()))
			.expect("derive_auth always produces user:password");

		let name = strng::new(cluster);
		// Rotate in place when the cluster already has an endpoint.
		{
			let mut inner = self.inner.lock().expect("cluster table poisoned");
			if let Some(entry) = inner.clusters.get_mut(&name) {
				if let Some(stale) = entry.tunnel.take() {
					stale.shutdown.cancel();
				}
				entry.tunnel_user = user;
				entry.tunnel_password = password;
				entry.agent_version = agent_version.to_string();
				let endpoint = entry.endpoint;
				self.update_connected_gauge(&inner);
				info!(%cluster, "rotated tunnel credentials");
				return Ok((endpoint, cert_pem));
			}
		}

		let (listener, endpoint) = self.allocate_listener(cluster)?;
		let listener_shutdown = CancellationToken::new();
		{
			let mut inner = self.inner.lock().expect("cluster table poisoned");
			// A racing registration may have created the entry already; this
			// call's credentials win, its endpoint stays, and the extra
			// listener is released.
			if let Some(existing) = inner.clusters.get_mut(&name) {
				if let Some(stale) = existing.tunnel.take() {
					stale.shutdown.cancel();
				}
				existing.tunnel_user = user;
				existing.tunnel_password = password;
				existing.agent_version = agent_version.to_string();
				let endpoint = existing.endpoint;
				drop(listener);
				return Ok((endpoint, cert_pem));
			}
			inner.clusters.insert(
				name.clone(),
				ClusterEntry {
					endpoint,
					tunnel_user: user,
					tunnel_password: password,
					agent_version: agent_version.to_string(),
					listener_shutdown: listener_shutdown.clone(),
					tunnel: None,
				},
			);
			tokio::spawn(self.clone().run_endpoint(
				name.clone(),
				listener,
				listener_shutdown,
			));
			info!(%cluster, %endpoint, "registered cluster endpoint");
		}
		Ok((endpoint, cert_pem))
	}

	/// Deterministic port from a hash of the name, linearly probed past
	/// collisions with other clusters or unrelated listeners.
	fn allocate_listener(&self, cluster: &str) -> Result<(TcpListener, SocketAddr), Error> {
		let range = self.opts.port_range.max(1) as u32;
		let start = fnv1a(cluster.as_bytes()) % range;
		for i in 0..range {
			let port = self.opts.port_base as u32 + ((start + i) % range);
			let Ok(port) = u16::try_from(port) else {
				continue;
			};
			let addr = SocketAddr::from(([127, 0, 0, 1], port));
			match std::net::TcpListener::bind(addr) {
				Ok(listener) => {
					listener
						.set_nonblocking(true)
						.map_err(|e| Error::internal(format!("listener nonblocking: {e}")))?;
					let listener = TcpListener::from_std(listener)
						.map_err(|e| Error::internal(format!("listener register: {e}")))?;
					return Ok((listener, addr));
				},
				Err(_) => continue,
			}
		}
		Err(Error::resource_exhausted("no free tunnel endpoints"))
	}

	/// Accept loop for one cluster's loopback endpoint: each connection
	/// becomes a CONNECT stream on the cluster's live tunnel.
	async fn run_endpoint(
		self: Arc<Self>,
		cluster: Strng,
		listener: TcpListener,
		shutdown: CancellationToken,
	) {
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				accepted = listener.accept() => match accepted {
					Ok((conn, _peer)) => {
						let provider = self.clone();
						let cluster = cluster.clone();
						tokio::spawn(async move {
							if let Err(e) = provider.forward_conn(&cluster, conn).await {
								debug!(%cluster, "endpoint connection ended: {e:#}");
							}
						});
					},
					Err(e) => {
						warn!(%cluster, "endpoint accept failed: {e}");
						tokio::time::sleep(Duration::from_millis(50)).await;
					},
				},
			}
		}
	}

	async fn forward_conn(&self, cluster: &str, mut conn: TcpStream) -> anyhow::Result<()> {
		let handle = {
			let inner = self.inner.lock().expect("cluster table poisoned");
			inner
				.clusters
				.get(cluster)
				.and_then(|e| e.tunnel.clone())
		};
		let Some(handle) = handle else {
			anyhow::bail!("no active tunnel for {cluster}");
		};
		let mut sender = handle.send.clone().ready().await?;
		let uri: http::Uri = format!("{cluster}:80").parse()?;
		let request = http::Request::builder()
			.method(http::Method::CONNECT)
			.uri(uri)
			.body(())?;
		let (response, send_stream) = sender.send_request(request, false)?;
		let response = response.await?;
		if response.status() != http::StatusCode::OK {
			anyhow::bail!("tunnel CONNECT refused: {}", response.status());
		}
		let mut h2 = H2Stream::new(response.into_body(), send_stream);
		let _ = tokio::io::copy_bidirectional(&mut conn, &mut h2).await;
		Ok(())
	}

	/// Constant-time credential check for a tunnel upgrade attempt.
	pub(crate) fn authorize_tunnel(&self, cluster: &str, user: &str, password: &str) -> bool {
		let inner = self.inner.lock().expect("cluster table poisoned");
		let Some(entry) = inner.clusters.get(cluster) else {
			return false;
		};
		constant_time_eq(entry.tunnel_user.as_bytes(), user.as_bytes())
			&& constant_time_eq(entry.tunnel_password.as_bytes(), password.as_bytes())
	}

	/// Publishes a freshly authenticated tunnel connection, displacing any
	/// previous one. Returns the shutdown token and generation the caller
	/// must use to drive and later clear the connection.
	pub(crate) fn install_tunnel(
		&self,
		cluster: &str,
		send: h2::client::SendRequest<Bytes>,
	) -> Option<(CancellationToken, u64)> {
		let mut inner = self.inner.lock().expect("cluster table poisoned");
		inner.next_generation += 1;
		let generation = inner.next_generation;
		let entry = inner.clusters.get_mut(cluster)?;
		if let Some(stale) = entry.tunnel.take() {
			stale.shutdown.cancel();
		}
		let shutdown = CancellationToken::new();
		entry.tunnel = Some(TunnelHandle {
			send,
			shutdown: shutdown.clone(),
			generation,
		});
		self.update_connected_gauge(&inner);
		Some((shutdown, generation))
	}

	/// Drops the tunnel handle when its connection ends, unless a newer
	/// registration already replaced it. The cluster entry itself stays
	/// (REGISTERED) for the agent's reconnect.
	pub(crate) fn clear_tunnel(&self, cluster: &str, generation: u64) {
		let mut inner = self.inner.lock().expect("cluster table poisoned");
		if let Some(entry) = inner.clusters.get_mut(cluster) {
			if entry
				.tunnel
				.as_ref()
				.is_some_and(|t| t.generation == generation)
			{
				entry.tunnel = None;
				info!(%cluster, "tunnel disconnected");
			}
		}
		self.update_connected_gauge(&inner);
	}

	/// Removes a cluster entirely: credentials, endpoint and tunnel.
	pub fn evict_cluster(&self, cluster: &str) -> Result<(), Error> {
		let mut inner = self.inner.lock().expect("cluster table poisoned");
		let entry = inner
			.clusters
			.remove(cluster)
			.ok_or_else(|| Error::ClusterNotFound(strng::new(cluster)))?;
		entry.listener_shutdown.cancel();
		if let Some(tunnel) = entry.tunnel {
			tunnel.shutdown.cancel();
		}
		self.update_connected_gauge(&inner);
		info!(%cluster, "evicted cluster");
		Ok(())
	}

	pub fn list_clusters(&self) -> HashMap<Strng, Cluster> {
		let inner = self.inner.lock().expect("cluster table poisoned");
		inner
			.clusters
			.iter()
			.map(|(name, e)| {
				(
					name.clone(),
					Cluster {
						name: name.clone(),
						endpoint: e.endpoint,
						tunnel_user: e.tunnel_user.clone(),
						agent_version: e.agent_version.clone(),
						connected: e.tunnel.is_some(),
					},
				)
			})
			.collect()
	}

	/// Base URL of the cluster's loopback endpoint, without waiting for the
	/// tunnel to be up.
	pub fn resolve_address(&self, cluster: &str) -> Result<String, Error> {
		let inner = self.inner.lock().expect("cluster table poisoned");
		let entry = inner
			.clusters
			.get(cluster)
			.ok_or_else(|| Error::ClusterNotFound(strng::new(cluster)))?;
		Ok(format!("http://{}", entry.endpoint))
	}

	/// Readiness probe: polls with exponential backoff until the cluster
	/// has a live tunnel or the budget runs out.
	pub async fn agent_base_url(&self, cluster: &str, wait_for: Duration) -> Result<String, Error> {
		let deadline = Instant::now() + wait_for;
		let mut backoff = PROBE_INITIAL_BACKOFF;
		loop {
			let connected = {
				let inner = self.inner.lock().expect("cluster table poisoned");
				let entry = inner
					.clusters
					.get(cluster)
					.ok_or_else(|| Error::ClusterNotFound(strng::new(cluster)))?;
				entry.tunnel.is_some().then(|| entry.endpoint)
			};
			if let Some(endpoint) = connected {
				return Ok(format!("http://{endpoint}"));
			}
			if Instant::now() + backoff > deadline {
				return Err(Error::not_ready("tunnel"));
			}
			tokio::time::sleep(backoff).await;
			backoff = (backoff * 2).min(PROBE_MAX_BACKOFF);
		}
	}

	fn update_connected_gauge(&self, inner: &Inner) {
		let connected = inner
			.clusters
			.values()
			.filter(|e| e.tunnel.is_some())
			.count();
		self.metrics.connected_clusters.set(connected as i64);
	}
}

fn fnv1a(data: &[u8]) -> u32 {
	let mut hash: u32 = 0x811c_9dc5;
	for b in data {
		hash ^= *b as u32;
		hash = hash.wrapping_mul(0x0100_0193);
	}
	hash
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	aws_lc_rs::constant_time::verify_slices_are_equal(a, b).is_ok()
}
