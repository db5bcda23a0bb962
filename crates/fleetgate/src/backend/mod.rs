mod kubeclient;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod types;

pub use kubeclient::KubeClientBackend;
pub use types::*;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discovery::VersionInfo;
use crate::errors::Error;
use crate::identity::UserInfo;
use crate::runtime::resize::SizeQueueReader;

/// Bidirectional byte stream handed to the port-forward backend.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Streamed pod-log chunks.
pub type LogStream = futures_util::stream::BoxStream<'static, Result<bytes::Bytes, Error>>;

/// A running watch. Events arrive in upstream order; `stop` is idempotent
/// and also fires on drop so abandoned watches cannot leak their relay task.
#[derive(Debug)]
pub struct Watcher {
	events: mpsc::Receiver<WatchEvent>,
	stop: CancellationToken,
}

impl Watcher {
	pub fn new(events: mpsc::Receiver<WatchEvent>, stop: CancellationToken) -> Self {
		Watcher { events, stop }
	}

	/// Next event, or `None` once the upstream watch has closed.
	pub async fn recv(&mut self) -> Option<WatchEvent> {
		self.events.recv().await
	}

	pub fn stop(&self) {
		self.stop.cancel();
	}
}

impl Drop for Watcher {
	fn drop(&mut self) {
		self.stop.cancel();
	}
}

/// Everything the gateway needs from a Kubernetes cluster. All operations
/// carry the calling user; the adapter translates that into impersonation so
/// the cluster's own RBAC decides what is allowed.
///
/// Errors come back as `DomainError`s with canonical codes; no
/// client-library error types cross this boundary.
#[async_trait::async_trait]
pub trait KubeBackend: Send + Sync + 'static {
	async fn server_resources(&self, user: &UserInfo) -> Result<Vec<ResourceInfo>, Error>;

	/// Confirms a GVR is served by this cluster; the use-case layer calls
	/// this before every resource operation.
	async fn lookup_resource(&self, user: &UserInfo, gvr: &Gvr) -> Result<ResourceInfo, Error>;

	/// OpenAPI schema for a group/version/kind. Served with the agent's own
	/// identity; schemas are not per-user data.
	async fn fetch_schema(
		&self,
		group: &str,
		version: &str,
		kind: &str,
	) -> Result<serde_json::Value, Error>;

	async fn server_version(&self) -> Result<VersionInfo, Error>;

	async fn list(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		opts: ListOptions,
	) -> Result<serde_json::Value, Error>;

	async fn get(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
	) -> Result<serde_json::Value, Error>;

	async fn create(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		object: serde_json::Value,
	) -> Result<serde_json::Value, Error>;

	/// Server-side apply.
	async fn apply(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		object: serde_json::Value,
		opts: ApplyOptions,
	) -> Result<serde_json::Value, Error>;

	async fn delete(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		opts: DeleteOptions,
	) -> Result<(), Error>;

	/// Events whose `involvedObject.uid` matches `uid`.
	async fn list_events_for(
		&self,
		user: &UserInfo,
		namespace: Option<&str>,
		uid: &str,
	) -> Result<serde_json::Value, Error>;

	async fn watch(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		opts: WatchOptions,
	) -> Result<Watcher, Error>;

	async fn pod_logs(
		&self,
		user: &UserInfo,
		namespace: &str,
		pod: &str,
		opts: LogOptions,
	) -> Result<LogStream, Error>;

	/// Runs an exec session to completion. The worker owns the pipe ends it
	/// is given and closes them when it returns.
	async fn exec(
		&self,
		user: &UserInfo,
		opts: ExecOptions,
		stdin: Box<dyn AsyncRead + Send + Unpin>,
		stdout: Box<dyn AsyncWrite + Send + Unpin>,
		stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
		resize: Option<SizeQueueReader>,
		cancel: CancellationToken,
	) -> Result<(), Error>;

	/// Runs a port-forward session to completion, copying bytes both ways.
	async fn port_forward(
		&self,
		user: &UserInfo,
		opts: PortForwardOptions,
		stream: Box<dyn AsyncStream>,
		cancel: CancellationToken,
	) -> Result<(), Error>;

	async fn scale(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		replicas: i32,
	) -> Result<(), Error>;

	/// Rollout restart via the `restartedAt` template annotation.
	async fn restart(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
	) -> Result<(), Error>;

	/// Server-side apply addressed by the object's own `apiVersion`/`kind`;
	/// the adapter resolves the REST mapping through discovery. Used by the
	/// bootstrap applier, where no caller supplies a GVR.
	async fn apply_object(
		&self,
		user: &UserInfo,
		object: serde_json::Value,
		opts: ApplyOptions,
	) -> Result<serde_json::Value, Error>;

	/// Fetch addressed by `apiVersion`/`kind`, for polling applied objects.
	async fn get_object(
		&self,
		user: &UserInfo,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
		name: &str,
	) -> Result<serde_json::Value, Error>;

	/// Drops any cached discovery/REST-mapping state. The bootstrap applier
	/// calls this between its CRD phase and the rest.
	async fn invalidate_discovery(&self) {}
}
