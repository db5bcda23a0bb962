use std::sync::Arc;

use fleet_core::Strng;
use tracing::debug;

use crate::backend::{
	ApplyOptions, DeleteOptions, Gvr, KubeBackend, ListOptions, ResourceInfo, WatchOptions,
	Watcher,
};
use crate::discovery::{DiscoveryCache, Schema, SchemaFetcher, SchemaKey, VersionInfo};
use crate::errors::Error;
use crate::identity::UserInfo;

/// Field manager recorded by server-side apply when the caller supplies
/// none.
pub const DEFAULT_FIELD_MANAGER: &str = "fleetgate";

/// Selector options accepted by `watch`.
#[derive(Debug, Clone, Default)]
pub struct WatchParams {
	pub label_selector: Option<String>,
	pub field_selector: Option<String>,
	pub resource_version: Option<String>,
}

/// `Get` plus the object's events; events are supplementary and an event
/// listing failure (usually RBAC) leaves them empty.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Described {
	pub object: serde_json::Value,
	pub events: serde_json::Value,
}

/// Resource CRUD and watch against one cluster, with GVR validation before
/// every operation and schema/version lookups through the discovery cache.
pub struct ResourceUseCase {
	backend: Arc<dyn KubeBackend>,
	cache: DiscoveryCache,
	cluster: Strng,
}

impl ResourceUseCase {
	pub fn new(backend: Arc<dyn KubeBackend>, cache: DiscoveryCache, cluster: Strng) -> Self {
		ResourceUseCase {
			backend,
			cache,
			cluster,
		}
	}

	async fn validate_gvr(&self, user: &UserInfo, gvr: &Gvr) -> Result<ResourceInfo, Error> {
		self.backend.lookup_resource(user, gvr).await
	}

	pub async fn server_resources(&self, user: &UserInfo) -> Result<Vec<ResourceInfo>, Error> {
		self.backend.server_resources(user).await
	}

	pub async fn resolve_schema(
		&self,
		group: &str,
		version: &str,
		kind: &str,
	) -> Result<Schema, Error> {
		self
			.cache
			.resolve_schema(&self.cluster, group, version, kind)
			.await
	}

	pub async fn server_version(&self) -> Result<VersionInfo, Error> {
		self.cache.server_version(&self.cluster).await
	}

	pub async fn list(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		opts: ListOptions,
	) -> Result<serde_json::Value, Error> {
		self.validate_gvr(user, gvr).await?;
		self.backend.list(user, gvr, namespace, opts).await
	}

	pub async fn get(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
	) -> Result<serde_json::Value, Error> {
		self.validate_gvr(user, gvr).await?;
		self.backend.get(user, gvr, namespace, name).await
	}

	pub async fn describe(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
	) -> Result<Described, Error> {
		self.validate_gvr(user, gvr).await?;
		let object = self.backend.get(user, gvr, namespace, name).await?;
		let uid = object
			.pointer("/metadata/uid")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();
		let events = if uid.is_empty() {
			serde_json::json!({ "items": [] })
		} else {
			match self.backend.list_events_for(user, namespace, &uid).await {
				Ok(events) => events,
				Err(e) => {
					debug!("event listing for {name} failed, describing without: {e}");
					serde_json::json!({ "items": [] })
				},
			}
		};
		Ok(Described { object, events })
	}

	pub async fn create(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		object: serde_json::Value,
	) -> Result<serde_json::Value, Error> {
		self.validate_gvr(user, gvr).await?;
		self.backend.create(user, gvr, namespace, object).await
	}

	/// Server-side apply of a YAML document. Conflicting field ownership is
	/// overridden only when `force` is set; otherwise the conflict surfaces
	/// as a failed precondition.
	pub async fn apply(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		yaml: &str,
		force: bool,
		field_manager: Option<&str>,
	) -> Result<serde_json::Value, Error> {
		self.validate_gvr(user, gvr).await?;
		let object: serde_json::Value = serde_yaml::from_str(yaml)
			.map_err(|e| Error::invalid_input("object", format!("invalid YAML: {e}")))?;
		let name = object
			.pointer("/metadata/name")
			.and_then(|v| v.as_str())
			.ok_or_else(|| Error::invalid_input("object", "metadata.name is required"))?
			.to_string();
		let opts = ApplyOptions {
			field_manager: field_manager
				.filter(|m| !m.is_empty())
				.unwrap_or(DEFAULT_FIELD_MANAGER)
				.to_string(),
			force,
		};
		self
			.backend
			.apply(user, gvr, namespace, &name, object, opts)
			.await
	}

	pub async fn delete(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		opts: DeleteOptions,
	) -> Result<(), Error> {
		self.validate_gvr(user, gvr).await?;
		self.backend.delete(user, gvr, namespace, name, opts).await
	}

	/// Opens a watch. When the cluster supports watch-list the stream opens
	/// with an initial snapshot; bookmarks are always requested.
	pub async fn watch(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		params: WatchParams,
	) -> Result<Watcher, Error> {
		self.validate_gvr(user, gvr).await?;
		let watch_list = self.cache.supports_watch_list(&self.cluster).await;
		let opts = WatchOptions {
			label_selector: params.label_selector,
			field_selector: params.field_selector,
			resource_version: params.resource_version,
			send_initial_events: watch_list,
			resource_version_match_not_older_than: watch_list,
			allow_bookmarks: true,
		};
		self.backend.watch(user, gvr, namespace, opts).await
	}
}

/// `SchemaFetcher` backed by the local cluster's `KubeBackend`; the cache's
/// cluster key is carried but a single agent only ever serves its own.
pub struct BackendSchemaFetcher {
	backend: Arc<dyn KubeBackend>,
}

impl BackendSchemaFetcher {
	pub fn new(backend: Arc<dyn KubeBackend>) -> Arc<Self> {
		Arc::new(BackendSchemaFetcher { backend })
	}
}

#[async_trait::async_trait]
impl SchemaFetcher for BackendSchemaFetcher {
	async fn fetch_schema(&self, key: &SchemaKey) -> Result<Schema, Error> {
		self
			.backend
			.fetch_schema(&key.group, &key.version, &key.kind)
			.await
	}

	async fn fetch_server_version(&self, _cluster: &str) -> Result<VersionInfo, Error> {
		self.backend.server_version().await
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;
	use std::time::Duration;

	use fleet_core::strng;

	use super::*;
	use crate::backend::WatchEventType;
	use crate::backend::testing::{StubBackend, watch_added};
	use crate::errors::Code;

	fn usecase(backend: Arc<StubBackend>) -> ResourceUseCase {
		let cache = DiscoveryCache::new(
			BackendSchemaFetcher::new(backend.clone()),
			Duration::from_secs(60),
		);
		ResourceUseCase::new(backend, cache, strng::new("dev"))
	}

	fn pods() -> Gvr {
		Gvr::new("", "v1", "pods")
	}

	#[tokio::test]
	async fn unknown_gvr_is_invalid_input() {
		let backend = Arc::new(StubBackend::default());
		*backend.known_resources.lock().unwrap() = Some(HashSet::new());
		let rc = usecase(backend);
		let user = UserInfo::new("alice");
		let err = rc
			.list(&user, &pods(), Some("default"), ListOptions::default())
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::InvalidArgument);
		assert!(err.to_string().contains("resource"));
	}

	#[tokio::test]
	async fn list_carries_caller_identity() {
		let backend = Arc::new(StubBackend::default());
		let rc = usecase(backend.clone());
		let user = UserInfo::new("alice");
		let list = rc
			.list(&user, &pods(), Some("default"), ListOptions::default())
			.await
			.unwrap();
		assert_eq!(list["items"].as_array().unwrap().len(), 2);
		assert!(
			backend
				.impersonated
				.lock()
				.unwrap()
				.iter()
				.all(|s| s == "alice")
		);
	}

	#[tokio::test]
	async fn apply_parses_yaml_and_honours_force() {
		let backend = Arc::new(StubBackend::default());
		let rc = usecase(backend.clone());
		let user = UserInfo::new("alice");

		let yaml = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: web\n";
		rc.apply(&user, &pods(), Some("default"), yaml, false, None)
			.await
			.unwrap();
		{
			let applied = backend.applied.lock().unwrap();
			assert_eq!(applied.len(), 1);
			assert_eq!(applied[0].0, "web");
			assert_eq!(applied[0].1.field_manager, DEFAULT_FIELD_MANAGER);
			assert!(!applied[0].1.force);
		}

		let conflict = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: conflict\n";
		let err = rc
			.apply(&user, &pods(), Some("default"), conflict, false, None)
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::FailedPrecondition);
		rc.apply(&user, &pods(), Some("default"), conflict, true, Some("kubectl"))
			.await
			.unwrap();

		let err = rc
			.apply(&user, &pods(), None, "kind: Pod", false, None)
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::InvalidArgument);
	}

	#[tokio::test]
	async fn describe_degrades_without_event_access() {
		let backend = Arc::new(StubBackend::default());
		let rc = usecase(backend.clone());
		let user = UserInfo::new("alice");

		let described = rc
			.describe(&user, &pods(), Some("default"), "web")
			.await
			.unwrap();
		assert_eq!(described.object["metadata"]["name"], "web");
		assert_eq!(described.events["items"].as_array().unwrap().len(), 1);

		backend
			.fail_events
			.store(true, std::sync::atomic::Ordering::SeqCst);
		let described = rc
			.describe(&user, &pods(), Some("default"), "web")
			.await
			.unwrap();
		assert!(described.events["items"].as_array().unwrap().is_empty());
	}

	#[tokio::test]
	async fn watch_options_follow_watch_list_support() {
		let backend = Arc::new(StubBackend::default());
		backend.watch_script.lock().unwrap().push(watch_added("one"));
		let rc = usecase(backend.clone());
		let user = UserInfo::new("alice");

		let mut watcher = rc
			.watch(&user, &pods(), Some("default"), WatchParams::default())
			.await
			.unwrap();
		let ev = watcher.recv().await.unwrap();
		assert_eq!(ev.event_type, WatchEventType::Added);
		watcher.stop();
		watcher.stop();

		let opts = backend.recorded_watch_opts.lock().unwrap();
		assert!(opts[0].send_initial_events);
		assert!(opts[0].resource_version_match_not_older_than);
		assert!(opts[0].allow_bookmarks);
	}

	#[tokio::test]
	async fn watch_options_without_watch_list() {
		let backend = Arc::new(StubBackend::default());
		*backend.server_version.lock().unwrap() = Some(VersionInfo {
			major: "1".into(),
			minor: "29".into(),
			git_version: "v1.29.0".into(),
		});
		let rc = usecase(backend.clone());
		let user = UserInfo::new("alice");
		let _ = rc
			.watch(&user, &pods(), Some("default"), WatchParams::default())
			.await
			.unwrap();
		let opts = backend.recorded_watch_opts.lock().unwrap();
		assert!(!opts[0].send_initial_events);
		assert!(opts[0].allow_bookmarks);
	}
}
