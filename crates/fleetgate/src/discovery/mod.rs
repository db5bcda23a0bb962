use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use fleet_core::{Strng, strng};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{Code, DomainError, Error};

/// Upper bound on a single backend discovery fetch. The fetch runs in a
/// detached task, so one caller's cancellation never fails other waiters.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Kubernetes version from which the watch-list streaming feature is
/// assumed available.
const WATCH_LIST_MAJOR: u32 = 1;
const WATCH_LIST_MINOR: u32 = 34;

/// Cluster server-version info, as reported by the API server.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionInfo {
	pub major: String,
	pub minor: String,
	pub git_version: String,
}

impl VersionInfo {
	/// Compares against `major.minor`, tolerating suffixes like `"34+"`.
	pub fn at_least(&self, major: u32, minor: u32) -> bool {
		let parse = |s: &str| -> Option<u32> {
			let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
			digits.parse().ok()
		};
		match (parse(&self.major), parse(&self.minor)) {
			(Some(ma), Some(mi)) => ma > major || (ma == major && mi >= minor),
			_ => false,
		}
	}
}

/// OpenAPI schema for a kind, kept generic; the handler ships it verbatim.
pub type Schema = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
	pub cluster: Strng,
	pub group: Strng,
	pub version: Strng,
	pub kind: Strng,
}

/// Source of truth behind the cache. The agent wires this to its
/// KubeBackend; the server wires it to the RPC proxy.
#[async_trait::async_trait]
pub trait SchemaFetcher: Send + Sync + 'static {
	async fn fetch_schema(&self, key: &SchemaKey) -> Result<Schema, Error>;
	async fn fetch_server_version(&self, cluster: &str) -> Result<VersionInfo, Error>;
}

struct Entry<T> {
	value: T,
	expires_at: Instant,
}

type FlightRx<T> = watch::Receiver<Option<Result<T, Error>>>;

struct Inner {
	fetcher: Arc<dyn SchemaFetcher>,
	ttl: Duration,
	schemas: RwLock<HashMap<SchemaKey, Entry<Schema>>>,
	versions: RwLock<HashMap<Strng, Entry<VersionInfo>>>,
	schema_flights: Mutex<HashMap<SchemaKey, FlightRx<Schema>>>,
	version_flights: Mutex<HashMap<Strng, FlightRx<VersionInfo>>>,
}

/// TTL cache for OpenAPI schemas and server versions with per-key
/// singleflight: concurrent misses for one key share a single backend
/// fetch. Read path takes a read lock; fetch completion and eviction take
/// the write lock, never across I/O.
#[derive(Clone)]
pub struct DiscoveryCache {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for DiscoveryCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DiscoveryCache")
			.field("ttl", &self.inner.ttl)
			.finish_non_exhaustive()
	}
}

impl DiscoveryCache {
	pub fn new(fetcher: Arc<dyn SchemaFetcher>, ttl: Duration) -> Self {
		DiscoveryCache {
			inner: Arc::new(Inner {
				fetcher,
				ttl,
				schemas: RwLock::new(HashMap::new()),
				versions: RwLock::new(HashMap::new()),
				schema_flights: Mutex::new(HashMap::new()),
				version_flights: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub async fn resolve_schema(
		&self,
		cluster: &str,
		group: &str,
		version: &str,
		kind: &str,
	) -> Result<Schema, Error> {
		let key = SchemaKey {
			cluster: strng::new(cluster),
			group: strng::new(group),
			version: strng::new(version),
			kind: strng::new(kind),
		};
		let fetcher = self.inner.fetcher.clone();
		let fetch_key = key.clone();
		get_or_fetch(
			self.inner.clone(),
			|inner| &inner.schemas,
			|inner| &inner.schema_flights,
			key,
			move || async move { fetcher.fetch_schema(&fetch_key).await },
		)
		.await
	}

	pub async fn server_version(&self, cluster: &str) -> Result<VersionInfo, Error> {
		let key = strng::new(cluster);
		let fetcher = self.inner.fetcher.clone();
		let fetch_key = key.clone();
		get_or_fetch(
			self.inner.clone(),
			|inner| &inner.versions,
			|inner| &inner.version_flights,
			key,
			move || async move { fetcher.fetch_server_version(&fetch_key).await },
		)
		.await
	}

	/// Whether the cluster supports the watch-list feature (≥ 1.34). A
	/// failed version probe degrades to `false` rather than failing the
	/// watch that asked.
	pub async fn supports_watch_list(&self, cluster: &str) -> bool {
		match self.server_version(cluster).await {
			Ok(v) => v.at_least(WATCH_LIST_MAJOR, WATCH_LIST_MINOR),
			Err(e) => {
				debug!("server version probe for {cluster} failed: {e}");
				false
			},
		}
	}

	/// Starts the background evictor; returns when `shutdown` fires.
	pub async fn run_evictor(self, interval: Duration, shutdown: CancellationToken) {
		let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = ticker.tick() => self.sweep_expired(),
				_ = shutdown.cancelled() => return,
			}
		}
	}

	pub(crate) fn sweep_expired(&self) {
		let now = Instant::now();
		let mut evicted = 0usize;
		{
			let mut schemas = self.inner.schemas.write().expect("schema cache poisoned");
			let before = schemas.len();
			schemas.retain(|_, e| e.expires_at > now);
			evicted += before - schemas.len();
		}
		{
			let mut versions = self.inner.versions.write().expect("version cache poisoned");
			let before = versions.len();
			versions.retain(|_, e| e.expires_at > now);
			evicted += before - versions.len();
		}
		if evicted > 0 {
			trace!("evicted {evicted} expired discovery entries");
		}
	}
}

/// Cache lookup with singleflight join. The winning caller spawns the fetch
/// in a detached task with its own timeout; every waiter (including callers
/// arriving later) observes the same result through a watch channel.
async fn get_or_fetch<K, T, F, Fut>(
	inner: Arc<Inner>,
	cache_of: fn(&Inner) -> &RwLock<HashMap<K, Entry<T>>>,
	flights_of: fn(&Inner) -> &Mutex<HashMap<K, FlightRx<T>>>,
	key: K,
	fetch: F,
) -> Result<T, Error>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
	T: Clone + Send + Sync + 'static,
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
{
	let ttl = inner.ttl;
	{
		let map = cache_of(&inner).read().expect("cache poisoned");
		if let Some(e) = map.get(&key) {
			if e.expires_at > Instant::now() {
				return Ok(e.value.clone());
			}
		}
	}

	let mut rx = {
		let mut guard = flights_of(&inner).lock().expect("flight table poisoned");
		if let Some(rx) = guard.get(&key) {
			rx.clone()
		} else {
			let (tx, rx) = watch::channel(None);
			guard.insert(key.clone(), rx.clone());
			let fut = fetch();
			let flight_key = key.clone();
			let inner = inner.clone();
			tokio::spawn(async move {
				let result = match tokio::time::timeout(FETCH_TIMEOUT, fut).await {
					Ok(r) => r,
					Err(_) => Err(Error::from(DomainError::new(
						Code::DeadlineExceeded,
						"discovery fetch timed out",
					))),
				};
				if let Ok(value) = &result {
					let mut map = cache_of(&inner).write().expect("cache poisoned");
					map.insert(
						flight_key.clone(),
						Entry {
							value: value.clone(),
							expires_at: Instant::now() + ttl,
						},
					);
				}
				flights_of(&inner)
					.lock()
					.expect("flight table poisoned")
					.remove(&flight_key);
				let _ = tx.send(Some(result));
			});
			rx
		}
	};

	loop {
		if let Some(result) = rx.borrow_and_update().clone() {
			return result;
		}
		if rx.changed().await.is_err() {
			return Err(Error::unavailable("discovery fetch aborted"));
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use tokio::sync::Notify;

	use super::*;

	struct MockFetcher {
		schema_calls: AtomicUsize,
		version_calls: AtomicUsize,
		gate: Notify,
		gated: std::sync::atomic::AtomicBool,
		fail: std::sync::atomic::AtomicBool,
		version: Mutex<VersionInfo>,
	}

	impl MockFetcher {
		fn new() -> Arc<Self> {
			Arc::new(MockFetcher {
				schema_calls: AtomicUsize::new(0),
				version_calls: AtomicUsize::new(0),
				gate: Notify::new(),
				gated: std::sync::atomic::AtomicBool::new(false),
				fail: std::sync::atomic::AtomicBool::new(false),
				version: Mutex::new(VersionInfo {
					major: "1".into(),
					minor: "34".into(),
					git_version: "v1.34.0".into(),
				}),
			})
		}
	}

	#[async_trait::async_trait]
	impl SchemaFetcher for MockFetcher {
		async fn fetch_schema(&self, key: &SchemaKey) -> Result<Schema, Error> {
			self.schema_calls.fetch_add(1, Ordering::SeqCst);
			if self.gated.load(Ordering::SeqCst) {
				self.gate.notified().await;
			}
			if self.fail.load(Ordering::SeqCst) {
				return Err(Error::unavailable("backend down"));
			}
			Ok(serde_json::json!({"kind": key.kind.as_str()}))
		}

		async fn fetch_server_version(&self, _cluster: &str) -> Result<VersionInfo, Error> {
			self.version_calls.fetch_add(1, Ordering::SeqCst);
			Ok(self.version.lock().unwrap().clone())
		}
	}

	fn cache_with(fetcher: Arc<MockFetcher>, ttl: Duration) -> DiscoveryCache {
		DiscoveryCache::new(fetcher, ttl)
	}

	#[tokio::test]
	async fn concurrent_misses_share_one_fetch() {
		let fetcher = MockFetcher::new();
		fetcher.gated.store(true, Ordering::SeqCst);
		let cache = cache_with(fetcher.clone(), Duration::from_secs(60));

		let mut handles = Vec::new();
		for _ in 0..10 {
			let cache = cache.clone();
			handles.push(tokio::spawn(async move {
				cache.resolve_schema("dev", "apps", "v1", "Deployment").await
			}));
		}
		// Let every caller reach the flight table, then release the fetch.
		tokio::time::sleep(Duration::from_millis(50)).await;
		fetcher.gate.notify_waiters();

		for h in handles {
			let schema = h.await.unwrap().unwrap();
			assert_eq!(schema["kind"], "Deployment");
		}
		assert_eq!(fetcher.schema_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn flight_error_is_shared_and_not_cached() {
		let fetcher = MockFetcher::new();
		fetcher.fail.store(true, Ordering::SeqCst);
		let cache = cache_with(fetcher.clone(), Duration::from_secs(60));

		let err = cache
			.resolve_schema("dev", "", "v1", "Pod")
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::Unavailable);

		fetcher.fail.store(false, Ordering::SeqCst);
		let ok = cache.resolve_schema("dev", "", "v1", "Pod").await.unwrap();
		assert_eq!(ok["kind"], "Pod");
		assert_eq!(fetcher.schema_calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn hits_within_ttl_do_not_refetch() {
		let fetcher = MockFetcher::new();
		let cache = cache_with(fetcher.clone(), Duration::from_secs(60));
		for _ in 0..3 {
			cache
				.resolve_schema("dev", "", "v1", "Pod")
				.await
				.unwrap();
		}
		assert_eq!(fetcher.schema_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn expired_entries_refetch_and_sweep() {
		let fetcher = MockFetcher::new();
		let cache = cache_with(fetcher.clone(), Duration::from_millis(10));
		cache.resolve_schema("dev", "", "v1", "Pod").await.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;

		cache.sweep_expired();
		assert!(cache.inner.schemas.read().unwrap().is_empty());

		cache.resolve_schema("dev", "", "v1", "Pod").await.unwrap();
		assert_eq!(fetcher.schema_calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn caller_cancellation_does_not_poison_waiters() {
		let fetcher = MockFetcher::new();
		fetcher.gated.store(true, Ordering::SeqCst);
		let cache = cache_with(fetcher.clone(), Duration::from_secs(60));

		let first = {
			let cache = cache.clone();
			tokio::spawn(
				async move { cache.resolve_schema("dev", "", "v1", "Pod").await },
			)
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		first.abort();

		let second = {
			let cache = cache.clone();
			tokio::spawn(
				async move { cache.resolve_schema("dev", "", "v1", "Pod").await },
			)
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		fetcher.gate.notify_waiters();

		let schema = second.await.unwrap().unwrap();
		assert_eq!(schema["kind"], "Pod");
		assert_eq!(fetcher.schema_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn watch_list_gate_follows_server_version() {
		let fetcher = MockFetcher::new();
		let cache = cache_with(fetcher.clone(), Duration::from_millis(1));
		assert!(cache.supports_watch_list("dev").await);

		tokio::time::sleep(Duration::from_millis(5)).await;
		*fetcher.version.lock().unwrap() = VersionInfo {
			major: "1".into(),
			minor: "28+".into(),
			git_version: "v1.28.3".into(),
		};
		assert!(!cache.supports_watch_list("dev").await);
		assert!(fetcher.version_calls.load(Ordering::SeqCst) >= 2);
	}

	#[test]
	fn version_comparison() {
		let v = |ma: &str, mi: &str| VersionInfo {
			major: ma.into(),
			minor: mi.into(),
			git_version: String::new(),
		};
		assert!(v("1", "34").at_least(1, 34));
		assert!(v("1", "35+").at_least(1, 34));
		assert!(v("2", "0").at_least(1, 34));
		assert!(!v("1", "33").at_least(1, 34));
		assert!(!v("", "34").at_least(1, 34));
	}
}
