use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fleet_core::{Strng, strng};
use futures_util::{SinkExt, StreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{
	Api, ApiResource, AttachParams, DeleteParams, DynamicObject, ListParams, LogParams, Patch,
	PatchParams, PostParams, WatchParams,
};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::{Client, Config, Discovery};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{
	ApplyOptions, AsyncStream, DeleteOptions, ExecOptions, Gvr, KubeBackend, ListOptions,
	LogOptions, LogStream, PortForwardOptions, ResourceInfo, WatchEvent, WatchEventType,
	WatchOptions, Watcher,
};
use crate::discovery::VersionInfo;
use crate::errors::{Code, DomainError, Error};
use crate::identity::UserInfo;
use crate::runtime::resize::SizeQueueReader;

/// `KubeBackend` over the kube-rs client. Impersonation is expressed through
/// the client config, so every request carries the caller's identity and the
/// target cluster's RBAC is the enforcement point. Clients are cached per
/// subject; they all inherit the same base (in-cluster) credentials.
pub struct KubeClientBackend {
	base: Config,
	plain: Client,
	clients: RwLock<HashMap<Strng, Client>>,
	discovery: tokio::sync::RwLock<Option<Arc<Discovery>>>,
}

impl std::fmt::Debug for KubeClientBackend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KubeClientBackend").finish_non_exhaustive()
	}
}

impl KubeClientBackend {
	/// Infers the config from the environment (in-cluster first, kubeconfig
	/// as a fallback for development).
	pub async fn infer() -> Result<Self, Error> {
		let base = Config::infer()
			.await
			.map_err(|e| DomainError::wrap(Code::Internal, "kubernetes config", e.into()))?;
		Self::new(base)
	}

	pub fn new(base: Config) -> Result<Self, Error> {
		let plain = Client::try_from(base.clone())
			.map_err(|e| DomainError::wrap(Code::Internal, "kubernetes client", e.into()))?;
		Ok(KubeClientBackend {
			base,
			plain,
			clients: RwLock::new(HashMap::new()),
			discovery: tokio::sync::RwLock::new(None),
		})
	}

	/// Client impersonating `user`. Double-checked cache keyed by subject;
	/// impersonation lives in the per-client config, never in shared state.
	fn client_for(&self, user: &UserInfo) -> Result<Client, Error> {
		if user.subject.is_empty() {
			// The ambient identity: no impersonation headers at all.
			return Ok(self.plain.clone());
		}
		{
			let cache = self.clients.read().expect("client cache poisoned");
			if let Some(c) = cache.get(&user.subject) {
				return Ok(c.clone());
			}
		}
		let mut cache = self.clients.write().expect("client cache poisoned");
		if let Some(c) = cache.get(&user.subject) {
			return Ok(c.clone());
		}
		let mut config = self.base.clone();
		config.auth_info.impersonate = Some(user.subject.to_string());
		config.auth_info.impersonate_groups =
			Some(user.groups.iter().map(|g| g.to_string()).collect());
		let client = Client::try_from(config)
			.map_err(|e| DomainError::wrap(Code::Internal, "impersonating client", e.into()))?;
		cache.insert(user.subject.clone(), client.clone());
		Ok(client)
	}

	async fn discovery(&self, client: &Client) -> Result<Arc<Discovery>, Error> {
		{
			let cached = self.discovery.read().await;
			if let Some(d) = cached.as_ref() {
				return Ok(d.clone());
			}
		}
		let fresh = Discovery::new(client.clone())
			.run()
			.await
			.map_err(map_kube_err)?;
		let fresh = Arc::new(fresh);
		*self.discovery.write().await = Some(fresh.clone());
		Ok(fresh)
	}

	fn dynamic_api(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		info: &ResourceInfo,
		namespace: Option<&str>,
	) -> Result<Api<DynamicObject>, Error> {
		let client = self.client_for(user)?;
		let ar = api_resource(gvr, &info.kind);
		Ok(match namespace {
			Some(ns) if info.namespaced => Api::namespaced_with(client, ns, &ar),
			_ => Api::all_with(client, &ar),
		})
	}

	fn pods(&self, user: &UserInfo, namespace: &str) -> Result<Api<Pod>, Error> {
		Ok(Api::namespaced(self.client_for(user)?, namespace))
	}

	/// Resolves an `apiVersion`/`kind` pair to a dynamic API through the
	/// cached discovery (the REST mapping).
	async fn api_by_gvk(
		&self,
		user: &UserInfo,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
	) -> Result<Api<DynamicObject>, Error> {
		let (group, version) = match api_version.split_once('/') {
			Some((g, v)) => (g, v),
			None => ("", api_version),
		};
		let client = self.client_for(user)?;
		let discovery = self.discovery(&client).await?;
		for g in discovery.groups() {
			if g.name() != group {
				continue;
			}
			for (ar, caps) in g.versioned_resources(version) {
				if ar.kind == kind {
					let namespaced = matches!(caps.scope, kube::discovery::Scope::Namespaced);
					return Ok(match namespace {
						Some(ns) if namespaced => Api::namespaced_with(client, ns, &ar),
						_ => Api::all_with(client, &ar),
					});
				}
			}
		}
		Err(Error::invalid_input(
			"object",
			format!("{api_version} {kind} is not served by this cluster"),
		))
	}
}

fn api_resource(gvr: &Gvr, kind: &str) -> ApiResource {
	let api_version = if gvr.group.is_empty() {
		gvr.version.to_string()
	} else {
		format!("{}/{}", gvr.group, gvr.version)
	};
	ApiResource {
		group: gvr.group.to_string(),
		version: gvr.version.to_string(),
		api_version,
		kind: kind.to_string(),
		plural: gvr.resource.to_string(),
	}
}

/// Translates kube-rs errors into the domain taxonomy. HTTP-status-bearing
/// API errors map by status; transport problems surface as Unavailable.
fn map_kube_err(e: kube::Error) -> Error {
	let code = match &e {
		kube::Error::Api(resp) => match resp.code {
			400 | 422 => Code::InvalidArgument,
			401 => Code::Unauthenticated,
			403 => Code::PermissionDenied,
			404 => Code::NotFound,
			409 => {
				if resp.reason == "AlreadyExists" {
					Code::AlreadyExists
				} else {
					Code::FailedPrecondition
				}
			},
			408 | 504 => Code::DeadlineExceeded,
			429 => Code::ResourceExhausted,
			500..=599 => Code::Unavailable,
			_ => Code::Internal,
		},
		kube::Error::Service(_) | kube::Error::HyperError(_) => Code::Unavailable,
		_ => Code::Internal,
	};
	let message = match &e {
		kube::Error::Api(resp) => resp.message.clone(),
		other => other.to_string(),
	};
	DomainError::wrap(code, message, e.into()).into()
}

#[async_trait::async_trait]
impl KubeBackend for KubeClientBackend {
	async fn server_resources(&self, user: &UserInfo) -> Result<Vec<ResourceInfo>, Error> {
		let client = self.client_for(user)?;
		let discovery = self.discovery(&client).await?;
		let mut out = Vec::new();
		for group in discovery.groups() {
			for version in group.versions() {
				for (ar, caps) in group.versioned_resources(version) {
					out.push(ResourceInfo {
						group: strng::new(&ar.group),
						version: strng::new(&ar.version),
						resource: strng::new(&ar.plural),
						kind: strng::new(&ar.kind),
						namespaced: matches!(caps.scope, kube::discovery::Scope::Namespaced),
					});
				}
			}
		}
		Ok(out)
	}

	async fn lookup_resource(&self, user: &UserInfo, gvr: &Gvr) -> Result<ResourceInfo, Error> {
		let client = self.client_for(user)?;
		let discovery = self.discovery(&client).await?;
		for group in discovery.groups() {
			if group.name() != gvr.group.as_str() {
				continue;
			}
			for (ar, caps) in group.versioned_resources(&gvr.version) {
				if ar.plural == gvr.resource.as_str() {
					return Ok(ResourceInfo {
						group: strng::new(&ar.group),
						version: strng::new(&ar.version),
						resource: strng::new(&ar.plural),
						kind: strng::new(&ar.kind),
						namespaced: matches!(caps.scope, kube::discovery::Scope::Namespaced),
					});
				}
			}
		}
		Err(Error::invalid_input(
			"resource",
			format!("{gvr} is not served by this cluster"),
		))
	}

	async fn fetch_schema(
		&self,
		group: &str,
		version: &str,
		kind: &str,
	) -> Result<serde_json::Value, Error> {
		let path = if group.is_empty() {
			format!("/openapi/v3/api/{version}")
		} else {
			format!("/openapi/v3/apis/{group}/{version}")
		};
		let req = http::Request::builder()
			.uri(&path)
			.body(Vec::new())
			.map_err(|e| DomainError::wrap(Code::Internal, "schema request", e.into()))?;
		let body = self
			.plain
			.request_text(req)
			.await
			.map_err(map_kube_err)?;
		let doc: serde_json::Value = serde_json::from_str(&body)
			.map_err(|e| DomainError::wrap(Code::Internal, "schema response", e.into()))?;
		let schemas = doc
			.pointer("/components/schemas")
			.and_then(|v| v.as_object())
			.ok_or_else(|| DomainError::new(Code::Internal, "schema document has no components"))?;
		for (_, schema) in schemas {
			let Some(gvks) = schema
				.get("x-kubernetes-group-version-kind")
				.and_then(|v| v.as_array())
			else {
				continue;
			};
			let matches = gvks.iter().any(|gvk| {
				gvk["group"] == group && gvk["version"] == version && gvk["kind"] == kind
			});
			if matches {
				return Ok(schema.clone());
			}
		}
		Err(DomainError::new(
			Code::NotFound,
			format!("no schema for {group}/{version} {kind}"),
		)
		.into())
	}

	async fn server_version(&self) -> Result<VersionInfo, Error> {
		let info = self
			.plain
			.apiserver_version()
			.await
			.map_err(map_kube_err)?;
		Ok(VersionInfo {
			major: info.major,
			minor: info.minor,
			git_version: info.git_version,
		})
	}

	async fn list(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		opts: ListOptions,
	) -> Result<serde_json::Value, Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;
		let lp = list_params(&opts);
		let list = api.list(&lp).await.map_err(map_kube_err)?;
		serde_json::to_value(&list)
			.map_err(|e| DomainError::wrap(Code::Internal, "serialize list", e.into()).into())
	}

	async fn get(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
	) -> Result<serde_json::Value, Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;
		let obj = api.get(name).await.map_err(map_kube_err)?;
		serde_json::to_value(&obj)
			.map_err(|e| DomainError::wrap(Code::Internal, "serialize object", e.into()).into())
	}

	async fn create(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		object: serde_json::Value,
	) -> Result<serde_json::Value, Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;
		let obj: DynamicObject = serde_json::from_value(object)
			.map_err(|e| Error::invalid_input("object", format!("not a valid object: {e}")))?;
		let created = api
			.create(&PostParams::default(), &obj)
			.await
			.map_err(map_kube_err)?;
		serde_json::to_value(&created)
			.map_err(|e| DomainError::wrap(Code::Internal, "serialize object", e.into()).into())
	}

	async fn apply(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		object: serde_json::Value,
		opts: ApplyOptions,
	) -> Result<serde_json::Value, Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;
		let mut pp = PatchParams::apply(&opts.field_manager);
		if opts.force {
			pp = pp.force();
		}
		let applied = api
			.patch(name, &pp, &Patch::Apply(object))
			.await
			.map_err(map_kube_err)?;
		serde_json::to_value(&applied)
			.map_err(|e| DomainError::wrap(Code::Internal, "serialize object", e.into()).into())
	}

	async fn delete(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		opts: DeleteOptions,
	) -> Result<(), Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;
		let mut dp = DeleteParams::default();
		dp.grace_period_seconds = opts.grace_period_seconds.map(|g| g.max(0) as u32);
		api.delete(name, &dp).await.map_err(map_kube_err)?;
		Ok(())
	}

	async fn list_events_for(
		&self,
		user: &UserInfo,
		namespace: Option<&str>,
		uid: &str,
	) -> Result<serde_json::Value, Error> {
		let client = self.client_for(user)?;
		let api: Api<Event> = match namespace {
			Some(ns) => Api::namespaced(client, ns),
			None => Api::all(client),
		};
		let lp = ListParams::default().fields(&format!("involvedObject.uid={uid}"));
		let list = api.list(&lp).await.map_err(map_kube_err)?;
		serde_json::to_value(&list)
			.map_err(|e| DomainError::wrap(Code::Internal, "serialize events", e.into()).into())
	}

	async fn watch(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		opts: WatchOptions,
	) -> Result<Watcher, Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;

		// The raw watch API has no initial-events knob, so the snapshot
		// phase of a watch-list is rendered as a list plus synthesized
		// ADDED events, then a watch from the list's resource version.
		let mut initial = Vec::new();
		let start_rv = if opts.send_initial_events {
			let mut lp = ListParams::default();
			if let Some(l) = &opts.label_selector {
				lp = lp.labels(l);
			}
			if let Some(f) = &opts.field_selector {
				lp = lp.fields(f);
			}
			let list = api.list(&lp).await.map_err(map_kube_err)?;
			let rv = list.metadata.resource_version.clone().unwrap_or_default();
			for item in list.items {
				initial.push(WatchEvent {
					event_type: WatchEventType::Added,
					object: serde_json::to_value(&item).unwrap_or_default(),
				});
			}
			rv
		} else {
			opts.resource_version.clone().unwrap_or_else(|| "0".to_string())
		};

		let mut wp = WatchParams::default();
		if let Some(l) = &opts.label_selector {
			wp = wp.labels(l);
		}
		if let Some(f) = &opts.field_selector {
			wp = wp.fields(f);
		}
		if !opts.allow_bookmarks {
			wp = wp.disable_bookmarks();
		}
		let mut stream = api
			.watch(&wp, &start_rv)
			.await
			.map_err(map_kube_err)?
			.boxed();

		let (tx, rx) = mpsc::channel(16);
		let stop = CancellationToken::new();
		let relay_stop = stop.clone();
		tokio::spawn(async move {
			for ev in initial {
				if tx.send(ev).await.is_err() {
					return;
				}
			}
			loop {
				tokio::select! {
					_ = relay_stop.cancelled() => return,
					item = stream.next() => match item {
						Some(Ok(ev)) => {
							if tx.send(map_watch_event(ev)).await.is_err() {
								return;
							}
						},
						Some(Err(e)) => {
							debug!("watch stream error: {e}");
							if tx.send(WatchEvent::error(e.to_string())).await.is_err() {
								return;
							}
						},
						None => return,
					},
				}
			}
		});
		Ok(Watcher::new(rx, stop))
	}

	async fn pod_logs(
		&self,
		user: &UserInfo,
		namespace: &str,
		pod: &str,
		opts: LogOptions,
	) -> Result<LogStream, Error> {
		let api = self.pods(user, namespace)?;
		let mut lp = LogParams::default();
		lp.container = opts.container;
		lp.follow = opts.follow;
		lp.tail_lines = opts.tail_lines;
		lp.since_seconds = opts.since_seconds;
		lp.previous = opts.previous;
		lp.timestamps = opts.timestamps;
		let reader = api.log_stream(pod, &lp).await.map_err(map_kube_err)?;
		let stream = tokio_util::io::ReaderStream::new(tokio_util::compat::FuturesAsyncReadCompatExt::compat(reader)).map(|chunk| {
			chunk.map_err(|e| Error::from(DomainError::unavailable(format!("log stream: {e}"))))
		});
		Ok(stream.boxed())
	}

	async fn exec(
		&self,
		user: &UserInfo,
		opts: ExecOptions,
		mut stdin: Box<dyn AsyncRead + Send + Unpin>,
		mut stdout: Box<dyn AsyncWrite + Send + Unpin>,
		stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
		resize: Option<SizeQueueReader>,
		cancel: CancellationToken,
	) -> Result<(), Error> {
		let api = self.pods(user, &opts.namespace)?;
		let mut ap = AttachParams::default()
			.stdin(true)
			.stdout(true)
			// In TTY mode the kubelet merges stderr into stdout.
			.stderr(!opts.tty)
			.tty(opts.tty);
		if let Some(container) = &opts.container {
			ap = ap.container(container.clone());
		}
		let mut attached = api
			.exec(&opts.pod, opts.command.clone(), &ap)
			.await
			.map_err(map_kube_err)?;

		let proc_stdin = attached.stdin();
		let proc_stdout = attached.stdout();
		let proc_stderr = attached.stderr();
		let size_tx = attached.terminal_size();

		// Stdin and resize run detached: they end when the remote side
		// closes, and must not gate session completion.
		tokio::spawn(async move {
			if let Some(mut w) = proc_stdin {
				let _ = tokio::io::copy(&mut stdin, &mut w).await;
				let _ = w.shutdown().await;
			}
		});
		if let (Some(mut queue), Some(mut tx)) = (resize, size_tx) {
			tokio::spawn(async move {
				while let Some(size) = queue.next().await {
					let terminal = kube::api::TerminalSize {
						height: size.rows,
						width: size.cols,
					};
					if tx.send(terminal).await.is_err() {
						return;
					}
				}
			});
		}

		let work = async move {
			let out = async {
				if let Some(mut r) = proc_stdout {
					let _ = tokio::io::copy(&mut r, &mut stdout).await;
				}
			};
			let err = async {
				if let (Some(mut r), Some(mut w)) = (proc_stderr, stderr) {
					let _ = tokio::io::copy(&mut r, &mut w).await;
				}
			};
			tokio::join!(out, err);
			attached
				.join()
				.await
				.map_err(|e| Error::from(DomainError::unavailable(format!("exec join: {e}"))))
		};
		tokio::select! {
			_ = cancel.cancelled() => Ok(()),
			res = work => res,
		}
	}

	async fn port_forward(
		&self,
		user: &UserInfo,
		opts: PortForwardOptions,
		mut stream: Box<dyn AsyncStream>,
		cancel: CancellationToken,
	) -> Result<(), Error> {
		let api = self.pods(user, &opts.namespace)?;
		let mut forwarder = api
			.portforward(&opts.pod, &[opts.port])
			.await
			.map_err(map_kube_err)?;
		let mut upstream = forwarder.take_stream(opts.port).ok_or_else(|| {
			Error::from(DomainError::new(
				Code::Internal,
				format!("no forward stream for port {}", opts.port),
			))
		})?;

		let work = async {
			let copy = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
			if let Err(e) = copy {
				debug!("port-forward copy ended: {e}");
			}
			Ok(())
		};
		tokio::select! {
			_ = cancel.cancelled() => Ok(()),
			res = work => res,
		}
	}

	async fn scale(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		replicas: i32,
	) -> Result<(), Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;
		let patch = serde_json::json!({ "spec": { "replicas": replicas } });
		api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn restart(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
	) -> Result<(), Error> {
		let info = self.lookup_resource(user, gvr).await?;
		let api = self.dynamic_api(user, gvr, &info, namespace)?;
		let now = OffsetDateTime::now_utc()
			.format(&Rfc3339)
			.map_err(|e| DomainError::wrap(Code::Internal, "format timestamp", e.into()))?;
		let patch = serde_json::json!({
			"spec": {
				"template": {
					"metadata": {
						"annotations": {
							"kubectl.kubernetes.io/restartedAt": now,
						}
					}
				}
			}
		});
		api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
			.await
			.map_err(map_kube_err)?;
		Ok(())
	}

	async fn apply_object(
		&self,
		user: &UserInfo,
		object: serde_json::Value,
		opts: ApplyOptions,
	) -> Result<serde_json::Value, Error> {
		let api_version = object
			.get("apiVersion")
			.and_then(|v| v.as_str())
			.ok_or_else(|| Error::invalid_input("object", "apiVersion is required"))?;
		let kind = object
			.get("kind")
			.and_then(|v| v.as_str())
			.ok_or_else(|| Error::invalid_input("object", "kind is required"))?;
		let name = object
			.pointer("/metadata/name")
			.and_then(|v| v.as_str())
			.ok_or_else(|| Error::invalid_input("object", "metadata.name is required"))?
			.to_string();
		let namespace = object
			.pointer("/metadata/namespace")
			.and_then(|v| v.as_str())
			.map(str::to_string);

		let api = self
			.api_by_gvk(user, api_version, kind, namespace.as_deref())
			.await?;
		let mut pp = PatchParams::apply(&opts.field_manager);
		if opts.force {
			pp = pp.force();
		}
		let applied = api
			.patch(&name, &pp, &Patch::Apply(object))
			.await
			.map_err(map_kube_err)?;
		serde_json::to_value(&applied)
			.map_err(|e| DomainError::wrap(Code::Internal, "serialize object", e.into()).into())
	}

	async fn get_object(
		&self,
		user: &UserInfo,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
		name: &str,
	) -> Result<serde_json::Value, Error> {
		let api = self.api_by_gvk(user, api_version, kind, namespace).await?;
		let obj = api.get(name).await.map_err(map_kube_err)?;
		serde_json::to_value(&obj)
			.map_err(|e| DomainError::wrap(Code::Internal, "serialize object", e.into()).into())
	}

	async fn invalidate_discovery(&self) {
		self.discovery.write().await.take();
	}
}

fn list_params(opts: &ListOptions) -> ListParams {
	let mut lp = ListParams::default();
	if let Some(l) = &opts.label_selector {
		lp = lp.labels(l);
	}
	if let Some(f) = &opts.field_selector {
		lp = lp.fields(f);
	}
	if let Some(limit) = opts.limit {
		lp = lp.limit(limit);
	}
	if let Some(token) = &opts.continue_token {
		lp = lp.continue_token(token);
	}
	lp
}

fn map_watch_event(ev: KubeWatchEvent<DynamicObject>) -> WatchEvent {
	match ev {
		KubeWatchEvent::Added(obj) => WatchEvent {
			event_type: WatchEventType::Added,
			object: serde_json::to_value(&obj).unwrap_or_default(),
		},
		KubeWatchEvent::Modified(obj) => WatchEvent {
			event_type: WatchEventType::Modified,
			object: serde_json::to_value(&obj).unwrap_or_default(),
		},
		KubeWatchEvent::Deleted(obj) => WatchEvent {
			event_type: WatchEventType::Deleted,
			object: serde_json::to_value(&obj).unwrap_or_default(),
		},
		KubeWatchEvent::Bookmark(b) => WatchEvent {
			event_type: WatchEventType::Bookmark,
			object: serde_json::json!({
				"metadata": { "resourceVersion": b.metadata.resource_version }
			}),
		},
		KubeWatchEvent::Error(e) => {
			warn!("watch error event: {} ({})", e.message, e.reason);
			WatchEvent::error(e.message)
		},
	}
}
