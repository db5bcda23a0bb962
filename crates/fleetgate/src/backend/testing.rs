//! Shared in-memory backend for unit tests across the use-case modules.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use fleet_core::strng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
	ApplyOptions, AsyncStream, DeleteOptions, ExecOptions, Gvr, KubeBackend, ListOptions,
	LogOptions, LogStream, PortForwardOptions, ResourceInfo, WatchEvent, WatchEventType,
	WatchOptions, Watcher,
};
use crate::discovery::VersionInfo;
use crate::errors::{Code, DomainError, Error};
use crate::identity::UserInfo;
use crate::runtime::resize::{SizeQueueReader, TerminalSize};

#[derive(Default)]
pub struct StubBackend {
	/// Objects applied via `apply_object`, in order (`kind/name`).
	pub applied_objects: Mutex<Vec<String>>,
	/// `get_object` calls needed before a CRD reports Established.
	pub established_after: std::sync::atomic::AtomicUsize,
	pub discovery_invalidated: AtomicBool,
	/// Resources discovery claims to serve; `None` accepts everything.
	pub known_resources: Mutex<Option<HashSet<String>>>,
	pub fail_events: AtomicBool,
	/// Scripted watch events, emitted then stream close.
	pub watch_script: Mutex<Vec<WatchEvent>>,
	pub recorded_watch_opts: Mutex<Vec<WatchOptions>>,
	/// Subjects observed on each impersonated call.
	pub impersonated: Mutex<Vec<String>>,
	pub applied: Mutex<Vec<(String, ApplyOptions)>>,
	pub scaled: Mutex<Vec<(String, i32)>>,
	pub restarted: Mutex<Vec<String>>,
	pub resizes: Mutex<Vec<TerminalSize>>,
	pub server_version: Mutex<Option<VersionInfo>>,
}

impl StubBackend {
	pub fn record_user(&self, user: &UserInfo) {
		self
			.impersonated
			.lock()
			.unwrap()
			.push(user.subject.to_string());
	}

	fn lookup(&self, gvr: &Gvr) -> Result<ResourceInfo, Error> {
		let known = self.known_resources.lock().unwrap();
		if let Some(set) = known.as_ref() {
			if !set.contains(&gvr.to_string()) {
				return Err(Error::invalid_input(
					"resource",
					format!("{gvr} is not served by this cluster"),
				));
			}
		}
		Ok(ResourceInfo {
			group: gvr.group.clone(),
			version: gvr.version.clone(),
			resource: gvr.resource.clone(),
			kind: strng::new("Stub"),
			namespaced: true,
		})
	}
}

#[async_trait::async_trait]
impl KubeBackend for StubBackend {
	async fn server_resources(&self, user: &UserInfo) -> Result<Vec<ResourceInfo>, Error> {
		self.record_user(user);
		Ok(vec![ResourceInfo {
			group: strng::new(""),
			version: strng::new("v1"),
			resource: strng::new("pods"),
			kind: strng::new("Pod"),
			namespaced: true,
		}])
	}

	async fn lookup_resource(&self, user: &UserInfo, gvr: &Gvr) -> Result<ResourceInfo, Error> {
		self.record_user(user);
		self.lookup(gvr)
	}

	async fn fetch_schema(
		&self,
		_group: &str,
		version: &str,
		kind: &str,
	) -> Result<serde_json::Value, Error> {
		Ok(serde_json::json!({"type": "object", "x-kind": kind, "x-version": version}))
	}

	async fn server_version(&self) -> Result<VersionInfo, Error> {
		Ok(self.server_version.lock().unwrap().clone().unwrap_or(
			VersionInfo {
				major: "1".into(),
				minor: "34".into(),
				git_version: "v1.34.0".into(),
			},
		))
	}

	async fn list(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		_opts: ListOptions,
	) -> Result<serde_json::Value, Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		Ok(serde_json::json!({
			"apiVersion": "v1",
			"kind": "List",
			"items": [stub_object("one"), stub_object("two")],
		}))
	}

	async fn get(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		name: &str,
	) -> Result<serde_json::Value, Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		if name == "missing" {
			return Err(DomainError::new(Code::NotFound, format!("{name} not found")).into());
		}
		Ok(stub_object(name))
	}

	async fn create(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		object: serde_json::Value,
	) -> Result<serde_json::Value, Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		Ok(object)
	}

	async fn apply(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		name: &str,
		object: serde_json::Value,
		opts: ApplyOptions,
	) -> Result<serde_json::Value, Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		if name == "conflict" && !opts.force {
			return Err(
				DomainError::new(Code::FailedPrecondition, "field manager conflict").into(),
			);
		}
		self.applied.lock().unwrap().push((name.to_string(), opts));
		Ok(object)
	}

	async fn delete(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		_name: &str,
		_opts: DeleteOptions,
	) -> Result<(), Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		Ok(())
	}

	async fn list_events_for(
		&self,
		user: &UserInfo,
		_namespace: Option<&str>,
		uid: &str,
	) -> Result<serde_json::Value, Error> {
		self.record_user(user);
		if self.fail_events.load(Ordering::SeqCst) {
			return Err(DomainError::new(Code::PermissionDenied, "events are forbidden").into());
		}
		Ok(serde_json::json!({
			"items": [{"reason": "Scheduled", "involvedObject": {"uid": uid}}]
		}))
	}

	async fn watch(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		opts: WatchOptions,
	) -> Result<Watcher, Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		self.recorded_watch_opts.lock().unwrap().push(opts);
		let script: Vec<WatchEvent> = self.watch_script.lock().unwrap().drain(..).collect();
		let (tx, rx) = mpsc::channel(16);
		let stop = CancellationToken::new();
		let task_stop = stop.clone();
		tokio::spawn(async move {
			for ev in script {
				tokio::select! {
					_ = task_stop.cancelled() => return,
					sent = tx.send(ev) => {
						if sent.is_err() {
							return;
						}
					},
				}
			}
		});
		Ok(Watcher::new(rx, stop))
	}

	async fn pod_logs(
		&self,
		user: &UserInfo,
		_namespace: &str,
		_pod: &str,
		_opts: LogOptions,
	) -> Result<LogStream, Error> {
		self.record_user(user);
		let chunks: Vec<Result<bytes::Bytes, Error>> = vec![
			Ok(bytes::Bytes::from_static(b"line one\n")),
			Ok(bytes::Bytes::from_static(b"line two\n")),
		];
		Ok(Box::pin(futures_util::stream::iter(chunks)))
	}

	async fn exec(
		&self,
		user: &UserInfo,
		_opts: ExecOptions,
		mut stdin: Box<dyn AsyncRead + Send + Unpin>,
		mut stdout: Box<dyn AsyncWrite + Send + Unpin>,
		_stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
		resize: Option<SizeQueueReader>,
		cancel: CancellationToken,
	) -> Result<(), Error> {
		self.record_user(user);
		let drain = async {
			if let Some(mut resize) = resize {
				while let Some(size) = resize.next().await {
					self.resizes.lock().unwrap().push(size);
				}
			}
			// With no queue there is nothing to drain; wait for cancel so
			// the echo loop decides completion.
			std::future::pending::<()>().await;
		};
		let echo = async {
			let mut buf = [0u8; 1024];
			loop {
				match stdin.read(&mut buf).await {
					Ok(0) | Err(_) => break,
					Ok(n) => {
						if stdout.write_all(&buf[..n]).await.is_err() {
							break;
						}
					},
				}
			}
		};
		tokio::select! {
			_ = cancel.cancelled() => {},
			_ = echo => {},
			_ = drain => {},
		}
		Ok(())
	}

	async fn port_forward(
		&self,
		user: &UserInfo,
		_opts: PortForwardOptions,
		mut stream: Box<dyn AsyncStream>,
		cancel: CancellationToken,
	) -> Result<(), Error> {
		self.record_user(user);
		let mut buf = [0u8; 1024];
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				read = stream.read(&mut buf) => match read {
					Ok(0) | Err(_) => break,
					Ok(n) => {
						if stream.write_all(&buf[..n]).await.is_err() {
							break;
						}
					},
				},
			}
		}
		Ok(())
	}

	async fn scale(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		name: &str,
		replicas: i32,
	) -> Result<(), Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		self
			.scaled
			.lock()
			.unwrap()
			.push((name.to_string(), replicas));
		Ok(())
	}

	async fn restart(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		_namespace: Option<&str>,
		name: &str,
	) -> Result<(), Error> {
		self.record_user(user);
		self.lookup(gvr)?;
		self.restarted.lock().unwrap().push(name.to_string());
		Ok(())
	}

	async fn apply_object(
		&self,
		_user: &UserInfo,
		object: serde_json::Value,
		_opts: ApplyOptions,
	) -> Result<serde_json::Value, Error> {
		let kind = object["kind"].as_str().unwrap_or_default().to_string();
		let name = object
			.pointer("/metadata/name")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();
		self
			.applied_objects
			.lock()
			.unwrap()
			.push(format!("{kind}/{name}"));
		Ok(object)
	}

	async fn get_object(
		&self,
		_user: &UserInfo,
		_api_version: &str,
		kind: &str,
		_namespace: Option<&str>,
		name: &str,
	) -> Result<serde_json::Value, Error> {
		let remaining = self.established_after.load(Ordering::SeqCst);
		let established = if remaining == 0 {
			true
		} else {
			self.established_after.fetch_sub(1, Ordering::SeqCst);
			remaining == 1
		};
		let status = if established { "True" } else { "False" };
		Ok(serde_json::json!({
			"apiVersion": "apiextensions.k8s.io/v1",
			"kind": kind,
			"metadata": { "name": name },
			"status": {
				"conditions": [
					{ "type": "NamesAccepted", "status": "True" },
					{ "type": "Established", "status": status },
				]
			}
		}))
	}

	async fn invalidate_discovery(&self) {
		self.discovery_invalidated.store(true, Ordering::SeqCst);
	}
}

/// An object carrying the noisy metadata the handler layer must scrub.
pub fn stub_object(name: &str) -> serde_json::Value {
	serde_json::json!({
		"apiVersion": "v1",
		"kind": "Pod",
		"metadata": {
			"name": name,
			"namespace": "default",
			"uid": format!("uid-{name}"),
			"managedFields": [{"manager": "kubectl"}],
			"annotations": {
				"kubectl.kubernetes.io/last-applied-configuration": "{}",
			},
		},
		"spec": {"containers": []},
	})
}

pub fn watch_added(name: &str) -> WatchEvent {
	WatchEvent {
		event_type: WatchEventType::Added,
		object: stub_object(name),
	}
}
