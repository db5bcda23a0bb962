pub mod resize;
pub mod session;

use std::sync::Arc;

use tokio::io::{AsyncWrite, ReadHalf, SimplexStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{ExecOptions, Gvr, KubeBackend, LogOptions, LogStream, PortForwardOptions};
use crate::errors::Error;
use crate::identity::UserInfo;
use crate::runtime::resize::{TerminalSize, size_queue};
use crate::runtime::session::{ExecSession, PortForwardSession, SessionStore, done_channel};

/// Per-pipe buffer before writes block. Backpressure is the pipe itself;
/// nothing above it buffers.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ExecParams {
	pub namespace: String,
	pub pod: String,
	pub container: Option<String>,
	pub command: Vec<String>,
	pub tty: bool,
	pub initial_rows: u16,
	pub initial_cols: u16,
}

#[derive(Debug, Clone)]
pub struct PortForwardParams {
	pub namespace: String,
	pub pod: String,
	pub port: u16,
}

/// Reader ends handed to the streaming handler.
#[derive(Debug)]
pub struct ExecStart {
	pub session_id: Uuid,
	pub stdout: ReadHalf<SimplexStream>,
	pub stderr: Option<ReadHalf<SimplexStream>>,
}

#[derive(Debug)]
pub struct PortForwardStart {
	pub session_id: Uuid,
	pub output: ReadHalf<SimplexStream>,
}

/// Exec, port-forward, pod logs, scale and restart. Sessions live in the
/// store until explicit cleanup or the reaper claims them.
pub struct RuntimeUseCase {
	backend: Arc<dyn KubeBackend>,
	store: Arc<SessionStore>,
}

impl RuntimeUseCase {
	pub fn new(backend: Arc<dyn KubeBackend>, store: Arc<SessionStore>) -> Self {
		RuntimeUseCase { backend, store }
	}

	pub fn store(&self) -> Arc<SessionStore> {
		self.store.clone()
	}

	pub fn start_exec(&self, user: &UserInfo, params: ExecParams) -> Result<ExecStart, Error> {
		if params.pod.trim().is_empty() {
			return Err(Error::invalid_input("name", "must not be empty"));
		}
		if params.command.is_empty() {
			return Err(Error::invalid_input("command", "must not be empty"));
		}

		let id = Uuid::new_v4();
		let (stdin_r, stdin_w) = tokio::io::simplex(PIPE_CAPACITY);
		let (stdout_r, stdout_w) = tokio::io::simplex(PIPE_CAPACITY);
		// In TTY mode the kubelet multiplexes stderr into stdout, so no
		// stderr pipe exists at all.
		let (stderr_r, stderr_w) = if params.tty {
			(None, None)
		} else {
			let (r, w) = tokio::io::simplex(PIPE_CAPACITY);
			(Some(r), Some(w))
		};
		let (queue, queue_reader) = if params.tty {
			let (q, r) = size_queue();
			(Some(q), Some(r))
		} else {
			(None, None)
		};
		if params.initial_rows > 0 && params.initial_cols > 0 {
			if let Some(q) = &queue {
				q.push(TerminalSize {
					rows: params.initial_rows,
					cols: params.initial_cols,
				});
			}
		}

		let cancel = CancellationToken::new();
		let (done_tx, done_rx) = done_channel();
		let session = Arc::new(ExecSession::new(
			id,
			stdin_w,
			queue.clone(),
			cancel.clone(),
			done_rx,
		));
		self.store.put_exec(session)?;

		let backend = self.backend.clone();
		let user = user.clone();
		let opts = ExecOptions {
			namespace: params.namespace,
			pod: params.pod,
			container: params.container,
			command: params.command,
			tty: params.tty,
		};
		tokio::spawn(async move {
			let result = backend
				.exec(
					&user,
					opts,
					Box::new(stdin_r),
					Box::new(stdout_w),
					stderr_w.map(|w| Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>),
					queue_reader,
					cancel,
				)
				.await;
			// The worker owns the stdout/stderr halves, dropped on return;
			// close the size queue so a blocked resize reader exits too.
			if let Some(q) = &queue {
				q.close();
			}
			if let Err(e) = &result {
				debug!(session = %id, "exec worker finished with error: {e}");
			}
			let _ = done_tx.send(Some(result));
		});

		Ok(ExecStart {
			session_id: id,
			stdout: stdout_r,
			stderr: stderr_r,
		})
	}

	pub fn start_port_forward(
		&self,
		user: &UserInfo,
		params: PortForwardParams,
	) -> Result<PortForwardStart, Error> {
		if params.pod.trim().is_empty() {
			return Err(Error::invalid_input("name", "must not be empty"));
		}
		if params.port == 0 {
			return Err(Error::invalid_input("port", "must be between 1 and 65535"));
		}

		let id = Uuid::new_v4();
		// Client-to-pod and pod-to-client pipes; the backend copies both
		// directions through the joined stream.
		let (up_r, up_w) = tokio::io::simplex(PIPE_CAPACITY);
		let (down_r, down_w) = tokio::io::simplex(PIPE_CAPACITY);

		let cancel = CancellationToken::new();
		let (done_tx, done_rx) = done_channel();
		let session = Arc::new(PortForwardSession::new(id, up_w, cancel.clone(), done_rx));
		self.store.put_port_forward(session)?;

		let backend = self.backend.clone();
		let user = user.clone();
		let opts = PortForwardOptions {
			namespace: params.namespace,
			pod: params.pod,
			port: params.port,
		};
		tokio::spawn(async move {
			let stream = tokio::io::join(up_r, down_w);
			let result = backend
				.port_forward(&user, opts, Box::new(stream), cancel)
				.await;
			if let Err(e) = &result {
				debug!(session = %id, "port-forward worker finished with error: {e}");
			}
			let _ = done_tx.send(Some(result));
		});

		Ok(PortForwardStart {
			session_id: id,
			output: down_r,
		})
	}

	pub async fn write_exec(&self, id: &Uuid, data: &[u8]) -> Result<(), Error> {
		let session = self.store.get_exec(id).ok_or(Error::SessionNotFound)?;
		session.write_stdin(data).await
	}

	pub fn resize_exec(&self, id: &Uuid, rows: u16, cols: u16) -> Result<(), Error> {
		let session = self.store.get_exec(id).ok_or(Error::SessionNotFound)?;
		session.resize(TerminalSize { rows, cols });
		Ok(())
	}

	pub async fn write_port_forward(&self, id: &Uuid, data: &[u8]) -> Result<(), Error> {
		let session = self
			.store
			.get_port_forward(id)
			.ok_or(Error::SessionNotFound)?;
		session.write(data).await
	}

	/// Extract-and-shutdown; safe against a concurrent reaper claim.
	pub async fn cleanup_exec(&self, id: &Uuid) {
		if let Some(session) = self.store.remove_exec(id) {
			session.shutdown().await;
		}
	}

	pub async fn cleanup_port_forward(&self, id: &Uuid) {
		if let Some(session) = self.store.remove_port_forward(id) {
			session.shutdown().await;
		}
	}

	pub async fn pod_log(
		&self,
		user: &UserInfo,
		namespace: &str,
		pod: &str,
		opts: LogOptions,
	) -> Result<LogStream, Error> {
		if pod.trim().is_empty() {
			return Err(Error::invalid_input("name", "must not be empty"));
		}
		self.backend.pod_logs(user, namespace, pod, opts).await
	}

	pub async fn scale(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
		replicas: i32,
	) -> Result<(), Error> {
		if name.trim().is_empty() {
			return Err(Error::invalid_input("name", "must not be empty"));
		}
		if replicas < 0 {
			return Err(Error::invalid_input("replicas", "must not be negative"));
		}
		self.backend.scale(user, gvr, namespace, name, replicas).await
	}

	pub async fn restart(
		&self,
		user: &UserInfo,
		gvr: &Gvr,
		namespace: Option<&str>,
		name: &str,
	) -> Result<(), Error> {
		if name.trim().is_empty() {
			return Err(Error::invalid_input("name", "must not be empty"));
		}
		self.backend.restart(user, gvr, namespace, name).await
	}
}
