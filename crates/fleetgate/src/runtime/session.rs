use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, SimplexStream, WriteHalf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{Code, DomainError, Error};
use crate::runtime::resize::{SizeQueue, TerminalSize};
use crate::telemetry::SharedMetrics;

/// Hard cap per session kind; the 101st start is refused.
pub const MAX_SESSIONS_PER_KIND: usize = 100;

/// Terminal result of a session worker, peekable by the reaper.
pub type DoneReceiver = watch::Receiver<Option<Result<(), Error>>>;
pub type DoneSender = watch::Sender<Option<Result<(), Error>>>;

pub fn done_channel() -> (DoneSender, DoneReceiver) {
	watch::channel(None)
}

/// An exec session. Mutated only by its worker and by the single RPC
/// consumer writing stdin; the store hands out `Arc`s.
pub struct ExecSession {
	pub id: Uuid,
	stdin: tokio::sync::Mutex<Option<WriteHalf<SimplexStream>>>,
	resize: Option<SizeQueue>,
	cancel: CancellationToken,
	done: DoneReceiver,
}

impl ExecSession {
	pub fn new(
		id: Uuid,
		stdin: WriteHalf<SimplexStream>,
		resize: Option<SizeQueue>,
		cancel: CancellationToken,
		done: DoneReceiver,
	) -> Self {
		ExecSession {
			id,
			stdin: tokio::sync::Mutex::new(Some(stdin)),
			resize,
			cancel,
			done,
		}
	}

	/// Writes stdin bytes. Blocks on pipe backpressure rather than
	/// buffering without bound.
	pub async fn write_stdin(&self, data: &[u8]) -> Result<(), Error> {
		let mut guard = self.stdin.lock().await;
		let Some(w) = guard.as_mut() else {
			return Err(DomainError::new(Code::Unavailable, "session stdin is closed").into());
		};
		w.write_all(data)
			.await
			.map_err(|e| DomainError::new(Code::Unavailable, format!("stdin write: {e}")).into())
	}

	/// Queues a terminal resize; a no-op for non-TTY sessions.
	pub fn resize(&self, size: TerminalSize) {
		if let Some(q) = &self.resize {
			q.push(size);
		}
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Whether the worker has posted its terminal result.
	pub fn is_done(&self) -> bool {
		self.done.borrow().is_some()
	}

	/// Waits for the worker's terminal result.
	pub async fn wait_done(&self) -> Option<Result<(), Error>> {
		let mut done = self.done.clone();
		loop {
			if let Some(result) = done.borrow_and_update().clone() {
				return Some(result);
			}
			if done.changed().await.is_err() {
				return None;
			}
		}
	}

	/// Cancels the worker and closes the write-side resources. Safe to call
	/// more than once; the cancel token and queue close are idempotent and
	/// the stdin half is dropped at most once.
	pub async fn shutdown(&self) {
		self.cancel.cancel();
		self.stdin.lock().await.take();
		if let Some(q) = &self.resize {
			q.close();
		}
	}
}

/// A port-forward session: same lifecycle as exec with a single
/// client-to-pod writer instead of stdin/resize.
pub struct PortForwardSession {
	pub id: Uuid,
	writer: tokio::sync::Mutex<Option<WriteHalf<SimplexStream>>>,
	cancel: CancellationToken,
	done: DoneReceiver,
}

impl PortForwardSession {
	pub fn new(
		id: Uuid,
		writer: WriteHalf<SimplexStream>,
		cancel: CancellationToken,
		done: DoneReceiver,
	) -> Self {
		PortForwardSession {
			id,
			writer: tokio::sync::Mutex::new(Some(writer)),
			cancel,
			done,
		}
	}

	pub async fn write(&self, data: &[u8]) -> Result<(), Error> {
		let mut guard = self.writer.lock().await;
		let Some(w) = guard.as_mut() else {
			return Err(DomainError::new(Code::Unavailable, "session writer is closed").into());
		};
		w.write_all(data)
			.await
			.map_err(|e| DomainError::new(Code::Unavailable, format!("forward write: {e}")).into())
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	pub fn is_done(&self) -> bool {
		self.done.borrow().is_some()
	}

	pub async fn shutdown(&self) {
		self.cancel.cancel();
		self.writer.lock().await.take();
	}
}

/// Session registry with a per-kind cap. Lookups take the read lock;
/// `put`/`remove`/the reaper take the write lock. Cleanup (cancel + close)
/// always happens after the lock is released so a worker blocked on a pipe
/// write can never deadlock against the store.
pub struct SessionStore {
	exec: RwLock<HashMap<Uuid, Arc<ExecSession>>>,
	port_forward: RwLock<HashMap<Uuid, Arc<PortForwardSession>>>,
	metrics: SharedMetrics,
}

impl SessionStore {
	pub fn new(metrics: SharedMetrics) -> Self {
		SessionStore {
			exec: RwLock::new(HashMap::new()),
			port_forward: RwLock::new(HashMap::new()),
			metrics,
		}
	}

	pub fn put_exec(&self, session: Arc<ExecSession>) -> Result<(), Error> {
		let mut map = self.exec.write().expect("session store poisoned");
		if map.len() >= MAX_SESSIONS_PER_KIND {
			return Err(Error::resource_exhausted(
				"max concurrent exec sessions reached",
			));
		}
		map.insert(session.id, session);
		self.metrics.active_exec_sessions.set(map.len() as i64);
		Ok(())
	}

	pub fn get_exec(&self, id: &Uuid) -> Option<Arc<ExecSession>> {
		self.exec.read().expect("session store poisoned").get(id).cloned()
	}

	/// Atomically extracts the session so cleanup runs exactly once even if
	/// an RPC cleanup races the reaper.
	pub fn remove_exec(&self, id: &Uuid) -> Option<Arc<ExecSession>> {
		let mut map = self.exec.write().expect("session store poisoned");
		let removed = map.remove(id);
		self.metrics.active_exec_sessions.set(map.len() as i64);
		removed
	}

	pub fn put_port_forward(&self, session: Arc<PortForwardSession>) -> Result<(), Error> {
		let mut map = self.port_forward.write().expect("session store poisoned");
		if map.len() >= MAX_SESSIONS_PER_KIND {
			return Err(Error::resource_exhausted(
				"max concurrent port-forward sessions reached",
			));
		}
		map.insert(session.id, session);
		self
			.metrics
			.active_port_forward_sessions
			.set(map.len() as i64);
		Ok(())
	}

	pub fn get_port_forward(&self, id: &Uuid) -> Option<Arc<PortForwardSession>> {
		self
			.port_forward
			.read()
			.expect("session store poisoned")
			.get(id)
			.cloned()
	}

	pub fn remove_port_forward(&self, id: &Uuid) -> Option<Arc<PortForwardSession>> {
		let mut map = self.port_forward.write().expect("session store poisoned");
		let removed = map.remove(id);
		self
			.metrics
			.active_port_forward_sessions
			.set(map.len() as i64);
		removed
	}

	/// Claim-and-release reaping: sessions whose workers have finished are
	/// removed under the write lock and cleaned up after it is dropped.
	pub async fn reap_stale_sessions(&self) -> usize {
		let claimed_exec: Vec<Arc<ExecSession>> = {
			let mut map = self.exec.write().expect("session store poisoned");
			let stale: Vec<Uuid> = map
				.iter()
				.filter(|(_, s)| s.is_done())
				.map(|(id, _)| *id)
				.collect();
			let claimed = stale.iter().filter_map(|id| map.remove(id)).collect();
			self.metrics.active_exec_sessions.set(map.len() as i64);
			claimed
		};
		let claimed_pf: Vec<Arc<PortForwardSession>> = {
			let mut map = self.port_forward.write().expect("session store poisoned");
			let stale: Vec<Uuid> = map
				.iter()
				.filter(|(_, s)| s.is_done())
				.map(|(id, _)| *id)
				.collect();
			let claimed = stale.iter().filter_map(|id| map.remove(id)).collect();
			self
				.metrics
				.active_port_forward_sessions
				.set(map.len() as i64);
			claimed
		};

		let reaped = claimed_exec.len() + claimed_pf.len();
		for s in claimed_exec {
			s.shutdown().await;
		}
		for s in claimed_pf {
			s.shutdown().await;
		}
		if reaped > 0 {
			debug!("reaped {reaped} finished sessions");
		}
		reaped
	}

	pub fn exec_count(&self) -> usize {
		self.exec.read().expect("session store poisoned").len()
	}

	pub fn port_forward_count(&self) -> usize {
		self
			.port_forward
			.read()
			.expect("session store poisoned")
			.len()
	}
}

/// Ticker loop invoking the reaper until shutdown.
pub async fn run_reaper(store: Arc<SessionStore>, interval: Duration, shutdown: CancellationToken) {
	let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = ticker.tick() => {
				store.reap_stale_sessions().await;
			},
			_ = shutdown.cancelled() => return,
		}
	}
}
