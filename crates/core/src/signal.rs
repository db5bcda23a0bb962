use tokio::sync::mpsc;
use tracing::info;

/// Aggregates OS termination signals and programmatic shutdown triggers into
/// a single awaitable event.
pub struct Shutdown {
	shutdown_tx: mpsc::Sender<()>,
	shutdown_rx: mpsc::Receiver<()>,
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown {
			shutdown_tx,
			shutdown_rx,
		}
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Waits until a termination signal arrives or a trigger fires.
	pub async fn wait(mut self) {
		tokio::select! {
			_ = wait_for_signal() => {},
			_ = self.shutdown_rx.recv() => {
				info!("received programmatic shutdown");
			},
		}
	}
}

#[derive(Clone)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(()).await;
	}
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
	tokio::select! {
		_ = sigterm.recv() => info!("received SIGTERM"),
		_ = tokio::signal::ctrl_c() => info!("received interrupt"),
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() {
	tokio::signal::ctrl_c()
		.await
		.expect("failed to register interrupt handler");
	info!("received interrupt");
}
