use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Terminal dimensions for a TTY exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TerminalSize {
	pub rows: u16,
	pub cols: u16,
}

/// A newer size supersedes an older one, so the queue stays small and drops
/// the oldest entry on overflow.
const SIZE_QUEUE_CAPACITY: usize = 4;

struct QueueState {
	queue: VecDeque<TerminalSize>,
	closed: bool,
}

struct Shared {
	state: Mutex<QueueState>,
	notify: Notify,
}

/// Producer half of the terminal-size queue. Pushes after close are no-ops,
/// not errors; `close` is idempotent.
#[derive(Clone)]
pub struct SizeQueue {
	shared: Arc<Shared>,
}

/// Consumer half; exactly one exists per session, owned by the exec worker.
pub struct SizeQueueReader {
	shared: Arc<Shared>,
}

pub fn size_queue() -> (SizeQueue, SizeQueueReader) {
	let shared = Arc::new(Shared {
		state: Mutex::new(QueueState {
			queue: VecDeque::with_capacity(SIZE_QUEUE_CAPACITY),
			closed: false,
		}),
		notify: Notify::new(),
	});
	(
		SizeQueue {
			shared: shared.clone(),
		},
		SizeQueueReader { shared },
	)
}

impl SizeQueue {
	pub fn push(&self, size: TerminalSize) {
		{
			let mut state = self.shared.state.lock().expect("size queue poisoned");
			if state.closed {
				return;
			}
			if state.queue.len() == SIZE_QUEUE_CAPACITY {
				state.queue.pop_front();
			}
			state.queue.push_back(size);
		}
		self.shared.notify.notify_one();
	}

	pub fn close(&self) {
		{
			let mut state = self.shared.state.lock().expect("size queue poisoned");
			state.closed = true;
		}
		self.shared.notify.notify_one();
	}
}

impl SizeQueueReader {
	/// Blocks until a size is queued or the queue is closed. Remaining
	/// entries are drained before the close is observed.
	pub async fn next(&mut self) -> Option<TerminalSize> {
		loop {
			// Create the future before checking state so a push landing in
			// between leaves a permit for the await below.
			let notified = self.shared.notify.notified();
			{
				let mut state = self.shared.state.lock().expect("size queue poisoned");
				if let Some(size) = state.queue.pop_front() {
					return Some(size);
				}
				if state.closed {
					return None;
				}
			}
			notified.await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sz(rows: u16, cols: u16) -> TerminalSize {
		TerminalSize { rows, cols }
	}

	#[tokio::test]
	async fn overflow_drops_oldest() {
		let (q, mut rx) = size_queue();
		for i in 1..=6u16 {
			q.push(sz(i, i));
		}
		// Capacity 4: entries 1 and 2 were dropped.
		assert_eq!(rx.next().await, Some(sz(3, 3)));
		assert_eq!(rx.next().await, Some(sz(4, 4)));
		assert_eq!(rx.next().await, Some(sz(5, 5)));
		assert_eq!(rx.next().await, Some(sz(6, 6)));
	}

	#[tokio::test]
	async fn close_drains_then_ends() {
		let (q, mut rx) = size_queue();
		q.push(sz(24, 80));
		q.close();
		q.close();
		q.push(sz(50, 100));
		assert_eq!(rx.next().await, Some(sz(24, 80)));
		assert_eq!(rx.next().await, None);
		assert_eq!(rx.next().await, None);
	}

	#[tokio::test]
	async fn next_blocks_until_push() {
		let (q, mut rx) = size_queue();
		let handle = tokio::spawn(async move { rx.next().await });
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		q.push(sz(1, 2));
		assert_eq!(handle.await.unwrap(), Some(sz(1, 2)));
	}
}
