use std::{cell::RefCell, future::Future, pin::pin};

use async_channel as chan;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use super::request::Request;

/// A single stage of the request pipeline: a named unbounded queue feeding
/// exactly one worker task. Requests handed to the same queue are processed
/// in arrival order.
pub(crate) struct RequestQueue {
	name: &'static str,
	tx: chan::Sender<Request>,
	handle: RefCell<Option<JoinHandle<()>>>,
}

/// SAFETY: `handle` is only accessed by `finish`, which runs once during
/// teardown after every producer has stopped, so there are never concurrent
/// borrows.
unsafe impl Sync for RequestQueue {}

impl RequestQueue {
	pub fn new<F, Fut>(name: &'static str, processor: F) -> Self
	where
		F: Fn(Request) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let (tx, rx) = chan::unbounded();

		let handle = tokio::spawn(async move {
			trace!(queue = name, "Request queue worker started");

			let mut stream = pin!(rx);
			while let Some(request) = stream.next().await {
				processor(request).await;
			}

			trace!(queue = name, "Request queue worker stopped");
		});

		Self {
			name,
			tx,
			handle: RefCell::new(Some(handle)),
		}
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	pub async fn enqueue(&self, request: Request) {
		self.tx
			.send(request)
			.await
			.expect("request queue channel closed trying to enqueue a request");
	}

	/// Enqueue without waiting. The queue is unbounded, so this only fails
	/// once the queue has been closed, at which point the request is dropped.
	pub fn try_enqueue(&self, request: Request) {
		if self.tx.try_send(request).is_err() {
			warn!(
				queue = self.name,
				"Dropping a request enqueued after queue shutdown"
			);
		}
	}

	/// Close the queue, let the worker drain whatever is already enqueued,
	/// then wait for it to stop.
	pub async fn finish(&self) {
		self.tx.close();

		// The borrow must end before the await; holding the `RefMut` across
		// it would make this future non-`Send`.
		if let Some(handle) = self
			.handle
			.try_borrow_mut()
			.ok()
			.and_then(|mut maybe_handle| maybe_handle.take())
		{
			if let Err(e) = handle.await {
				error!(queue = self.name, ?e, "Request queue worker panicked");
			}
		} else {
			warn!(queue = self.name, "Request queue finished more than once");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	};

	use crate::request::{ControlAction, Request, RequestBody};

	use super::RequestQueue;

	fn barrier_request() -> Request {
		Request {
			context: None,
			router: None,
			zone: 0,
			body: RequestBody::Control {
				action: ControlAction::SparseCacheBarrier { virtual_chapter: 0 },
			},
		}
	}

	#[tokio::test]
	async fn finish_drains_then_joins_from_a_spawned_task() {
		let processed = Arc::new(AtomicU32::new(0));
		let queue = Arc::new(RequestQueue::new("testW", {
			let processed = Arc::clone(&processed);
			move |request| {
				let processed = Arc::clone(&processed);
				async move {
					drop(request);
					processed.fetch_add(1, Ordering::SeqCst);
				}
			}
		}));

		for _ in 0..8 {
			queue.enqueue(barrier_request()).await;
		}

		// Joining from a spawned task requires the finish future to move
		// between worker threads.
		tokio::spawn({
			let queue = Arc::clone(&queue);
			async move { queue.finish().await }
		})
		.await
		.unwrap();

		assert_eq!(processed.load(Ordering::SeqCst), 8);

		// A repeated finish is a warned no-op.
		queue.finish().await;
	}
}
