use std::sync::Arc;

use async_trait::async_trait;
use futures_concurrency::future::Join;
use tracing::error;

use crate::{
	error::Error,
	index::{DispatchOutcome, Index, IndexConfiguration, IndexStats},
	queue::RequestQueue,
	request::{ControlAction, Request, RequestBody, RequestStage},
};

use super::IndexRouter;

/// The router for an index living in this process.
///
/// One queue and worker per zone, plus a single triage queue when the index
/// is sparse and multi-zone. The triage worker is the only task that emits
/// sparse-cache barrier messages, which keeps every zone queue's barrier
/// ordered before the request that triggered it.
pub(crate) struct LocalIndexRouter {
	index: Arc<dyn Index>,
	zone_queues: Vec<RequestQueue>,
	triage_queue: Option<RequestQueue>,
}

impl LocalIndexRouter {
	pub fn new(index: Arc<dyn Index>) -> Self {
		let configuration = index.configuration();

		let zone_queues = (0..configuration.zone_count)
			.map(|_| {
				RequestQueue::new("indexW", |request: Request| async move {
					let router = request
						.router
						.clone()
						.expect("request reached an index queue without a router");
					router.execute(request).await;
				})
			})
			.collect();

		// Only a sparse, multi-zone index needs barriers, so only it pays
		// for the extra stage.
		let triage_queue = (configuration.zone_count > 1 && configuration.sparse).then(|| {
			RequestQueue::new("triageW", |request: Request| async move {
				let router = request
					.router
					.clone()
					.expect("request reached the triage queue without a router");
				router.triage(request).await;
			})
		});

		Self {
			index,
			zone_queues,
			triage_queue,
		}
	}

	/// Send one barrier message to every zone queue. These must all be
	/// enqueued before the triggering request reaches its own zone queue.
	async fn enqueue_barrier_messages(&self, request: &Request, virtual_chapter: u64) {
		for (zone, queue) in self.zone_queues.iter().enumerate() {
			queue
				.enqueue(Request {
					context: None,
					router: request.router.clone(),
					zone,
					body: RequestBody::Control {
						action: ControlAction::SparseCacheBarrier { virtual_chapter },
					},
				})
				.await;
		}
	}
}

#[async_trait]
impl IndexRouter for LocalIndexRouter {
	fn configuration(&self) -> IndexConfiguration {
		self.index.configuration()
	}

	fn select_queue(&self, request: &mut Request, stage: RequestStage) -> &RequestQueue {
		if request.is_control() {
			// Control messages are pre-assigned to a zone.
			return &self.zone_queues[request.zone];
		}

		if stage == RequestStage::Triage {
			if let Some(triage_queue) = &self.triage_queue {
				return triage_queue;
			}
		}

		request.zone = self.index.zone_of(request.name());
		&self.zone_queues[request.zone]
	}

	async fn execute(&self, mut request: Request) {
		match &mut request.body {
			RequestBody::Control { action } => {
				match action {
					ControlAction::SparseCacheBarrier { virtual_chapter } => {
						let virtual_chapter = *virtual_chapter;
						let zone = request.zone;
						if let Err(e) = self
							.index
							.update_sparse_cache(zone, virtual_chapter)
							.await
						{
							error!(
								zone,
								virtual_chapter,
								?e,
								"Failed to update the sparse cache"
							);
						}
					}
					_ => error!("Synchronous control message routed to an index queue"),
				}

				request.enter_callback_stage().await;
			}
			RequestBody::Record(record) => {
				if record.requeued && record.status.is_err() {
					// A request that failed after surviving a barrier is
					// poisoned; the index is no longer trustworthy.
					let error = std::mem::replace(&mut record.status, Ok(()))
						.expect_err("status checked to be an error");
					record.status = Err(Error::unrecoverable(error));
					request.enter_callback_stage().await;
					return;
				}

				match self.index.dispatch(request).await {
					DispatchOutcome::Done(request) => request.enter_callback_stage().await,
					// The engine owns the request and will restart it.
					DispatchOutcome::Queued => {}
				}
			}
		}
	}

	async fn triage(&self, request: Request) {
		if let Some(virtual_chapter) = self.index.triage(&request) {
			self.enqueue_barrier_messages(&request, virtual_chapter).await;
		}

		request.enqueue(RequestStage::Index).await;
	}

	async fn save_state(&self) -> Result<(), Error> {
		self.index.save().await
	}

	async fn get_statistics(&self) -> IndexStats {
		self.index.stats().await
	}

	fn set_checkpoint_frequency(&self, frequency: u32) {
		self.index.set_checkpoint_frequency(frequency);
	}

	async fn finish(&self) {
		if let Some(triage_queue) = &self.triage_queue {
			triage_queue.finish().await;
		}

		self.zone_queues
			.iter()
			.map(RequestQueue::finish)
			.collect::<Vec<_>>()
			.join()
			.await;
	}
}
