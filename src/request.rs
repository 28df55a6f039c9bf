use std::{
	future::Future,
	pin::Pin,
	sync::Arc,
	task::Poll,
	time::Instant,
};

use tokio::sync::{oneshot, OwnedSemaphorePermit};

use super::{
	chunk_name::ChunkName,
	context::{self, Context, ContextStats},
	error::Error,
	index::{BlockAddress, ChunkLocation},
	router::IndexRouter,
	session::SessionRef,
};

/// The index operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
	/// Record the chunk if absent, returning the canonical address if it was
	/// already indexed.
	Post,
	/// Overwrite the chunk's address.
	Update,
	Delete,
	/// Look up the chunk without modifying the index.
	Query,
}

/// The pipeline stage a request is being handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestStage {
	Triage,
	Index,
	Callback,
}

/// How a retired request reports its outcome.
pub(crate) enum Responder {
	/// Complete the handle the launcher is awaiting.
	Handle(oneshot::Sender<CompletedRequest>),
	/// Deliver dedupe advice through the context's registered callback.
	Advice,
}

pub(crate) struct RecordRequest {
	pub op: OperationKind,
	pub name: Option<ChunkName>,
	pub data: Option<Vec<u8>>,
	pub data_len: usize,
	pub new_address: Option<BlockAddress>,
	pub canonical_address: Option<BlockAddress>,
	pub location: ChunkLocation,
	pub status: Result<(), Error>,
	pub requeued: bool,
	pub from_callback: bool,
	pub init_time: Instant,
	pub responder: Responder,
	pub permit: Option<OwnedSemaphorePermit>,
}

/// Internal control messages that ride the request queues so they are
/// ordered with the record requests around them.
pub(crate) enum ControlAction {
	CollectStats(oneshot::Sender<ContextStats>),
	ResetStats(oneshot::Sender<()>),
	SparseCacheBarrier { virtual_chapter: u64 },
}

pub(crate) enum RequestBody {
	Record(RecordRequest),
	Control { action: ControlAction },
}

/// A request travelling through the pipeline. Exactly one stage owns a
/// request at any moment; handing it to the next stage moves it.
pub struct Request {
	pub(crate) context: Option<SessionRef<Context>>,
	pub(crate) router: Option<Arc<dyn IndexRouter>>,
	pub(crate) zone: usize,
	pub(crate) body: RequestBody,
}

impl Request {
	fn record(&self) -> &RecordRequest {
		match &self.body {
			RequestBody::Record(record) => record,
			RequestBody::Control { .. } => {
				unreachable!("control requests carry no record fields")
			}
		}
	}

	fn record_mut(&mut self) -> &mut RecordRequest {
		match &mut self.body {
			RequestBody::Record(record) => record,
			RequestBody::Control { .. } => {
				unreachable!("control requests carry no record fields")
			}
		}
	}

	pub fn operation(&self) -> OperationKind {
		self.record().op
	}

	/// The chunk name. Always present once the request has left the hash
	/// stage, which is the only part of the pipeline an engine ever sees.
	pub fn name(&self) -> &ChunkName {
		self.record()
			.name
			.as_ref()
			.expect("record request routed to the index before hashing")
	}

	pub fn new_address(&self) -> Option<BlockAddress> {
		self.record().new_address
	}

	pub fn data_len(&self) -> usize {
		self.record().data_len
	}

	/// Whether this request already went through a sparse-cache barrier and
	/// was requeued by the engine.
	pub fn requeued(&self) -> bool {
		self.record().requeued
	}

	pub fn zone(&self) -> usize {
		self.zone
	}

	pub fn set_location(&mut self, location: ChunkLocation) {
		self.record_mut().location = location;
	}

	pub fn set_canonical_address(&mut self, address: BlockAddress) {
		self.record_mut().canonical_address = Some(address);
	}

	pub fn fail(&mut self, error: Error) {
		self.record_mut().status = Err(error);
	}

	pub(crate) fn is_control(&self) -> bool {
		matches!(self.body, RequestBody::Control { .. })
	}

	/// Hand the request to a pipeline stage. Triage and index stages are
	/// chosen by the router; the callback stage always belongs to the
	/// originating context.
	pub(crate) async fn enqueue(mut self, stage: RequestStage) {
		match stage {
			RequestStage::Callback => {
				let context = self
					.context
					.clone()
					.expect("callback stage reached without a context");
				context.callback_queue().enqueue(self).await;
			}
			RequestStage::Triage | RequestStage::Index => {
				let router = self
					.router
					.clone()
					.expect("routed stage reached without a router");
				router.select_queue(&mut self, stage).enqueue(self).await;
			}
		}
	}

	/// Retire the request towards its originator. Failed record requests
	/// pass through the context's error handler first, which may disable the
	/// context; asynchronous control messages simply evaporate.
	pub(crate) async fn enter_callback_stage(mut self) {
		match &mut self.body {
			RequestBody::Record(record) => {
				if record.status.is_err() {
					let error = std::mem::replace(&mut record.status, Ok(()))
						.expect_err("status checked to be an error");
					let stripped = match &self.context {
						Some(context) => context::handle_error(context, error),
						None => error.sans_unrecoverable(),
					};
					record.status = Err(stripped);
				}
				self.enqueue(RequestStage::Callback).await;
			}
			RequestBody::Control { .. } => {}
		}
	}

	/// Requeue a request the engine held back behind a sparse-cache barrier.
	pub async fn restart(mut self) {
		self.record_mut().requeued = true;
		self.enqueue(RequestStage::Index).await;
	}
}

/// The outcome of a retired record request.
#[derive(Debug)]
pub struct CompletedRequest {
	pub operation: OperationKind,
	pub name: ChunkName,
	/// Whether the chunk was already indexed when the request ran.
	pub found: bool,
	pub location: ChunkLocation,
	/// The address the index now associates with the chunk, if any.
	pub canonical_address: Option<BlockAddress>,
	pub status: Result<(), Error>,
}

/// A future resolving to the outcome of a launched request.
pub struct RequestHandle {
	pub(crate) done_rx: oneshot::Receiver<CompletedRequest>,
}

impl Future for RequestHandle {
	type Output = Result<CompletedRequest, Error>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.done_rx)
			.poll(cx)
			.map(|result| result.map_err(|_| Error::RequestAborted))
	}
}
