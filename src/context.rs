use std::{
	sync::{
		atomic::{AtomicU32, AtomicU8, Ordering},
		Arc, Mutex,
	},
	time::{Instant, SystemTime},
};

use tracing::{error, warn};

use super::{
	chunk_name::{ChunkName, ChunkNameGenerator},
	error::Error,
	index::{BlockAddress, ChunkLocation},
	index_session::IndexSession,
	limit::RequestLimit,
	queue::RequestQueue,
	request::{
		CompletedRequest, ControlAction, OperationKind, RecordRequest, Request, RequestBody,
		RequestStage, Responder,
	},
	session::{SessionId, SessionRef},
};

/// Identifies an open context to clients.
pub type ContextId = u32;

/// The largest per-chunk metadata size a context may be opened with.
pub const MAX_METADATA_SIZE: usize = 16;

const STATE_READY: u8 = 0;
const STATE_DISABLED: u8 = 1;

/// Dedupe advice delivered through a registered callback when a request
/// launched without a handle retires.
#[derive(Debug, Clone)]
pub struct DedupeAdvice {
	pub operation: OperationKind,
	pub name: ChunkName,
	pub found: bool,
	pub location: ChunkLocation,
	pub canonical_address: Option<BlockAddress>,
}

/// A client-registered sink for dedupe advice.
///
/// Invoked from the context's callback worker, so implementations must not
/// block; follow-up requests go through the provided injector rather than
/// back through the launch entry points.
pub trait DedupeCallback: Send + Sync + 'static {
	fn on_dedupe_advice(&self, advice: DedupeAdvice, injector: &RequestInjector<'_>);
}

/// Launches follow-up requests from inside a dedupe callback.
///
/// Injected requests are name-only, bypass the request limiter, and do not
/// generate further advice, so a callback can never deadlock the worker it
/// runs on or feed itself forever.
pub struct RequestInjector<'a> {
	context: &'a SessionRef<Context>,
}

impl RequestInjector<'_> {
	pub fn launch(
		&self,
		operation: OperationKind,
		name: ChunkName,
		new_address: Option<BlockAddress>,
	) {
		if self
			.context
			.check()
			.and_then(|()| self.context.index_session.check())
			.is_err()
		{
			warn!(
				context_id = self.context.id,
				"Ignoring a request injected into a disabled context"
			);
			return;
		}

		let mut request = Request {
			context: Some(self.context.clone()),
			router: Some(Arc::clone(self.context.index_session.router())),
			zone: 0,
			body: RequestBody::Record(RecordRequest {
				op: operation,
				name: Some(name),
				data: None,
				data_len: 0,
				new_address,
				canonical_address: None,
				location: ChunkLocation::Unavailable,
				status: Ok(()),
				requeued: false,
				from_callback: true,
				init_time: Instant::now(),
				responder: Responder::Advice,
				permit: None,
			}),
		};

		let router = request
			.router
			.clone()
			.expect("injected request built without a router");
		router
			.select_queue(&mut request, RequestStage::Triage)
			.try_enqueue(request);
	}
}

#[derive(Default)]
struct StatCounters {
	requests: u64,
	posts_found: u64,
	posts_found_open_chapter: u64,
	posts_found_dense: u64,
	posts_found_sparse: u64,
	posts_found_data: u64,
	posts_not_found: u64,
	posts_not_found_data: u64,
	bytes_found: u64,
	bytes_not_found: u64,
	updates_found: u64,
	updates_not_found: u64,
	deletions_found: u64,
	deletions_not_found: u64,
	queries_found: u64,
	queries_not_found: u64,
	request_turnaround_time: u64,
	maximum_turnaround_time: u64,
}

struct StatsBlock {
	reset_time: SystemTime,
	counters: StatCounters,
}

/// A snapshot of a context's request counters.
#[derive(Debug, Clone)]
pub struct ContextStats {
	pub current_time: SystemTime,
	pub reset_time: SystemTime,
	pub requests: u64,
	pub posts_found: u64,
	pub posts_found_open_chapter: u64,
	pub posts_found_dense: u64,
	pub posts_found_sparse: u64,
	pub posts_not_found: u64,
	pub bytes_found: u64,
	pub bytes_not_found: u64,
	/// Mean data size of posts that hit, zero when none carried data.
	pub avg_chunk_found: u64,
	pub avg_chunk_not_found: u64,
	pub updates_found: u64,
	pub updates_not_found: u64,
	pub deletions_found: u64,
	pub deletions_not_found: u64,
	pub queries_found: u64,
	pub queries_not_found: u64,
	/// Total microseconds requests spent in the pipeline.
	pub request_turnaround_time: u64,
	pub maximum_turnaround_time: u64,
	pub request_queue_limit: u32,
}

fn safe_divide(numerator: u64, denominator: u64) -> u64 {
	if denominator == 0 {
		0
	} else {
		numerator / denominator
	}
}

pub(crate) fn validate_metadata_size(metadata_size: usize) -> Result<(), Error> {
	if metadata_size > MAX_METADATA_SIZE {
		return Err(Error::InvalidMetadataSize(metadata_size));
	}
	Ok(())
}

/// Per-client state: the attachment to an index session, the request
/// limiter, the stats block, and the callback stage queue.
pub(crate) struct Context {
	pub(crate) id: SessionId,
	state: AtomicU8,
	pub(crate) index_session: SessionRef<IndexSession>,
	metadata_size: usize,
	limit: RequestLimit,
	hash_rotor: AtomicU32,
	chunk_name_generator: ChunkNameGenerator,
	callback: Mutex<Option<Arc<dyn DedupeCallback>>>,
	// Mutated only by the callback worker; collect and reset ride the
	// callback queue so they are ordered with the requests around them.
	stats: Mutex<StatsBlock>,
	callback_queue: RequestQueue,
}

impl Context {
	pub fn new(
		id: SessionId,
		index_session: SessionRef<IndexSession>,
		metadata_size: usize,
		chunk_name_generator: ChunkNameGenerator,
	) -> Self {
		Self {
			id,
			state: AtomicU8::new(STATE_READY),
			index_session,
			metadata_size,
			limit: RequestLimit::new(),
			hash_rotor: AtomicU32::new(0),
			chunk_name_generator,
			callback: Mutex::new(None),
			stats: Mutex::new(StatsBlock {
				reset_time: SystemTime::now(),
				counters: StatCounters::default(),
			}),
			callback_queue: RequestQueue::new("callbackW", handle_callbacks),
		}
	}

	pub fn check(&self) -> Result<(), Error> {
		match self.state.load(Ordering::Acquire) {
			STATE_READY => Ok(()),
			STATE_DISABLED => Err(Error::Disabled),
			_ => Err(Error::NoContext),
		}
	}

	pub fn disable(&self) {
		self.state.store(STATE_DISABLED, Ordering::Release);
	}

	pub fn metadata_size(&self) -> usize {
		self.metadata_size
	}

	pub fn limit(&self) -> &RequestLimit {
		&self.limit
	}

	pub fn callback_queue(&self) -> &RequestQueue {
		&self.callback_queue
	}

	pub fn chunk_name_generator(&self) -> ChunkNameGenerator {
		self.chunk_name_generator
	}

	pub fn next_rotor(&self) -> u32 {
		self.hash_rotor.fetch_add(1, Ordering::Relaxed)
	}

	/// Register, replace-reject, or clear the dedupe callback. Passing
	/// `None` always clears; passing `Some` fails if one is already set.
	pub fn register_callback(&self, callback: Option<Arc<dyn DedupeCallback>>) -> Result<(), Error> {
		let mut slot = self.callback.lock().expect("callback mutex poisoned");
		match callback {
			Some(callback) => {
				if slot.is_some() {
					return Err(Error::CallbackAlreadyRegistered);
				}
				*slot = Some(callback);
			}
			None => *slot = None,
		}
		Ok(())
	}

	fn registered_callback(&self) -> Option<Arc<dyn DedupeCallback>> {
		self.callback
			.lock()
			.expect("callback mutex poisoned")
			.clone()
	}

	fn update_request_stats(&self, record: &RecordRequest) {
		let mut stats = self.stats.lock().expect("stats mutex poisoned");
		let counters = &mut stats.counters;

		counters.requests += 1;
		let turnaround = record.init_time.elapsed().as_micros() as u64;
		counters.request_turnaround_time += turnaround;
		counters.maximum_turnaround_time = counters.maximum_turnaround_time.max(turnaround);

		if record.status.is_err() {
			return;
		}

		let found = record.location != ChunkLocation::Unavailable;
		match record.op {
			OperationKind::Post => {
				if found {
					counters.posts_found += 1;
					match record.location {
						ChunkLocation::InOpenChapter => counters.posts_found_open_chapter += 1,
						ChunkLocation::InDense => counters.posts_found_dense += 1,
						ChunkLocation::InSparse => counters.posts_found_sparse += 1,
						ChunkLocation::Unavailable => {}
					}
					if record.data_len > 0 {
						counters.posts_found_data += 1;
						counters.bytes_found += record.data_len as u64;
					}
				} else {
					counters.posts_not_found += 1;
					if record.data_len > 0 {
						counters.posts_not_found_data += 1;
						counters.bytes_not_found += record.data_len as u64;
					}
				}
			}
			OperationKind::Update => {
				if found {
					counters.updates_found += 1;
				} else {
					counters.updates_not_found += 1;
				}
			}
			OperationKind::Delete => {
				if found {
					counters.deletions_found += 1;
				} else {
					counters.deletions_not_found += 1;
				}
			}
			OperationKind::Query => {
				if found {
					counters.queries_found += 1;
				} else {
					counters.queries_not_found += 1;
				}
			}
		}
	}

	async fn collect_stats(&self) -> ContextStats {
		let request_queue_limit = self.limit.current().await;

		let stats = self.stats.lock().expect("stats mutex poisoned");
		let counters = &stats.counters;

		ContextStats {
			current_time: SystemTime::now(),
			reset_time: stats.reset_time,
			requests: counters.requests,
			posts_found: counters.posts_found,
			posts_found_open_chapter: counters.posts_found_open_chapter,
			posts_found_dense: counters.posts_found_dense,
			posts_found_sparse: counters.posts_found_sparse,
			posts_not_found: counters.posts_not_found,
			bytes_found: counters.bytes_found,
			bytes_not_found: counters.bytes_not_found,
			avg_chunk_found: safe_divide(counters.bytes_found, counters.posts_found_data),
			avg_chunk_not_found: safe_divide(
				counters.bytes_not_found,
				counters.posts_not_found_data,
			),
			updates_found: counters.updates_found,
			updates_not_found: counters.updates_not_found,
			deletions_found: counters.deletions_found,
			deletions_not_found: counters.deletions_not_found,
			queries_found: counters.queries_found,
			queries_not_found: counters.queries_not_found,
			request_turnaround_time: counters.request_turnaround_time,
			maximum_turnaround_time: counters.maximum_turnaround_time,
			request_queue_limit,
		}
	}

	fn reset_stats(&self) {
		let mut stats = self.stats.lock().expect("stats mutex poisoned");
		stats.reset_time = SystemTime::now();
		stats.counters = StatCounters::default();
	}
}

/// React to a failed request on its way out of the pipeline. Unrecoverable
/// faults permanently disable the context and its index session; the
/// internal attribute is stripped before the error reaches the client.
pub(crate) fn handle_error(context: &SessionRef<Context>, error: Error) -> Error {
	if error.is_unrecoverable() {
		warn!(
			context_id = context.id,
			%error,
			"Disabling context after an unrecoverable index error"
		);
		context.disable();
		context.index_session.disable();
	}
	error.sans_unrecoverable()
}

/// The callback stage worker. Runs on the context's single callback task,
/// which is the only task allowed to touch the stats counters.
pub(crate) async fn handle_callbacks(request: Request) {
	let Some(context) = request.context.clone() else {
		error!("Request reached the callback stage without a context");
		return;
	};

	match request.body {
		RequestBody::Control { action } => match action {
			ControlAction::CollectStats(reply) => {
				let stats = context.collect_stats().await;
				if reply.send(stats).is_err() {
					warn!(
						context_id = context.id,
						"Stats collected after the requester gave up"
					);
				}
			}
			ControlAction::ResetStats(reply) => {
				context.reset_stats();
				if reply.send(()).is_err() {
					warn!(
						context_id = context.id,
						"Stats reset after the requester gave up"
					);
				}
			}
			ControlAction::SparseCacheBarrier { .. } => {
				error!(
					context_id = context.id,
					"Barrier message routed to a context callback queue"
				);
			}
		},
		RequestBody::Record(record) => {
			context.update_request_stats(&record);

			let found = record.location != ChunkLocation::Unavailable;
			match record.responder {
				Responder::Handle(done_tx) => {
					let outcome = CompletedRequest {
						operation: record.op,
						name: record
							.name
							.expect("record request retired before hashing"),
						found,
						location: record.location,
						canonical_address: record.canonical_address,
						status: record.status,
					};
					if done_tx.send(outcome).is_err() {
						warn!(
							context_id = context.id,
							"Request completed after its handle was dropped"
						);
					}
				}
				Responder::Advice => {
					if record.from_callback {
						// Advice about an injected request would feed the
						// callback its own output.
						return;
					}
					match record.status {
						Ok(()) => {
							if let Some(callback) = context.registered_callback() {
								let advice = DedupeAdvice {
									operation: record.op,
									name: record
										.name
										.expect("record request retired before hashing"),
									found,
									location: record.location,
									canonical_address: record.canonical_address,
								};
								callback.on_dedupe_advice(
									advice,
									&RequestInjector { context: &context },
								);
							}
						}
						Err(error) => warn!(
							context_id = context.id,
							%error,
							"Dropping advice for a failed request"
						),
					}
				}
			}

			// The request is retired; its permit goes back to the limiter.
			drop(record.permit);
		}
	}
}
