use std::{
	num::NonZeroUsize,
	sync::{
		atomic::{AtomicU8, Ordering},
		Arc,
	},
	time::Instant,
};

use futures::FutureExt;
use futures_concurrency::future::Join;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use super::{
	chunk_name::{default_chunk_name, ChunkName, ChunkNameGenerator},
	context::{validate_metadata_size, Context, ContextId, ContextStats, DedupeCallback},
	error::Error,
	index::{BlockAddress, ChunkLocation, Index, IndexConfiguration, IndexStats},
	index_session::{IndexSession, IndexSessionId},
	queue::RequestQueue,
	request::{
		ControlAction, OperationKind, RecordRequest, Request, RequestBody, RequestHandle,
		RequestStage, Responder,
	},
	router::{IndexRouter, LocalIndexRouter},
	session::{SessionGroup, SessionRef},
};

const UNINITIALIZED: u8 = 0;
const IN_TRANSIT: u8 = 1;
const RUNNING: u8 = 2;

/// What a client hands to a launch entry point: either raw chunk data to be
/// hashed by the pipeline, or a name it already knows.
pub enum ChunkInput {
	Name(ChunkName),
	Data(Vec<u8>),
}

enum LibraryState {
	Uninitialized,
	Running,
	ShuttingDown,
}

struct GlobalState {
	library: LibraryState,
	contexts: Option<Arc<SessionGroup<Context>>>,
	index_sessions: Option<Arc<SessionGroup<IndexSession>>>,
	hash_pool: Option<Arc<HashPool>>,
}

struct Shared {
	// Guards the transitions of `state.library`. Only the task that wins the
	// UNINITIALIZED -> IN_TRANSIT (or RUNNING -> IN_TRANSIT) exchange may
	// change the library state; everyone else spins until it is done.
	handshake: AtomicU8,
	state: Mutex<GlobalState>,
}

/// The deduplication index service. Cheap to clone; every clone shares the
/// same library state, session groups, and hash pool.
#[derive(Clone)]
pub struct System {
	shared: Arc<Shared>,
}

impl Default for System {
	fn default() -> Self {
		Self::new()
	}
}

impl System {
	#[must_use]
	pub fn new() -> Self {
		Self {
			shared: Arc::new(Shared {
				handshake: AtomicU8::new(UNINITIALIZED),
				state: Mutex::new(GlobalState {
					library: LibraryState::Uninitialized,
					contexts: None,
					index_sessions: None,
					hash_pool: None,
				}),
			}),
		}
	}

	/// Bring the library up. Safe to call from any number of tasks at once;
	/// returns `true` only for the caller that actually performed the
	/// initialization.
	pub async fn initialize(&self) -> bool {
		loop {
			match self.shared.handshake.compare_exchange(
				UNINITIALIZED,
				IN_TRANSIT,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => {
					{
						let mut state = self.shared.state.lock().await;
						state.library = LibraryState::Running;
						state.contexts = Some(Arc::new(SessionGroup::new(
							"contexts",
							|| Error::NoContext,
							Box::new(|context: Context| {
								async move {
									context.callback_queue().finish().await;
								}
								.boxed()
							}),
						)));
						state.index_sessions = Some(Arc::new(SessionGroup::new(
							"index sessions",
							|| Error::NoIndexSession,
							Box::new(|session: IndexSession| {
								async move {
									let router = Arc::clone(session.router());
									if let Err(e) = router.save_state().await {
										warn!(
											session_id = session.id(),
											%e,
											"Failed to save index state during close"
										);
									}
									router.finish().await;
								}
								.boxed()
							}),
						)));
					}

					self.shared.handshake.store(RUNNING, Ordering::Release);
					info!("Deduplication index library initialized");
					return true;
				}
				Err(IN_TRANSIT) => tokio::task::yield_now().await,
				Err(_) => return false,
			}
		}
	}

	/// Tear the library down: close every context, then every index session,
	/// then the hash pool. Afterwards the library can be initialized again.
	pub async fn shutdown(&self) {
		loop {
			match self.shared.handshake.compare_exchange(
				RUNNING,
				IN_TRANSIT,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => break,
				Err(IN_TRANSIT) => tokio::task::yield_now().await,
				Err(_) => return,
			}
		}

		let (contexts, index_sessions, hash_pool) = {
			let mut state = self.shared.state.lock().await;
			state.library = LibraryState::ShuttingDown;
			(
				state.contexts.take(),
				state.index_sessions.take(),
				state.hash_pool.take(),
			)
		};

		// Contexts drain first so in-flight requests retire through their
		// callback queues, then the routers they were attached to.
		if let Some(contexts) = contexts {
			contexts.shutdown().await;
		}
		if let Some(index_sessions) = index_sessions {
			index_sessions.shutdown().await;
		}
		if let Some(hash_pool) = hash_pool {
			hash_pool.finish().await;
		}

		self.shared.state.lock().await.library = LibraryState::Uninitialized;
		self.shared.handshake.store(UNINITIALIZED, Ordering::Release);
		info!("Deduplication index library shut down");
	}

	async fn running_groups(
		&self,
	) -> Result<(Arc<SessionGroup<Context>>, Arc<SessionGroup<IndexSession>>), Error> {
		let state = self.shared.state.lock().await;
		match state.library {
			LibraryState::Running => Ok((
				Arc::clone(
					state
						.contexts
						.as_ref()
						.expect("running library without a context group"),
				),
				Arc::clone(
					state
						.index_sessions
						.as_ref()
						.expect("running library without an index session group"),
				),
			)),
			LibraryState::Uninitialized => Err(Error::Uninitialized),
			LibraryState::ShuttingDown => Err(Error::ShuttingDown),
		}
	}

	/// Look a context up and verify neither it nor its owning index session
	/// has been disabled.
	async fn usable_context(&self, context_id: ContextId) -> Result<SessionRef<Context>, Error> {
		let (contexts, _) = self.running_groups().await?;
		let context = contexts.lookup(context_id).await?;
		context.check()?;
		context.index_session.check()?;
		Ok(context)
	}

	async fn hash_pool(&self) -> Result<Arc<HashPool>, Error> {
		let mut state = self.shared.state.lock().await;
		match state.library {
			LibraryState::Running => {}
			LibraryState::Uninitialized => return Err(Error::Uninitialized),
			LibraryState::ShuttingDown => return Err(Error::ShuttingDown),
		}

		Ok(match &state.hash_pool {
			Some(pool) => Arc::clone(pool),
			None => {
				let pool = Arc::new(HashPool::new());
				state.hash_pool = Some(Arc::clone(&pool));
				pool
			}
		})
	}

	/// Open an index session over a storage engine, initializing the library
	/// if this is the first session.
	pub async fn open_index_session(
		&self,
		index: Arc<dyn Index>,
	) -> Result<IndexSessionId, Error> {
		self.initialize().await;
		let (_, index_sessions) = self.running_groups().await?;

		let router: Arc<dyn IndexRouter> = Arc::new(LocalIndexRouter::new(index));
		let session = index_sessions
			.create(|id| IndexSession::new(id, Arc::clone(&router)))
			.await?;

		let id = session.id();
		debug!(session_id = id, "Opened index session");
		Ok(id)
	}

	/// Close an index session, waiting for its contexts to be closed, saving
	/// the engine's state, and stopping its queues.
	pub async fn close_index_session(&self, session_id: IndexSessionId) -> Result<(), Error> {
		let (_, index_sessions) = self.running_groups().await?;
		index_sessions.finish(session_id).await?;
		debug!(session_id, "Closed index session");
		Ok(())
	}

	pub async fn get_index_configuration(
		&self,
		session_id: IndexSessionId,
	) -> Result<IndexConfiguration, Error> {
		let (_, index_sessions) = self.running_groups().await?;
		let session = index_sessions.lookup(session_id).await?;
		session.check()?;
		Ok(session.router().configuration())
	}

	pub async fn set_checkpoint_frequency(
		&self,
		session_id: IndexSessionId,
		frequency: u32,
	) -> Result<(), Error> {
		let (_, index_sessions) = self.running_groups().await?;
		let session = index_sessions.lookup(session_id).await?;
		session.check()?;
		session.router().set_checkpoint_frequency(frequency);
		Ok(())
	}

	/// Open a context against an index session, using the default chunk name
	/// generator.
	pub async fn open_context(
		&self,
		session_id: IndexSessionId,
		metadata_size: usize,
	) -> Result<ContextId, Error> {
		self.open_context_with_generator(session_id, metadata_size, default_chunk_name)
			.await
	}

	pub async fn open_context_with_generator(
		&self,
		session_id: IndexSessionId,
		metadata_size: usize,
		chunk_name_generator: ChunkNameGenerator,
	) -> Result<ContextId, Error> {
		validate_metadata_size(metadata_size)?;

		let (contexts, index_sessions) = self.running_groups().await?;
		let session = index_sessions.lookup(session_id).await?;
		session.check()?;

		let context = contexts
			.create(|id| Context::new(id, session.clone(), metadata_size, chunk_name_generator))
			.await?;

		let id = context.id();
		debug!(context_id = id, session_id, "Opened context");
		Ok(id)
	}

	/// Close a context, draining its in-flight requests first.
	pub async fn close_context(&self, context_id: ContextId) -> Result<(), Error> {
		let (contexts, _) = self.running_groups().await?;
		contexts.finish(context_id).await?;
		debug!(context_id, "Closed context");
		Ok(())
	}

	/// Wait until every request launched on a context has retired.
	pub async fn flush_context(&self, context_id: ContextId) -> Result<(), Error> {
		let (contexts, _) = self.running_groups().await?;
		let context = contexts.lookup(context_id).await?;
		context.check()?;
		context.index_session.check()?;
		contexts.wait_idle(&context).await;
		Ok(())
	}

	pub async fn context_metadata_size(&self, context_id: ContextId) -> Result<usize, Error> {
		let context = self.usable_context(context_id).await?;
		Ok(context.metadata_size())
	}

	/// The configuration of the index a context is attached to.
	pub async fn get_context_configuration(
		&self,
		context_id: ContextId,
	) -> Result<IndexConfiguration, Error> {
		let context = self.usable_context(context_id).await?;
		Ok(context.index_session.router().configuration())
	}

	/// Snapshot a context's request counters. The snapshot rides the
	/// callback queue, so it reflects every request retired before it.
	pub async fn get_context_stats(&self, context_id: ContextId) -> Result<ContextStats, Error> {
		let context = self.usable_context(context_id).await?;

		let (tx, rx) = oneshot::channel();
		context
			.callback_queue()
			.enqueue(Request {
				context: Some(context.clone()),
				router: None,
				zone: 0,
				body: RequestBody::Control {
					action: ControlAction::CollectStats(tx),
				},
			})
			.await;

		rx.await.map_err(|_| Error::ShuttingDown)
	}

	pub async fn reset_context_stats(&self, context_id: ContextId) -> Result<(), Error> {
		let context = self.usable_context(context_id).await?;

		let (tx, rx) = oneshot::channel();
		context
			.callback_queue()
			.enqueue(Request {
				context: Some(context.clone()),
				router: None,
				zone: 0,
				body: RequestBody::Control {
					action: ControlAction::ResetStats(tx),
				},
			})
			.await;

		rx.await.map_err(|_| Error::ShuttingDown)
	}

	/// Storage-engine statistics for the index a context is attached to.
	pub async fn get_context_index_stats(
		&self,
		context_id: ContextId,
	) -> Result<IndexStats, Error> {
		let context = self.usable_context(context_id).await?;
		Ok(context.index_session.router().get_statistics().await)
	}

	pub async fn set_request_queue_limit(
		&self,
		context_id: ContextId,
		limit: u32,
	) -> Result<(), Error> {
		let context = self.usable_context(context_id).await?;
		context.limit().set(limit).await
	}

	/// Register (`Some`) or clear (`None`) the dedupe advice callback for a
	/// context. Registering over an existing callback fails.
	pub async fn register_dedupe_callback(
		&self,
		context_id: ContextId,
		callback: Option<Arc<dyn DedupeCallback>>,
	) -> Result<(), Error> {
		let context = self.usable_context(context_id).await?;
		context.register_callback(callback)
	}

	/// Launch a request and get a handle resolving to its outcome.
	pub async fn launch_request(
		&self,
		context_id: ContextId,
		operation: OperationKind,
		input: ChunkInput,
		new_address: Option<BlockAddress>,
	) -> Result<RequestHandle, Error> {
		let (tx, rx) = oneshot::channel();
		self.launch(context_id, operation, input, new_address, Responder::Handle(tx))
			.await?;
		Ok(RequestHandle { done_rx: rx })
	}

	/// Launch a request whose outcome is delivered as dedupe advice through
	/// the context's registered callback instead of a handle.
	pub async fn launch_detached(
		&self,
		context_id: ContextId,
		operation: OperationKind,
		input: ChunkInput,
		new_address: Option<BlockAddress>,
	) -> Result<(), Error> {
		self.launch(context_id, operation, input, new_address, Responder::Advice)
			.await
	}

	async fn launch(
		&self,
		context_id: ContextId,
		operation: OperationKind,
		input: ChunkInput,
		new_address: Option<BlockAddress>,
		responder: Responder,
	) -> Result<(), Error> {
		let context = self.usable_context(context_id).await?;

		let permit = context.limit().borrow().await;
		let router = Arc::clone(context.index_session.router());

		let (name, data, data_len) = match input {
			ChunkInput::Name(name) => (Some(name), None, 0),
			ChunkInput::Data(data) => {
				let data_len = data.len();
				(None, Some(data), data_len)
			}
		};
		let hashed = name.is_some();

		let request = Request {
			context: Some(context.clone()),
			router: Some(router),
			zone: 0,
			body: RequestBody::Record(RecordRequest {
				op: operation,
				name,
				data,
				data_len,
				new_address,
				canonical_address: None,
				location: ChunkLocation::Unavailable,
				status: Ok(()),
				requeued: false,
				from_callback: false,
				init_time: Instant::now(),
				responder,
				permit: Some(permit),
			}),
		};

		if hashed {
			request.enqueue(RequestStage::Triage).await;
		} else {
			let pool = self.hash_pool().await?;
			pool.next_queue(&request).enqueue(request).await;
		}

		Ok(())
	}
}

/// The shared hash stage: a fixed pool of queues fed round-robin per
/// context, shared by every context in the process.
struct HashPool {
	queues: Vec<RequestQueue>,
}

impl HashPool {
	fn new() -> Self {
		let queue_count = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);

		Self {
			queues: (0..queue_count)
				.map(|_| RequestQueue::new("hashW", compute_hash))
				.collect(),
		}
	}

	/// Pick a hash queue. Control and contextless requests are pinned to
	/// queue zero so they cannot be reordered against each other; everything
	/// else rotates through the pool per context.
	fn next_queue(&self, request: &Request) -> &RequestQueue {
		if self.queues.len() == 1 || request.is_control() {
			return &self.queues[0];
		}

		match &request.context {
			Some(context) => &self.queues[context.next_rotor() as usize % self.queues.len()],
			None => &self.queues[0],
		}
	}

	async fn finish(&self) {
		self.queues
			.iter()
			.map(RequestQueue::finish)
			.collect::<Vec<_>>()
			.join()
			.await;
	}
}

/// The hash stage worker: derive the chunk name, shed the data, and pass
/// the request on to triage.
async fn compute_hash(mut request: Request) {
	if request.is_control() {
		request.enqueue(RequestStage::Triage).await;
		return;
	}

	let context = request
		.context
		.clone()
		.expect("data request hashed without a context");

	if let RequestBody::Record(record) = &mut request.body {
		let data = record
			.data
			.take()
			.expect("data request hashed without data");
		record.name = Some((context.chunk_name_generator())(&data));
		// Only the name travels on; the data is dropped here.
	}

	request.enqueue(RequestStage::Triage).await;
}
