use async_trait::async_trait;

use super::{chunk_name::ChunkName, error::Error, request::Request};

/// The opaque block address a client associates with a chunk name.
pub type BlockAddress = u64;

/// Where a record was found when a request was resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkLocation {
	/// Not found, or the record was deleted.
	#[default]
	Unavailable,
	InOpenChapter,
	InDense,
	InSparse,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexConfiguration {
	pub zone_count: usize,
	pub sparse: bool,
}

/// Storage-engine statistics, reported verbatim to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
	pub entries_indexed: u64,
	pub memory_used: u64,
	pub disk_used: u64,
	pub collisions: u64,
	pub entries_discarded: u64,
	pub checkpoints: u64,
}

/// What the engine did with a dispatched request.
pub enum DispatchOutcome {
	/// The request was resolved; send it on to the callback stage.
	Done(Request),
	/// The engine kept the request and will requeue it once the chapter it
	/// needs is available.
	Queued,
}

/// The storage engine behind a router. The routing core never interprets
/// records itself; it partitions requests by zone, runs the sparse-cache
/// barrier protocol, and hands each request to exactly one of these methods
/// on the engine's behalf.
#[async_trait]
pub trait Index: Send + Sync + 'static {
	fn configuration(&self) -> IndexConfiguration;

	/// The zone responsible for a chunk name. Must be stable and less than
	/// the configured zone count.
	fn zone_of(&self, name: &ChunkName) -> usize;

	/// Decide whether a request needs a sparse chapter hooked into the cache
	/// before it can be dispatched, returning the virtual chapter to hook.
	fn triage(&self, request: &Request) -> Option<u64>;

	/// Resolve a record request against the zone it was routed to. Called
	/// only from that zone's worker.
	async fn dispatch(&self, request: Request) -> DispatchOutcome;

	/// Hook a sparse chapter into the cache on behalf of one zone. Called
	/// once per zone per barrier; returns only when this zone's part of the
	/// barrier is complete.
	async fn update_sparse_cache(&self, zone: usize, virtual_chapter: u64) -> Result<(), Error>;

	async fn save(&self) -> Result<(), Error>;

	async fn stats(&self) -> IndexStats;

	fn set_checkpoint_frequency(&self, frequency: u32);
}
