//!
//! # Dedup Index System
//!
//! The request-routing and concurrency core of a block-level deduplication
//! index service. Clients open an index session over a storage engine, open
//! contexts against it, and launch chunk operations; the system pushes each
//! request through a staged pipeline (hash, triage, index zone, callback)
//! with exactly one worker task per queue, so no stage ever needs a lock
//! around the data it owns.
//!
//! The storage engine itself is a collaborator behind the [`Index`] trait;
//! this crate routes, throttles, counts, and orders requests but never
//! interprets a record.
//!
//! ## Basic example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dedup_index_system::{ChunkInput, Index, OperationKind, System};
//!
//! async fn deduplicate(engine: Arc<dyn Index>, block: Vec<u8>) {
//!     let system = System::new();
//!
//!     let session = system.open_index_session(engine).await.unwrap();
//!     let context = system.open_context(session, 0).await.unwrap();
//!
//!     let outcome = system
//!         .launch_request(context, OperationKind::Post, ChunkInput::Data(block), Some(42))
//!         .await
//!         .unwrap()
//!         .await
//!         .unwrap();
//!
//!     if outcome.found {
//!         println!("duplicate of block {:?}", outcome.canonical_address);
//!     }
//!
//!     system.shutdown().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod chunk_name;
mod context;
mod error;
mod index;
mod index_session;
mod limit;
mod queue;
mod request;
mod router;
mod session;
mod system;

pub use chunk_name::{default_chunk_name, ChunkName, ChunkNameGenerator, CHUNK_NAME_SIZE};
pub use context::{
	ContextId, ContextStats, DedupeAdvice, DedupeCallback, RequestInjector, MAX_METADATA_SIZE,
};
pub use error::Error;
pub use index::{
	BlockAddress, ChunkLocation, DispatchOutcome, Index, IndexConfiguration, IndexStats,
};
pub use index_session::IndexSessionId;
pub use limit::{DEFAULT_REQUEST_LIMIT, MAX_REQUEST_LIMIT};
pub use request::{CompletedRequest, OperationKind, Request, RequestHandle};
pub use system::{ChunkInput, System};
