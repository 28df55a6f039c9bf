use std::{
	collections::HashMap,
	ops::Deref,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tracing::{error, trace};

use super::error::Error;

pub(crate) type SessionId = u32;

type Destructor<T> = Box<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// A generic, reference-counted, id-indexed container of sessions.
///
/// The group owns every session it creates. Lookups hand out [`SessionRef`]
/// handles; a session is destroyed only after it has been finished *and*
/// every outstanding handle has been dropped, at which point the group's
/// destructor runs exactly once. Ids are allocated monotonically and never
/// reused.
pub(crate) struct SessionGroup<T: Send + Sync + 'static> {
	name: &'static str,
	missing: fn() -> Error,
	destructor: Destructor<T>,
	sessions: Mutex<GroupMap<T>>,
	released: Arc<Notify>,
}

struct GroupMap<T> {
	open: bool,
	next_id: SessionId,
	entries: HashMap<SessionId, Arc<SessionSlot<T>>>,
}

struct SessionSlot<T> {
	id: SessionId,
	finishing: AtomicBool,
	contents: T,
}

/// A counted reference to a session's contents. Dropping the reference
/// wakes any task waiting for the session to drain.
pub(crate) struct SessionRef<T: Send + Sync + 'static> {
	slot: Option<Arc<SessionSlot<T>>>,
	released: Arc<Notify>,
}

impl<T: Send + Sync + 'static> SessionRef<T> {
	fn slot(&self) -> &Arc<SessionSlot<T>> {
		self.slot
			.as_ref()
			.expect("session reference used after drop")
	}

	pub fn id(&self) -> SessionId {
		self.slot().id
	}
}

impl<T: Send + Sync + 'static> Clone for SessionRef<T> {
	fn clone(&self) -> Self {
		Self {
			slot: self.slot.clone(),
			released: Arc::clone(&self.released),
		}
	}
}

impl<T: Send + Sync + 'static> Deref for SessionRef<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.slot().contents
	}
}

impl<T: Send + Sync + 'static> Drop for SessionRef<T> {
	fn drop(&mut self) {
		// The slot must be released before waiters re-check the refcount.
		self.slot.take();
		self.released.notify_waiters();
	}
}

impl<T: Send + Sync + 'static> SessionGroup<T> {
	pub fn new(name: &'static str, missing: fn() -> Error, destructor: Destructor<T>) -> Self {
		Self {
			name,
			missing,
			destructor,
			sessions: Mutex::new(GroupMap {
				open: true,
				next_id: 1,
				entries: HashMap::new(),
			}),
			released: Arc::new(Notify::new()),
		}
	}

	fn reference(&self, slot: Arc<SessionSlot<T>>) -> SessionRef<T> {
		SessionRef {
			slot: Some(slot),
			released: Arc::clone(&self.released),
		}
	}

	/// Create a new session, building its contents from the allocated id.
	/// The returned reference is the creator's.
	pub async fn create(
		&self,
		build: impl FnOnce(SessionId) -> T,
	) -> Result<SessionRef<T>, Error> {
		let mut map = self.sessions.lock().await;
		if !map.open {
			return Err(Error::ShuttingDown);
		}

		let id = map.next_id;
		map.next_id += 1;

		let slot = Arc::new(SessionSlot {
			id,
			finishing: AtomicBool::new(false),
			contents: build(id),
		});
		map.entries.insert(id, Arc::clone(&slot));

		trace!(group = self.name, session_id = id, "Created session");

		Ok(self.reference(slot))
	}

	/// Look up a session by id, taking a counted reference. Fails for
	/// unknown or finishing ids.
	pub async fn lookup(&self, id: SessionId) -> Result<SessionRef<T>, Error> {
		let map = self.sessions.lock().await;
		if !map.open {
			return Err(Error::ShuttingDown);
		}

		match map.entries.get(&id) {
			Some(slot) if !slot.finishing.load(Ordering::Acquire) => {
				Ok(self.reference(Arc::clone(slot)))
			}
			_ => Err((self.missing)()),
		}
	}

	/// Wait until the caller's reference is the only one outstanding, i.e.
	/// no pipeline stage still holds the session.
	pub async fn wait_idle(&self, reference: &SessionRef<T>) {
		let slot = reference.slot();
		loop {
			let released = self.released.notified();
			// One reference held by the registry, one by the caller.
			if Arc::strong_count(slot) <= 2 {
				return;
			}
			released.await;
		}
	}

	/// Finish a session: block further lookups, wait for every outstanding
	/// reference to be released, then destroy the contents.
	pub async fn finish(&self, id: SessionId) -> Result<(), Error> {
		let slot = {
			let map = self.sessions.lock().await;
			let slot = map.entries.get(&id).ok_or_else(self.missing)?;
			if slot.finishing.swap(true, Ordering::AcqRel) {
				// Someone else is already finishing this session.
				return Err((self.missing)());
			}
			Arc::clone(slot)
		};

		self.drain_and_destroy(slot).await;
		Ok(())
	}

	async fn drain_and_destroy(&self, slot: Arc<SessionSlot<T>>) {
		// Wait for every reference other than the registry's and ours.
		loop {
			let released = self.released.notified();
			if Arc::strong_count(&slot) <= 2 {
				break;
			}
			released.await;
		}

		let id = slot.id;
		{
			let mut map = self.sessions.lock().await;
			map.entries.remove(&id);
		}

		match Arc::try_unwrap(slot) {
			Ok(slot) => {
				(self.destructor)(slot.contents).await;
				trace!(group = self.name, session_id = id, "Destroyed session");
			}
			Err(_) => {
				error!(
					group = self.name,
					session_id = id,
					"Session still referenced after drain"
				);
			}
		}

		self.released.notify_waiters();
	}

	/// Close the group to new sessions, then finish and destroy every
	/// session it still holds. Used only at process shutdown.
	pub async fn shutdown(&self) {
		let slots = {
			let mut map = self.sessions.lock().await;
			map.open = false;
			map.entries
				.values()
				.filter(|slot| !slot.finishing.swap(true, Ordering::AcqRel))
				.cloned()
				.collect::<Vec<_>>()
		};

		for slot in slots {
			self.drain_and_destroy(slot).await;
		}

		// Sessions being finished concurrently by their closers still have
		// to drain before the group is gone.
		loop {
			let released = self.released.notified();
			if self.sessions.lock().await.entries.is_empty() {
				return;
			}
			released.await;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use futures::FutureExt;
	use futures_concurrency::future::Join;

	use super::{Error, SessionGroup};

	fn counting_group(drops: &Arc<AtomicUsize>) -> SessionGroup<String> {
		let drops = Arc::clone(drops);
		SessionGroup::new(
			"test",
			|| Error::NoContext,
			Box::new(move |_contents| {
				let drops = Arc::clone(&drops);
				async move {
					drops.fetch_add(1, Ordering::SeqCst);
				}
				.boxed()
			}),
		)
	}

	#[tokio::test]
	async fn lookup_after_finish_fails() {
		let drops = Arc::new(AtomicUsize::new(0));
		let group = counting_group(&drops);

		let session = group.create(|id| format!("session {id}")).await.unwrap();
		let id = session.id();
		drop(session);

		group.finish(id).await.unwrap();
		assert!(matches!(group.lookup(id).await, Err(Error::NoContext)));
		assert_eq!(drops.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn destructor_runs_once_after_last_release() {
		let drops = Arc::new(AtomicUsize::new(0));
		let group = Arc::new(counting_group(&drops));

		let session = group.create(|id| format!("session {id}")).await.unwrap();
		let id = session.id();

		let references = (0..16)
			.map(|_| {
				let group = Arc::clone(&group);
				async move { group.lookup(id).await.unwrap() }
			})
			.collect::<Vec<_>>()
			.join()
			.await;
		drop(session);

		let finisher = tokio::spawn({
			let group = Arc::clone(&group);
			async move { group.finish(id).await.unwrap() }
		});

		// The finisher cannot complete while references are outstanding.
		tokio::task::yield_now().await;
		assert_eq!(drops.load(Ordering::SeqCst), 0);

		references
			.into_iter()
			.map(|reference| async move {
				tokio::task::yield_now().await;
				drop(reference);
			})
			.collect::<Vec<_>>()
			.join()
			.await;

		finisher.await.unwrap();
		assert_eq!(drops.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn ids_are_unique_and_not_reused() {
		let drops = Arc::new(AtomicUsize::new(0));
		let group = counting_group(&drops);

		let first = group.create(|id| format!("session {id}")).await.unwrap();
		let first_id = first.id();
		drop(first);
		group.finish(first_id).await.unwrap();

		let second = group.create(|id| format!("session {id}")).await.unwrap();
		assert_ne!(second.id(), first_id);
	}

	#[tokio::test]
	async fn shutdown_blocks_creation() {
		let drops = Arc::new(AtomicUsize::new(0));
		let group = counting_group(&drops);

		let session = group.create(|id| format!("session {id}")).await.unwrap();
		drop(session);

		group.shutdown().await;
		assert_eq!(drops.load(Ordering::SeqCst), 1);
		assert!(matches!(
			group.create(|id| format!("session {id}")).await,
			Err(Error::ShuttingDown)
		));
	}
}
