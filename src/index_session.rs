use std::sync::{
	atomic::{AtomicU8, Ordering},
	Arc,
};

use super::{error::Error, router::IndexRouter, session::SessionId};

/// Identifies an open index session to clients.
pub type IndexSessionId = u32;

const STATE_READY: u8 = 0;
const STATE_DISABLED: u8 = 1;

/// An attachment to one index: the router owning the index's stage queues,
/// shared by every context opened against this session.
pub(crate) struct IndexSession {
	id: SessionId,
	state: AtomicU8,
	router: Arc<dyn IndexRouter>,
}

impl IndexSession {
	pub fn new(id: SessionId, router: Arc<dyn IndexRouter>) -> Self {
		Self {
			id,
			state: AtomicU8::new(STATE_READY),
			router,
		}
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn router(&self) -> &Arc<dyn IndexRouter> {
		&self.router
	}

	pub fn check(&self) -> Result<(), Error> {
		match self.state.load(Ordering::Acquire) {
			STATE_READY => Ok(()),
			STATE_DISABLED => Err(Error::Disabled),
			_ => Err(Error::NoIndexSession),
		}
	}

	/// Permanently disable the session after an unrecoverable index fault.
	/// There is no way back; clients must close and reopen.
	pub fn disable(&self) {
		self.state.store(STATE_DISABLED, Ordering::Release);
	}
}
