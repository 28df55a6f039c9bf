use thiserror::Error;

/// Errors surfaced by the deduplication index core.
///
/// The `Unrecoverable` wrapper is an internal attribute: it marks a fault
/// that must permanently disable the owning context, and it is stripped by
/// [`Error::sans_unrecoverable`] before any error crosses the client
/// boundary.
#[derive(Debug, Error)]
pub enum Error {
	#[error("library has not been initialized")]
	Uninitialized,

	#[error("library is shutting down")]
	ShuttingDown,

	#[error("context not found")]
	NoContext,

	#[error("context is disabled")]
	Disabled,

	#[error("index session not found")]
	NoIndexSession,

	#[error("invalid context metadata size: {0}")]
	InvalidMetadataSize(usize),

	#[error("request queue limit out of range: {0}")]
	RequestsOutOfRange(u32),

	#[error("dedupe callback already registered")]
	CallbackAlreadyRegistered,

	#[error("index operation failed: {0}")]
	IndexOperation(String),

	#[error("request pipeline torn down before completion")]
	RequestAborted,

	#[error(transparent)]
	Unrecoverable(Box<Error>),
}

impl Error {
	/// Mark an error as unrecoverable, which will permanently disable the
	/// context (and its index session) handling the failed request.
	#[must_use]
	pub fn unrecoverable(error: Self) -> Self {
		match error {
			Self::Unrecoverable(_) => error,
			other => Self::Unrecoverable(Box::new(other)),
		}
	}

	#[must_use]
	pub fn is_unrecoverable(&self) -> bool {
		matches!(self, Self::Unrecoverable(_))
	}

	/// Strip the internal unrecoverable attribute so the client never sees
	/// it.
	#[must_use]
	pub fn sans_unrecoverable(self) -> Self {
		match self {
			Self::Unrecoverable(inner) => inner.sans_unrecoverable(),
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::Error;

	#[test]
	fn unrecoverable_is_stripped() {
		let error = Error::unrecoverable(Error::IndexOperation("volume torn".to_string()));
		assert!(error.is_unrecoverable());

		let stripped = error.sans_unrecoverable();
		assert!(!stripped.is_unrecoverable());
		assert!(matches!(stripped, Error::IndexOperation(_)));
	}

	#[test]
	fn unrecoverable_does_not_nest() {
		let error = Error::unrecoverable(Error::unrecoverable(Error::Disabled));
		assert!(matches!(
			error.sans_unrecoverable(),
			Error::Disabled
		));
	}
}
