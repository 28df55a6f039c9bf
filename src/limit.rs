use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::error::Error;

/// The default cap on in-flight requests per context.
pub const DEFAULT_REQUEST_LIMIT: u32 = 1024;

/// The hard upper bound a client may raise the request limit to.
pub const MAX_REQUEST_LIMIT: u32 = 2 * DEFAULT_REQUEST_LIMIT;

/// Throttle on the number of requests a context may have in flight at once.
///
/// A permit is borrowed when a request is launched and returned when the
/// request retires, by dropping the permit it carries through the pipeline.
/// Raising the limit takes effect immediately; lowering it takes effect as
/// outstanding requests retire.
pub(crate) struct RequestLimit {
	semaphore: Arc<Semaphore>,
	limit: Mutex<u32>,
}

impl RequestLimit {
	pub fn new() -> Self {
		Self {
			semaphore: Arc::new(Semaphore::new(DEFAULT_REQUEST_LIMIT as usize)),
			limit: Mutex::new(DEFAULT_REQUEST_LIMIT),
		}
	}

	/// Borrow a permit, waiting if the context is already at its limit.
	pub async fn borrow(&self) -> OwnedSemaphorePermit {
		Arc::clone(&self.semaphore)
			.acquire_owned()
			.await
			.expect("request limit semaphore closed while borrowing a permit")
	}

	pub async fn current(&self) -> u32 {
		*self.limit.lock().await
	}

	/// Change the limit. Out-of-range values are rejected without touching
	/// the current limit.
	pub async fn set(&self, new_limit: u32) -> Result<(), Error> {
		if new_limit == 0 || new_limit > MAX_REQUEST_LIMIT {
			return Err(Error::RequestsOutOfRange(new_limit));
		}

		let mut limit = self.limit.lock().await;

		if new_limit > *limit {
			self.semaphore.add_permits((new_limit - *limit) as usize);
		} else {
			let mut shortfall = *limit - new_limit;
			shortfall -= self.semaphore.forget_permits(shortfall as usize) as u32;
			if shortfall > 0 {
				// The remaining capacity is out on loan; reclaim it as the
				// borrowing requests retire.
				Arc::clone(&self.semaphore)
					.acquire_many_owned(shortfall)
					.await
					.expect("request limit semaphore closed while lowering the limit")
					.forget();
			}
		}

		*limit = new_limit;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{Error, RequestLimit, DEFAULT_REQUEST_LIMIT, MAX_REQUEST_LIMIT};

	#[tokio::test]
	async fn raising_the_limit_adds_capacity() {
		let limit = RequestLimit::new();
		limit.set(MAX_REQUEST_LIMIT).await.unwrap();

		assert_eq!(limit.current().await, MAX_REQUEST_LIMIT);
		assert_eq!(
			limit.semaphore.available_permits(),
			MAX_REQUEST_LIMIT as usize
		);
	}

	#[tokio::test]
	async fn lowering_the_limit_removes_idle_capacity() {
		let limit = RequestLimit::new();
		limit.set(16).await.unwrap();

		assert_eq!(limit.current().await, 16);
		assert_eq!(limit.semaphore.available_permits(), 16);
	}

	#[tokio::test]
	async fn lowering_waits_for_borrowed_permits() {
		let limit = std::sync::Arc::new(RequestLimit::new());
		let borrowed = (0..DEFAULT_REQUEST_LIMIT as usize)
			.map(|_| limit.semaphore.clone().try_acquire_owned().unwrap())
			.collect::<Vec<_>>();

		let lowering = tokio::spawn({
			let limit = std::sync::Arc::clone(&limit);
			async move { limit.set(4).await.unwrap() }
		});

		for _ in 0..32 {
			tokio::task::yield_now().await;
		}
		assert!(!lowering.is_finished(), "set should wait for retirements");

		drop(borrowed);
		lowering.await.unwrap();
		assert_eq!(limit.current().await, 4);
		assert_eq!(limit.semaphore.available_permits(), 4);
	}

	#[tokio::test]
	async fn out_of_range_values_are_rejected() {
		let limit = RequestLimit::new();

		assert!(matches!(
			limit.set(0).await,
			Err(Error::RequestsOutOfRange(0))
		));
		assert!(matches!(
			limit.set(MAX_REQUEST_LIMIT + 1).await,
			Err(Error::RequestsOutOfRange(_))
		));
		assert_eq!(limit.current().await, DEFAULT_REQUEST_LIMIT);
	}
}
