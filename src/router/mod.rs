use async_trait::async_trait;

use super::{
	error::Error,
	index::{IndexConfiguration, IndexStats},
	queue::RequestQueue,
	request::{Request, RequestStage},
};

mod local;

pub(crate) use local::LocalIndexRouter;

/// Routes requests into an index's stage queues and executes them there.
///
/// The router is the seam between the pipeline and the storage engine: the
/// pipeline only ever talks to an index through one of these.
#[async_trait]
pub(crate) trait IndexRouter: Send + Sync + 'static {
	fn configuration(&self) -> IndexConfiguration;

	/// Pick the queue for a request entering a routed stage, assigning the
	/// request's zone on the way.
	fn select_queue(&self, request: &mut Request, stage: RequestStage) -> &RequestQueue;

	/// Resolve a request on its zone worker.
	async fn execute(&self, request: Request);

	/// Run a request through the triage stage.
	async fn triage(&self, request: Request);

	async fn save_state(&self) -> Result<(), Error>;

	async fn get_statistics(&self) -> IndexStats;

	fn set_checkpoint_frequency(&self, frequency: u32);

	/// Drain and stop every queue the router owns.
	async fn finish(&self);
}
