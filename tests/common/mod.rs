use std::{
	collections::{HashMap, HashSet},
	sync::{
		atomic::{AtomicBool, AtomicU32, Ordering},
		Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use dedup_index_system::{
	BlockAddress, ChunkLocation, ChunkName, DispatchOutcome, Error, Index, IndexConfiguration,
	IndexStats, OperationKind, Request,
};

/// A deterministic chunk name for numbered test requests, unique per `i` and
/// spread across zones and chapters.
pub fn name_for(i: u32) -> ChunkName {
	let mut bytes = [0u8; 16];
	bytes[..4].copy_from_slice(&i.to_le_bytes());
	bytes[2] = (i % 13) as u8;
	bytes[3] = (i % 5) as u8;
	ChunkName(bytes)
}

fn chapter_of(name: &ChunkName) -> u64 {
	u64::from(name.as_bytes()[3] % 8)
}

/// An in-memory engine that records every barrier arrival so tests can
/// verify no request ever reaches a zone ahead of the barrier it needs.
pub struct TestIndex {
	zone_count: usize,
	sparse: bool,
	barrier_latency: Duration,
	/// Fail every first dispatch and requeue it, so requeued requests come
	/// back poisoned.
	poison_first: AtomicBool,
	/// Requeue the first dispatch of every name, then resolve it.
	requeue_once: bool,
	queued_names: Mutex<HashSet<ChunkName>>,
	records: Mutex<HashMap<ChunkName, BlockAddress>>,
	hooked: Mutex<HashSet<u64>>,
	arrivals: Mutex<HashMap<u64, HashSet<usize>>>,
	violations: Mutex<Vec<String>>,
	saves: AtomicU32,
	checkpoint_frequency: AtomicU32,
}

impl TestIndex {
	pub fn new(zone_count: usize, sparse: bool) -> Self {
		Self {
			zone_count,
			sparse,
			barrier_latency: Duration::ZERO,
			poison_first: AtomicBool::new(false),
			requeue_once: false,
			queued_names: Mutex::new(HashSet::new()),
			records: Mutex::new(HashMap::new()),
			hooked: Mutex::new(HashSet::new()),
			arrivals: Mutex::new(HashMap::new()),
			violations: Mutex::new(Vec::new()),
			saves: AtomicU32::new(0),
			checkpoint_frequency: AtomicU32::new(0),
		}
	}

	pub fn with_barrier_latency(mut self, latency: Duration) -> Self {
		self.barrier_latency = latency;
		self
	}

	pub fn poisoning_dispatches(self) -> Self {
		self.poison_first.store(true, Ordering::SeqCst);
		self
	}

	pub fn requeueing_first_dispatches(mut self) -> Self {
		self.requeue_once = true;
		self
	}

	pub fn saves(&self) -> u32 {
		self.saves.load(Ordering::SeqCst)
	}

	pub fn checkpoint_frequency(&self) -> u32 {
		self.checkpoint_frequency.load(Ordering::SeqCst)
	}

	pub fn assert_no_violations(&self) {
		let violations = self.violations.lock().unwrap();
		assert!(violations.is_empty(), "ordering violations: {violations:#?}");
	}

	/// Every barrier that was started must have reached all zones by the
	/// time the router's queues have drained.
	pub fn assert_barriers_complete(&self) {
		let arrivals = self.arrivals.lock().unwrap();
		for (chapter, zones) in arrivals.iter() {
			assert_eq!(
				zones.len(),
				self.zone_count,
				"chapter {chapter} barrier reached only zones {zones:?}"
			);
		}
	}

	fn check_ordering(&self, request: &Request) {
		let expected_zone = self.zone_of(request.name());
		if request.zone() != expected_zone {
			self.violations.lock().unwrap().push(format!(
				"chunk {:?} routed to zone {} instead of {expected_zone}",
				request.name(),
				request.zone()
			));
		}

		if self.sparse && self.zone_count > 1 {
			let chapter = chapter_of(request.name());
			let arrived = self
				.arrivals
				.lock()
				.unwrap()
				.get(&chapter)
				.is_some_and(|zones| zones.contains(&request.zone()));
			if !arrived {
				self.violations.lock().unwrap().push(format!(
					"chunk {:?} reached zone {} ahead of its chapter {chapter} barrier",
					request.name(),
					request.zone()
				));
			}
		}
	}
}

#[async_trait]
impl Index for TestIndex {
	fn configuration(&self) -> IndexConfiguration {
		IndexConfiguration {
			zone_count: self.zone_count,
			sparse: self.sparse,
		}
	}

	fn zone_of(&self, name: &ChunkName) -> usize {
		usize::from(name.as_bytes()[2]) % self.zone_count
	}

	fn triage(&self, request: &Request) -> Option<u64> {
		if !self.sparse {
			return None;
		}

		let chapter = chapter_of(request.name());
		(!self.hooked.lock().unwrap().contains(&chapter)).then_some(chapter)
	}

	async fn dispatch(&self, mut request: Request) -> DispatchOutcome {
		self.check_ordering(&request);

		if self.poison_first.load(Ordering::SeqCst) && !request.requeued() {
			request.fail(Error::IndexOperation("engine fault".to_string()));
			tokio::spawn(request.restart());
			return DispatchOutcome::Queued;
		}

		if self.requeue_once
			&& !request.requeued()
			&& self.queued_names.lock().unwrap().insert(*request.name())
		{
			tokio::spawn(request.restart());
			return DispatchOutcome::Queued;
		}

		let name = *request.name();
		let mut records = self.records.lock().unwrap();

		match request.operation() {
			OperationKind::Post => match records.get(&name) {
				Some(&address) => {
					request.set_location(ChunkLocation::InDense);
					request.set_canonical_address(address);
				}
				None => {
					if let Some(address) = request.new_address() {
						records.insert(name, address);
					}
				}
			},
			OperationKind::Update => {
				if records.contains_key(&name) {
					request.set_location(ChunkLocation::InDense);
				}
				if let Some(address) = request.new_address() {
					records.insert(name, address);
					request.set_canonical_address(address);
				}
			}
			OperationKind::Delete => {
				if records.remove(&name).is_some() {
					request.set_location(ChunkLocation::InDense);
				}
			}
			OperationKind::Query => {
				if let Some(&address) = records.get(&name) {
					request.set_location(ChunkLocation::InDense);
					request.set_canonical_address(address);
				}
			}
		}

		drop(records);
		DispatchOutcome::Done(request)
	}

	async fn update_sparse_cache(&self, zone: usize, virtual_chapter: u64) -> Result<(), Error> {
		if self.barrier_latency > Duration::ZERO {
			tokio::time::sleep(self.barrier_latency).await;
		}

		let mut arrivals = self.arrivals.lock().unwrap();
		let zones = arrivals.entry(virtual_chapter).or_default();
		zones.insert(zone);
		if zones.len() == self.zone_count {
			self.hooked.lock().unwrap().insert(virtual_chapter);
		}

		Ok(())
	}

	async fn save(&self) -> Result<(), Error> {
		self.saves.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn stats(&self) -> IndexStats {
		IndexStats {
			entries_indexed: self.records.lock().unwrap().len() as u64,
			checkpoints: u64::from(self.saves()),
			..IndexStats::default()
		}
	}

	fn set_checkpoint_frequency(&self, frequency: u32) {
		self.checkpoint_frequency.store(frequency, Ordering::SeqCst);
	}
}
