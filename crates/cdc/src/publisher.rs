// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! The shard consumers of one subscription and the background work around
//! them: topology monitoring, checkpoint writes and table changes.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	thread::{self, JoinHandle},
	time::Instant,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;
use shardstream_checkpoint::CheckpointStore;
use shardstream_core::{
	Error, LogPosition, PartitionOwnership, Result, ShardId, StreamMode, StreamPosition, StreamWarning,
	SubscriptionConfig,
	interface::{FilterChangeRequest, FilterChangeStatus, ShardInfo, StartPosition, TopologySnapshot},
};
use shardstream_filter::{FilterStatistics, TableSet};
use tracing::{debug, error, info, warn};

use crate::{
	consumer::{ConsumerLink, ShardConsumer, ShardStart, join_until},
	context::{Event, StreamContext},
	queue::WAKE_INTERVAL,
};

/// Start of every shard of a new subscription, and the position already
/// delivered before it.
pub(crate) struct Starts {
	pub shards: BTreeMap<ShardId, ShardStart>,
	pub delivered: StreamPosition,
}

/// Resolves where each assigned shard starts for the configured mode.
pub(crate) fn resolve_starts(
	config: &SubscriptionConfig,
	checkpoints: &CheckpointStore,
	snapshot: &TopologySnapshot,
) -> Result<Starts> {
	let base = match config.stream_mode {
		StreamMode::FromNow => None,
		StreamMode::FromCheckpoint | StreamMode::FromExactCheckpoint => {
			let stored = checkpoints.read(&snapshot.store_name, snapshot.store_id)?;
			if stored.is_none() {
				info!(subscription = %config.subscription_name, "no checkpoint stored, starting from the earliest position");
			}
			stored
		}
		StreamMode::FromStreamPosition | StreamMode::FromExactStreamPosition => {
			let position = config
				.initial_position
				.clone()
				.ok_or_else(|| Error::config(format!("{:?} requires an initial position", config.stream_mode)))?;
			if position.store_name() != snapshot.store_name || position.store_id() != snapshot.store_id {
				return Err(Error::config(format!(
					"initial position belongs to store {}/{}, not {}/{}",
					position.store_name(),
					position.store_id(),
					snapshot.store_name,
					snapshot.store_id
				)));
			}
			Some(position)
		}
	};

	let mut delivered = StreamPosition::new(&snapshot.store_name, snapshot.store_id);
	let mut shards = BTreeMap::new();
	for shard in snapshot.shards.keys().copied().filter(|s| config.assigned(s.0)) {
		let position = match config.stream_mode {
			StreamMode::FromNow => StartPosition::Now,
			_ => match base.as_ref().and_then(|b| b.next_for(shard)) {
				Some(next) => StartPosition::At(next),
				None => StartPosition::Earliest,
			},
		};
		match base.as_ref().and_then(|b| b.get(shard)) {
			Some(position) => delivered.set(shard, position),
			None => delivered.cover(shard),
		}
		shards.insert(
			shard,
			ShardStart {
				position,
				exact: config.stream_mode.is_exact(),
			},
		);
	}

	Ok(Starts {
		shards,
		delivered,
	})
}

enum ChangeTask {
	Add(String),
	Remove(String),
}

pub(crate) struct PublishingUnit {
	ctx: Arc<StreamContext>,
	consumers: Mutex<BTreeMap<ShardId, ShardConsumer>>,
	retired: Mutex<BTreeSet<ShardId>>,
	/// Serializes filter changes with consumer starts, so every consumer
	/// starts with the current table set.
	changes: Mutex<()>,
	threads: Mutex<Vec<JoinHandle<()>>>,
	checkpoint_requests: Sender<StreamPosition>,
	checkpoint_busy: AtomicBool,
	change_tasks: Sender<ChangeTask>,
	changes_in_flight: AtomicUsize,
	shut_down: AtomicBool,
}

impl PublishingUnit {
	pub fn start(ctx: Arc<StreamContext>, snapshot: &TopologySnapshot, starts: Starts) -> Result<Arc<Self>> {
		let (checkpoint_tx, checkpoint_rx) = bounded(1);
		let (change_tx, change_rx) = unbounded();

		let unit = Arc::new(Self {
			ctx: ctx.clone(),
			consumers: Mutex::new(BTreeMap::new()),
			retired: Mutex::new(BTreeSet::new()),
			changes: Mutex::new(()),
			threads: Mutex::new(Vec::new()),
			checkpoint_requests: checkpoint_tx,
			checkpoint_busy: AtomicBool::new(false),
			change_tasks: change_tx,
			changes_in_flight: AtomicUsize::new(0),
			shut_down: AtomicBool::new(false),
		});

		let tables = ctx.tables.table_set(ctx.subscribed_tables().as_ref());
		for (shard, start) in starts.shards {
			let Some(info) = snapshot.shard(shard) else {
				continue;
			};
			let consumer = match ShardConsumer::spawn(
				ctx.clone(),
				info.clone(),
				start,
				tables.clone(),
				PartitionOwnership::all(snapshot.num_partitions),
				false,
			) {
				Ok(consumer) => consumer,
				Err(err) => {
					unit.shutdown();
					return Err(err);
				}
			};
			unit.consumers.lock().insert(shard, consumer);
		}

		if let Err(err) = unit.spawn_workers(checkpoint_rx, change_rx) {
			unit.shutdown();
			return Err(err);
		}

		info!(
			subscription = %ctx.config.subscription_name,
			shards = unit.consumers.lock().len(),
			mode = ?ctx.config.stream_mode,
			"publishing unit started"
		);
		Ok(unit)
	}

	fn spawn_workers(
		self: &Arc<Self>,
		checkpoints: Receiver<StreamPosition>,
		changes: Receiver<ChangeTask>,
	) -> Result<()> {
		let unit = self.clone();
		self.spawn_named("shardstream-topology", move || unit.monitor_topology())?;

		let unit = self.clone();
		self.spawn_named("shardstream-checkpoint", move || unit.run_checkpoints(checkpoints))?;

		for worker in 0..self.ctx.config.change_pool_size {
			let unit = self.clone();
			let tasks = changes.clone();
			self.spawn_named(&format!("shardstream-change-{}", worker), move || unit.run_changes(tasks))?;
		}
		Ok(())
	}

	fn spawn_named(&self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
		let handle = thread::Builder::new()
			.name(name.to_string())
			.spawn(f)
			.map_err(|e| Error::internal(format!("failed to spawn {}: {}", name, e)))?;
		self.threads.lock().push(handle);
		Ok(())
	}

	pub fn active_shards(&self) -> BTreeSet<ShardId> {
		self.consumers.lock().keys().copied().collect()
	}

	pub fn filter_statistics(&self) -> BTreeMap<ShardId, FilterStatistics> {
		self.consumers.lock().iter().map(|(shard, c)| (*shard, c.filter().statistics())).collect()
	}

	fn links(&self) -> Vec<ConsumerLink> {
		self.consumers.lock().values().map(|c| c.link()).collect()
	}

	fn monitor_topology(&self) {
		let interval = self.ctx.config.topology_poll_interval;
		while self.ctx.cancel.sleep(interval) {
			if let Err(err) = self.poll_topology() {
				if err.is_transient() {
					warn!(subscription = %self.ctx.config.subscription_name, "topology poll failed: {}", err);
				} else {
					self.ctx.fail(err);
					return;
				}
			}
		}
	}

	/// Retires consumers whose shard gave away every partition and starts
	/// consumers for shards that appeared since the last poll.
	pub(crate) fn poll_topology(&self) -> Result<()> {
		let snapshot = self.ctx.sources.topology.snapshot()?;
		let _changes = self.changes.lock();
		if self.ctx.cancel.is_cancelled() {
			return Ok(());
		}

		let mut retiring = Vec::new();
		{
			let mut consumers = self.consumers.lock();
			let mut retired = self.retired.lock();

			let idle: Vec<ShardId> = consumers
				.values()
				.filter(|c| c.is_retirable(self.ctx.queue.pending_closes(c.shard())))
				.map(|c| c.shard())
				.collect();
			for shard in idle {
				if let Some(consumer) = consumers.remove(&shard) {
					info!(%shard, state = %consumer.state(), "retiring shard consumer, it owns no partition");
					consumer.stop();
					retired.insert(shard);
					retiring.push(consumer);
				}
			}

			let tables = self.ctx.tables.table_set(self.ctx.subscribed_tables().as_ref());
			for info in snapshot.shards.values() {
				if consumers.contains_key(&info.id) || retired.contains(&info.id) || !self.ctx.config.assigned(info.id.0)
				{
					continue;
				}
				let consumer = self.start_new_shard(info, &snapshot, tables.clone())?;
				consumers.insert(info.id, consumer);
			}
		}

		let deadline = Instant::now() + self.ctx.config.shutdown_grace;
		for consumer in retiring {
			consumer.join(deadline);
		}
		Ok(())
	}

	fn start_new_shard(
		&self,
		info: &ShardInfo,
		snapshot: &TopologySnapshot,
		tables: TableSet,
	) -> Result<ShardConsumer> {
		info!(shard = %info.id, leader = %info.leader, "new shard discovered");
		self.ctx.with_delivered(|delivered| delivered.cover(info.id));
		ShardConsumer::spawn(
			self.ctx.clone(),
			info.clone(),
			ShardStart {
				position: StartPosition::Earliest,
				exact: false,
			},
			tables,
			PartitionOwnership::none(snapshot.num_partitions),
			true,
		)
	}

	/// Queues a checkpoint write; only one may be in flight.
	pub fn submit_checkpoint(&self, position: StreamPosition) -> Result<()> {
		if self.checkpoint_busy.swap(true, Ordering::AcqRel) {
			return Err(Error::CheckpointInProgress);
		}
		match self.checkpoint_requests.try_send(position) {
			Ok(()) => Ok(()),
			Err(TrySendError::Full(_)) => {
				self.checkpoint_busy.store(false, Ordering::Release);
				Err(Error::CheckpointInProgress)
			}
			Err(TrySendError::Disconnected(_)) => {
				self.checkpoint_busy.store(false, Ordering::Release);
				Err(Error::Canceled)
			}
		}
	}

	fn run_checkpoints(&self, requests: Receiver<StreamPosition>) {
		let mut last_auto = Instant::now();
		let mut last_written: Option<StreamPosition> = None;
		loop {
			if self.ctx.cancel.is_cancelled() {
				break;
			}
			match requests.recv_timeout(WAKE_INTERVAL) {
				Ok(position) => {
					let result = self.ctx.checkpoints.write(&position).map(|_| position.clone());
					if let Err(err) = &result {
						warn!(subscription = %self.ctx.config.subscription_name, "checkpoint failed: {}", err);
					} else {
						last_written = Some(position);
					}
					self.checkpoint_busy.store(false, Ordering::Release);
					self.ctx.notify(Event::CheckpointComplete(result));
				}
				Err(RecvTimeoutError::Timeout) => {}
				Err(RecvTimeoutError::Disconnected) => break,
			}

			let Some(interval) = self.ctx.config.checkpoint_interval else {
				continue;
			};
			if !self.ctx.config.checkpoint_enabled || last_auto.elapsed() < interval {
				continue;
			}
			last_auto = Instant::now();
			let delivered = self.ctx.delivered();
			if delivered.shards().all(|(_, p)| p.is_none()) || last_written.as_ref() == Some(&delivered) {
				continue;
			}
			match self.ctx.checkpoints.write(&delivered) {
				Ok(()) => {
					debug!(position = %delivered, "automatic checkpoint written");
					last_written = Some(delivered);
				}
				Err(err) => self.ctx.warn(StreamWarning::CheckpointFailed(err.to_string())),
			}
		}
	}

	/// Queues a table change. At most `change_pool_size` changes run at once.
	pub fn submit_change(&self, add: bool, table: &str) -> Result<()> {
		let limit = self.ctx.config.change_pool_size;
		let admitted = self
			.changes_in_flight
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
			.is_ok();
		if !admitted {
			return Err(Error::ChangeRejected(format!("{} table changes already pending", limit)));
		}

		let task = if add {
			ChangeTask::Add(table.to_string())
		} else {
			ChangeTask::Remove(table.to_string())
		};
		if self.change_tasks.send(task).is_err() {
			self.changes_in_flight.fetch_sub(1, Ordering::AcqRel);
			return Err(Error::Canceled);
		}
		Ok(())
	}

	fn run_changes(&self, tasks: Receiver<ChangeTask>) {
		loop {
			if self.ctx.cancel.is_cancelled() {
				break;
			}
			let task = match tasks.recv_timeout(WAKE_INTERVAL) {
				Ok(task) => task,
				Err(RecvTimeoutError::Timeout) => continue,
				Err(RecvTimeoutError::Disconnected) => break,
			};
			let (table, result) = match task {
				ChangeTask::Add(table) => {
					let result = self.add_table(&table);
					(table, result)
				}
				ChangeTask::Remove(table) => {
					let result = self.remove_table(&table);
					(table, result)
				}
			};
			self.changes_in_flight.fetch_sub(1, Ordering::AcqRel);
			self.ctx.notify(Event::ChangeResult {
				table,
				result,
			});
		}
	}

	/// Installs `table` at every consumer, then caches it and adds it to the
	/// subscribed set. Any consumer refusing the change rolls back the others.
	fn add_table(&self, table: &str) -> Result<()> {
		let _changes = self.changes.lock();
		let result = self.install(table);
		self.ctx.finish_add(table, result.is_ok());
		result
	}

	fn install(&self, table: &str) -> Result<()> {
		let meta = self
			.ctx
			.tables
			.catalog()
			.table(table)?
			.ok_or_else(|| Error::TableNotFound(table.to_string()))?;

		// shards applying the change first pass records before the others answer
		self.ctx.tables.stage(meta.clone());
		let timeout = self.ctx.config.change_timeout;
		let mut applied: Vec<(ConsumerLink, Option<LogPosition>)> = Vec::new();
		for link in self.links() {
			let response = link.change_filter(FilterChangeRequest::add(&meta), timeout);
			match response.status {
				FilterChangeStatus::Ok => applied.push((link, response.effective_position)),
				FilterChangeStatus::NotApplicable => {
					debug!(shard = %link.shard, %table, "table already in filter")
				}
				FilterChangeStatus::Fail | FilterChangeStatus::Timeout => {
					for (done, _) in &applied {
						let rollback = done.change_filter(FilterChangeRequest::remove(&meta), timeout);
						if !rollback.is_ok() {
							error!(shard = %done.shard, %table, "rolling back filter change failed: {}", rollback.message);
						}
					}
					// a schema refresh may already have cached it
					if self.ctx.tables.unstage(table).is_none() {
						self.ctx.tables.remove(table);
					}
					return Err(Error::ChangeRejected(format!(
						"shard {} answered {:?}: {}",
						link.shard, response.status, response.message
					)));
				}
			}
		}

		self.ctx.tables.insert(meta);
		for (link, effective) in &applied {
			info!(shard = %link.shard, %table, effective = ?effective, "table added to filter");
		}
		Ok(())
	}

	/// Drops `table` from the subscribed set, the cache and every filter,
	/// in that order.
	fn remove_table(&self, table: &str) -> Result<()> {
		let _changes = self.changes.lock();
		self.ctx.unsubscribe(table)?;
		let Some(meta) = self.ctx.tables.remove(table) else {
			return Ok(());
		};

		let timeout = self.ctx.config.change_timeout;
		for link in self.links() {
			let response = link.change_filter(FilterChangeRequest::remove(&meta), timeout);
			if !response.is_ok() && response.status != FilterChangeStatus::NotApplicable {
				// records that still pass are dropped at commit
				warn!(shard = %link.shard, %table, status = ?response.status, "removing table from filter failed: {}", response.message);
			}
		}
		info!(%table, "table removed from subscription");
		Ok(())
	}

	/// Stops every thread of the unit, waiting at most the configured grace
	/// period, and drops whatever is still queued.
	pub fn shutdown(&self) {
		if self.shut_down.swap(true, Ordering::AcqRel) {
			return;
		}
		self.ctx.cancel.cancel();

		let consumers = std::mem::take(&mut *self.consumers.lock());
		for consumer in consumers.values() {
			consumer.stop();
		}

		let deadline = Instant::now() + self.ctx.config.shutdown_grace;
		for consumer in consumers.into_values() {
			consumer.join(deadline);
		}
		let threads = std::mem::take(&mut *self.threads.lock());
		let current = thread::current().id();
		for handle in threads {
			// shutdown may run on one of the unit's own threads
			if handle.thread().id() != current {
				join_until(handle, deadline);
			}
		}
		self.ctx.queue.clear();
		debug!(subscription = %self.ctx.config.subscription_name, "publishing unit stopped");
	}
}
