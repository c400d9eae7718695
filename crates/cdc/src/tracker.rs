// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Migration ordering for one shard.
//!
//! When a partition moves from shard A to shard B, A writes a CLOSE marker
//! and B an OPEN marker naming A's close position. B may only deliver
//! after A's internal checkpoint reached that position, which A writes
//! once everything it queued before the CLOSE has been delivered.

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use shardstream_checkpoint::CheckpointStore;
use shardstream_core::{
	CancellationToken, Error, LogPosition, LogRecord, PartitionGeneration, PartitionOwnership, Result, ShardId,
	generation::Predecessor,
};
use tracing::{debug, info, warn};

use crate::queue::{CloseMarker, DeliveryQueue, QueueItem};

pub(crate) struct MigrationTracker {
	shard: ShardId,
	ownership: PartitionOwnership,
	checkpoints: Arc<CheckpointStore>,
	queue: DeliveryQueue,
	cancel: CancellationToken,
	poll_interval: Duration,
	timeout: Option<Duration>,
}

impl MigrationTracker {
	pub fn new(
		shard: ShardId,
		ownership: PartitionOwnership,
		checkpoints: Arc<CheckpointStore>,
		queue: DeliveryQueue,
		cancel: CancellationToken,
	) -> Self {
		Self {
			shard,
			ownership,
			checkpoints,
			queue,
			cancel,
			poll_interval: Duration::from_millis(100),
			timeout: None,
		}
	}

	pub fn with_wait(mut self, poll_interval: Duration, timeout: Option<Duration>) -> Self {
		self.poll_interval = poll_interval;
		self.timeout = timeout;
		self
	}

	pub fn handle(&self, record: &LogRecord) -> Result<()> {
		let value = record
			.value
			.as_deref()
			.ok_or_else(|| Error::codec(format!("generation marker at {} without value", record.position)))?;
		let generation = PartitionGeneration::decode(value)?;

		if generation.is_open() {
			self.open(&generation, record.position)
		} else {
			self.close(&generation, record.position)
		}
	}

	fn open(&self, generation: &PartitionGeneration, position: LogPosition) -> Result<()> {
		if generation.generation.is_initial() {
			return Ok(());
		}

		if let Some(predecessor) = generation.predecessor() {
			let applied = self.checkpoints.read_internal(self.shard)?.is_some_and(|p| p >= position);
			if applied {
				debug!(shard = %self.shard, partition = %generation.partition, "generation already opened");
			} else {
				self.await_predecessor(generation, predecessor, position)?;
			}
		}

		self.checkpoints.write_internal(self.shard, position)?;
		self.ownership.open(generation.partition);
		info!(
			shard = %self.shard,
			partition = %generation.partition,
			generation = %generation.generation,
			%position,
			"partition generation opened"
		);
		Ok(())
	}

	fn await_predecessor(
		&self,
		generation: &PartitionGeneration,
		predecessor: Predecessor,
		position: LogPosition,
	) -> Result<()> {
		info!(
			shard = %self.shard,
			partition = %generation.partition,
			previous = %predecessor.shard,
			end = %predecessor.end,
			"waiting for previous owner to finish partition"
		);

		let started = Instant::now();
		loop {
			match self.checkpoints.read_internal(predecessor.shard) {
				Ok(Some(reached)) if reached >= predecessor.end => return Ok(()),
				Ok(_) => {}
				Err(err) if err.is_transient() => {
					warn!(shard = %self.shard, "reading migration checkpoint failed: {}", err)
				}
				Err(err) => return Err(err),
			}

			let timed_out = self.timeout.is_some_and(|timeout| started.elapsed() >= timeout);
			if timed_out || !self.cancel.sleep(self.poll_interval) {
				// keep what was already delivered from this shard resumable
				if let Err(err) = self.checkpoints.write_internal(self.shard, position.prev()) {
					warn!(shard = %self.shard, "migration checkpoint failed: {}", err);
				}
				if !timed_out {
					return Err(Error::Canceled);
				}
				return Err(Error::Migration {
					shard: self.shard,
					partition: generation.partition,
					message: format!(
						"shard {} did not reach position {} within {:?}",
						predecessor.shard,
						predecessor.end,
						started.elapsed()
					),
				});
			}
		}
	}

	fn close(&self, generation: &PartitionGeneration, position: LogPosition) -> Result<()> {
		debug!(shard = %self.shard, partition = %generation.partition, %position, "partition generation closing");
		self.queue.push(QueueItem::Close(CloseMarker {
			shard: self.shard,
			partition: generation.partition,
			position,
			ownership: self.ownership.clone(),
		}))
	}
}

/// Applies a dequeued close marker: everything before it was delivered.
pub(crate) fn apply_close(checkpoints: &CheckpointStore, marker: &CloseMarker) -> Result<()> {
	checkpoints
		.write_internal(marker.shard, marker.position)
		.map_err(|e| Error::CheckpointFailed(format!("closing {} on {}: {}", marker.partition, marker.shard, e)))?;
	marker.ownership.close(marker.partition);
	info!(shard = %marker.shard, partition = %marker.partition, position = %marker.position, "partition generation closed");
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::thread;

	use shardstream_checkpoint::MemoryCheckpointBackend;
	use shardstream_core::{DatabaseId, Generation, PartitionId, TxnId};

	use super::*;

	fn store() -> Arc<CheckpointStore> {
		let store = CheckpointStore::new(Arc::new(MemoryCheckpointBackend::new()), "cp", "feed");
		store.ensure_table().unwrap();
		Arc::new(store)
	}

	fn marker(position: u64, generation: PartitionGeneration) -> LogRecord {
		LogRecord::put(
			LogPosition(position),
			DatabaseId(0),
			TxnId(position),
			generation.marker_key(),
			generation.encode().unwrap(),
		)
	}

	fn tracker(shard: u32, checkpoints: Arc<CheckpointStore>, queue: DeliveryQueue) -> MigrationTracker {
		MigrationTracker::new(
			ShardId(shard),
			PartitionOwnership::none(8),
			checkpoints,
			queue,
			CancellationToken::new(),
		)
		.with_wait(Duration::from_millis(5), Some(Duration::from_secs(5)))
	}

	#[test]
	fn test_initial_generation_is_ignored() {
		let checkpoints = store();
		let tracker = tracker(1, checkpoints.clone(), DeliveryQueue::new(100, CancellationToken::new()));
		tracker.handle(&marker(3, PartitionGeneration::open(PartitionId(1), Generation::INITIAL, None))).unwrap();
		assert!(!tracker.ownership.owns(PartitionId(1)));
		assert_eq!(checkpoints.read_internal(ShardId(1)).unwrap(), None);
	}

	#[test]
	fn test_open_waits_for_predecessor() {
		let checkpoints = store();
		let tracker = tracker(2, checkpoints.clone(), DeliveryQueue::new(100, CancellationToken::new()));
		let open = PartitionGeneration::open(
			PartitionId(4),
			Generation(1),
			Some(Predecessor {
				shard: ShardId(1),
				end: LogPosition(40),
			}),
		);

		let writer = checkpoints.clone();
		let handle = thread::spawn(move || {
			thread::sleep(Duration::from_millis(30));
			let before_write = Instant::now();
			writer.write_internal(ShardId(1), LogPosition(40)).unwrap();
			before_write
		});

		tracker.handle(&marker(7, open)).unwrap();
		let opened = Instant::now();
		let predecessor_done = handle.join().unwrap();

		assert!(opened >= predecessor_done);
		assert!(tracker.ownership.owns(PartitionId(4)));
		assert_eq!(checkpoints.read_internal(ShardId(2)).unwrap(), Some(LogPosition(7)));
	}

	#[test]
	fn test_open_already_applied_skips_wait() {
		let checkpoints = store();
		checkpoints.write_internal(ShardId(2), LogPosition(9)).unwrap();
		let tracker = tracker(2, checkpoints, DeliveryQueue::new(100, CancellationToken::new()))
			.with_wait(Duration::from_millis(5), Some(Duration::from_millis(1)));

		let open = PartitionGeneration::open(
			PartitionId(4),
			Generation(1),
			Some(Predecessor {
				shard: ShardId(1),
				end: LogPosition(40),
			}),
		);
		tracker.handle(&marker(7, open)).unwrap();
		assert!(tracker.ownership.owns(PartitionId(4)));
	}

	#[test]
	fn test_open_times_out() {
		let checkpoints = store();
		let tracker = tracker(2, checkpoints.clone(), DeliveryQueue::new(100, CancellationToken::new()))
			.with_wait(Duration::from_millis(5), Some(Duration::from_millis(20)));

		let open = PartitionGeneration::open(
			PartitionId(4),
			Generation(1),
			Some(Predecessor {
				shard: ShardId(1),
				end: LogPosition(40),
			}),
		);
		let err = tracker.handle(&marker(7, open)).unwrap_err();
		assert!(matches!(err, Error::Migration { .. }));
		assert!(!tracker.ownership.owns(PartitionId(4)));
		assert_eq!(checkpoints.read_internal(ShardId(2)).unwrap(), Some(LogPosition(6)));
	}

	#[test]
	fn test_close_is_deferred_through_queue() {
		let checkpoints = store();
		let queue = DeliveryQueue::new(100, CancellationToken::new());
		let tracker = MigrationTracker::new(
			ShardId(1),
			PartitionOwnership::all(4),
			checkpoints.clone(),
			queue.clone(),
			CancellationToken::new(),
		);

		let close = PartitionGeneration::close(PartitionId(2), Generation(0), LogPosition(12), ShardId(3));
		tracker.handle(&marker(12, close)).unwrap();
		assert!(tracker.ownership.owns(PartitionId(2)));
		assert_eq!(queue.pending_closes(ShardId(1)), 1);

		let marker = queue.pop_control().unwrap();
		apply_close(&checkpoints, &marker).unwrap();
		assert!(!tracker.ownership.owns(PartitionId(2)));
		assert!(tracker.ownership.owns(PartitionId(3)));
		assert_eq!(checkpoints.read_internal(ShardId(1)).unwrap(), Some(LogPosition(12)));
	}
}
