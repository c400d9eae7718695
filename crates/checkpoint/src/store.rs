// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use shardstream_core::{
	CancellationToken, Error, LogPosition, Result, ShardId, StreamPosition, SubscriptionConfig,
	interface::{CheckpointBackend, CheckpointRow},
	util::now_millis,
};
use tracing::{debug, info, warn};

use crate::codec::{decode_position, decode_shard, encode_position, encode_shard};

/// Checkpoint rows of one subscription.
///
/// Writes are serialized per store; every write lands in one atomic batch.
pub struct CheckpointStore {
	backend: Arc<dyn CheckpointBackend>,
	table: String,
	subscription: String,
	read_attempts: u32,
	retry_sleep: Duration,
	cancel: CancellationToken,
	write_lock: Mutex<()>,
}

impl CheckpointStore {
	pub fn new(backend: Arc<dyn CheckpointBackend>, table: impl Into<String>, subscription: impl Into<String>) -> Self {
		Self {
			backend,
			table: table.into(),
			subscription: subscription.into(),
			read_attempts: 5,
			retry_sleep: Duration::from_millis(200),
			cancel: CancellationToken::new(),
			write_lock: Mutex::new(()),
		}
	}

	pub fn from_config(backend: Arc<dyn CheckpointBackend>, config: &SubscriptionConfig) -> Self {
		Self::new(backend, config.checkpoint_table.clone(), config.subscription_name.clone())
			.with_read_retry(config.checkpoint_read_attempts, config.checkpoint_retry_sleep)
	}

	pub fn with_read_retry(mut self, attempts: u32, sleep: Duration) -> Self {
		self.read_attempts = attempts.max(1);
		self.retry_sleep = sleep;
		self
	}

	/// Retry sleeps end early once `cancel` fires.
	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	pub fn table(&self) -> &str {
		&self.table
	}

	pub fn subscription(&self) -> &str {
		&self.subscription
	}

	pub fn ensure_table(&self) -> Result<()> {
		if !self.backend.table_exists(&self.table)? {
			info!(table = %self.table, "creating checkpoint table");
			self.backend.create_table(&self.table)?;
		}
		Ok(())
	}

	/// The stored user checkpoint, or `None` when nothing was ever stored.
	pub fn read(&self, store_name: &str, store_id: u64) -> Result<Option<StreamPosition>> {
		let rows = self.read_rows()?;
		let mut position = StreamPosition::new(store_name, store_id);
		for row in rows {
			let (shard, internal) = decode_shard(row.shard_id)?;
			if !internal {
				position.set(shard, decode_position(row.position)?);
			}
		}
		Ok(if position.is_empty() {
			None
		} else {
			Some(position)
		})
	}

	/// Stores every set shard of `position` in one batch. Unset shards are
	/// left untouched.
	pub fn write(&self, position: &StreamPosition) -> Result<()> {
		let timestamp = now_millis();
		let rows = position
			.shards()
			.filter_map(|(shard, p)| p.map(|p| (shard, p)))
			.map(|(shard, p)| self.row(shard, false, p, timestamp))
			.collect::<Result<Vec<_>>>()?;
		if rows.is_empty() {
			return Err(Error::InvalidCheckpoint(format!("{} has no positions", position)));
		}

		let _guard = self.write_lock.lock();
		self.backend.write(&self.table, &rows)?;
		debug!(subscription = %self.subscription, %position, "checkpoint written");
		Ok(())
	}

	pub fn read_internal(&self, shard: ShardId) -> Result<Option<LogPosition>> {
		Ok(self.read_internal_all()?.remove(&shard))
	}

	pub fn read_internal_all(&self) -> Result<BTreeMap<ShardId, LogPosition>> {
		let mut result = BTreeMap::new();
		for row in self.read_rows()? {
			let (shard, internal) = decode_shard(row.shard_id)?;
			if internal {
				result.insert(shard, decode_position(row.position)?);
			}
		}
		Ok(result)
	}

	/// Records that `shard` delivered everything up to `position` for
	/// migration purposes. Never moves a row backwards.
	pub fn write_internal(&self, shard: ShardId, position: LogPosition) -> Result<()> {
		let _guard = self.write_lock.lock();
		if let Some(current) = self.read_internal(shard)? {
			if current >= position {
				debug!(%shard, %current, %position, "internal checkpoint already ahead");
				return Ok(());
			}
		}
		let row = self.row(shard, true, position, now_millis())?;
		self.backend.write(&self.table, &[row])?;
		debug!(subscription = %self.subscription, %shard, %position, "internal checkpoint written");
		Ok(())
	}

	fn row(&self, shard: ShardId, internal: bool, position: LogPosition, timestamp: i64) -> Result<CheckpointRow> {
		Ok(CheckpointRow {
			subscription: self.subscription.clone(),
			shard_id: encode_shard(shard, internal)?,
			position: encode_position(position)?,
			timestamp,
		})
	}

	fn read_rows(&self) -> Result<Vec<CheckpointRow>> {
		let mut attempt = 1;
		loop {
			match self.backend.read(&self.table, &self.subscription) {
				Ok(rows) => return Ok(rows),
				Err(err) if err.is_transient() && attempt < self.read_attempts => {
					warn!(table = %self.table, attempt, "checkpoint read failed, retrying: {}", err);
					if !self.cancel.sleep(self.retry_sleep) {
						return Err(Error::Canceled);
					}
					attempt += 1;
				}
				Err(err) => return Err(err),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::MemoryCheckpointBackend;

	fn store(backend: &MemoryCheckpointBackend) -> CheckpointStore {
		let store = CheckpointStore::new(Arc::new(backend.clone()), "cp", "feed")
			.with_read_retry(3, Duration::from_millis(1));
		store.ensure_table().unwrap();
		store
	}

	#[test]
	fn test_write_then_read() {
		let backend = MemoryCheckpointBackend::new();
		let store = store(&backend);
		assert_eq!(store.read("kv", 1).unwrap(), None);

		let mut position = StreamPosition::unset("kv", 1, [ShardId(1), ShardId(2)]);
		position.set(ShardId(1), LogPosition(10));
		position.set(ShardId(2), LogPosition(50));
		store.write(&position).unwrap();

		assert_eq!(store.read("kv", 1).unwrap(), Some(position));
	}

	#[test]
	fn test_unset_shards_are_not_written() {
		let backend = MemoryCheckpointBackend::new();
		let store = store(&backend);

		let mut position = StreamPosition::unset("kv", 1, [ShardId(1), ShardId(2)]);
		position.set(ShardId(2), LogPosition(50));
		store.write(&position).unwrap();

		let read = store.read("kv", 1).unwrap().unwrap();
		assert!(!read.covers(ShardId(1)));
		assert_eq!(read.get(ShardId(2)), Some(LogPosition(50)));

		let empty = StreamPosition::unset("kv", 1, [ShardId(1)]);
		assert!(matches!(store.write(&empty), Err(Error::InvalidCheckpoint(_))));
	}

	#[test]
	fn test_internal_rows_are_separate() {
		let backend = MemoryCheckpointBackend::new();
		let store = store(&backend);

		store.write_internal(ShardId(2), LogPosition(30)).unwrap();
		assert_eq!(store.read("kv", 1).unwrap(), None);
		assert_eq!(store.read_internal(ShardId(2)).unwrap(), Some(LogPosition(30)));
		assert_eq!(backend.rows("cp")[0].shard_id, -2);
	}

	#[test]
	fn test_internal_checkpoint_never_moves_back() {
		let backend = MemoryCheckpointBackend::new();
		let store = store(&backend);

		store.write_internal(ShardId(1), LogPosition(30)).unwrap();
		store.write_internal(ShardId(1), LogPosition(20)).unwrap();
		assert_eq!(store.read_internal(ShardId(1)).unwrap(), Some(LogPosition(30)));
	}

	#[test]
	fn test_read_retries_missing_table() {
		let backend = MemoryCheckpointBackend::new();
		let store = store(&backend);

		backend.hide_table_for(2);
		assert_eq!(store.read("kv", 1).unwrap(), None);

		backend.hide_table_for(3);
		assert_eq!(store.read("kv", 1), Err(Error::TableNotFound("cp".into())));
	}

	#[test]
	fn test_write_failure_is_reported() {
		let backend = MemoryCheckpointBackend::new();
		let store = store(&backend);
		backend.fail_writes(true);
		assert!(store.write_internal(ShardId(1), LogPosition(1)).is_err());
	}
}
