// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use shardstream_cdc::{StreamSources, SubscriptionHandle, subscribe};
use shardstream_checkpoint::MemoryCheckpointBackend;
use shardstream_core::{
	FieldValue, LogPosition, PartitionId, Row, ShardId, StreamMode, StreamOperation, SubscriptionConfig,
	SubscriptionConfigBuilder, TableMetadata,
};
use shardstream_testing::{MemoryCatalog, MemoryStore, SubscriberProbe, logging};

pub const CHECKPOINT_TABLE: &str = "stream_checkpoints";

pub struct Fixture {
	pub store: MemoryStore,
	pub catalog: MemoryCatalog,
	pub checkpoints: MemoryCheckpointBackend,
	pub users: TableMetadata,
	pub orders: TableMetadata,
}

impl Fixture {
	pub fn new(num_partitions: u32, num_shards: u32) -> Self {
		logging::init();
		let catalog = MemoryCatalog::new();
		let users = catalog.create_table("users", &["id"], &["name"]);
		let orders = catalog.create_table("orders", &["id"], &["amount"]);
		Self {
			store: MemoryStore::new("kv", 7, num_partitions, num_shards),
			catalog,
			checkpoints: MemoryCheckpointBackend::new(),
			users,
			orders,
		}
	}

	pub fn sources(&self) -> StreamSources {
		StreamSources {
			transport: Arc::new(self.store.clone()),
			topology: Arc::new(self.store.clone()),
			catalog: Arc::new(self.catalog.clone()),
			directory: Arc::new(self.store.clone()),
			checkpoints: Arc::new(self.checkpoints.clone()),
		}
	}

	/// Streams `users` from the stored checkpoint, or from the start of
	/// every log when none exists, with intervals short enough for tests.
	pub fn config(&self, name: &str) -> SubscriptionConfigBuilder {
		SubscriptionConfig::builder(name)
			.tables(["users"])
			.checkpoints(CHECKPOINT_TABLE)
			.stream_mode(StreamMode::FromCheckpoint)
			.reconnect(5, Duration::from_millis(10))
			.topology_poll_interval(Duration::from_millis(20))
			.migration(Duration::from_millis(5), Some(Duration::from_secs(5)))
			.change_pool(2, Duration::from_secs(2))
			.shutdown_grace(Duration::from_secs(2))
	}

	pub fn subscribe(&self, config: SubscriptionConfig, probe: &SubscriberProbe) -> SubscriptionHandle {
		subscribe(config, self.sources(), probe.clone()).unwrap()
	}

	pub fn put_user(&self, id: &str, name: &str) -> LogPosition {
		let positions = self.store.begin().put(&self.users, &[id], &[text(name)]).commit();
		*positions.values().next().unwrap()
	}

	pub fn put_order(&self, id: &str, amount: i64) -> LogPosition {
		let positions = self.store.begin().put(&self.orders, &[id], &[FieldValue::Integer(amount)]).commit();
		*positions.values().next().unwrap()
	}

	pub fn shard_of_user(&self, id: &str) -> ShardId {
		self.store.shard_of(&self.users.key::<&str, _>(&[], &[id]))
	}
}

pub fn text(value: &str) -> FieldValue {
	FieldValue::String(value.to_string())
}

/// First key value of `row`, as text.
pub fn key_of(row: &Row) -> String {
	match &row.key[0].1 {
		FieldValue::String(key) => key.clone(),
		other => other.to_string(),
	}
}

pub fn keys(rows: &[Row]) -> Vec<String> {
	rows.iter().map(key_of).collect()
}

/// Finds an id whose row is stored on `shard`.
pub fn user_id_on(fixture: &Fixture, shard: ShardId, prefix: &str) -> String {
	(0..1000)
		.map(|i| format!("{}{}", prefix, i))
		.find(|id| fixture.shard_of_user(id) == shard)
		.unwrap_or_else(|| panic!("no key of shard {}", shard))
}

/// Finds an id whose row is stored in `partition`.
pub fn user_id_in(fixture: &Fixture, partition: PartitionId, prefix: &str) -> String {
	(0..1000)
		.map(|i| format!("{}{}", prefix, i))
		.find(|id| fixture.store.partition_of(&fixture.users.key::<&str, _>(&[], &[id.as_str()])) == partition)
		.unwrap_or_else(|| panic!("no key of partition {}", partition))
}

pub fn positions(operations: &[StreamOperation]) -> Vec<(ShardId, LogPosition, u32)> {
	operations.iter().map(|op| op.seq()).map(|seq| (seq.shard, seq.position, seq.index)).collect()
}
