// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Checkpoints stored in a SQLite file survive reopening the store.

use std::sync::Arc;

use shardstream_checkpoint::{CheckpointStore, SqliteCheckpointBackend};
use shardstream_core::{LogPosition, ShardId, StreamPosition};
use shardstream_testing::tempdir::temp_dir;

#[test]
fn test_checkpoint_survives_reopen() {
	temp_dir(|dir| {
		let path = dir.join("checkpoints.db");

		{
			let backend = SqliteCheckpointBackend::open(&path).unwrap();
			let store = CheckpointStore::new(Arc::new(backend), "stream_checkpoints", "orders-feed");
			store.ensure_table().unwrap();

			let mut position = StreamPosition::unset("kv", 7, [ShardId(1), ShardId(2)]);
			position.set(ShardId(1), LogPosition(12));
			position.set(ShardId(2), LogPosition(50));
			store.write(&position).unwrap();
			store.write_internal(ShardId(2), LogPosition(55)).unwrap();
		}

		let backend = SqliteCheckpointBackend::open(&path).unwrap();
		let store = CheckpointStore::new(Arc::new(backend), "stream_checkpoints", "orders-feed");
		store.ensure_table().unwrap();

		let read = store.read("kv", 7).unwrap().unwrap();
		assert_eq!(read.get(ShardId(1)), Some(LogPosition(12)));
		assert_eq!(read.get(ShardId(2)), Some(LogPosition(50)));
		assert_eq!(store.read_internal(ShardId(2)).unwrap(), Some(LogPosition(55)));
		Ok(())
	})
	.unwrap();
}

#[test]
fn test_subscriptions_do_not_see_each_other() {
	let backend = Arc::new(SqliteCheckpointBackend::in_memory().unwrap());
	let orders = CheckpointStore::new(backend.clone(), "stream_checkpoints", "orders-feed");
	let users = CheckpointStore::new(backend, "stream_checkpoints", "users-feed");
	orders.ensure_table().unwrap();

	let mut position = StreamPosition::unset("kv", 7, [ShardId(1)]);
	position.set(ShardId(1), LogPosition(3));
	orders.write(&position).unwrap();

	assert_eq!(users.read("kv", 7).unwrap(), None);
	assert_eq!(orders.read("kv", 7).unwrap(), Some(position));
}
