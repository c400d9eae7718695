// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::collections::{BTreeMap, BTreeSet};

use shardstream_type::{PartitionId, Result, ShardId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
	pub id: ShardId,
	/// Address of the current leader, handed to the transport.
	pub leader: String,
	pub partitions: BTreeSet<PartitionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
	pub store_name: String,
	pub store_id: u64,
	pub num_partitions: u32,
	pub shards: BTreeMap<ShardId, ShardInfo>,
}

impl TopologySnapshot {
	pub fn shard(&self, id: ShardId) -> Option<&ShardInfo> {
		self.shards.get(&id)
	}
}

/// Cluster membership. Must be safe to share between threads.
pub trait Topology: Send + Sync {
	fn snapshot(&self) -> Result<TopologySnapshot>;
}
