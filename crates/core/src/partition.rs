// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use shardstream_type::PartitionId;
use xxhash_rust::xxh3::xxh3_64;

use crate::key;

/// Number of leading key components that decide placement: the root table
/// id and the first primary key component.
pub const MAJOR_PATH_COMPONENTS: usize = 2;

/// Maps keys to the partition that stores them.
pub trait Partitioner: Send + Sync {
	fn partition_of(&self, key: &[u8]) -> PartitionId;

	fn num_partitions(&self) -> u32;
}

#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
	num_partitions: u32,
}

impl HashPartitioner {
	pub fn new(num_partitions: u32) -> Self {
		assert!(num_partitions > 0, "a store has at least one partition");
		Self {
			num_partitions,
		}
	}
}

impl Partitioner for HashPartitioner {
	fn partition_of(&self, key: &[u8]) -> PartitionId {
		let major = key::prefix(key, MAJOR_PATH_COMPONENTS);
		PartitionId(1 + (xxh3_64(major) % self.num_partitions as u64) as u32)
	}

	fn num_partitions(&self) -> u32 {
		self.num_partitions
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::key::KeyBuilder;

	#[test]
	fn test_partition_in_range() {
		let partitioner = HashPartitioner::new(8);
		for i in 0..100 {
			let key = KeyBuilder::new().component("10").component(format!("k{i}")).build();
			let partition = partitioner.partition_of(&key);
			assert!(partition.0 >= 1 && partition.0 <= 8);
		}
	}

	#[test]
	fn test_minor_components_do_not_move_a_row() {
		let partitioner = HashPartitioner::new(16);
		let parent = KeyBuilder::new().component("10").component("u1").build();
		let child = KeyBuilder::new().component("10").component("u1").component("11").component("1").build();
		assert_eq!(partitioner.partition_of(&parent), partitioner.partition_of(&child));
	}
}
