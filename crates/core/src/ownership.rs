// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Live partition ownership of one shard.
//!
//! Shared between the source filter and the migration tracker, and written
//! by both. The filter reads it for every data record and applies generation
//! markers as they leave the source. The tracker opens a partition once its
//! predecessor finished and closes it when the close marker is delivered.

use std::{collections::BTreeSet, sync::Arc};

use parking_lot::RwLock;
use shardstream_type::PartitionId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Owned {
	/// Nothing is known about generations yet: every partition is owned.
	All,
	Only(BTreeSet<PartitionId>),
}

#[derive(Debug, Clone)]
pub struct PartitionOwnership {
	owned: Arc<RwLock<Owned>>,
	num_partitions: u32,
}

impl PartitionOwnership {
	pub fn all(num_partitions: u32) -> Self {
		Self {
			owned: Arc::new(RwLock::new(Owned::All)),
			num_partitions,
		}
	}

	/// Ownership of a shard that joined the store and has not received
	/// any partition yet.
	pub fn none(num_partitions: u32) -> Self {
		Self::only(num_partitions, BTreeSet::new())
	}

	pub fn only(num_partitions: u32, partitions: BTreeSet<PartitionId>) -> Self {
		Self {
			owned: Arc::new(RwLock::new(Owned::Only(partitions))),
			num_partitions,
		}
	}

	pub fn owns(&self, partition: PartitionId) -> bool {
		match &*self.owned.read() {
			Owned::All => true,
			Owned::Only(set) => set.contains(&partition),
		}
	}

	pub fn open(&self, partition: PartitionId) {
		let mut owned = self.owned.write();
		if let Owned::Only(set) = &mut *owned {
			set.insert(partition);
		}
	}

	pub fn close(&self, partition: PartitionId) {
		let mut owned = self.owned.write();
		match &mut *owned {
			Owned::All => {
				let mut set: BTreeSet<PartitionId> = (1..=self.num_partitions).map(PartitionId).collect();
				set.remove(&partition);
				*owned = Owned::Only(set);
			}
			Owned::Only(set) => {
				set.remove(&partition);
			}
		}
	}

	pub fn owns_nothing(&self) -> bool {
		match &*self.owned.read() {
			Owned::All => false,
			Owned::Only(set) => set.is_empty(),
		}
	}

	/// `None` while every partition is owned.
	pub fn snapshot(&self) -> Option<BTreeSet<PartitionId>> {
		match &*self.owned.read() {
			Owned::All => None,
			Owned::Only(set) => Some(set.clone()),
		}
	}

	pub fn num_partitions(&self) -> u32 {
		self.num_partitions
	}
}
