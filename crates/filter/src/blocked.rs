// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::collections::{HashSet, VecDeque};

use shardstream_core::DatabaseId;

/// Bounded set of databases known to be blocked. The oldest entry is
/// evicted first.
#[derive(Debug)]
pub(crate) struct BlockedDatabases {
	capacity: usize,
	members: HashSet<DatabaseId>,
	order: VecDeque<DatabaseId>,
}

impl BlockedDatabases {
	pub(crate) fn new(capacity: usize) -> Self {
		Self {
			capacity,
			members: HashSet::new(),
			order: VecDeque::new(),
		}
	}

	pub(crate) fn contains(&self, database: DatabaseId) -> bool {
		self.members.contains(&database)
	}

	pub(crate) fn insert(&mut self, database: DatabaseId) {
		if self.capacity == 0 || !self.members.insert(database) {
			return;
		}
		self.order.push_back(database);
		if self.order.len() > self.capacity {
			if let Some(evicted) = self.order.pop_front() {
				self.members.remove(&evicted);
			}
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.members.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_evicts_oldest() {
		let mut blocked = BlockedDatabases::new(2);
		blocked.insert(DatabaseId(1));
		blocked.insert(DatabaseId(2));
		blocked.insert(DatabaseId(1));
		blocked.insert(DatabaseId(3));

		assert_eq!(blocked.len(), 2);
		assert!(!blocked.contains(DatabaseId(1)));
		assert!(blocked.contains(DatabaseId(2)));
		assert!(blocked.contains(DatabaseId(3)));
	}

	#[test]
	fn test_zero_capacity_caches_nothing() {
		let mut blocked = BlockedDatabases::new(0);
		blocked.insert(DatabaseId(1));
		assert!(!blocked.contains(DatabaseId(1)));
	}
}
