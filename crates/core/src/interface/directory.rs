// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use shardstream_type::{DatabaseId, PartitionId};

/// What a database of a shard holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseKind {
	Partition(PartitionId),
	/// The reserved system table recording partition generations.
	MigrationMarkers,
	Internal,
	DuplicateIndex,
	NonPartition,
}

impl DatabaseKind {
	/// Records of these databases never reach a subscriber.
	pub fn is_blocked(self) -> bool {
		matches!(self, DatabaseKind::Internal | DatabaseKind::DuplicateIndex | DatabaseKind::NonPartition)
	}
}

pub trait DatabaseDirectory: Send + Sync {
	fn resolve(&self, database: DatabaseId) -> DatabaseKind;
}
