// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	fmt::{self, Display, Formatter},
	ops::Deref,
};

use serde::{Deserialize, Serialize};

/// Replication group owning a subset of partitions. Shard ids start at 1.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl Display for ShardId {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "rg{}", self.0)
	}
}

impl Deref for ShardId {
	type Target = u32;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl From<u32> for ShardId {
	fn from(value: u32) -> Self {
		ShardId(value)
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl Display for PartitionId {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "p{}", self.0)
	}
}

impl From<u32> for PartitionId {
	fn from(value: u32) -> Self {
		PartitionId(value)
	}
}

/// Shard-local, monotonically increasing position in a commit log.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct LogPosition(pub u64);

impl LogPosition {
	pub const ZERO: LogPosition = LogPosition(0);

	#[inline]
	pub fn next(self) -> LogPosition {
		LogPosition(self.0.saturating_add(1))
	}

	#[inline]
	pub fn prev(self) -> LogPosition {
		LogPosition(self.0.saturating_sub(1))
	}
}

impl Display for LogPosition {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

impl Deref for LogPosition {
	type Target = u64;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl From<u64> for LogPosition {
	fn from(value: u64) -> Self {
		LogPosition(value)
	}
}

impl PartialEq<u64> for LogPosition {
	fn eq(&self, other: &u64) -> bool {
		self.0.eq(other)
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub u64);

impl TableId {
	/// Bytes of this id as it appears as a key component.
	pub fn to_component(self) -> Vec<u8> {
		self.0.to_string().into_bytes()
	}
}

impl Display for TableId {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

/// Database inside a shard's environment. Partitions, internal catalogs
/// and secondary indexes each live in their own database.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(pub u32);

impl Display for DatabaseId {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "db{}", self.0)
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl Display for TxnId {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "txn{}", self.0)
	}
}

/// Ownership epoch of one partition on one shard.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct Generation(pub u32);

impl Generation {
	/// Generation every partition starts in when the store is created.
	pub const INITIAL: Generation = Generation(0);

	#[inline]
	pub fn is_initial(self) -> bool {
		self == Self::INITIAL
	}
}

impl Display for Generation {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "g{}", self.0)
	}
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(pub u32);

impl Display for RegionId {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "region{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_log_position_next_saturates() {
		assert_eq!(LogPosition(7).next(), LogPosition(8));
		assert_eq!(LogPosition(u64::MAX).next(), LogPosition(u64::MAX));
		assert_eq!(LogPosition::ZERO.prev(), LogPosition::ZERO);
	}

	#[test]
	fn test_table_id_component() {
		assert_eq!(TableId(1042).to_component(), b"1042".to_vec());
	}
}
