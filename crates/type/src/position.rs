// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	collections::BTreeMap,
	fmt::{self, Display, Formatter},
};

use serde::{Deserialize, Serialize};

use crate::{LogPosition, ShardId};

/// Per-shard log positions of one store.
///
/// A shard can be covered without a position: that is a shard which was
/// never delivered or checkpointed, and differs from a shard at position 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
	store_name: String,
	store_id: u64,
	shards: BTreeMap<ShardId, Option<LogPosition>>,
}

impl StreamPosition {
	pub fn new(store_name: impl Into<String>, store_id: u64) -> Self {
		Self {
			store_name: store_name.into(),
			store_id,
			shards: BTreeMap::new(),
		}
	}

	/// Position covering `shards`, none of them set yet.
	pub fn unset(store_name: impl Into<String>, store_id: u64, shards: impl IntoIterator<Item = ShardId>) -> Self {
		let mut result = Self::new(store_name, store_id);
		for shard in shards {
			result.shards.insert(shard, None);
		}
		result
	}

	pub fn store_name(&self) -> &str {
		&self.store_name
	}

	pub fn store_id(&self) -> u64 {
		self.store_id
	}

	pub fn get(&self, shard: ShardId) -> Option<LogPosition> {
		self.shards.get(&shard).copied().flatten()
	}

	pub fn covers(&self, shard: ShardId) -> bool {
		self.shards.contains_key(&shard)
	}

	pub fn set(&mut self, shard: ShardId, position: LogPosition) {
		self.shards.insert(shard, Some(position));
	}

	pub fn cover(&mut self, shard: ShardId) {
		self.shards.entry(shard).or_insert(None);
	}

	pub fn remove(&mut self, shard: ShardId) -> Option<LogPosition> {
		self.shards.remove(&shard).flatten()
	}

	/// Moves `shard` forward to `position`, never backwards.
	pub fn advance(&mut self, shard: ShardId, position: LogPosition) {
		let entry = self.shards.entry(shard).or_insert(None);
		match *entry {
			Some(current) if current >= position => {}
			_ => *entry = Some(position),
		}
	}

	/// Position to resume `shard` from: right after the recorded one.
	pub fn next_for(&self, shard: ShardId) -> Option<LogPosition> {
		self.get(shard).map(LogPosition::next)
	}

	pub fn shards(&self) -> impl Iterator<Item = (ShardId, Option<LogPosition>)> + '_ {
		self.shards.iter().map(|(shard, position)| (*shard, *position))
	}

	pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
		self.shards.keys().copied()
	}

	pub fn len(&self) -> usize {
		self.shards.len()
	}

	pub fn is_empty(&self) -> bool {
		self.shards.is_empty()
	}

	/// True when every shard set in `other` is set here at the same or a
	/// later position.
	pub fn is_at_or_after(&self, other: &StreamPosition) -> bool {
		other.shards.iter().all(|(shard, theirs)| match theirs {
			None => true,
			Some(theirs) => matches!(self.get(*shard), Some(ours) if ours >= *theirs),
		})
	}

	/// Per-shard maximum of both positions.
	pub fn merge_max(&mut self, other: &StreamPosition) {
		for (shard, position) in other.shards() {
			match position {
				Some(position) => self.advance(shard, position),
				None => self.cover(shard),
			}
		}
	}
}

impl Display for StreamPosition {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "{}:{}[", self.store_name, self.store_id)?;
		for (idx, (shard, position)) in self.shards.iter().enumerate() {
			if idx > 0 {
				f.write_str(", ")?;
			}
			match position {
				Some(position) => write!(f, "{}={}", shard, position)?,
				None => write!(f, "{}=-", shard)?,
			}
		}
		f.write_str("]")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_unset_differs_from_zero() {
		let mut position = StreamPosition::unset("kv", 7, [ShardId(1), ShardId(2)]);
		position.set(ShardId(2), LogPosition(0));

		assert!(position.covers(ShardId(1)));
		assert_eq!(position.get(ShardId(1)), None);
		assert_eq!(position.get(ShardId(2)), Some(LogPosition(0)));
		assert!(!position.covers(ShardId(3)));
	}

	#[test]
	fn test_advance_is_monotonic() {
		let mut position = StreamPosition::new("kv", 1);
		position.advance(ShardId(1), LogPosition(10));
		position.advance(ShardId(1), LogPosition(5));
		assert_eq!(position.get(ShardId(1)), Some(LogPosition(10)));
		position.advance(ShardId(1), LogPosition(11));
		assert_eq!(position.next_for(ShardId(1)), Some(LogPosition(12)));
	}

	#[test]
	fn test_is_at_or_after() {
		let mut earlier = StreamPosition::unset("kv", 1, [ShardId(1), ShardId(2)]);
		earlier.set(ShardId(1), LogPosition(10));

		let mut later = StreamPosition::new("kv", 1);
		later.set(ShardId(1), LogPosition(12));
		assert!(later.is_at_or_after(&earlier));
		assert!(!earlier.is_at_or_after(&later));
	}

	#[test]
	fn test_display() {
		let mut position = StreamPosition::unset("kv", 3, [ShardId(1), ShardId(2)]);
		position.set(ShardId(1), LogPosition(42));
		assert_eq!(position.to_string(), "kv:3[rg1=42, rg2=-]");
	}

	#[test]
	fn test_serde_roundtrip_keeps_unset_shards() {
		let position = StreamPosition::unset("kv", 3, [ShardId(4)]);
		let json = serde_json::to_string(&position).unwrap();
		let decoded: StreamPosition = serde_json::from_str(&json).unwrap();
		assert_eq!(decoded, position);
		assert!(decoded.covers(ShardId(4)));
	}
}
