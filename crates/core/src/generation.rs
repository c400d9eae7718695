// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Partition generation markers.
//!
//! A migration writes one CLOSE marker into the log of the shard losing a
//! partition and one OPEN marker into the log of the shard gaining it. Both
//! are rows of the reserved migration-marker table.

use serde::{Deserialize, Serialize};
use shardstream_type::{Error, Generation, LogPosition, PartitionId, Result, ShardId};

use crate::key::KeyBuilder;

const MARKER_TABLE: &str = "$gen";

/// Where the previous generation of a partition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predecessor {
	pub shard: ShardId,
	pub end: LogPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationState {
	Open {
		predecessor: Option<Predecessor>,
	},
	Closed {
		end: LogPosition,
		next_shard: ShardId,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionGeneration {
	pub partition: PartitionId,
	pub generation: Generation,
	pub state: GenerationState,
}

impl PartitionGeneration {
	pub fn open(partition: PartitionId, generation: Generation, predecessor: Option<Predecessor>) -> Self {
		Self {
			partition,
			generation,
			state: GenerationState::Open {
				predecessor,
			},
		}
	}

	pub fn close(partition: PartitionId, generation: Generation, end: LogPosition, next_shard: ShardId) -> Self {
		Self {
			partition,
			generation,
			state: GenerationState::Closed {
				end,
				next_shard,
			},
		}
	}

	pub fn is_open(&self) -> bool {
		matches!(self.state, GenerationState::Open { .. })
	}

	pub fn predecessor(&self) -> Option<Predecessor> {
		match self.state {
			GenerationState::Open {
				predecessor,
			} => predecessor,
			GenerationState::Closed {
				..
			} => None,
		}
	}

	/// Key of the marker row; one row per partition and generation.
	pub fn marker_key(&self) -> Vec<u8> {
		KeyBuilder::new()
			.component(MARKER_TABLE)
			.component(self.partition.0.to_string())
			.component(self.generation.0.to_string())
			.build()
	}

	pub fn encode(&self) -> Result<Vec<u8>> {
		postcard::to_allocvec(self).map_err(|e| Error::codec(format!("encoding generation marker: {}", e)))
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		postcard::from_bytes(bytes).map_err(|e| Error::codec(format!("invalid generation marker: {}", e)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_open_predecessor() {
		let initial = PartitionGeneration::open(PartitionId(3), Generation::INITIAL, None);
		assert!(initial.is_open());
		assert_eq!(initial.predecessor(), None);

		let migrated = PartitionGeneration::open(
			PartitionId(3),
			Generation(1),
			Some(Predecessor {
				shard: ShardId(1),
				end: LogPosition(100),
			}),
		);
		assert_eq!(migrated.predecessor().map(|p| p.end), Some(LogPosition(100)));
	}

	#[test]
	fn test_closed_has_no_predecessor() {
		let closed = PartitionGeneration::close(PartitionId(3), Generation(0), LogPosition(100), ShardId(2));
		assert!(!closed.is_open());
		assert_eq!(closed.predecessor(), None);
	}

	#[test]
	fn test_decode_rejects_garbage() {
		assert!(PartitionGeneration::decode(&[0xff, 0xff, 0xff]).is_err());
	}

	#[test]
	fn test_decode_encoded_marker() {
		let closed = PartitionGeneration::close(PartitionId(9), Generation(4), LogPosition(77), ShardId(2));
		assert_eq!(PartitionGeneration::decode(&closed.encode().unwrap()).unwrap(), closed);
	}
}
