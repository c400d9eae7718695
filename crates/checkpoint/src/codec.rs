// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use shardstream_core::{Error, LogPosition, Result, ShardId};

/// Stored shard id of a checkpoint row. Shard ids start at 1, so every
/// internal row is stored at or below -1.
pub fn encode_shard(shard: ShardId, internal: bool) -> Result<i32> {
	let id = i32::try_from(shard.0)
		.map_err(|_| Error::codec(format!("shard {} does not fit a checkpoint row", shard)))?;
	Ok(if internal {
		-id
	} else {
		id
	})
}

/// Inverse of [`encode_shard`]: the shard and whether the row is internal.
pub fn decode_shard(stored: i32) -> Result<(ShardId, bool)> {
	match stored {
		0 => Err(Error::codec("checkpoint row with shard id 0")),
		id if id < 0 => Ok((ShardId(id.unsigned_abs()), true)),
		id => Ok((ShardId(id as u32), false)),
	}
}

pub(crate) fn encode_position(position: LogPosition) -> Result<i64> {
	i64::try_from(position.0).map_err(|_| Error::codec(format!("position {} does not fit a checkpoint row", position)))
}

pub(crate) fn decode_position(stored: i64) -> Result<LogPosition> {
	u64::try_from(stored)
		.map(LogPosition)
		.map_err(|_| Error::codec(format!("negative checkpoint position {}", stored)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_internal_rows_are_negative() {
		assert_eq!(encode_shard(ShardId(3), false).unwrap(), 3);
		assert_eq!(encode_shard(ShardId(3), true).unwrap(), -3);
		assert_eq!(encode_shard(ShardId(1), true).unwrap(), -1);
	}

	#[test]
	fn test_decode_inverts_encode() {
		for shard in [1u32, 2, 77] {
			for internal in [false, true] {
				let stored = encode_shard(ShardId(shard), internal).unwrap();
				assert_eq!(decode_shard(stored).unwrap(), (ShardId(shard), internal));
			}
		}
		assert!(decode_shard(0).is_err());
	}

	#[test]
	fn test_shard_id_overflow_is_rejected() {
		let max = i32::MAX as u32;
		assert_eq!(encode_shard(ShardId(max), true).unwrap(), -i32::MAX);
		assert!(matches!(encode_shard(ShardId(max + 1), false), Err(Error::Codec(_))));
		assert!(matches!(encode_shard(ShardId(u32::MAX), true), Err(Error::Codec(_))));
	}

	#[test]
	fn test_position_bounds() {
		assert_eq!(decode_position(50).unwrap(), LogPosition(50));
		assert!(decode_position(-1).is_err());
		assert!(encode_position(LogPosition(u64::MAX)).is_err());
	}
}
