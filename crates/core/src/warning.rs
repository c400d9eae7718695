// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	fmt::{self, Display, Formatter},
	time::Duration,
};

use shardstream_type::{LogPosition, ShardId};

/// Non-fatal conditions surfaced through `on_warn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamWarning {
	/// No message arrived from a shard within the configured timeout.
	ShardTimeout {
		shard: ShardId,
		idle: Duration,
	},
	/// The requested start position was no longer retained; streaming
	/// resumed from the earliest retained position instead.
	LogFallback {
		shard: ShardId,
		requested: LogPosition,
		earliest: LogPosition,
	},
	Reconnecting {
		shard: ShardId,
		attempt: u32,
		reason: String,
	},
	TableDropped {
		table: String,
	},
	/// A committed record could not be decoded and was skipped.
	UndecodableRecord {
		shard: ShardId,
		position: LogPosition,
		reason: String,
	},
	InvalidDemand(i64),
	CheckpointFailed(String),
}

impl Display for StreamWarning {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			StreamWarning::ShardTimeout {
				shard,
				idle,
			} => write!(f, "no message from shard {} for {:?}", shard, idle),
			StreamWarning::LogFallback {
				shard,
				requested,
				earliest,
			} => write!(
				f,
				"shard {} no longer retains position {}, streaming from earliest retained position {}",
				shard, requested, earliest
			),
			StreamWarning::Reconnecting {
				shard,
				attempt,
				reason,
			} => write!(f, "reconnecting to shard {} (attempt {}): {}", shard, attempt, reason),
			StreamWarning::TableDropped {
				table,
			} => write!(f, "table {} was dropped", table),
			StreamWarning::UndecodableRecord {
				shard,
				position,
				reason,
			} => write!(f, "skipped record {} of shard {}: {}", position, shard, reason),
			StreamWarning::InvalidDemand(n) => write!(f, "ignored request for {} operations", n),
			StreamWarning::CheckpointFailed(msg) => write!(f, "checkpoint failed: {}", msg),
		}
	}
}
