// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{sync::Arc, time::Duration};

use shardstream_type::{LogPosition, Result};

use super::{FeedFilter, FilterChangeRequest, FilterChangeResponse, ShardInfo};
use crate::record::LogRecord;

/// Where a new connection starts reading a shard's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
	Earliest,
	/// Right after the last record currently in the log.
	Now,
	At(LogPosition),
}

/// Opens filtered log subscriptions against shard leaders.
pub trait LogTransport: Send + Sync {
	/// Opens a connection streaming the records `filter` passes.
	///
	/// Fails with `Error::InsufficientLog` when `start` is before the
	/// earliest retained record, `Error::Unauthorized` when the caller may
	/// not read the shard, and `Error::Link` when the leader is unreachable.
	fn open(&self, shard: &ShardInfo, start: StartPosition, filter: Arc<dyn FeedFilter>)
	-> Result<Box<dyn LogConnection>>;

	/// Earliest position the shard still retains.
	fn earliest_position(&self, shard: &ShardInfo) -> Result<LogPosition>;
}

/// An open log subscription, owned by one consumer thread.
pub trait LogConnection: Send {
	/// Position of the first record this connection will deliver.
	fn start_position(&self) -> LogPosition;

	/// Next record, or `None` when nothing arrived within `timeout`.
	fn recv(&mut self, timeout: Duration) -> Result<Option<LogRecord>>;

	/// Sends a filter change in-band and waits for the source's answer.
	fn change_filter(&mut self, request: FilterChangeRequest, timeout: Duration) -> Result<FilterChangeResponse>;

	fn close(&mut self);
}
