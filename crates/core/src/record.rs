// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use serde::{Deserialize, Serialize};
use shardstream_type::{DatabaseId, LogPosition, RegionId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
	Put,
	Delete,
	Commit,
	Abort,
	/// Trace, heartbeat and every other non-data entry of the log.
	Other,
}

impl RecordKind {
	#[inline]
	pub fn is_data(self) -> bool {
		matches!(self, RecordKind::Put | RecordKind::Delete)
	}

	#[inline]
	pub fn is_boundary(self) -> bool {
		matches!(self, RecordKind::Commit | RecordKind::Abort)
	}
}

/// Prior version of a row, shipped with the record when the source keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeforeImage {
	pub value: Option<Vec<u8>>,
	pub modified_at: i64,
	pub expires_at: Option<i64>,
}

/// One entry of a shard's replicated commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
	pub kind: RecordKind,
	pub position: LogPosition,
	pub database: DatabaseId,
	pub txn: TxnId,
	pub key: Vec<u8>,
	pub value: Option<Vec<u8>>,
	pub modified_at: i64,
	pub expires_at: Option<i64>,
	pub before: Option<BeforeImage>,
	pub region: Option<RegionId>,
}

impl LogRecord {
	pub fn put(position: LogPosition, database: DatabaseId, txn: TxnId, key: Vec<u8>, value: Vec<u8>) -> Self {
		Self {
			kind: RecordKind::Put,
			position,
			database,
			txn,
			key,
			value: Some(value),
			modified_at: 0,
			expires_at: None,
			before: None,
			region: None,
		}
	}

	pub fn delete(position: LogPosition, database: DatabaseId, txn: TxnId, key: Vec<u8>) -> Self {
		Self {
			kind: RecordKind::Delete,
			position,
			database,
			txn,
			key,
			value: None,
			modified_at: 0,
			expires_at: None,
			before: None,
			region: None,
		}
	}

	pub fn commit(position: LogPosition, txn: TxnId) -> Self {
		Self::boundary(RecordKind::Commit, position, txn)
	}

	pub fn abort(position: LogPosition, txn: TxnId) -> Self {
		Self::boundary(RecordKind::Abort, position, txn)
	}

	pub fn other(position: LogPosition) -> Self {
		Self::boundary(RecordKind::Other, position, TxnId(0))
	}

	fn boundary(kind: RecordKind, position: LogPosition, txn: TxnId) -> Self {
		Self {
			kind,
			position,
			database: DatabaseId(0),
			txn,
			key: Vec::new(),
			value: None,
			modified_at: 0,
			expires_at: None,
			before: None,
			region: None,
		}
	}

	pub fn with_modified_at(mut self, modified_at: i64) -> Self {
		self.modified_at = modified_at;
		self
	}

	pub fn with_expires_at(mut self, expires_at: i64) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	pub fn with_before(mut self, before: BeforeImage) -> Self {
		self.before = Some(before);
		self
	}

	pub fn with_region(mut self, region: RegionId) -> Self {
		self.region = Some(region);
		self
	}

	/// Approximate in-memory footprint, used for queue accounting.
	pub fn size_bytes(&self) -> usize {
		let before = self.before.as_ref().map(|b| b.value.as_ref().map_or(0, Vec::len) + 24).unwrap_or(0);
		64 + self.key.len() + self.value.as_ref().map_or(0, Vec::len) + before
	}
}
