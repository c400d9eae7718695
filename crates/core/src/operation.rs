// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Operations delivered to a subscriber.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use shardstream_type::{LogPosition, ShardId};

use crate::row::{FieldValue, Row};

/// Identifies one delivered operation.
///
/// All operations of one commit share the commit position and are told
/// apart by `index`. Only the last operation of a commit closes it: a
/// checkpoint taken before that would resume in the middle of the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceId {
	pub shard: ShardId,
	pub position: LogPosition,
	pub index: u32,
	pub closes_commit: bool,
}

impl SequenceId {
	pub fn new(shard: ShardId, position: LogPosition, index: u32, closes_commit: bool) -> Self {
		Self {
			shard,
			position,
			index,
			closes_commit,
		}
	}
}

impl PartialOrd for SequenceId {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for SequenceId {
	fn cmp(&self, other: &Self) -> Ordering {
		(self.shard, self.position, self.index).cmp(&(other.shard, other.position, other.index))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
	Commit,
	Abort,
}

/// A decoded write with the metadata of the log record it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
	pub row: Row,
	pub modified_at: i64,
	pub expires_at: Option<i64>,
	/// Values of the previous version, when the source shipped them.
	pub before: Option<Vec<(String, FieldValue)>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamOperation {
	Put {
		seq: SequenceId,
		change: RowChange,
	},
	Delete {
		seq: SequenceId,
		change: RowChange,
	},
	/// Writes of transaction-grouped tables, delivered as one unit.
	Transaction {
		seq: SequenceId,
		kind: TransactionKind,
		operations: Vec<StreamOperation>,
	},
}

impl StreamOperation {
	pub fn seq(&self) -> SequenceId {
		match self {
			StreamOperation::Put {
				seq,
				..
			}
			| StreamOperation::Delete {
				seq,
				..
			}
			| StreamOperation::Transaction {
				seq,
				..
			} => *seq,
		}
	}

	pub fn shard(&self) -> ShardId {
		self.seq().shard
	}

	/// Table of a single-row operation.
	pub fn table(&self) -> Option<&str> {
		match self {
			StreamOperation::Put {
				change,
				..
			}
			| StreamOperation::Delete {
				change,
				..
			} => Some(&change.row.table),
			StreamOperation::Transaction {
				..
			} => None,
		}
	}

	pub fn is_aborted(&self) -> bool {
		matches!(
			self,
			StreamOperation::Transaction {
				kind: TransactionKind::Abort,
				..
			}
		)
	}

	/// Number of row operations carried, one for a put or delete.
	pub fn row_count(&self) -> usize {
		match self {
			StreamOperation::Transaction {
				operations,
				..
			} => operations.len(),
			_ => 1,
		}
	}
}

#[cfg(test)]
mod tests {
	use shardstream_type::TableId;

	use super::*;

	fn change(table: &str) -> RowChange {
		RowChange {
			row: Row {
				table: table.to_string(),
				table_id: TableId(1),
				parent_path: vec![],
				key: vec![],
				values: vec![],
			},
			modified_at: 0,
			expires_at: None,
			before: None,
		}
	}

	#[test]
	fn test_sequence_order_ignores_commit_flag() {
		let a = SequenceId::new(ShardId(1), LogPosition(10), 0, false);
		let b = SequenceId::new(ShardId(1), LogPosition(10), 1, true);
		let c = SequenceId::new(ShardId(1), LogPosition(11), 0, true);
		assert!(a < b && b < c);
		assert_eq!(a.cmp(&SequenceId::new(ShardId(1), LogPosition(10), 0, true)), Ordering::Equal);
	}

	#[test]
	fn test_transaction_counts_rows() {
		let seq = SequenceId::new(ShardId(2), LogPosition(7), 0, true);
		let batch = StreamOperation::Transaction {
			seq,
			kind: TransactionKind::Abort,
			operations: vec![
				StreamOperation::Put {
					seq,
					change: change("orders"),
				},
				StreamOperation::Delete {
					seq,
					change: change("orders"),
				},
			],
		};
		assert_eq!(batch.row_count(), 2);
		assert!(batch.is_aborted());
		assert_eq!(batch.table(), None);
		assert_eq!(batch.shard(), ShardId(2));
	}
}
