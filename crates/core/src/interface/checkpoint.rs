// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use serde::{Deserialize, Serialize};
use shardstream_type::Result;

/// One row of a checkpoint table, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRow {
	pub subscription: String,
	/// Negative for internal migration rows.
	pub shard_id: i32,
	pub position: i64,
	/// Write time in milliseconds since the unix epoch.
	pub timestamp: i64,
}

/// Storage of checkpoint tables. Rows are keyed by
/// `(subscription, shard_id)`.
pub trait CheckpointBackend: Send + Sync {
	fn table_exists(&self, table: &str) -> Result<bool>;

	fn create_table(&self, table: &str) -> Result<()>;

	/// Every row of `subscription`. Fails with `Error::TableNotFound` when
	/// the table does not exist.
	fn read(&self, table: &str, subscription: &str) -> Result<Vec<CheckpointRow>>;

	/// Inserts or overwrites all `rows` in one atomic batch.
	fn write(&self, table: &str, rows: &[CheckpointRow]) -> Result<()>;
}
