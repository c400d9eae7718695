// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use shardstream_type::{Result, TableId};

use crate::row::TableMetadata;

/// Table-metadata catalog of the store. Must be safe to share between
/// threads.
pub trait TableCatalog: Send + Sync {
	fn table(&self, name: &str) -> Result<Option<TableMetadata>>;

	fn tables(&self) -> Result<Vec<TableMetadata>>;

	/// Fetches the current metadata of `id`; `None` when the table was
	/// dropped.
	fn refresh(&self, id: TableId) -> Result<Option<TableMetadata>>;
}
