// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	collections::BTreeMap,
	sync::{
		Arc,
		atomic::{AtomicU32, AtomicU64, Ordering},
	},
};

use parking_lot::RwLock;
use shardstream_core::{Error, Result, TableId, TableMetadata, interface::TableCatalog};

/// Table metadata kept in memory. Clones share the same tables.
#[derive(Clone)]
pub struct MemoryCatalog {
	inner: Arc<Inner>,
}

struct Inner {
	tables: RwLock<BTreeMap<TableId, TableMetadata>>,
	next_id: AtomicU64,
	/// Refresh calls failing with a transient error before succeeding.
	failing_refreshes: AtomicU32,
}

impl Default for MemoryCatalog {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryCatalog {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				tables: RwLock::new(BTreeMap::new()),
				next_id: AtomicU64::new(100),
				failing_refreshes: AtomicU32::new(0),
			}),
		}
	}

	fn next_id(&self) -> TableId {
		TableId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
	}

	pub fn create_table(&self, name: &str, key: &[&str], values: &[&str]) -> TableMetadata {
		let meta = TableMetadata::top_level(self.next_id(), name).with_key(key).with_values(values);
		self.inner.tables.write().insert(meta.id, meta.clone());
		meta
	}

	pub fn create_child(&self, parent: &TableMetadata, name: &str, key: &[&str], values: &[&str]) -> TableMetadata {
		let meta = TableMetadata::child_of(parent, self.next_id(), name).with_key(key).with_values(values);
		self.inner.tables.write().insert(meta.id, meta.clone());
		meta
	}

	/// Adds value columns and bumps the schema version.
	pub fn add_columns(&self, name: &str, columns: &[&str]) -> Result<TableMetadata> {
		let mut tables = self.inner.tables.write();
		let meta = tables
			.values_mut()
			.find(|t| t.name == name)
			.ok_or_else(|| Error::TableNotFound(name.to_string()))?;
		meta.value_columns.extend(columns.iter().map(|c| c.to_string()));
		meta.version += 1;
		Ok(meta.clone())
	}

	pub fn drop_table(&self, name: &str) -> Result<TableMetadata> {
		let mut tables = self.inner.tables.write();
		let id = tables
			.values()
			.find(|t| t.name == name)
			.map(|t| t.id)
			.ok_or_else(|| Error::TableNotFound(name.to_string()))?;
		tables.remove(&id).ok_or_else(|| Error::TableNotFound(name.to_string()))
	}

	pub fn fail_refreshes(&self, count: u32) {
		self.inner.failing_refreshes.store(count, Ordering::SeqCst);
	}
}

impl TableCatalog for MemoryCatalog {
	fn table(&self, name: &str) -> Result<Option<TableMetadata>> {
		Ok(self.inner.tables.read().values().find(|t| t.name == name).cloned())
	}

	fn tables(&self) -> Result<Vec<TableMetadata>> {
		Ok(self.inner.tables.read().values().cloned().collect())
	}

	fn refresh(&self, id: TableId) -> Result<Option<TableMetadata>> {
		let failing = self.inner.failing_refreshes.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
		if failing.is_ok() {
			return Err(Error::store("catalog unavailable"));
		}
		Ok(self.inner.tables.read().get(&id).cloned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_add_columns_bumps_version() {
		let catalog = MemoryCatalog::new();
		let users = catalog.create_table("users", &["id"], &["name"]);
		let altered = catalog.add_columns("users", &["email"]).unwrap();
		assert_eq!(altered.version, users.version + 1);
		assert_eq!(catalog.refresh(users.id).unwrap(), Some(altered));
	}

	#[test]
	fn test_failing_refreshes() {
		let catalog = MemoryCatalog::new();
		let users = catalog.create_table("users", &["id"], &[]);
		catalog.fail_refreshes(1);
		assert!(catalog.refresh(users.id).is_err());
		assert!(catalog.refresh(users.id).is_ok());
	}

	#[test]
	fn test_dropped_table_is_gone() {
		let catalog = MemoryCatalog::new();
		let users = catalog.create_table("users", &["id"], &[]);
		catalog.drop_table("users").unwrap();
		assert_eq!(catalog.refresh(users.id).unwrap(), None);
		assert_eq!(catalog.table("users").unwrap(), None);
	}
}
