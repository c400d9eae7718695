// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	collections::{BTreeMap, HashMap},
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
	},
	thread,
	time::Duration,
};

use parking_lot::RwLock;
use shardstream_core::{
	Error, Result,
	interface::{CheckpointBackend, CheckpointRow},
};

type Table = BTreeMap<(String, i32), CheckpointRow>;

/// Checkpoint tables kept in memory.
///
/// Clones share the same tables. Failures can be injected to exercise the
/// retry paths of the checkpoint store.
#[derive(Clone, Default)]
pub struct MemoryCheckpointBackend {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	tables: RwLock<HashMap<String, Table>>,
	missing_reads: AtomicU32,
	fail_writes: AtomicBool,
	write_delay_ms: AtomicU64,
}

impl MemoryCheckpointBackend {
	pub fn new() -> Self {
		Self::default()
	}

	/// The next `count` reads report the table as missing.
	pub fn hide_table_for(&self, count: u32) {
		self.inner.missing_reads.store(count, Ordering::SeqCst);
	}

	pub fn fail_writes(&self, fail: bool) {
		self.inner.fail_writes.store(fail, Ordering::SeqCst);
	}

	/// Makes every write take `delay` before it lands.
	pub fn delay_writes(&self, delay: Duration) {
		self.inner.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
	}

	/// Every row of `table`, in `(subscription, shard_id)` order.
	pub fn rows(&self, table: &str) -> Vec<CheckpointRow> {
		self.inner.tables.read().get(table).map(|t| t.values().cloned().collect()).unwrap_or_default()
	}

	fn take_missing_read(&self) -> bool {
		self.inner
			.missing_reads
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
	}
}

impl CheckpointBackend for MemoryCheckpointBackend {
	fn table_exists(&self, table: &str) -> Result<bool> {
		Ok(self.inner.tables.read().contains_key(table))
	}

	fn create_table(&self, table: &str) -> Result<()> {
		self.inner.tables.write().entry(table.to_string()).or_default();
		Ok(())
	}

	fn read(&self, table: &str, subscription: &str) -> Result<Vec<CheckpointRow>> {
		if self.take_missing_read() {
			return Err(Error::TableNotFound(table.to_string()));
		}
		let tables = self.inner.tables.read();
		let rows = tables.get(table).ok_or_else(|| Error::TableNotFound(table.to_string()))?;
		Ok(rows.values().filter(|row| row.subscription == subscription).cloned().collect())
	}

	fn write(&self, table: &str, rows: &[CheckpointRow]) -> Result<()> {
		if self.inner.fail_writes.load(Ordering::SeqCst) {
			return Err(Error::store("injected write failure"));
		}
		let delay = self.inner.write_delay_ms.load(Ordering::SeqCst);
		if delay > 0 {
			thread::sleep(Duration::from_millis(delay));
		}
		let mut tables = self.inner.tables.write();
		let stored = tables.get_mut(table).ok_or_else(|| Error::TableNotFound(table.to_string()))?;
		for row in rows {
			stored.insert((row.subscription.clone(), row.shard_id), row.clone());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn row(subscription: &str, shard_id: i32, position: i64) -> CheckpointRow {
		CheckpointRow {
			subscription: subscription.to_string(),
			shard_id,
			position,
			timestamp: 0,
		}
	}

	#[test]
	fn test_write_overwrites_by_primary_key() {
		let backend = MemoryCheckpointBackend::new();
		backend.create_table("cp").unwrap();
		backend.write("cp", &[row("a", 1, 10), row("a", -1, 5), row("b", 1, 7)]).unwrap();
		backend.write("cp", &[row("a", 1, 20)]).unwrap();

		let rows = backend.read("cp", "a").unwrap();
		assert_eq!(rows.len(), 2);
		assert!(rows.contains(&row("a", 1, 20)));
		assert!(rows.contains(&row("a", -1, 5)));
	}

	#[test]
	fn test_missing_table() {
		let backend = MemoryCheckpointBackend::new();
		assert_eq!(backend.read("cp", "a"), Err(Error::TableNotFound("cp".into())));
		assert!(backend.write("cp", &[row("a", 1, 1)]).is_err());
	}

	#[test]
	fn test_hidden_table_recovers() {
		let backend = MemoryCheckpointBackend::new();
		backend.create_table("cp").unwrap();
		backend.hide_table_for(1);
		assert!(backend.read("cp", "a").is_err());
		assert!(backend.read("cp", "a").unwrap().is_empty());
	}
}
