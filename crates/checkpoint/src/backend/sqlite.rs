// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! SQLite checkpoint tables, so checkpoints survive a restart.

use std::{path::Path, sync::Arc};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use shardstream_core::{
	Error, Result,
	interface::{CheckpointBackend, CheckpointRow},
};
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct SqliteCheckpointBackend {
	conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointBackend {
	#[instrument(name = "checkpoint::sqlite::open", level = "info", skip(path), fields(path = %path.as_ref().display()))]
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let conn = Connection::open(path.as_ref()).map_err(store_error)?;
		conn.pragma_update(None, "journal_mode", "WAL").map_err(store_error)?;
		conn.pragma_update(None, "synchronous", "NORMAL").map_err(store_error)?;
		Ok(Self::from_connection(conn))
	}

	pub fn in_memory() -> Result<Self> {
		let conn = Connection::open_in_memory().map_err(store_error)?;
		Ok(Self::from_connection(conn))
	}

	fn from_connection(conn: Connection) -> Self {
		Self {
			conn: Arc::new(Mutex::new(conn)),
		}
	}
}

/// Table names are interpolated into statements, so only plain
/// identifiers are accepted.
fn checked_name(table: &str) -> Result<&str> {
	let valid = !table.is_empty()
		&& table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
		&& !table.starts_with(|c: char| c.is_ascii_digit());
	if valid {
		Ok(table)
	} else {
		Err(Error::config(format!("invalid checkpoint table name {:?}", table)))
	}
}

fn store_error(err: rusqlite::Error) -> Error {
	Error::store(err.to_string())
}

impl CheckpointBackend for SqliteCheckpointBackend {
	fn table_exists(&self, table: &str) -> Result<bool> {
		let table = checked_name(table)?;
		let conn = self.conn.lock();
		let found: Option<String> = conn
			.query_row("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1", params![table], |row| {
				row.get(0)
			})
			.optional()
			.map_err(store_error)?;
		Ok(found.is_some())
	}

	fn create_table(&self, table: &str) -> Result<()> {
		let table = checked_name(table)?;
		debug!(table, "creating checkpoint table");
		self.conn
			.lock()
			.execute_batch(&format!(
				"CREATE TABLE IF NOT EXISTS {table} (
					subscription TEXT NOT NULL,
					shard_id     INTEGER NOT NULL,
					position     INTEGER NOT NULL,
					timestamp    INTEGER NOT NULL,
					PRIMARY KEY (subscription, shard_id)
				);"
			))
			.map_err(store_error)
	}

	fn read(&self, table: &str, subscription: &str) -> Result<Vec<CheckpointRow>> {
		let table = checked_name(table)?;
		let conn = self.conn.lock();
		let mut stmt = match conn.prepare(&format!(
			"SELECT subscription, shard_id, position, timestamp FROM {table} WHERE subscription = ?1 ORDER BY shard_id"
		)) {
			Ok(stmt) => stmt,
			Err(err) if err.to_string().contains("no such table") => {
				return Err(Error::TableNotFound(table.to_string()));
			}
			Err(err) => return Err(store_error(err)),
		};

		let rows = stmt
			.query_map(params![subscription], |row| {
				Ok(CheckpointRow {
					subscription: row.get(0)?,
					shard_id: row.get(1)?,
					position: row.get(2)?,
					timestamp: row.get(3)?,
				})
			})
			.map_err(store_error)?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_error)
	}

	fn write(&self, table: &str, rows: &[CheckpointRow]) -> Result<()> {
		let table = checked_name(table)?;
		let mut conn = self.conn.lock();
		let tx = conn.transaction().map_err(store_error)?;
		{
			let mut stmt = match tx.prepare(&format!(
				"INSERT OR REPLACE INTO {table} (subscription, shard_id, position, timestamp) VALUES (?1, ?2, ?3, ?4)"
			)) {
				Ok(stmt) => stmt,
				Err(err) if err.to_string().contains("no such table") => {
					return Err(Error::TableNotFound(table.to_string()));
				}
				Err(err) => return Err(store_error(err)),
			};
			for row in rows {
				stmt.execute(params![row.subscription, row.shard_id, row.position, row.timestamp])
					.map_err(store_error)?;
			}
		}
		tx.commit().map_err(store_error)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn row(shard_id: i32, position: i64) -> CheckpointRow {
		CheckpointRow {
			subscription: "feed".to_string(),
			shard_id,
			position,
			timestamp: 1_700_000_000_000,
		}
	}

	#[test]
	fn test_create_write_read() {
		let backend = SqliteCheckpointBackend::in_memory().unwrap();
		assert!(!backend.table_exists("cp").unwrap());
		backend.create_table("cp").unwrap();
		assert!(backend.table_exists("cp").unwrap());

		backend.write("cp", &[row(1, 10), row(-1, 4)]).unwrap();
		backend.write("cp", &[row(1, 12)]).unwrap();

		let rows = backend.read("cp", "feed").unwrap();
		assert_eq!(rows, vec![row(-1, 4), row(1, 12)]);
		assert!(backend.read("cp", "other").unwrap().is_empty());
	}

	#[test]
	fn test_missing_table_is_reported() {
		let backend = SqliteCheckpointBackend::in_memory().unwrap();
		assert_eq!(backend.read("cp", "feed"), Err(Error::TableNotFound("cp".into())));
	}

	#[test]
	fn test_rejects_unsafe_names() {
		let backend = SqliteCheckpointBackend::in_memory().unwrap();
		assert!(matches!(backend.create_table("cp; DROP TABLE x"), Err(Error::Config(_))));
		assert!(backend.create_table("1cp").is_err());
	}
}
