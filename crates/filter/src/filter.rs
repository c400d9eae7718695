// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	collections::{BTreeMap, HashSet},
	sync::Arc,
};

use parking_lot::Mutex;
use shardstream_core::{
	LogPosition, LogRecord, PartitionGeneration, PartitionOwnership, RecordKind, RegionId, ShardId, TableId,
	TableMetadata, TxnId,
	interface::{
		DatabaseDirectory, DatabaseKind, FeedFilter, FilterChangeRequest, FilterChangeResponse, FilterChangeStatus,
	},
};
use tracing::{debug, trace, warn};

use crate::{
	blocked::BlockedDatabases,
	match_key::MatchKey,
	stats::{BlockReason, FilterStatistics},
};

const DEFAULT_BLOCKED_CACHE: usize = 1024;

/// Tables whose records pass the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSet {
	/// Every table passes; the set cannot be changed.
	Wildcard,
	Tables(BTreeMap<TableId, MatchKey>),
}

impl TableSet {
	pub fn of<'a>(tables: impl IntoIterator<Item = &'a TableMetadata>) -> Self {
		TableSet::Tables(tables.into_iter().map(|t| (t.id, MatchKey::for_table(t))).collect())
	}

	pub fn matches(&self, key: &[u8]) -> bool {
		match self {
			TableSet::Wildcard => true,
			TableSet::Tables(tables) => tables.values().any(|m| m.matches(key)),
		}
	}
}

struct FilterState {
	tables: TableSet,
	blocked: BlockedDatabases,
	open_txns: HashSet<TxnId>,
	stats: FilterStatistics,
}

enum Verdict {
	Pass,
	Marker,
	Block(BlockReason),
}

/// The predicate of one shard's feed.
///
/// Record evaluation and table changes share one lock, so a change takes
/// effect exactly between two records.
pub struct SourceFilter {
	shard: ShardId,
	directory: Arc<dyn DatabaseDirectory>,
	ownership: PartitionOwnership,
	local_region: Option<RegionId>,
	state: Mutex<FilterState>,
}

impl SourceFilter {
	pub fn new(
		shard: ShardId,
		tables: TableSet,
		directory: Arc<dyn DatabaseDirectory>,
		ownership: PartitionOwnership,
	) -> Self {
		Self {
			shard,
			directory,
			ownership,
			local_region: None,
			state: Mutex::new(FilterState {
				tables,
				blocked: BlockedDatabases::new(DEFAULT_BLOCKED_CACHE),
				open_txns: HashSet::new(),
				stats: FilterStatistics::default(),
			}),
		}
	}

	/// Only pass writes that originated in `region`.
	pub fn with_local_region(mut self, region: RegionId) -> Self {
		self.local_region = Some(region);
		self
	}

	pub fn with_blocked_cache(self, capacity: usize) -> Self {
		self.state.lock().blocked = BlockedDatabases::new(capacity);
		self
	}

	pub fn shard(&self) -> ShardId {
		self.shard
	}

	pub fn ownership(&self) -> &PartitionOwnership {
		&self.ownership
	}

	pub fn statistics(&self) -> FilterStatistics {
		self.state.lock().stats.clone()
	}

	pub fn tables(&self) -> TableSet {
		self.state.lock().tables.clone()
	}

	fn classify(&self, state: &mut FilterState, record: &LogRecord) -> Verdict {
		match record.kind {
			RecordKind::Put | RecordKind::Delete => self.classify_data(state, record),
			RecordKind::Commit | RecordKind::Abort => {
				if state.open_txns.remove(&record.txn) {
					Verdict::Pass
				} else {
					Verdict::Block(BlockReason::Boundary)
				}
			}
			RecordKind::Other => Verdict::Block(BlockReason::NonData),
		}
	}

	fn classify_data(&self, state: &mut FilterState, record: &LogRecord) -> Verdict {
		if state.blocked.contains(record.database) {
			return Verdict::Block(BlockReason::Database);
		}

		let partition = match self.directory.resolve(record.database) {
			DatabaseKind::MigrationMarkers => return Verdict::Marker,
			DatabaseKind::Partition(partition) => partition,
			kind => {
				debug_assert!(kind.is_blocked());
				state.blocked.insert(record.database);
				return Verdict::Block(BlockReason::Database);
			}
		};

		if let (Some(local), Some(origin)) = (self.local_region, record.region) {
			if local != origin {
				return Verdict::Block(BlockReason::ForeignRegion);
			}
		}

		if !self.ownership.owns(partition) {
			return Verdict::Block(BlockReason::PartitionNotOwned);
		}

		if !state.tables.matches(&record.key) {
			return Verdict::Block(BlockReason::NoTableMatch);
		}

		state.open_txns.insert(record.txn);
		Verdict::Pass
	}

	/// The source sees generation markers before any record of the new
	/// generation, so it tracks ownership ahead of the delivery side.
	fn observe_marker(&self, record: &LogRecord) {
		let Some(value) = record.value.as_deref() else {
			return;
		};
		match PartitionGeneration::decode(value) {
			Ok(generation) if generation.is_open() => self.ownership.open(generation.partition),
			Ok(generation) => self.ownership.close(generation.partition),
			Err(err) => warn!(shard = %self.shard, position = %record.position, "unreadable generation marker: {}", err),
		}
	}
}

impl FeedFilter for SourceFilter {
	fn evaluate(&self, record: &LogRecord) -> bool {
		let mut state = self.state.lock();
		state.stats.seen += 1;

		match self.classify(&mut state, record) {
			Verdict::Block(reason) => {
				trace!(shard = %self.shard, position = %record.position, ?reason, "blocked record");
				state.stats.record_block(reason);
				false
			}
			verdict => {
				if let Verdict::Marker = verdict {
					state.stats.markers += 1;
					self.observe_marker(record);
				}
				state.stats.passed += 1;
				state.stats.passed_bytes += record.size_bytes() as u64;
				state.stats.last_passed = Some(record.position);
				true
			}
		}
	}

	fn apply_change(&self, request: &FilterChangeRequest) -> FilterChangeResponse {
		let mut state = self.state.lock();
		let request_id = request.request_id();

		let TableSet::Tables(tables) = &mut state.tables else {
			return FilterChangeResponse::new(
				request_id,
				FilterChangeStatus::Fail,
				"a filter passing all tables cannot be changed",
			);
		};

		let applied = match request {
			FilterChangeRequest::Add {
				table_name,
				root_table_id,
				table_id,
				key_count,
				skip_count,
				..
			} => {
				if tables.contains_key(table_id) {
					Err(format!("table {} is already in the filter", table_name))
				} else {
					tables.insert(*table_id, MatchKey::new(*root_table_id, *table_id, *key_count, *skip_count));
					Ok(())
				}
			}
			FilterChangeRequest::Remove {
				table_name,
				table_id,
				..
			} => {
				if tables.remove(table_id).is_some() {
					Ok(())
				} else {
					Err(format!("table {} is not in the filter", table_name))
				}
			}
		};

		match applied {
			Ok(()) => {
				debug!(shard = %self.shard, table = request.table_name(), "filter changed");
				let response = FilterChangeResponse::new(request_id, FilterChangeStatus::Ok, "");
				match state.stats.last_passed {
					Some(position) => response.with_effective_position(position.next()),
					None => response,
				}
			}
			Err(message) => FilterChangeResponse::new(request_id, FilterChangeStatus::NotApplicable, message),
		}
	}

	fn reset_stream(&self) {
		let mut state = self.state.lock();
		state.open_txns.clear();
		state.stats.last_passed = None;
	}
}

impl SourceFilter {
	/// Position right after the last record that passed.
	pub fn effective_position(&self) -> Option<LogPosition> {
		self.state.lock().stats.last_passed.map(LogPosition::next)
	}
}

#[cfg(test)]
mod tests {
	use shardstream_core::{DatabaseId, Generation, PartitionId, key::KeyBuilder};

	use super::*;

	const MARKERS: DatabaseId = DatabaseId(90);
	const INTERNAL: DatabaseId = DatabaseId(91);

	struct Directory;

	impl DatabaseDirectory for Directory {
		fn resolve(&self, database: DatabaseId) -> DatabaseKind {
			match database {
				MARKERS => DatabaseKind::MigrationMarkers,
				INTERNAL => DatabaseKind::Internal,
				DatabaseId(n) if n < 10 => DatabaseKind::Partition(PartitionId(n)),
				_ => DatabaseKind::DuplicateIndex,
			}
		}
	}

	fn users() -> TableMetadata {
		TableMetadata::top_level(TableId(10), "users").with_key(&["id"])
	}

	fn orders() -> TableMetadata {
		TableMetadata::top_level(TableId(20), "orders").with_key(&["id"])
	}

	fn filter(tables: TableSet, ownership: PartitionOwnership) -> SourceFilter {
		SourceFilter::new(ShardId(1), tables, Arc::new(Directory), ownership)
	}

	fn put(position: u64, db: u32, txn: u64, table: &TableMetadata, id: &str) -> LogRecord {
		let key = table.key::<&[u8], _>(&[], &[id]);
		LogRecord::put(LogPosition(position), DatabaseId(db), TxnId(txn), key, vec![0, 0, 0, 1, 0])
	}

	#[test]
	fn test_data_from_subscribed_table_passes_with_its_commit() {
		let filter = filter(TableSet::of([&users()]), PartitionOwnership::all(8));

		assert!(filter.evaluate(&put(1, 1, 7, &users(), "u1")));
		assert!(filter.evaluate(&LogRecord::commit(LogPosition(2), TxnId(7))));
		assert!(!filter.evaluate(&LogRecord::commit(LogPosition(3), TxnId(7))));
	}

	#[test]
	fn test_boundary_of_blocked_transaction_is_blocked() {
		let filter = filter(TableSet::of([&users()]), PartitionOwnership::all(8));

		assert!(!filter.evaluate(&put(1, 1, 7, &orders(), "o1")));
		assert!(!filter.evaluate(&LogRecord::abort(LogPosition(2), TxnId(7))));
		let stats = filter.statistics();
		assert_eq!(stats.blocked_table, 1);
		assert_eq!(stats.blocked_boundary, 1);
	}

	#[test]
	fn test_internal_databases_are_cached_as_blocked() {
		let filter = filter(TableSet::Wildcard, PartitionOwnership::all(8));

		assert!(!filter.evaluate(&put(1, INTERNAL.0, 1, &users(), "u1")));
		assert!(!filter.evaluate(&put(2, 50, 1, &users(), "u1")));
		assert!(!filter.evaluate(&put(3, INTERNAL.0, 1, &users(), "u1")));
		assert_eq!(filter.statistics().blocked_database, 3);
	}

	#[test]
	fn test_unowned_partition_is_blocked() {
		let ownership = PartitionOwnership::only(8, [PartitionId(2)].into_iter().collect());
		let filter = filter(TableSet::Wildcard, ownership);

		assert!(!filter.evaluate(&put(1, 1, 1, &users(), "u1")));
		assert!(filter.evaluate(&put(2, 2, 1, &users(), "u1")));
		assert_eq!(filter.statistics().blocked_partition, 1);
	}

	#[test]
	fn test_non_data_records_are_blocked() {
		let filter = filter(TableSet::Wildcard, PartitionOwnership::all(8));
		assert!(!filter.evaluate(&LogRecord::other(LogPosition(1))));
	}

	#[test]
	fn test_markers_pass_and_update_ownership() {
		let ownership = PartitionOwnership::none(8);
		let filter = filter(TableSet::of([&users()]), ownership.clone());

		let marker = PartitionGeneration::open(PartitionId(3), Generation(1), None);
		let record =
			LogRecord::put(LogPosition(5), MARKERS, TxnId(1), marker.marker_key(), marker.encode().unwrap());
		assert!(filter.evaluate(&record));
		assert!(ownership.owns(PartitionId(3)));
		assert_eq!(filter.statistics().markers, 1);
	}

	#[test]
	fn test_foreign_region_is_blocked() {
		let filter = filter(TableSet::Wildcard, PartitionOwnership::all(8)).with_local_region(RegionId(1));

		assert!(filter.evaluate(&put(1, 1, 1, &users(), "u1").with_region(RegionId(1))));
		assert!(!filter.evaluate(&put(2, 1, 2, &users(), "u1").with_region(RegionId(2))));
		assert_eq!(filter.statistics().blocked_region, 1);
	}

	#[test]
	fn test_add_and_remove_tables() {
		let filter = filter(TableSet::of([&users()]), PartitionOwnership::all(8));
		assert!(filter.evaluate(&put(41, 1, 1, &users(), "u1")));

		let response = filter.apply_change(&FilterChangeRequest::add(&orders()));
		assert_eq!(response.status, FilterChangeStatus::Ok);
		assert_eq!(response.effective_position, Some(LogPosition(42)));
		assert!(filter.evaluate(&put(42, 1, 2, &orders(), "o1")));

		let again = filter.apply_change(&FilterChangeRequest::add(&orders()));
		assert_eq!(again.status, FilterChangeStatus::NotApplicable);

		let removed = filter.apply_change(&FilterChangeRequest::remove(&users()));
		assert!(removed.is_ok());
		assert!(!filter.evaluate(&put(43, 1, 3, &users(), "u2")));

		let missing = filter.apply_change(&FilterChangeRequest::remove(&users()));
		assert_eq!(missing.status, FilterChangeStatus::NotApplicable);
	}

	#[test]
	fn test_wildcard_rejects_changes() {
		let filter = filter(TableSet::Wildcard, PartitionOwnership::all(8));
		let response = filter.apply_change(&FilterChangeRequest::add(&orders()));
		assert_eq!(response.status, FilterChangeStatus::Fail);
	}

	#[test]
	fn test_reset_forgets_open_transactions() {
		let filter = filter(TableSet::Wildcard, PartitionOwnership::all(8));
		assert!(filter.evaluate(&put(1, 1, 9, &users(), "u1")));

		filter.reset_stream();
		assert_eq!(filter.effective_position(), None);
		assert!(!filter.evaluate(&LogRecord::commit(LogPosition(2), TxnId(9))));
	}

	#[test]
	fn test_child_key_does_not_pass_parent_filter() {
		let parent = users();
		let child = TableMetadata::child_of(&parent, TableId(11), "users.emails").with_key(&["seq"]);
		let filter = filter(TableSet::of([&parent]), PartitionOwnership::all(8));

		let key = child.key(&["u1"], &["1"]);
		let record = LogRecord::put(LogPosition(1), DatabaseId(1), TxnId(1), key, vec![]);
		assert!(!filter.evaluate(&record));

		let raw = KeyBuilder::new().component("10").component("u2").build();
		assert!(filter.evaluate(&LogRecord::delete(LogPosition(2), DatabaseId(1), TxnId(2), raw)));
	}
}
