// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use shardstream_core::LogPosition;

/// Why a record did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
	/// Internal, duplicate-index or non-partition database.
	Database,
	/// Written in another region while only local writes are streamed.
	ForeignRegion,
	PartitionNotOwned,
	NoTableMatch,
	/// Commit or abort of a transaction that passed nothing.
	Boundary,
	NonData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStatistics {
	pub seen: u64,
	pub passed: u64,
	pub passed_bytes: u64,
	pub markers: u64,
	pub blocked_database: u64,
	pub blocked_region: u64,
	pub blocked_partition: u64,
	pub blocked_table: u64,
	pub blocked_boundary: u64,
	pub blocked_non_data: u64,
	pub last_passed: Option<LogPosition>,
}

impl FilterStatistics {
	pub(crate) fn record_block(&mut self, reason: BlockReason) {
		let counter = match reason {
			BlockReason::Database => &mut self.blocked_database,
			BlockReason::ForeignRegion => &mut self.blocked_region,
			BlockReason::PartitionNotOwned => &mut self.blocked_partition,
			BlockReason::NoTableMatch => &mut self.blocked_table,
			BlockReason::Boundary => &mut self.blocked_boundary,
			BlockReason::NonData => &mut self.blocked_non_data,
		};
		*counter += 1;
	}

	pub fn blocked(&self) -> u64 {
		self.blocked_database
			+ self.blocked_region
			+ self.blocked_partition
			+ self.blocked_table
			+ self.blocked_boundary
			+ self.blocked_non_data
	}
}
