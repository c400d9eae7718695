// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	collections::BTreeMap,
	sync::atomic::{AtomicU64, Ordering},
	time::{Duration, Instant},
};

use parking_lot::Mutex;
use shardstream_core::{LogPosition, ShardId, StatReportInterval, StreamOperation};
use shardstream_filter::FilterStatistics;
use tracing::info;

/// Point-in-time view of a subscription's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
	pub delivered: u64,
	pub puts: u64,
	pub deletes: u64,
	pub transactions: u64,
	pub aborted_transactions: u64,
	/// Commits pushed to the delivery queue, per shard.
	pub last_applied: BTreeMap<ShardId, LogPosition>,
	pub skipped_unsubscribed: u64,
	pub skipped_undecodable: u64,
	pub schema_refreshes: u64,
	pub reconnects: u64,
	pub active_shards: usize,
	pub queued_operations: usize,
	pub queued_bytes: usize,
	pub filters: BTreeMap<ShardId, FilterStatistics>,
}

#[derive(Default)]
pub(crate) struct StreamStatistics {
	delivered: AtomicU64,
	puts: AtomicU64,
	deletes: AtomicU64,
	transactions: AtomicU64,
	aborted: AtomicU64,
	skipped_unsubscribed: AtomicU64,
	skipped_undecodable: AtomicU64,
	schema_refreshes: AtomicU64,
	reconnects: AtomicU64,
	last_applied: Mutex<BTreeMap<ShardId, LogPosition>>,
}

impl StreamStatistics {
	pub fn delivered(&self, operation: &StreamOperation) {
		self.delivered.fetch_add(1, Ordering::Relaxed);
		let counter = match operation {
			StreamOperation::Put {
				..
			} => &self.puts,
			StreamOperation::Delete {
				..
			} => &self.deletes,
			StreamOperation::Transaction {
				..
			} if operation.is_aborted() => &self.aborted,
			StreamOperation::Transaction {
				..
			} => &self.transactions,
		};
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn applied(&self, shard: ShardId, position: LogPosition) {
		self.last_applied.lock().insert(shard, position);
	}

	pub fn skipped_unsubscribed(&self) {
		self.skipped_unsubscribed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn skipped_undecodable(&self) {
		self.skipped_undecodable.fetch_add(1, Ordering::Relaxed);
	}

	pub fn schema_refreshed(&self) {
		self.schema_refreshes.fetch_add(1, Ordering::Relaxed);
	}

	pub fn reconnected(&self) {
		self.reconnects.fetch_add(1, Ordering::Relaxed);
	}

	pub fn delivered_count(&self) -> u64 {
		self.delivered.load(Ordering::Relaxed)
	}

	pub fn snapshot(&self) -> Statistics {
		Statistics {
			delivered: self.delivered.load(Ordering::Relaxed),
			puts: self.puts.load(Ordering::Relaxed),
			deletes: self.deletes.load(Ordering::Relaxed),
			transactions: self.transactions.load(Ordering::Relaxed),
			aborted_transactions: self.aborted.load(Ordering::Relaxed),
			last_applied: self.last_applied.lock().clone(),
			skipped_unsubscribed: self.skipped_unsubscribed.load(Ordering::Relaxed),
			skipped_undecodable: self.skipped_undecodable.load(Ordering::Relaxed),
			schema_refreshes: self.schema_refreshes.load(Ordering::Relaxed),
			reconnects: self.reconnects.load(Ordering::Relaxed),
			..Statistics::default()
		}
	}
}

/// Decides when the subscription worker logs its statistics.
pub(crate) struct StatReporter {
	interval: StatReportInterval,
	last_report: Instant,
	last_delivered: u64,
}

impl StatReporter {
	pub fn new(interval: StatReportInterval) -> Self {
		Self {
			interval,
			last_report: Instant::now(),
			last_delivered: 0,
		}
	}

	pub fn due(&self, delivered: u64) -> bool {
		match self.interval {
			StatReportInterval::Disabled => false,
			StatReportInterval::Operations(n) => delivered >= self.last_delivered + n,
			StatReportInterval::Time(period) => self.last_report.elapsed() >= period.max(Duration::from_millis(1)),
		}
	}

	pub fn report(&mut self, subscription: &str, stats: &Statistics) {
		info!(
			subscription,
			delivered = stats.delivered,
			puts = stats.puts,
			deletes = stats.deletes,
			transactions = stats.transactions,
			aborted = stats.aborted_transactions,
			skipped_unsubscribed = stats.skipped_unsubscribed,
			skipped_undecodable = stats.skipped_undecodable,
			reconnects = stats.reconnects,
			shards = stats.active_shards,
			queued = stats.queued_operations,
			queued_bytes = stats.queued_bytes,
			"stream statistics"
		);
		self.last_report = Instant::now();
		self.last_delivered = stats.delivered;
	}
}
