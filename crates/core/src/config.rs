// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Subscription configuration.
//!
//! A [`SubscriptionConfig`] is built once, validated, and shared read-only
//! by every component of the subscription.

use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};
use shardstream_type::{Error, RegionId, Result, StreamPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMode {
	/// Start at the current end of every shard's log.
	FromNow,
	/// Resume after the stored checkpoint, falling back to the earliest
	/// retained position.
	FromCheckpoint,
	/// Resume after the stored checkpoint or fail.
	FromExactCheckpoint,
	/// Resume after the configured initial position, falling back to the
	/// earliest retained position.
	FromStreamPosition,
	/// Resume after the configured initial position or fail.
	FromExactStreamPosition,
}

impl StreamMode {
	pub fn is_exact(self) -> bool {
		matches!(self, StreamMode::FromExactCheckpoint | StreamMode::FromExactStreamPosition)
	}

	pub fn uses_checkpoint(self) -> bool {
		matches!(self, StreamMode::FromCheckpoint | StreamMode::FromExactCheckpoint)
	}

	pub fn uses_initial_position(self) -> bool {
		matches!(self, StreamMode::FromStreamPosition | StreamMode::FromExactStreamPosition)
	}
}

/// How often streaming statistics are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatReportInterval {
	Disabled,
	Operations(u64),
	Time(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
	/// Scope key of this subscription's checkpoint rows.
	pub subscription_name: String,
	pub stream_mode: StreamMode,
	pub initial_position: Option<StreamPosition>,
	/// Subscribed tables; `None` streams every table.
	pub tables: Option<BTreeSet<String>>,
	/// Tables whose committed writes are delivered as one transaction.
	pub transaction_tables: BTreeSet<String>,
	pub include_abort_transactions: bool,

	pub checkpoint_enabled: bool,
	pub checkpoint_table: String,
	pub checkpoint_interval: Option<Duration>,
	pub checkpoint_read_attempts: u32,
	pub checkpoint_retry_sleep: Duration,

	/// Byte cap of the delivery queue shared by all shards.
	pub max_queue_bytes: usize,
	pub shard_timeout: Duration,
	pub max_reconnect_attempts: u32,
	pub reconnect_backoff: Duration,
	pub stat_report_interval: StatReportInterval,

	pub local_writes_only: bool,
	pub local_region: Option<RegionId>,

	pub subscriber_index: u32,
	pub subscriber_count: u32,

	pub topology_poll_interval: Duration,
	pub migration_poll_interval: Duration,
	/// `None` waits for a partition's previous owner indefinitely.
	pub migration_timeout: Option<Duration>,
	pub change_pool_size: usize,
	pub change_timeout: Duration,
	pub blocked_database_cache: usize,
	pub shutdown_grace: Duration,
}

impl Default for SubscriptionConfig {
	fn default() -> Self {
		Self {
			subscription_name: "default".to_string(),
			stream_mode: StreamMode::FromNow,
			initial_position: None,
			tables: None,
			transaction_tables: BTreeSet::new(),
			include_abort_transactions: false,
			checkpoint_enabled: false,
			checkpoint_table: "stream_checkpoints".to_string(),
			checkpoint_interval: None,
			checkpoint_read_attempts: 5,
			checkpoint_retry_sleep: Duration::from_millis(200),
			max_queue_bytes: 16 * 1024 * 1024,
			shard_timeout: Duration::from_secs(30),
			max_reconnect_attempts: 10,
			reconnect_backoff: Duration::from_millis(500),
			stat_report_interval: StatReportInterval::Time(Duration::from_secs(60)),
			local_writes_only: false,
			local_region: None,
			subscriber_index: 0,
			subscriber_count: 1,
			topology_poll_interval: Duration::from_secs(5),
			migration_poll_interval: Duration::from_millis(100),
			migration_timeout: None,
			change_pool_size: 2,
			change_timeout: Duration::from_secs(10),
			blocked_database_cache: 1024,
			shutdown_grace: Duration::from_secs(5),
		}
	}
}

impl SubscriptionConfig {
	pub fn builder(subscription_name: impl Into<String>) -> SubscriptionConfigBuilder {
		SubscriptionConfigBuilder::new(subscription_name)
	}

	pub fn from_json(json: &str) -> Result<Self> {
		let config: SubscriptionConfig = serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn to_json(&self) -> Result<String> {
		serde_json::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
	}

	pub fn streams_all_tables(&self) -> bool {
		self.tables.is_none()
	}

	pub fn is_transactional(&self, table: &str) -> bool {
		self.transaction_tables.contains(table)
	}

	/// Whether this subscriber instance streams `shard`.
	pub fn assigned(&self, shard: u32) -> bool {
		shard % self.subscriber_count == self.subscriber_index
	}

	pub fn validate(&self) -> Result<()> {
		if self.subscription_name.is_empty() {
			return Err(Error::config("subscription name must not be empty"));
		}
		if self.subscriber_count == 0 {
			return Err(Error::config("subscriber count must be at least 1"));
		}
		if self.subscriber_index >= self.subscriber_count {
			return Err(Error::config(format!(
				"subscriber index {} out of range for {} subscribers",
				self.subscriber_index, self.subscriber_count
			)));
		}
		if self.max_queue_bytes == 0 {
			return Err(Error::config("queue byte cap must be positive"));
		}
		if self.change_pool_size == 0 {
			return Err(Error::config("change pool needs at least one worker"));
		}
		if self.checkpoint_read_attempts == 0 {
			return Err(Error::config("checkpoint read attempts must be at least 1"));
		}
		if self.stream_mode.uses_initial_position() && self.initial_position.is_none() {
			return Err(Error::config(format!("{:?} requires an initial position", self.stream_mode)));
		}
		if self.stream_mode.uses_checkpoint() && !self.checkpoint_enabled {
			return Err(Error::config(format!("{:?} requires checkpoints to be enabled", self.stream_mode)));
		}
		if self.checkpoint_enabled && self.checkpoint_table.is_empty() {
			return Err(Error::config("checkpoint table name must not be empty"));
		}
		if self.local_writes_only && self.local_region.is_none() {
			return Err(Error::config("local writes only requires a local region"));
		}
		if let Some(tables) = &self.tables {
			if let Some(table) = self.transaction_tables.iter().find(|t| !tables.contains(*t)) {
				return Err(Error::config(format!("transaction table {} is not subscribed", table)));
			}
		}
		if let StatReportInterval::Operations(0) = self.stat_report_interval {
			return Err(Error::config("stat report interval must be positive"));
		}
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfigBuilder {
	config: SubscriptionConfig,
}

impl SubscriptionConfigBuilder {
	pub fn new(subscription_name: impl Into<String>) -> Self {
		Self {
			config: SubscriptionConfig {
				subscription_name: subscription_name.into(),
				..SubscriptionConfig::default()
			},
		}
	}

	pub fn stream_mode(mut self, mode: StreamMode) -> Self {
		self.config.stream_mode = mode;
		self
	}

	pub fn initial_position(mut self, position: StreamPosition) -> Self {
		self.config.initial_position = Some(position);
		self
	}

	pub fn tables<I, S>(mut self, tables: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.tables = Some(tables.into_iter().map(Into::into).collect());
		self
	}

	pub fn all_tables(mut self) -> Self {
		self.config.tables = None;
		self
	}

	pub fn transaction_tables<I, S>(mut self, tables: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.transaction_tables = tables.into_iter().map(Into::into).collect();
		self
	}

	pub fn include_abort_transactions(mut self, include: bool) -> Self {
		self.config.include_abort_transactions = include;
		self
	}

	pub fn checkpoints(mut self, table: impl Into<String>) -> Self {
		self.config.checkpoint_enabled = true;
		self.config.checkpoint_table = table.into();
		self
	}

	pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
		self.config.checkpoint_interval = Some(interval);
		self
	}

	pub fn checkpoint_read_retry(mut self, attempts: u32, sleep: Duration) -> Self {
		self.config.checkpoint_read_attempts = attempts;
		self.config.checkpoint_retry_sleep = sleep;
		self
	}

	pub fn max_queue_bytes(mut self, bytes: usize) -> Self {
		self.config.max_queue_bytes = bytes;
		self
	}

	pub fn shard_timeout(mut self, timeout: Duration) -> Self {
		self.config.shard_timeout = timeout;
		self
	}

	pub fn reconnect(mut self, max_attempts: u32, backoff: Duration) -> Self {
		self.config.max_reconnect_attempts = max_attempts;
		self.config.reconnect_backoff = backoff;
		self
	}

	pub fn stat_report_interval(mut self, interval: StatReportInterval) -> Self {
		self.config.stat_report_interval = interval;
		self
	}

	pub fn local_writes_only(mut self, region: RegionId) -> Self {
		self.config.local_writes_only = true;
		self.config.local_region = Some(region);
		self
	}

	pub fn subscriber(mut self, index: u32, count: u32) -> Self {
		self.config.subscriber_index = index;
		self.config.subscriber_count = count;
		self
	}

	pub fn topology_poll_interval(mut self, interval: Duration) -> Self {
		self.config.topology_poll_interval = interval;
		self
	}

	pub fn migration(mut self, poll_interval: Duration, timeout: Option<Duration>) -> Self {
		self.config.migration_poll_interval = poll_interval;
		self.config.migration_timeout = timeout;
		self
	}

	pub fn change_pool(mut self, size: usize, timeout: Duration) -> Self {
		self.config.change_pool_size = size;
		self.config.change_timeout = timeout;
		self
	}

	pub fn shutdown_grace(mut self, grace: Duration) -> Self {
		self.config.shutdown_grace = grace;
		self
	}

	pub fn build(self) -> Result<SubscriptionConfig> {
		self.config.validate()?;
		Ok(self.config)
	}
}

#[cfg(test)]
mod tests {
	use shardstream_type::ShardId;

	use super::*;

	#[test]
	fn test_defaults_are_valid() {
		let config = SubscriptionConfig::builder("orders-feed").build().unwrap();
		assert_eq!(config.stream_mode, StreamMode::FromNow);
		assert!(config.streams_all_tables());
		assert!(!config.checkpoint_enabled);
	}

	#[test]
	fn test_checkpoint_mode_requires_checkpoints() {
		let err = SubscriptionConfig::builder("feed").stream_mode(StreamMode::FromCheckpoint).build().unwrap_err();
		assert!(matches!(err, Error::Config(_)));

		SubscriptionConfig::builder("feed")
			.stream_mode(StreamMode::FromCheckpoint)
			.checkpoints("cp")
			.build()
			.unwrap();
	}

	#[test]
	fn test_position_mode_requires_position() {
		assert!(
			SubscriptionConfig::builder("feed")
				.stream_mode(StreamMode::FromExactStreamPosition)
				.build()
				.is_err()
		);

		let position = StreamPosition::unset("kv", 1, [ShardId(1)]);
		SubscriptionConfig::builder("feed")
			.stream_mode(StreamMode::FromExactStreamPosition)
			.initial_position(position)
			.build()
			.unwrap();
	}

	#[test]
	fn test_subscriber_assignment() {
		assert!(SubscriptionConfig::builder("feed").subscriber(2, 2).build().is_err());

		let config = SubscriptionConfig::builder("feed").subscriber(1, 3).build().unwrap();
		assert!(config.assigned(1));
		assert!(config.assigned(4));
		assert!(!config.assigned(3));
	}

	#[test]
	fn test_transaction_tables_must_be_subscribed() {
		let err = SubscriptionConfig::builder("feed")
			.tables(["users"])
			.transaction_tables(["orders"])
			.build()
			.unwrap_err();
		assert_eq!(err, Error::Config("transaction table orders is not subscribed".into()));
	}

	#[test]
	fn test_json_fills_defaults_and_validates() {
		let config = SubscriptionConfig::from_json(
			r#"{"subscription_name":"feed","stream_mode":"FROM_CHECKPOINT","checkpoint_enabled":true}"#,
		)
		.unwrap();
		assert_eq!(config.stream_mode, StreamMode::FromCheckpoint);
		assert_eq!(config.checkpoint_table, "stream_checkpoints");

		assert!(SubscriptionConfig::from_json(r#"{"stream_mode":"FROM_CHECKPOINT"}"#).is_err());
	}
}
