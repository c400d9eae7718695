// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{collections::BTreeSet, sync::Arc};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use shardstream_checkpoint::CheckpointStore;
use shardstream_core::{
	CancellationToken, Error, Result, StreamPosition, StreamWarning, SubscriptionConfig,
	interface::{CheckpointBackend, DatabaseDirectory, LogTransport, TableCatalog, Topology},
};
use tracing::{error, warn};

use crate::{queue::DeliveryQueue, stats::StreamStatistics, tables::TableCache};

/// The store-facing services a subscription runs against.
#[derive(Clone)]
pub struct StreamSources {
	pub transport: Arc<dyn LogTransport>,
	pub topology: Arc<dyn Topology>,
	pub catalog: Arc<dyn TableCatalog>,
	pub directory: Arc<dyn DatabaseDirectory>,
	pub checkpoints: Arc<dyn CheckpointBackend>,
}

/// Notifications for the subscription worker, which owns every callback.
#[derive(Debug)]
pub(crate) enum Event {
	Wake,
	Warn(StreamWarning),
	ChangeResult {
		table: String,
		result: Result<()>,
	},
	CheckpointComplete(Result<StreamPosition>),
}

#[derive(Default)]
struct TableSubscription {
	/// `None` streams every table.
	tables: Option<BTreeSet<String>>,
	/// Tables whose filter change is in flight.
	adding: BTreeSet<String>,
}

/// State shared by the threads of one subscription.
pub(crate) struct StreamContext {
	pub config: SubscriptionConfig,
	pub sources: StreamSources,
	pub cancel: CancellationToken,
	pub queue: DeliveryQueue,
	pub checkpoints: Arc<CheckpointStore>,
	pub tables: TableCache,
	pub stats: StreamStatistics,
	pub store_name: String,
	pub store_id: u64,
	subscription: RwLock<TableSubscription>,
	delivered: Mutex<StreamPosition>,
	failure: Mutex<Option<Error>>,
	events: Sender<Event>,
}

impl StreamContext {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: SubscriptionConfig,
		sources: StreamSources,
		cancel: CancellationToken,
		checkpoints: Arc<CheckpointStore>,
		tables: TableCache,
		delivered: StreamPosition,
		events: Sender<Event>,
	) -> Self {
		let queue = DeliveryQueue::new(config.max_queue_bytes, cancel.clone());
		Self {
			subscription: RwLock::new(TableSubscription {
				tables: config.tables.clone(),
				adding: BTreeSet::new(),
			}),
			store_name: delivered.store_name().to_string(),
			store_id: delivered.store_id(),
			config,
			sources,
			cancel,
			queue,
			checkpoints,
			tables,
			stats: StreamStatistics::default(),
			delivered: Mutex::new(delivered),
			failure: Mutex::new(None),
			events,
		}
	}

	/// Terminates the subscription with `err`. Only the first failure is
	/// kept; cancellation is not a failure.
	pub fn fail(&self, err: Error) {
		if err == Error::Canceled {
			return;
		}
		{
			let mut failure = self.failure.lock();
			if failure.is_some() || self.cancel.is_cancelled() {
				warn!(subscription = %self.config.subscription_name, "ignoring error after termination: {}", err);
				return;
			}
			error!(subscription = %self.config.subscription_name, "subscription failed: {}", err);
			*failure = Some(err);
		}
		self.cancel.cancel();
		self.notify(Event::Wake);
	}

	pub fn failure(&self) -> Option<Error> {
		self.failure.lock().clone()
	}

	pub fn warn(&self, warning: StreamWarning) {
		warn!(subscription = %self.config.subscription_name, "{}", warning);
		self.notify(Event::Warn(warning));
	}

	pub fn notify(&self, event: Event) {
		// the worker is gone once the subscription terminated
		let _ = self.events.send(event);
	}

	pub fn subscribed_tables(&self) -> Option<BTreeSet<String>> {
		self.subscription.read().tables.clone()
	}

	/// Whether operations of `table` may still be delivered. Tables being
	/// added count as subscribed so nothing after their filter change is lost.
	pub fn is_deliverable(&self, table: &str) -> bool {
		let subscription = self.subscription.read();
		match &subscription.tables {
			None => true,
			Some(tables) => tables.contains(table) || subscription.adding.contains(table),
		}
	}

	pub fn begin_add(&self, table: &str) -> Result<()> {
		let mut subscription = self.subscription.write();
		let Some(tables) = &subscription.tables else {
			return Err(Error::ChangeRejected("subscription streams every table".into()));
		};
		if tables.contains(table) || subscription.adding.contains(table) {
			return Err(Error::ChangeRejected(format!("table {} is already subscribed", table)));
		}
		subscription.adding.insert(table.to_string());
		Ok(())
	}

	pub fn finish_add(&self, table: &str, applied: bool) {
		let mut subscription = self.subscription.write();
		subscription.adding.remove(table);
		if applied {
			if let Some(tables) = subscription.tables.as_mut() {
				tables.insert(table.to_string());
			}
		}
	}

	/// Takes `table` out of the subscribed set.
	pub fn unsubscribe(&self, table: &str) -> Result<()> {
		let mut subscription = self.subscription.write();
		let Some(tables) = subscription.tables.as_mut() else {
			return Err(Error::ChangeRejected("subscription streams every table".into()));
		};
		if !tables.remove(table) {
			return Err(Error::ChangeRejected(format!("table {} is not subscribed", table)));
		}
		Ok(())
	}

	pub fn check_remove(&self, table: &str) -> Result<()> {
		let subscription = self.subscription.read();
		match &subscription.tables {
			None => Err(Error::ChangeRejected("subscription streams every table".into())),
			Some(tables) if !tables.contains(table) => {
				Err(Error::ChangeRejected(format!("table {} is not subscribed", table)))
			}
			Some(_) => Ok(()),
		}
	}

	pub fn delivered(&self) -> StreamPosition {
		self.delivered.lock().clone()
	}

	pub fn with_delivered<R>(&self, f: impl FnOnce(&mut StreamPosition) -> R) -> R {
		f(&mut self.delivered.lock())
	}
}
