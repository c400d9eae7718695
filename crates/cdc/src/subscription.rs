// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Demand-driven delivery of stream operations to a [`Subscriber`].
//!
//! A single worker thread invokes every subscriber callback, so callbacks
//! never overlap. Operations are only delivered against outstanding demand;
//! warnings, table change results and checkpoint completions are delivered
//! regardless of demand.

use std::{
	collections::BTreeSet,
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use parking_lot::{Condvar, Mutex};
use shardstream_checkpoint::CheckpointStore;
use shardstream_core::{
	CancellationToken, Error, Result, StreamOperation, StreamPosition, StreamWarning, SubscriptionConfig,
};
use tracing::{debug, info, instrument, warn};

use crate::{
	StreamSources,
	context::{Event, StreamContext},
	publisher::{PublishingUnit, resolve_starts},
	queue::{QueueItem, WAKE_INTERVAL},
	stats::{StatReporter, Statistics},
	tables::TableCache,
	tracker::apply_close,
};

/// Receives the operations and notifications of one subscription.
///
/// Every callback runs on the subscription's worker thread. A panicking
/// callback terminates the subscription with [`Error::Subscriber`].
pub trait Subscriber: Send + 'static {
	/// Called once before anything else. Request demand through `handle`.
	fn on_subscribe(&mut self, handle: SubscriptionHandle);

	fn on_next(&mut self, operation: StreamOperation);

	fn on_change_result(&mut self, table: &str, result: Result<()>) {
		let _ = (table, result);
	}

	fn on_checkpoint_complete(&mut self, result: Result<StreamPosition>) {
		let _ = result;
	}

	fn on_warn(&mut self, warning: StreamWarning) {
		let _ = warning;
	}

	/// Terminal: the subscription failed.
	fn on_error(&mut self, error: Error);

	/// Terminal: the subscription was canceled.
	fn on_complete(&mut self) {}
}

/// Outstanding demand; saturates instead of overflowing.
#[derive(Default)]
struct Demand {
	requested: AtomicU64,
}

impl Demand {
	fn add(&self, n: u64) {
		let _ = self.requested.fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_add(n)));
	}

	fn requested(&self) -> u64 {
		self.requested.load(Ordering::Acquire)
	}
}

#[derive(Default)]
struct Termination {
	done: Mutex<bool>,
	signal: Condvar,
}

struct HandleInner {
	ctx: Arc<StreamContext>,
	unit: Arc<PublishingUnit>,
	demand: Demand,
	termination: Termination,
	worker: Mutex<Option<JoinHandle<()>>>,
}

/// Controls a running subscription. Cheap to clone; every clone controls
/// the same subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
	inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
	/// Allows `n` more operations to be delivered.
	pub fn request(&self, n: i64) -> Result<()> {
		if self.is_canceled() {
			return Ok(());
		}
		if n <= 0 {
			self.inner.ctx.warn(StreamWarning::InvalidDemand(n));
			return Err(Error::InvalidDemand(n));
		}
		self.inner.demand.add(n as u64);
		self.inner.ctx.notify(Event::Wake);
		Ok(())
	}

	/// Stops the subscription. The subscriber receives `on_complete` once
	/// every thread has stopped. Calling it again has no effect.
	pub fn cancel(&self) {
		if self.inner.ctx.cancel.cancel() {
			info!(subscription = %self.inner.ctx.config.subscription_name, "subscription canceled");
			self.inner.ctx.notify(Event::Wake);
		}
	}

	pub fn is_canceled(&self) -> bool {
		self.inner.ctx.cancel.is_cancelled()
	}

	pub fn config(&self) -> &SubscriptionConfig {
		&self.inner.ctx.config
	}

	/// Position of the last fully delivered commit of every shard.
	pub fn current_position(&self) -> StreamPosition {
		self.inner.ctx.delivered()
	}

	/// Stores `position` as the subscription's checkpoint. Completion is
	/// reported through `on_checkpoint_complete`.
	///
	/// With `exact`, `position` must cover every consumed shard and may not
	/// be ahead of what was delivered; it is stored as given. Otherwise each
	/// shard stores the later of `position` and the delivered position.
	pub fn checkpoint(&self, position: StreamPosition, exact: bool) -> Result<()> {
		let ctx = &self.inner.ctx;
		if !ctx.config.checkpoint_enabled {
			return Err(Error::CheckpointDisabled);
		}
		if self.is_canceled() {
			return Err(Error::Canceled);
		}
		if position.store_name() != ctx.store_name || position.store_id() != ctx.store_id {
			return Err(Error::InvalidCheckpoint(format!(
				"{} belongs to store {}/{}",
				position,
				position.store_name(),
				position.store_id()
			)));
		}

		let delivered = ctx.delivered();
		let target = if exact {
			for shard in self.inner.unit.active_shards() {
				if !position.covers(shard) {
					return Err(Error::InvalidCheckpoint(format!("{} does not cover shard {}", position, shard)));
				}
			}
			for (shard, p) in position.shards() {
				let Some(p) = p else {
					continue;
				};
				if delivered.get(shard).is_none_or(|d| p > d) {
					return Err(Error::InvalidCheckpoint(format!(
						"shard {} position {} is ahead of what was delivered",
						shard, p
					)));
				}
			}
			position
		} else {
			let mut target = delivered;
			target.merge_max(&position);
			target
		};

		if target.shards().all(|(_, p)| p.is_none()) {
			return Err(Error::InvalidCheckpoint("nothing delivered yet".into()));
		}
		self.inner.unit.submit_checkpoint(target)
	}

	/// Starts streaming `table`. The outcome arrives through
	/// `on_change_result`.
	pub fn subscribe_table(&self, table: &str) -> Result<()> {
		if self.is_canceled() {
			return Err(Error::Canceled);
		}
		self.inner.ctx.begin_add(table)?;
		if let Err(err) = self.inner.unit.submit_change(true, table) {
			self.inner.ctx.finish_add(table, false);
			return Err(err);
		}
		Ok(())
	}

	/// Stops streaming `table`. The outcome arrives through
	/// `on_change_result`.
	pub fn unsubscribe_table(&self, table: &str) -> Result<()> {
		if self.is_canceled() {
			return Err(Error::Canceled);
		}
		self.inner.ctx.check_remove(table)?;
		self.inner.unit.submit_change(false, table)
	}

	/// The subscribed tables, `None` when streaming every table.
	pub fn subscribed_tables(&self) -> Option<BTreeSet<String>> {
		self.inner.ctx.subscribed_tables()
	}

	pub fn statistics(&self) -> Statistics {
		let mut stats = self.inner.ctx.stats.snapshot();
		stats.active_shards = self.inner.unit.active_shards().len();
		stats.queued_operations = self.inner.ctx.queue.len();
		stats.queued_bytes = self.inner.ctx.queue.bytes();
		stats.filters = self.inner.unit.filter_statistics();
		stats
	}

	/// Whether the terminal callback was delivered.
	pub fn is_terminated(&self) -> bool {
		*self.inner.termination.done.lock()
	}

	/// Waits for the terminal callback. Returns `false` on timeout.
	pub fn await_termination(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		{
			let mut done = self.inner.termination.done.lock();
			while !*done {
				if self.inner.termination.signal.wait_until(&mut done, deadline).timed_out() {
					return *done;
				}
			}
		}
		let worker = self.inner.worker.lock().take();
		if let Some(worker) = worker {
			if worker.thread().id() != thread::current().id() {
				let _ = worker.join();
			}
		}
		true
	}
}

/// Starts a subscription delivering to `subscriber`.
///
/// Configuration problems, an unknown subscribed table and an unreadable
/// checkpoint fail here; everything later is reported through the
/// subscriber's callbacks.
#[instrument(name = "subscribe", level = "info", skip_all, fields(subscription = %config.subscription_name))]
pub fn subscribe<S: Subscriber>(
	config: SubscriptionConfig,
	sources: StreamSources,
	subscriber: S,
) -> Result<SubscriptionHandle> {
	config.validate()?;

	let cancel = CancellationToken::new();
	let snapshot = sources.topology.snapshot()?;
	let checkpoints = Arc::new(
		CheckpointStore::from_config(sources.checkpoints.clone(), &config).with_cancellation(cancel.clone()),
	);
	// migration checkpoints are written even when user checkpoints are off
	checkpoints.ensure_table()?;

	let tables = TableCache::load(sources.catalog.clone(), config.tables.as_ref())?;
	let starts = resolve_starts(&config, &checkpoints, &snapshot)?;

	let (events_tx, events_rx) = unbounded();
	let ctx = Arc::new(StreamContext::new(
		config,
		sources,
		cancel,
		checkpoints,
		tables,
		starts.delivered.clone(),
		events_tx,
	));
	let unit = PublishingUnit::start(ctx.clone(), &snapshot, starts)?;

	let handle = SubscriptionHandle {
		inner: Arc::new(HandleInner {
			ctx: ctx.clone(),
			unit: unit.clone(),
			demand: Demand::default(),
			termination: Termination::default(),
			worker: Mutex::new(None),
		}),
	};

	let worker = Worker {
		subscriber,
		reporter: StatReporter::new(ctx.config.stat_report_interval),
		ctx,
		unit: unit.clone(),
		handle: handle.clone(),
		events: events_rx,
		delivered: 0,
	};
	let thread = thread::Builder::new()
		.name("shardstream-subscription".to_string())
		.spawn(move || worker.run())
		.map_err(|e| {
			unit.shutdown();
			Error::internal(format!("failed to spawn subscription worker: {}", e))
		})?;
	*handle.inner.worker.lock() = Some(thread);
	Ok(handle)
}

struct Worker<S> {
	subscriber: S,
	ctx: Arc<StreamContext>,
	unit: Arc<PublishingUnit>,
	handle: SubscriptionHandle,
	events: Receiver<Event>,
	reporter: StatReporter,
	/// Operations delivered so far, compared against the requested demand.
	delivered: u64,
}

impl<S: Subscriber> Worker<S> {
	fn run(mut self) {
		let handle = self.handle.clone();
		self.call("on_subscribe", |s| s.on_subscribe(handle));

		while !self.ctx.cancel.is_cancelled() {
			self.drain_events();
			if self.ctx.cancel.is_cancelled() {
				break;
			}

			if let Some(marker) = self.ctx.queue.pop_control() {
				if let Err(err) = apply_close(&self.ctx.checkpoints, &marker) {
					self.ctx.fail(err);
				}
				continue;
			}

			if self.delivered < self.handle.inner.demand.requested() {
				match self.ctx.queue.pop(WAKE_INTERVAL) {
					Some(QueueItem::Operation {
						operation,
						..
					}) => self.deliver(operation),
					Some(QueueItem::Close(marker)) => {
						if let Err(err) = apply_close(&self.ctx.checkpoints, &marker) {
							self.ctx.fail(err);
						}
					}
					None => {}
				}
			} else {
				match self.events.recv_timeout(WAKE_INTERVAL) {
					Ok(event) => self.dispatch(event),
					Err(RecvTimeoutError::Timeout) => {}
					Err(RecvTimeoutError::Disconnected) => break,
				}
			}

			if self.reporter.due(self.ctx.stats.delivered_count()) {
				let stats = self.handle.statistics();
				self.reporter.report(&self.ctx.config.subscription_name, &stats);
			}
		}

		self.terminate();
	}

	fn deliver(&mut self, operation: StreamOperation) {
		let seq = operation.seq();
		self.delivered += 1;
		self.ctx.stats.delivered(&operation);
		if seq.closes_commit {
			self.ctx.with_delivered(|position| position.advance(seq.shard, seq.position));
		}
		self.call("on_next", |s| s.on_next(operation));
	}

	fn drain_events(&mut self) {
		while let Ok(event) = self.events.try_recv() {
			self.dispatch(event);
		}
	}

	fn dispatch(&mut self, event: Event) {
		match event {
			Event::Wake => {}
			Event::Warn(warning) => self.call("on_warn", |s| s.on_warn(warning)),
			Event::ChangeResult {
				table,
				result,
			} => self.call("on_change_result", |s| s.on_change_result(&table, result)),
			Event::CheckpointComplete(result) => {
				self.call("on_checkpoint_complete", |s| s.on_checkpoint_complete(result))
			}
		}
	}

	/// Runs a callback; a panic fails the subscription.
	fn call(&mut self, callback: &str, f: impl FnOnce(&mut S)) {
		let subscriber = &mut self.subscriber;
		if catch_unwind(AssertUnwindSafe(|| f(subscriber))).is_err() {
			warn!(callback, "subscriber panicked");
			self.ctx.fail(Error::Subscriber(format!("{} panicked", callback)));
		}
	}

	fn terminate(mut self) {
		self.unit.shutdown();
		// pending notifications still reach the subscriber
		while let Ok(event) = self.events.try_recv() {
			if !matches!(event, Event::Wake) {
				self.dispatch(event);
			}
		}

		let failure = self.ctx.failure();
		let subscriber = &mut self.subscriber;
		let outcome = catch_unwind(AssertUnwindSafe(|| match failure {
			Some(err) => subscriber.on_error(err),
			None => subscriber.on_complete(),
		}));
		if outcome.is_err() {
			warn!(subscription = %self.ctx.config.subscription_name, "subscriber panicked in terminal callback");
		}
		debug!(subscription = %self.ctx.config.subscription_name, delivered = self.delivered, "subscription terminated");

		let termination = &self.handle.inner.termination;
		*termination.done.lock() = true;
		termination.signal.notify_all();
	}
}
