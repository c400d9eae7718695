// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! One shard's connection, reconnect loop and reassembler.
//!
//! Each consumer runs two threads. The connection thread owns the log
//! connection: it forwards records to the reassembler thread, applies
//! filter changes between two reads and reopens the connection when the
//! link fails. The reassembler thread turns records into operations.

use std::{
	fmt::{self, Display, Formatter},
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use shardstream_core::{
	CancellationToken, Error, LogPosition, LogRecord, PartitionOwnership, Result, ShardId, StreamWarning,
	interface::{
		FeedFilter, FilterChangeRequest, FilterChangeResponse, FilterChangeStatus, LogConnection, ShardInfo,
		StartPosition,
	},
};
use shardstream_filter::{SourceFilter, TableSet};
use tracing::{debug, info, warn};

use crate::{
	context::StreamContext,
	queue::WAKE_INTERVAL,
	reassembler::{Reassembler, ReassemblerMessage},
	tracker::MigrationTracker,
};

const RECORD_BUFFER: usize = 1024;

/// Where a consumer starts and whether a missing start is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShardStart {
	pub position: StartPosition,
	pub exact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConsumerState {
	Init = 0,
	Streaming = 1,
	Error = 2,
	Reconnecting = 3,
	Terminated = 4,
}

impl ConsumerState {
	fn from_u8(value: u8) -> Self {
		match value {
			0 => ConsumerState::Init,
			1 => ConsumerState::Streaming,
			2 => ConsumerState::Error,
			3 => ConsumerState::Reconnecting,
			_ => ConsumerState::Terminated,
		}
	}
}

impl Display for ConsumerState {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let name = match self {
			ConsumerState::Init => "INIT",
			ConsumerState::Streaming => "STREAMING",
			ConsumerState::Error => "ERROR",
			ConsumerState::Reconnecting => "RECONNECTING",
			ConsumerState::Terminated => "TERMINATED",
		};
		f.write_str(name)
	}
}

/// Records handed to the reassembler and records it finished.
#[derive(Default)]
pub(crate) struct Progress {
	forwarded: AtomicU64,
	processed: AtomicU64,
}

impl Progress {
	pub fn processed(&self) {
		self.processed.fetch_add(1, Ordering::AcqRel);
	}

	fn is_idle(&self) -> bool {
		let processed = self.processed.load(Ordering::Acquire);
		processed == self.forwarded.load(Ordering::Acquire)
	}
}

pub(crate) enum ConsumerControl {
	ChangeFilter {
		request: FilterChangeRequest,
		reply: Sender<FilterChangeResponse>,
	},
}

/// Sends filter changes to a consumer's connection thread.
#[derive(Clone)]
pub(crate) struct ConsumerLink {
	pub shard: ShardId,
	control: Sender<ConsumerControl>,
}

impl ConsumerLink {
	pub fn change_filter(&self, request: FilterChangeRequest, timeout: Duration) -> FilterChangeResponse {
		let id = request.request_id();
		let (reply, response) = bounded(1);
		if self
			.control
			.send(ConsumerControl::ChangeFilter {
				request,
				reply,
			})
			.is_err()
		{
			return FilterChangeResponse::new(id, FilterChangeStatus::Fail, "consumer stopped");
		}
		match response.recv_timeout(timeout) {
			Ok(response) => response,
			Err(_) => FilterChangeResponse::new(id, FilterChangeStatus::Timeout, format!("no answer within {:?}", timeout)),
		}
	}
}

pub(crate) struct ShardConsumer {
	shard: ShardId,
	ownership: PartitionOwnership,
	filter: Arc<SourceFilter>,
	link: ConsumerLink,
	state: Arc<AtomicU8>,
	/// Set for shards created after the subscription started, until they
	/// take over their first partition.
	newly_born: AtomicBool,
	progress: Arc<Progress>,
	/// Consecutive topology polls that found the consumer retirable.
	idle_polls: AtomicU32,
	stop: CancellationToken,
	threads: Vec<JoinHandle<()>>,
}

impl ShardConsumer {
	pub fn spawn(
		ctx: Arc<StreamContext>,
		info: ShardInfo,
		start: ShardStart,
		tables: TableSet,
		ownership: PartitionOwnership,
		newly_born: bool,
	) -> Result<Self> {
		let shard = info.id;
		let stop = CancellationToken::new();

		let mut filter =
			SourceFilter::new(shard, tables, ctx.sources.directory.clone(), ownership.clone())
				.with_blocked_cache(ctx.config.blocked_database_cache);
		if ctx.config.local_writes_only {
			if let Some(region) = ctx.config.local_region {
				filter = filter.with_local_region(region);
			}
		}
		let filter = Arc::new(filter);

		let tracker = MigrationTracker::new(shard, ownership.clone(), ctx.checkpoints.clone(), ctx.queue.clone(), stop.clone())
			.with_wait(ctx.config.migration_poll_interval, ctx.config.migration_timeout);
		let progress = Arc::new(Progress::default());
		let reassembler = Reassembler::new(shard, ctx.clone(), tracker, progress.clone(), stop.clone());

		let (records_tx, records_rx) = bounded(RECORD_BUFFER);
		let (control_tx, control_rx) = crossbeam_channel::unbounded();
		let state = Arc::new(AtomicU8::new(ConsumerState::Init as u8));

		let reassembler_thread = thread::Builder::new()
			.name(format!("shardstream-reassembler-{}", shard.0))
			.spawn(move || reassembler.run(records_rx))
			.map_err(|e| Error::internal(format!("failed to spawn reassembler thread: {}", e)))?;

		let connection = ConnectionLoop {
			shard,
			ctx,
			info,
			start,
			filter: filter.clone(),
			records: records_tx,
			progress: progress.clone(),
			control: control_rx,
			stop: stop.clone(),
			state: state.clone(),
		};
		let connection_thread = thread::Builder::new()
			.name(format!("shardstream-shard-{}", shard.0))
			.spawn(move || connection.run())
			.map_err(|e| {
				stop.cancel();
				Error::internal(format!("failed to spawn shard thread: {}", e))
			})?;

		debug!(%shard, ?start, newly_born, "shard consumer started");
		Ok(Self {
			shard,
			ownership,
			filter,
			link: ConsumerLink {
				shard,
				control: control_tx,
			},
			state,
			newly_born: AtomicBool::new(newly_born),
			progress,
			idle_polls: AtomicU32::new(0),
			stop: stop.clone(),
			threads: vec![connection_thread, reassembler_thread],
		})
	}

	pub fn shard(&self) -> ShardId {
		self.shard
	}

	pub fn link(&self) -> ConsumerLink {
		self.link.clone()
	}

	pub fn filter(&self) -> &Arc<SourceFilter> {
		&self.filter
	}

	pub fn state(&self) -> ConsumerState {
		ConsumerState::from_u8(self.state.load(Ordering::Acquire))
	}

	/// A consumer may retire once it owns no partition and every close it
	/// read was applied. The source gives partitions away before their
	/// close markers reach the queue, so the condition has to hold on two
	/// consecutive polls. Newly created shards are kept until they received
	/// their first partition.
	pub fn is_retirable(&self, pending_closes: usize) -> bool {
		if !self.ownership.owns_nothing() {
			self.newly_born.store(false, Ordering::Release);
			self.idle_polls.store(0, Ordering::Release);
			return false;
		}
		let idle = pending_closes == 0 && self.progress.is_idle() && !self.newly_born.load(Ordering::Acquire);
		if !idle {
			self.idle_polls.store(0, Ordering::Release);
			return false;
		}
		self.idle_polls.fetch_add(1, Ordering::AcqRel) >= 1
	}

	pub fn stop(&self) {
		self.stop.cancel();
	}

	/// Waits for both threads until `deadline`, then abandons them.
	pub fn join(self, deadline: Instant) {
		self.stop.cancel();
		for handle in self.threads {
			join_until(handle, deadline);
		}
	}
}

pub(crate) fn join_until(handle: JoinHandle<()>, deadline: Instant) {
	let name = handle.thread().name().unwrap_or("unnamed").to_string();
	while !handle.is_finished() && Instant::now() < deadline {
		thread::sleep(Duration::from_millis(5));
	}
	if handle.is_finished() {
		if handle.join().is_err() {
			warn!(thread = %name, "thread panicked");
		}
	} else {
		warn!(thread = %name, "thread did not stop within the shutdown grace period, abandoning it");
	}
}

struct ConnectionLoop {
	shard: ShardId,
	ctx: Arc<StreamContext>,
	info: ShardInfo,
	start: ShardStart,
	filter: Arc<SourceFilter>,
	records: Sender<ReassemblerMessage>,
	progress: Arc<Progress>,
	control: Receiver<ConsumerControl>,
	stop: CancellationToken,
	state: Arc<AtomicU8>,
}

impl ConnectionLoop {
	fn run(mut self) {
		match self.stream() {
			Ok(()) | Err(Error::Canceled) => {}
			Err(err) => {
				self.set_state(ConsumerState::Error);
				self.ctx.fail(err);
			}
		}
		self.set_state(ConsumerState::Terminated);
		// answer changes that raced with the shutdown
		self.drain_control(None);
		debug!(shard = %self.shard, "shard connection stopped");
	}

	fn set_state(&self, state: ConsumerState) {
		let previous = ConsumerState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
		if previous != state {
			debug!(shard = %self.shard, from = %previous, to = %state, "consumer state changed");
		}
	}

	fn stopped(&self) -> bool {
		self.stop.is_cancelled() || self.ctx.cancel.is_cancelled()
	}

	fn stream(&mut self) -> Result<()> {
		let mut connection = self.connect()?;
		self.set_state(ConsumerState::Streaming);

		let mut last_record = Instant::now();
		let mut idle_reported = false;
		loop {
			if self.stopped() {
				connection.close();
				return Ok(());
			}
			self.drain_control(Some(&mut *connection));

			match connection.recv(WAKE_INTERVAL) {
				Ok(Some(record)) => {
					last_record = Instant::now();
					idle_reported = false;
					self.forward(record)?;
				}
				Ok(None) => {
					let idle = last_record.elapsed();
					if !idle_reported && idle >= self.ctx.config.shard_timeout {
						idle_reported = true;
						self.ctx.warn(StreamWarning::ShardTimeout {
							shard: self.shard,
							idle,
						});
					}
				}
				Err(err) if err.is_transient() => {
					connection.close();
					connection = self.reconnect(err)?;
					self.set_state(ConsumerState::Streaming);
					last_record = Instant::now();
					idle_reported = false;
				}
				Err(err) => {
					connection.close();
					return Err(err);
				}
			}
		}
	}

	fn open(&self, start: StartPosition) -> Result<Box<dyn LogConnection>> {
		let filter: Arc<dyn FeedFilter> = self.filter.clone();
		self.ctx.sources.transport.open(&self.info, start, filter)
	}

	fn connect(&mut self) -> Result<Box<dyn LogConnection>> {
		match self.open(self.start.position) {
			Ok(connection) => Ok(connection),
			Err(Error::InsufficientLog {
				shard,
				requested,
				earliest,
			}) if !self.start.exact => {
				self.ctx.warn(StreamWarning::LogFallback {
					shard,
					requested,
					earliest,
				});
				self.start.position = StartPosition::Earliest;
				match self.open(StartPosition::Earliest) {
					Ok(connection) => Ok(connection),
					Err(err) if err.is_transient() => self.reconnect(err),
					Err(err) => Err(err),
				}
			}
			Err(err) if err.is_transient() => self.reconnect(err),
			Err(err) => Err(err),
		}
	}

	fn reconnect(&mut self, cause: Error) -> Result<Box<dyn LogConnection>> {
		self.set_state(ConsumerState::Reconnecting);
		self.ctx.stats.reconnected();

		let start = match self.reset_reassembler()? {
			Some(position) => StartPosition::At(position),
			None => self.start.position,
		};
		self.filter.reset_stream();

		let attempts = self.ctx.config.max_reconnect_attempts;
		let mut reason = cause.to_string();
		for attempt in 1..=attempts {
			self.ctx.warn(StreamWarning::Reconnecting {
				shard: self.shard,
				attempt,
				reason: reason.clone(),
			});
			if !self.stop.sleep(self.ctx.config.reconnect_backoff) || self.stopped() {
				return Err(Error::Canceled);
			}
			self.drain_control(None);

			// the leader may have moved
			match self.ctx.sources.topology.snapshot() {
				Ok(snapshot) => {
					if let Some(info) = snapshot.shard(self.shard) {
						self.info = info.clone();
					}
				}
				Err(err) => debug!(shard = %self.shard, "topology refresh failed: {}", err),
			}

			match self.open(start) {
				Ok(connection) => {
					info!(shard = %self.shard, attempt, leader = %self.info.leader, ?start, "shard reconnected");
					return Ok(connection);
				}
				Err(err) if err.is_transient() => reason = err.to_string(),
				Err(err) => return Err(err),
			}
		}

		Err(Error::ReconnectExhausted {
			shard: self.shard,
			attempts,
		})
	}

	fn reset_reassembler(&self) -> Result<Option<LogPosition>> {
		let (reply, answer) = bounded(1);
		self.send(ReassemblerMessage::Reset {
			reply,
		})?;
		loop {
			match answer.recv_timeout(WAKE_INTERVAL) {
				Ok(resume) => return Ok(resume),
				Err(_) if self.stopped() => return Err(Error::Canceled),
				Err(RecvTimeoutError::Disconnected) => return Err(Error::Canceled),
				Err(RecvTimeoutError::Timeout) => {}
			}
		}
	}

	fn forward(&self, record: LogRecord) -> Result<()> {
		self.progress.forwarded.fetch_add(1, Ordering::AcqRel);
		self.send(ReassemblerMessage::Record(record))
	}

	fn send(&self, message: ReassemblerMessage) -> Result<()> {
		let mut message = message;
		loop {
			match self.records.send_timeout(message, WAKE_INTERVAL) {
				Ok(()) => return Ok(()),
				Err(SendTimeoutError::Timeout(returned)) => {
					if self.stopped() {
						return Err(Error::Canceled);
					}
					message = returned;
				}
				// the reassembler stopped, it reported its own failure
				Err(SendTimeoutError::Disconnected(_)) => return Err(Error::Canceled),
			}
		}
	}

	/// Applies pending filter changes. Without a connection the change is
	/// applied to the filter directly and travels with the next connection.
	fn drain_control(&self, mut connection: Option<&mut dyn LogConnection>) {
		while let Ok(control) = self.control.try_recv() {
			match control {
				ConsumerControl::ChangeFilter {
					request,
					reply,
				} => {
					let id = request.request_id();
					let response = if self.stopped() {
						FilterChangeResponse::new(id, FilterChangeStatus::Fail, "consumer stopped")
					} else {
						match connection.as_mut() {
							Some(connection) => {
								match connection.change_filter(request, self.ctx.config.change_timeout) {
									Ok(response) => response,
									Err(Error::Timeout(message)) => {
										FilterChangeResponse::new(id, FilterChangeStatus::Timeout, message)
									}
									Err(err) => FilterChangeResponse::new(id, FilterChangeStatus::Fail, err.to_string()),
								}
							}
							None => self.filter.apply_change(&request),
						}
					};
					debug!(shard = %self.shard, status = ?response.status, "filter change answered");
					let _ = reply.send(response);
				}
			}
		}
	}
}
