// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Turns one shard's record stream into committed stream operations.
//!
//! Data records are buffered per transaction until their commit or abort
//! arrives. Committed transactions are decoded against the table cache and
//! pushed to the delivery queue as one unit.

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::Arc,
	time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use shardstream_core::{
	CancellationToken, Error, LogPosition, LogRecord, RecordKind, Result, RowChange, SequenceId, ShardId,
	StreamOperation, StreamWarning, TableMetadata, TransactionKind, TxnId,
	interface::DatabaseKind,
	row::{DecodeError, decode_row},
};
use tracing::{debug, instrument, trace};

use crate::{
	consumer::Progress,
	context::{Event, StreamContext},
	queue::{QueueItem, WAKE_INTERVAL},
	tables::Lookup,
	tracker::MigrationTracker,
};

const REFRESH_ATTEMPTS: u32 = 3;
const REFRESH_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) enum ReassemblerMessage {
	Record(LogRecord),
	/// The connection is being reopened. The reply names where the new
	/// connection must start so no open transaction loses records; `None`
	/// keeps the original start.
	Reset {
		reply: Sender<Option<LogPosition>>,
	},
}

/// Records that arrive again after a reconnect and were already handled.
struct Replay {
	through: LogPosition,
	completed: HashSet<TxnId>,
}

struct Decoded {
	kind: RecordKind,
	change: RowChange,
	bytes: usize,
}

pub(crate) struct Reassembler {
	shard: ShardId,
	ctx: Arc<StreamContext>,
	tracker: MigrationTracker,
	progress: Arc<Progress>,
	stop: CancellationToken,
	open: HashMap<TxnId, Vec<LogRecord>>,
	/// Transactions finished while older ones were still open, oldest first.
	completed: VecDeque<(LogPosition, TxnId)>,
	last_boundary: Option<LogPosition>,
	replay: Option<Replay>,
}

impl Reassembler {
	pub fn new(
		shard: ShardId,
		ctx: Arc<StreamContext>,
		tracker: MigrationTracker,
		progress: Arc<Progress>,
		stop: CancellationToken,
	) -> Self {
		Self {
			shard,
			ctx,
			tracker,
			progress,
			stop,
			open: HashMap::new(),
			completed: VecDeque::new(),
			last_boundary: None,
			replay: None,
		}
	}

	#[instrument(name = "reassembler", level = "debug", skip_all, fields(shard = %self.shard))]
	pub fn run(mut self, records: Receiver<ReassemblerMessage>) {
		loop {
			if self.stop.is_cancelled() || self.ctx.cancel.is_cancelled() {
				break;
			}
			match records.recv_timeout(WAKE_INTERVAL) {
				Ok(ReassemblerMessage::Record(record)) => {
					let result = self.process(record);
					self.progress.processed();
					if let Err(err) = result {
						self.ctx.fail(err);
						break;
					}
				}
				Ok(ReassemblerMessage::Reset {
					reply,
				}) => {
					let _ = reply.send(self.reset());
				}
				Err(RecvTimeoutError::Timeout) => {}
				Err(RecvTimeoutError::Disconnected) => break,
			}
		}
		debug!(shard = %self.shard, open = self.open.len(), "reassembler stopped");
	}

	fn is_marker(&self, record: &LogRecord) -> bool {
		record.kind.is_data() && self.ctx.sources.directory.resolve(record.database) == DatabaseKind::MigrationMarkers
	}

	pub(crate) fn process(&mut self, record: LogRecord) -> Result<()> {
		if let Some(replay) = &self.replay {
			if record.position > replay.through {
				self.replay = None;
			} else if self.is_marker(&record) || replay.completed.contains(&record.txn) {
				trace!(shard = %self.shard, position = %record.position, "skipping replayed record");
				return Ok(());
			}
		}

		match record.kind {
			RecordKind::Put | RecordKind::Delete if self.is_marker(&record) => {
				self.tracker.handle(&record)?;
				self.last_boundary = Some(record.position);
			}
			RecordKind::Put | RecordKind::Delete => {
				self.open.entry(record.txn).or_default().push(record);
			}
			RecordKind::Commit => {
				let records = self.open.remove(&record.txn).unwrap_or_default();
				if !records.is_empty() {
					self.commit(record.position, records)?;
				}
				self.finish(record.position, record.txn);
			}
			RecordKind::Abort => {
				let records = self.open.remove(&record.txn).unwrap_or_default();
				if self.ctx.config.include_abort_transactions && !records.is_empty() {
					self.abort(record.position, records)?;
				}
				self.finish(record.position, record.txn);
			}
			RecordKind::Other => {}
		}
		Ok(())
	}

	fn finish(&mut self, position: LogPosition, txn: TxnId) {
		self.last_boundary = Some(position);
		if self.open.is_empty() {
			self.completed.clear();
		} else {
			self.completed.push_back((position, txn));
		}
	}

	/// Forgets every open transaction and answers where the log must be
	/// re-read from to rebuild them.
	pub(crate) fn reset(&mut self) -> Option<LogPosition> {
		let earliest_open = self.open.values().filter_map(|records| records.first()).map(|r| r.position).min();
		let resume = match (earliest_open, self.last_boundary) {
			(Some(open), Some(boundary)) => Some(open.min(boundary.next())),
			(Some(open), None) => Some(open),
			(None, Some(boundary)) => Some(boundary.next()),
			(None, None) => None,
		};

		self.replay = match (earliest_open, self.last_boundary) {
			(Some(_), Some(through)) => Some(Replay {
				through,
				completed: self.completed.iter().map(|(_, txn)| *txn).collect(),
			}),
			_ => None,
		};
		debug!(
			shard = %self.shard,
			open = self.open.len(),
			resume = ?resume,
			"reassembler reset"
		);
		self.open.clear();
		self.completed.clear();
		resume
	}

	fn commit(&mut self, position: LogPosition, records: Vec<LogRecord>) -> Result<()> {
		let mut decoded = Vec::new();
		for record in &records {
			if let Some(d) = self.decode(record)? {
				decoded.push(d);
			}
		}
		if decoded.is_empty() {
			return Ok(());
		}

		// touching one transaction table turns the whole commit into a batch
		if decoded.iter().any(|d| self.ctx.config.is_transactional(&d.change.row.table)) {
			let bytes = decoded.iter().map(|d| d.bytes).sum();
			let batch = self.batch(position, 0, TransactionKind::Commit, decoded);
			self.push(batch, bytes)?;
		} else {
			let count = decoded.len();
			for (index, d) in decoded.into_iter().enumerate() {
				let seq = SequenceId::new(self.shard, position, index as u32, index + 1 == count);
				self.push(operation(seq, d.kind, d.change), d.bytes)?;
			}
		}

		self.ctx.stats.applied(self.shard, position);
		Ok(())
	}

	fn abort(&mut self, position: LogPosition, records: Vec<LogRecord>) -> Result<()> {
		let mut decoded = Vec::new();
		for record in &records {
			if let Some(d) = self.decode(record)? {
				decoded.push(d);
			}
		}
		if decoded.is_empty() {
			return Ok(());
		}
		let bytes = decoded.iter().map(|d| d.bytes).sum();
		let batch = self.batch(position, 0, TransactionKind::Abort, decoded);
		self.push(batch, bytes)
	}

	fn batch(&self, position: LogPosition, index: u32, kind: TransactionKind, decoded: Vec<Decoded>) -> StreamOperation {
		let operations = decoded
			.into_iter()
			.enumerate()
			.map(|(i, d)| operation(SequenceId::new(self.shard, position, index + i as u32, false), d.kind, d.change))
			.collect();
		StreamOperation::Transaction {
			seq: SequenceId::new(self.shard, position, index, true),
			kind,
			operations,
		}
	}

	fn push(&self, operation: StreamOperation, bytes: usize) -> Result<()> {
		self.ctx.queue.push(QueueItem::Operation {
			operation,
			bytes,
		})?;
		self.ctx.notify(Event::Wake);
		Ok(())
	}

	fn decode(&self, record: &LogRecord) -> Result<Option<Decoded>> {
		let meta = match self.ctx.tables.lookup(&record.key) {
			Lookup::Found(meta) => meta,
			Lookup::Dropped => {
				self.ctx.stats.skipped_unsubscribed();
				return Ok(None);
			}
			Lookup::UnmatchedChild | Lookup::UnknownRoot if !self.ctx.config.streams_all_tables() => {
				trace!(shard = %self.shard, position = %record.position, "skipping record of unsubscribed table");
				self.ctx.stats.skipped_unsubscribed();
				return Ok(None);
			}
			Lookup::UnmatchedChild | Lookup::UnknownRoot | Lookup::Corrupt => {
				self.undecodable(record, "key matches no known table".to_string());
				return Ok(None);
			}
		};

		if !self.ctx.is_deliverable(&meta.name) {
			self.ctx.stats.skipped_unsubscribed();
			return Ok(None);
		}

		let (row, meta) = match decode_row(&meta, &record.key, record.value.as_deref()) {
			Ok(row) => (row, meta),
			Err(DecodeError::StaleSchema {
				found,
				known,
			}) => {
				debug!(table = %meta.name, found, known, "row written by a newer schema");
				let Some(fresh) = self.refresh(&meta)? else {
					return Ok(None);
				};
				match decode_row(&fresh, &record.key, record.value.as_deref()) {
					Ok(row) => (row, fresh),
					Err(err) => {
						self.undecodable(record, err.to_string());
						return Ok(None);
					}
				}
			}
			Err(err) => {
				self.undecodable(record, err.to_string());
				return Ok(None);
			}
		};

		let before = record
			.before
			.as_ref()
			.and_then(|before| before.value.as_deref())
			.and_then(|value| decode_row(&meta, &record.key, Some(value)).ok())
			.map(|row| row.values);

		Ok(Some(Decoded {
			kind: record.kind,
			bytes: record.size_bytes(),
			change: RowChange {
				row,
				modified_at: record.modified_at,
				expires_at: record.expires_at,
				before,
			},
		}))
	}

	/// Reloads a table after a row newer than its cached schema arrived.
	/// `None` means the table no longer exists.
	fn refresh(&self, meta: &TableMetadata) -> Result<Option<TableMetadata>> {
		self.ctx.stats.schema_refreshed();
		let mut attempt = 1;
		loop {
			match self.ctx.tables.catalog().refresh(meta.id) {
				Ok(Some(fresh)) => {
					self.ctx.tables.insert(fresh.clone());
					return Ok(Some(fresh));
				}
				Ok(None) => {
					self.ctx.tables.drop_table(meta.id);
					self.ctx.warn(StreamWarning::TableDropped {
						table: meta.name.clone(),
					});
					return Ok(None);
				}
				Err(err) if err.is_transient() && attempt < REFRESH_ATTEMPTS => {
					debug!(table = %meta.name, attempt, "schema refresh failed: {}", err);
					if !self.stop.sleep(REFRESH_BACKOFF * attempt) {
						return Err(Error::Canceled);
					}
					attempt += 1;
				}
				Err(err) => {
					return Err(Error::Internal(format!("refreshing schema of {} failed: {}", meta.name, err)));
				}
			}
		}
	}

	fn undecodable(&self, record: &LogRecord, reason: String) {
		self.ctx.stats.skipped_undecodable();
		self.ctx.warn(StreamWarning::UndecodableRecord {
			shard: self.shard,
			position: record.position,
			reason,
		});
	}
}

fn operation(seq: SequenceId, kind: RecordKind, change: RowChange) -> StreamOperation {
	match kind {
		RecordKind::Delete => StreamOperation::Delete {
			seq,
			change,
		},
		_ => StreamOperation::Put {
			seq,
			change,
		},
	}
}
