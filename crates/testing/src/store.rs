// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! A sharded, partitioned store held in memory.
//!
//! Every shard keeps an append-only log starting at position 1. Partition
//! `p` lives in database `p`; the marker, internal, duplicate index and
//! non-partition databases use reserved ids. The store serves as topology,
//! database directory and log transport of a subscription.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use shardstream_core::{
	BeforeImage, DatabaseId, Error, FieldValue, Generation, LogPosition, LogRecord, PartitionGeneration, PartitionId,
	RegionId, Result, ShardId, TableMetadata, TxnId,
	generation::Predecessor,
	interface::{
		DatabaseDirectory, DatabaseKind, FeedFilter, FilterChangeRequest, FilterChangeResponse, FilterChangeStatus,
		LogConnection, LogTransport, ShardInfo, StartPosition, Topology, TopologySnapshot,
	},
	partition::{HashPartitioner, Partitioner},
	row::encode_values,
	util::now_millis,
};

pub const MARKERS_DATABASE: DatabaseId = DatabaseId(u32::MAX);
pub const INTERNAL_DATABASE: DatabaseId = DatabaseId(u32::MAX - 1);
pub const DUPLICATE_INDEX_DATABASE: DatabaseId = DatabaseId(u32::MAX - 2);
pub const NON_PARTITION_DATABASE: DatabaseId = DatabaseId(0);

#[derive(Default)]
struct ShardLog {
	leader: String,
	records: Vec<LogRecord>,
	earliest: u64,
	/// Bumped to break every open connection.
	epoch: u64,
	failing_opens: u32,
	unauthorized: bool,
	reject_filter_changes: bool,
	/// How long each filter change takes to apply.
	filter_change_delay: Duration,
	/// Connections opened so far, with their start position.
	opens: Vec<LogPosition>,
}

impl ShardLog {
	fn new(leader: String) -> Self {
		Self {
			leader,
			earliest: 1,
			..Self::default()
		}
	}

	fn next_position(&self) -> LogPosition {
		LogPosition(self.records.len() as u64 + 1)
	}
}

struct State {
	shards: BTreeMap<ShardId, ShardLog>,
	owners: BTreeMap<PartitionId, ShardId>,
	generations: BTreeMap<PartitionId, Generation>,
}

struct Inner {
	name: String,
	id: u64,
	partitioner: HashPartitioner,
	state: Mutex<State>,
	appended: Condvar,
	next_txn: AtomicU64,
}

/// Clones share the same store.
#[derive(Clone)]
pub struct MemoryStore {
	inner: Arc<Inner>,
}

impl MemoryStore {
	/// A store with `num_shards` shards (ids from 1) and `num_partitions`
	/// partitions spread round-robin over them.
	pub fn new(name: &str, id: u64, num_partitions: u32, num_shards: u32) -> Self {
		let mut shards = BTreeMap::new();
		for shard in 1..=num_shards {
			shards.insert(ShardId(shard), ShardLog::new(format!("node-{}-a", shard)));
		}
		let owners = (1..=num_partitions).map(|p| (PartitionId(p), ShardId(1 + (p - 1) % num_shards))).collect();

		Self {
			inner: Arc::new(Inner {
				name: name.to_string(),
				id,
				partitioner: HashPartitioner::new(num_partitions),
				state: Mutex::new(State {
					shards,
					owners,
					generations: BTreeMap::new(),
				}),
				appended: Condvar::new(),
				next_txn: AtomicU64::new(1),
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn id(&self) -> u64 {
		self.inner.id
	}

	pub fn partition_of(&self, key: &[u8]) -> PartitionId {
		self.inner.partitioner.partition_of(key)
	}

	pub fn owner_of(&self, partition: PartitionId) -> ShardId {
		self.inner.state.lock().owners.get(&partition).copied().unwrap_or(ShardId(1))
	}

	pub fn shard_of(&self, key: &[u8]) -> ShardId {
		self.owner_of(self.partition_of(key))
	}

	pub fn begin(&self) -> TransactionBuilder {
		TransactionBuilder {
			store: self.clone(),
			txn: self.next_txn(),
			writes: Vec::new(),
			region: None,
		}
	}

	pub fn next_txn(&self) -> TxnId {
		TxnId(self.inner.next_txn.fetch_add(1, Ordering::SeqCst))
	}

	/// Appends the record built for the next position of `shard`.
	pub fn append(&self, shard: ShardId, make: impl FnOnce(LogPosition) -> LogRecord) -> LogPosition {
		let mut state = self.inner.state.lock();
		let log = state.shards.get_mut(&shard).unwrap_or_else(|| panic!("unknown shard {}", shard));
		let position = log.next_position();
		log.records.push(make(position));
		self.inner.appended.notify_all();
		position
	}

	pub fn last_position(&self, shard: ShardId) -> LogPosition {
		let state = self.inner.state.lock();
		state.shards.get(&shard).map_or(LogPosition(0), |log| log.next_position().prev())
	}

	/// Forgets every record before `position`.
	pub fn truncate(&self, shard: ShardId, position: LogPosition) {
		if let Some(log) = self.inner.state.lock().shards.get_mut(&shard) {
			log.earliest = position.0;
		}
	}

	/// Breaks every open connection to `shard`.
	pub fn disconnect(&self, shard: ShardId) {
		if let Some(log) = self.inner.state.lock().shards.get_mut(&shard) {
			log.epoch += 1;
		}
		self.inner.appended.notify_all();
	}

	/// Lets the next `count` connection attempts to `shard` fail.
	pub fn fail_opens(&self, shard: ShardId, count: u32) {
		if let Some(log) = self.inner.state.lock().shards.get_mut(&shard) {
			log.failing_opens = count;
		}
	}

	pub fn set_unauthorized(&self, shard: ShardId, unauthorized: bool) {
		if let Some(log) = self.inner.state.lock().shards.get_mut(&shard) {
			log.unauthorized = unauthorized;
		}
	}

	pub fn reject_filter_changes(&self, shard: ShardId, reject: bool) {
		if let Some(log) = self.inner.state.lock().shards.get_mut(&shard) {
			log.reject_filter_changes = reject;
		}
	}

	/// Makes every filter change on `shard` take `delay` before it applies.
	pub fn delay_filter_changes(&self, shard: ShardId, delay: Duration) {
		if let Some(log) = self.inner.state.lock().shards.get_mut(&shard) {
			log.filter_change_delay = delay;
		}
	}

	pub fn set_leader(&self, shard: ShardId, leader: &str) {
		if let Some(log) = self.inner.state.lock().shards.get_mut(&shard) {
			log.leader = leader.to_string();
		}
	}

	/// Start positions of the connections opened against `shard`.
	pub fn opens(&self, shard: ShardId) -> Vec<LogPosition> {
		self.inner.state.lock().shards.get(&shard).map(|log| log.opens.clone()).unwrap_or_default()
	}

	/// Adds an empty shard owning no partition.
	pub fn add_shard(&self) -> ShardId {
		let mut state = self.inner.state.lock();
		let id = ShardId(state.shards.keys().last().map_or(1, |s| s.0 + 1));
		state.shards.insert(id, ShardLog::new(format!("node-{}-a", id.0)));
		id
	}

	/// Moves `partition` to shard `to`: the current owner logs a CLOSE
	/// marker, `to` logs the OPEN marker of the next generation naming the
	/// close position. Returns both positions.
	pub fn migrate(&self, partition: PartitionId, to: ShardId) -> (LogPosition, LogPosition) {
		let from = self.owner_of(partition);
		let generation = self.inner.state.lock().generations.get(&partition).copied().unwrap_or(Generation::INITIAL);

		let close = self.append_marker(from, |position| PartitionGeneration::close(partition, generation, position, to));
		let next = Generation(generation.0 + 1);
		let open = self.append_marker(to, |_| {
			PartitionGeneration::open(
				partition,
				next,
				Some(Predecessor {
					shard: from,
					end: close,
				}),
			)
		});

		let mut state = self.inner.state.lock();
		state.owners.insert(partition, to);
		state.generations.insert(partition, next);
		(close, open)
	}

	fn append_marker(&self, shard: ShardId, make: impl FnOnce(LogPosition) -> PartitionGeneration) -> LogPosition {
		let txn = self.next_txn();
		let position = self.append(shard, |position| {
			let generation = make(position);
			let value = generation.encode().expect("generation markers always encode");
			LogRecord::put(position, MARKERS_DATABASE, txn, generation.marker_key(), value)
		});
		self.append(shard, |position| LogRecord::commit(position, txn));
		position
	}

	/// Appends a record of a database no subscriber should ever see.
	pub fn append_noise(&self, shard: ShardId, database: DatabaseId) -> LogPosition {
		let txn = self.next_txn();
		let position = self.append(shard, |position| LogRecord::put(position, database, txn, b"noise".to_vec(), vec![1]));
		self.append(shard, |position| LogRecord::commit(position, txn));
		position
	}

	fn open_connection(&self, shard: ShardId, start: StartPosition, filter: Arc<dyn FeedFilter>) -> Result<MemoryConnection> {
		let mut state = self.inner.state.lock();
		let log = state.shards.get_mut(&shard).ok_or_else(|| Error::Link {
			shard,
			message: "no such shard".into(),
		})?;
		if log.unauthorized {
			return Err(Error::Unauthorized(format!("reading shard {}", shard)));
		}
		if log.failing_opens > 0 {
			log.failing_opens -= 1;
			return Err(Error::Link {
				shard,
				message: "connection refused".into(),
			});
		}

		let next = match start {
			StartPosition::Earliest => LogPosition(log.earliest),
			StartPosition::Now => log.next_position(),
			StartPosition::At(position) if position.0 < log.earliest => {
				return Err(Error::InsufficientLog {
					shard,
					requested: position,
					earliest: LogPosition(log.earliest),
				});
			}
			StartPosition::At(position) => position,
		};
		log.opens.push(next);

		Ok(MemoryConnection {
			store: self.inner.clone(),
			shard,
			start: next,
			next,
			epoch: log.epoch,
			filter,
			closed: false,
		})
	}
}

impl Topology for MemoryStore {
	fn snapshot(&self) -> Result<TopologySnapshot> {
		let state = self.inner.state.lock();
		let mut shards: BTreeMap<ShardId, ShardInfo> = state
			.shards
			.iter()
			.map(|(id, log)| {
				(
					*id,
					ShardInfo {
						id: *id,
						leader: log.leader.clone(),
						partitions: BTreeSet::new(),
					},
				)
			})
			.collect();
		for (partition, owner) in &state.owners {
			if let Some(info) = shards.get_mut(owner) {
				info.partitions.insert(*partition);
			}
		}
		Ok(TopologySnapshot {
			store_name: self.inner.name.clone(),
			store_id: self.inner.id,
			num_partitions: self.inner.partitioner.num_partitions(),
			shards,
		})
	}
}

impl DatabaseDirectory for MemoryStore {
	fn resolve(&self, database: DatabaseId) -> DatabaseKind {
		match database {
			MARKERS_DATABASE => DatabaseKind::MigrationMarkers,
			INTERNAL_DATABASE => DatabaseKind::Internal,
			DUPLICATE_INDEX_DATABASE => DatabaseKind::DuplicateIndex,
			DatabaseId(id) if id >= 1 && id <= self.inner.partitioner.num_partitions() => {
				DatabaseKind::Partition(PartitionId(id))
			}
			_ => DatabaseKind::NonPartition,
		}
	}
}

impl LogTransport for MemoryStore {
	fn open(
		&self,
		shard: &ShardInfo,
		start: StartPosition,
		filter: Arc<dyn FeedFilter>,
	) -> Result<Box<dyn LogConnection>> {
		Ok(Box::new(self.open_connection(shard.id, start, filter)?))
	}

	fn earliest_position(&self, shard: &ShardInfo) -> Result<LogPosition> {
		let state = self.inner.state.lock();
		let log = state.shards.get(&shard.id).ok_or_else(|| Error::Link {
			shard: shard.id,
			message: "no such shard".into(),
		})?;
		Ok(LogPosition(log.earliest))
	}
}

pub struct MemoryConnection {
	store: Arc<Inner>,
	shard: ShardId,
	start: LogPosition,
	next: LogPosition,
	epoch: u64,
	filter: Arc<dyn FeedFilter>,
	closed: bool,
}

impl MemoryConnection {
	fn broken(&self) -> Error {
		Error::Link {
			shard: self.shard,
			message: "connection reset".into(),
		}
	}
}

impl LogConnection for MemoryConnection {
	fn start_position(&self) -> LogPosition {
		self.start
	}

	fn recv(&mut self, timeout: Duration) -> Result<Option<LogRecord>> {
		if self.closed {
			return Err(self.broken());
		}
		let deadline = Instant::now() + timeout;
		let mut state = self.store.state.lock();
		loop {
			let log = state.shards.get(&self.shard).ok_or_else(|| self.broken())?;
			if log.epoch != self.epoch {
				return Err(self.broken());
			}
			match log.records.get(self.next.0 as usize - 1) {
				Some(record) => {
					self.next = self.next.next();
					if self.filter.evaluate(record) {
						return Ok(Some(record.clone()));
					}
				}
				None => {
					if self.store.appended.wait_until(&mut state, deadline).timed_out() {
						return Ok(None);
					}
				}
			}
		}
	}

	fn change_filter(&mut self, request: FilterChangeRequest, _timeout: Duration) -> Result<FilterChangeResponse> {
		let (reject, delay) = {
			let state = self.store.state.lock();
			let log = state.shards.get(&self.shard).ok_or_else(|| self.broken())?;
			if log.epoch != self.epoch {
				return Err(self.broken());
			}
			(log.reject_filter_changes, log.filter_change_delay)
		};
		if !delay.is_zero() {
			std::thread::sleep(delay);
		}
		if reject {
			return Ok(FilterChangeResponse::new(request.request_id(), FilterChangeStatus::Fail, "rejected by source"));
		}
		Ok(self.filter.apply_change(&request))
	}

	fn close(&mut self) {
		self.closed = true;
	}
}

enum Write {
	Put {
		key: Vec<u8>,
		value: Vec<u8>,
		before: Option<BeforeImage>,
	},
	Delete {
		key: Vec<u8>,
	},
}

impl Write {
	fn key(&self) -> &[u8] {
		match self {
			Write::Put {
				key,
				..
			}
			| Write::Delete {
				key,
			} => key,
		}
	}
}

/// Collects the writes of one transaction. Each touched shard logs the
/// writes routed to it followed by the commit or abort.
pub struct TransactionBuilder {
	store: MemoryStore,
	txn: TxnId,
	writes: Vec<Write>,
	region: Option<RegionId>,
}

impl TransactionBuilder {
	pub fn txn(&self) -> TxnId {
		self.txn
	}

	pub fn put(self, table: &TableMetadata, key: &[&str], values: &[FieldValue]) -> Self {
		self.put_child(table, &[], key, values)
	}

	pub fn put_child(mut self, table: &TableMetadata, parent: &[&str], key: &[&str], values: &[FieldValue]) -> Self {
		self.writes.push(Write::Put {
			key: table.key(parent, key),
			value: encode_values(table.version, values),
			before: None,
		});
		self
	}

	/// An update carrying the previous values of the row.
	pub fn update(mut self, table: &TableMetadata, key: &[&str], values: &[FieldValue], before: &[FieldValue]) -> Self {
		self.writes.push(Write::Put {
			key: table.key::<&str, _>(&[], key),
			value: encode_values(table.version, values),
			before: Some(BeforeImage {
				value: Some(encode_values(table.version, before)),
				modified_at: now_millis(),
				expires_at: None,
			}),
		});
		self
	}

	/// A put with a payload written by schema `version`.
	pub fn put_versioned(mut self, table: &TableMetadata, key: &[&str], version: u32, values: &[FieldValue]) -> Self {
		self.writes.push(Write::Put {
			key: table.key::<&str, _>(&[], key),
			value: encode_values(version, values),
			before: None,
		});
		self
	}

	pub fn put_raw(mut self, key: Vec<u8>, value: Vec<u8>) -> Self {
		self.writes.push(Write::Put {
			key,
			value,
			before: None,
		});
		self
	}

	pub fn delete(mut self, table: &TableMetadata, key: &[&str]) -> Self {
		self.writes.push(Write::Delete {
			key: table.key::<&str, _>(&[], key),
		});
		self
	}

	pub fn region(mut self, region: RegionId) -> Self {
		self.region = Some(region);
		self
	}

	/// Logs the transaction and returns the commit position per shard.
	pub fn commit(self) -> BTreeMap<ShardId, LogPosition> {
		self.finish(LogRecord::commit)
	}

	pub fn abort(self) -> BTreeMap<ShardId, LogPosition> {
		self.finish(LogRecord::abort)
	}

	fn finish(self, boundary: fn(LogPosition, TxnId) -> LogRecord) -> BTreeMap<ShardId, LogPosition> {
		let store = self.store;
		let txn = self.txn;
		let region = self.region;
		let mut routed: BTreeMap<ShardId, Vec<Write>> = BTreeMap::new();
		for write in self.writes {
			routed.entry(store.shard_of(write.key())).or_default().push(write);
		}

		let mut positions = BTreeMap::new();
		for (shard, writes) in routed {
			for write in writes {
				let database = DatabaseId(store.partition_of(write.key()).0);
				store.append(shard, |position| {
					let record = match write {
						Write::Put {
							key,
							value,
							before,
						} => {
							let record = LogRecord::put(position, database, txn, key, value).with_modified_at(now_millis());
							match before {
								Some(before) => record.with_before(before),
								None => record,
							}
						}
						Write::Delete {
							key,
						} => LogRecord::delete(position, database, txn, key).with_modified_at(now_millis()),
					};
					match region {
						Some(region) => record.with_region(region),
						None => record,
					}
				});
			}
			positions.insert(shard, store.append(shard, |position| boundary(position, txn)));
		}
		positions
	}
}
