// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Delivery queue shared by every shard of a subscription.
//!
//! Bounded by the approximate byte size of the queued operations. Producers
//! block while the queue is full, the subscription worker blocks while it
//! is empty, and both wake periodically to observe cancellation.

use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
	time::Duration,
};

use parking_lot::{Condvar, Mutex};
use shardstream_core::{
	CancellationToken, Error, LogPosition, PartitionId, PartitionOwnership, Result, ShardId, StreamOperation,
};

pub(crate) const WAKE_INTERVAL: Duration = Duration::from_millis(50);

/// End of a partition generation on `shard`, applied once everything queued
/// before it has been delivered.
#[derive(Debug, Clone)]
pub(crate) struct CloseMarker {
	pub shard: ShardId,
	pub partition: PartitionId,
	pub position: LogPosition,
	pub ownership: PartitionOwnership,
}

#[derive(Debug)]
pub(crate) enum QueueItem {
	Operation {
		operation: StreamOperation,
		bytes: usize,
	},
	Close(CloseMarker),
}

impl QueueItem {
	fn bytes(&self) -> usize {
		match self {
			QueueItem::Operation {
				bytes,
				..
			} => *bytes,
			QueueItem::Close(_) => 0,
		}
	}
}

#[derive(Default)]
struct State {
	items: VecDeque<QueueItem>,
	bytes: usize,
	pending_closes: HashMap<ShardId, usize>,
}

impl State {
	fn take_front(&mut self) -> Option<QueueItem> {
		let item = self.items.pop_front()?;
		self.bytes -= item.bytes();
		if let QueueItem::Close(marker) = &item {
			if let Some(count) = self.pending_closes.get_mut(&marker.shard) {
				*count -= 1;
				if *count == 0 {
					self.pending_closes.remove(&marker.shard);
				}
			}
		}
		Some(item)
	}
}

#[derive(Clone)]
pub(crate) struct DeliveryQueue {
	inner: Arc<Inner>,
}

struct Inner {
	state: Mutex<State>,
	not_empty: Condvar,
	not_full: Condvar,
	capacity: usize,
	cancel: CancellationToken,
}

impl DeliveryQueue {
	pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(State::default()),
				not_empty: Condvar::new(),
				not_full: Condvar::new(),
				capacity,
				cancel,
			}),
		}
	}

	/// Blocks while the queue is full. An item larger than the whole queue
	/// is accepted once the queue is empty.
	pub fn push(&self, item: QueueItem) -> Result<()> {
		let size = item.bytes();
		let mut state = self.inner.state.lock();
		while state.bytes > 0 && state.bytes + size > self.inner.capacity {
			if self.inner.cancel.is_cancelled() {
				return Err(Error::Canceled);
			}
			self.inner.not_full.wait_for(&mut state, WAKE_INTERVAL);
		}
		if self.inner.cancel.is_cancelled() {
			return Err(Error::Canceled);
		}

		if let QueueItem::Close(marker) = &item {
			*state.pending_closes.entry(marker.shard).or_default() += 1;
		}
		state.bytes += size;
		state.items.push_back(item);
		self.inner.not_empty.notify_one();
		Ok(())
	}

	/// Next item, or `None` when nothing arrived within `timeout`.
	pub fn pop(&self, timeout: Duration) -> Option<QueueItem> {
		let mut state = self.inner.state.lock();
		if state.items.is_empty() && !self.inner.cancel.is_cancelled() {
			self.inner.not_empty.wait_for(&mut state, timeout.min(WAKE_INTERVAL));
		}
		let item = state.take_front();
		if item.is_some() {
			self.inner.not_full.notify_all();
		}
		item
	}

	/// Pops the head only if it is a close marker.
	pub fn pop_control(&self) -> Option<CloseMarker> {
		let mut state = self.inner.state.lock();
		if !matches!(state.items.front(), Some(QueueItem::Close(_))) {
			return None;
		}
		match state.take_front() {
			Some(QueueItem::Close(marker)) => Some(marker),
			_ => None,
		}
	}

	pub fn pending_closes(&self, shard: ShardId) -> usize {
		self.inner.state.lock().pending_closes.get(&shard).copied().unwrap_or(0)
	}

	pub fn clear(&self) {
		let mut state = self.inner.state.lock();
		state.items.clear();
		state.bytes = 0;
		state.pending_closes.clear();
		self.inner.not_full.notify_all();
	}

	pub fn len(&self) -> usize {
		self.inner.state.lock().items.len()
	}

	pub fn bytes(&self) -> usize {
		self.inner.state.lock().bytes
	}
}
