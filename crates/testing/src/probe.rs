// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use shardstream_cdc::{Subscriber, SubscriptionHandle};
use shardstream_core::{Error, Result, Row, StreamOperation, StreamPosition, StreamWarning};

use crate::util::wait::{DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT, wait_for_condition};

type NextHook = Box<dyn FnMut(&StreamOperation, &SubscriptionHandle) + Send>;

#[derive(Default)]
struct ProbeState {
	handle: Option<SubscriptionHandle>,
	operations: Vec<StreamOperation>,
	warnings: Vec<StreamWarning>,
	change_results: Vec<(String, Result<()>)>,
	checkpoints: Vec<Result<StreamPosition>>,
	error: Option<Error>,
	completed: bool,
	terminal_calls: u32,
}

/// Records every callback of a subscription. Clones observe the same
/// subscription; hand one clone to `subscribe` and keep another.
#[derive(Clone)]
pub struct SubscriberProbe {
	state: Arc<Mutex<ProbeState>>,
	hook: Arc<Mutex<Option<NextHook>>>,
	initial_demand: i64,
}

impl SubscriberProbe {
	/// Requests `initial_demand` operations on subscribe; zero requests
	/// nothing.
	pub fn new(initial_demand: i64) -> Self {
		Self {
			state: Arc::new(Mutex::new(ProbeState::default())),
			hook: Arc::new(Mutex::new(None)),
			initial_demand,
		}
	}

	/// Runs `hook` inside every `on_next`, after the operation was recorded.
	pub fn on_next(self, hook: impl FnMut(&StreamOperation, &SubscriptionHandle) + Send + 'static) -> Self {
		*self.hook.lock() = Some(Box::new(hook));
		self
	}

	pub fn handle(&self) -> Option<SubscriptionHandle> {
		self.state.lock().handle.clone()
	}

	pub fn operations(&self) -> Vec<StreamOperation> {
		self.state.lock().operations.clone()
	}

	/// Every delivered row, flattening transaction batches.
	pub fn rows(&self) -> Vec<Row> {
		fn collect(operation: &StreamOperation, rows: &mut Vec<Row>) {
			match operation {
				StreamOperation::Put {
					change,
					..
				}
				| StreamOperation::Delete {
					change,
					..
				} => rows.push(change.row.clone()),
				StreamOperation::Transaction {
					operations,
					..
				} => operations.iter().for_each(|op| collect(op, rows)),
			}
		}
		let mut rows = Vec::new();
		for operation in &self.state.lock().operations {
			collect(operation, &mut rows);
		}
		rows
	}

	pub fn warnings(&self) -> Vec<StreamWarning> {
		self.state.lock().warnings.clone()
	}

	pub fn change_results(&self) -> Vec<(String, Result<()>)> {
		self.state.lock().change_results.clone()
	}

	pub fn checkpoints(&self) -> Vec<Result<StreamPosition>> {
		self.state.lock().checkpoints.clone()
	}

	pub fn error(&self) -> Option<Error> {
		self.state.lock().error.clone()
	}

	pub fn is_completed(&self) -> bool {
		self.state.lock().completed
	}

	pub fn terminal_calls(&self) -> u32 {
		self.state.lock().terminal_calls
	}

	pub fn wait_for_operations(&self, count: usize) {
		self.wait_until(&format!("{} operations delivered", count), |s| s.operations.len() >= count);
	}

	pub fn wait_for_rows(&self, count: usize) {
		let probe = self.clone();
		wait_for_condition(
			|| probe.rows().len() >= count,
			DEFAULT_TIMEOUT,
			DEFAULT_POLL_INTERVAL,
			&format!("{} rows delivered", count),
		);
	}

	pub fn wait_for_warning(&self, matches: impl Fn(&StreamWarning) -> bool) {
		self.wait_until("matching warning", |s| s.warnings.iter().any(&matches));
	}

	pub fn wait_for_change_results(&self, count: usize) {
		self.wait_until(&format!("{} change results", count), |s| s.change_results.len() >= count);
	}

	pub fn wait_for_checkpoints(&self, count: usize) {
		self.wait_until(&format!("{} checkpoint completions", count), |s| s.checkpoints.len() >= count);
	}

	pub fn wait_for_termination(&self) {
		self.wait_until("terminal callback", |s| s.terminal_calls > 0);
	}

	/// Asserts that no further operation arrives within `period`.
	pub fn assert_quiet(&self, period: Duration) {
		let before = self.state.lock().operations.len();
		std::thread::sleep(period);
		assert_eq!(self.state.lock().operations.len(), before, "unexpected operations delivered");
	}

	fn wait_until(&self, message: &str, condition: impl Fn(&ProbeState) -> bool) {
		wait_for_condition(|| condition(&self.state.lock()), DEFAULT_TIMEOUT, DEFAULT_POLL_INTERVAL, message);
	}
}

impl Subscriber for SubscriberProbe {
	fn on_subscribe(&mut self, handle: SubscriptionHandle) {
		if self.initial_demand > 0 {
			let _ = handle.request(self.initial_demand);
		}
		self.state.lock().handle = Some(handle);
	}

	fn on_next(&mut self, operation: StreamOperation) {
		let handle = {
			let mut state = self.state.lock();
			state.operations.push(operation.clone());
			state.handle.clone()
		};
		if let (Some(hook), Some(handle)) = (self.hook.lock().as_mut(), handle) {
			hook(&operation, &handle);
		}
	}

	fn on_change_result(&mut self, table: &str, result: Result<()>) {
		self.state.lock().change_results.push((table.to_string(), result));
	}

	fn on_checkpoint_complete(&mut self, result: Result<StreamPosition>) {
		self.state.lock().checkpoints.push(result);
	}

	fn on_warn(&mut self, warning: StreamWarning) {
		self.state.lock().warnings.push(warning);
	}

	fn on_error(&mut self, error: Error) {
		let mut state = self.state.lock();
		state.error = Some(error);
		state.terminal_calls += 1;
	}

	fn on_complete(&mut self) {
		let mut state = self.state.lock();
		state.completed = true;
		state.terminal_calls += 1;
	}
}
