// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// A cancellation token for signalling shutdown to worker threads.
///
/// Clones share state. Sleeping through the token wakes up as soon as it is
/// cancelled instead of waiting out the full duration.
#[derive(Clone, Debug)]
pub struct CancellationToken {
	inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
	cancelled: AtomicBool,
	lock: Mutex<()>,
	cond: Condvar,
}

impl CancellationToken {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				cancelled: AtomicBool::new(false),
				lock: Mutex::new(()),
				cond: Condvar::new(),
			}),
		}
	}

	/// Signal cancellation. Returns true for the call that flipped the flag.
	pub fn cancel(&self) -> bool {
		let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
		let _guard = self.inner.lock.lock();
		self.inner.cond.notify_all();
		first
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.cancelled.load(Ordering::SeqCst)
	}

	/// Sleeps for `duration`. Returns false if the token was cancelled
	/// before or during the sleep.
	pub fn sleep(&self, duration: Duration) -> bool {
		let deadline = Instant::now() + duration;
		let mut guard = self.inner.lock.lock();
		while !self.is_cancelled() {
			if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
				return !self.is_cancelled();
			}
		}
		false
	}
}

impl Default for CancellationToken {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;

	#[test]
	fn test_cancel_once() {
		let token = CancellationToken::new();
		assert!(token.cancel());
		assert!(!token.cancel());
		assert!(token.clone().is_cancelled());
	}

	#[test]
	fn test_sleep_runs_full_duration() {
		let token = CancellationToken::new();
		let start = Instant::now();
		assert!(token.sleep(Duration::from_millis(20)));
		assert!(start.elapsed() >= Duration::from_millis(20));
	}

	#[test]
	fn test_cancel_wakes_sleeper() {
		let token = CancellationToken::new();
		let sleeper = token.clone();
		let handle = thread::spawn(move || {
			let start = Instant::now();
			let completed = sleeper.sleep(Duration::from_secs(30));
			(completed, start.elapsed())
		});

		thread::sleep(Duration::from_millis(20));
		token.cancel();
		let (completed, elapsed) = handle.join().unwrap();
		assert!(!completed);
		assert!(elapsed < Duration::from_secs(5));
	}
}
