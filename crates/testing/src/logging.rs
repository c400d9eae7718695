// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use tracing_subscriber::{EnvFilter, fmt};

/// Routes tracing output through the test harness. Filtered by `RUST_LOG`,
/// warnings only by default. Safe to call from every test.
pub fn init() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
	let _ = fmt().with_env_filter(filter).with_test_writer().with_target(false).try_init();
}
