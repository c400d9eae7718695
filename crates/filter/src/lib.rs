// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Predicate installed at the log-producing side of a shard connection.
//!
//! The filter decides per record whether it crosses the wire: noise from
//! internal databases is dropped, migration markers always pass, data
//! records pass when their partition is owned and their key matches a
//! subscribed table, and transaction boundaries pass only for
//! transactions that produced a passing record.

mod blocked;
mod filter;
mod match_key;
mod stats;

pub use filter::{SourceFilter, TableSet};
pub use match_key::MatchKey;
pub use stats::{BlockReason, FilterStatistics};
