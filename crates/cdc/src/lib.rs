// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Change data capture over the commit logs of a sharded key-value store.
//!
//! A subscription runs one consumer per assigned shard. Each consumer opens
//! a filtered log connection against the shard leader, reassembles
//! committed transactions and pushes the resulting operations into a
//! shared, byte-bounded delivery queue. A single worker drains the queue
//! against the subscriber's demand.
//!
//! Partition migrations are ordered through generation markers: a shard
//! taking over a partition waits until the previous owner delivered
//! everything up to its close marker.

mod consumer;
mod context;
mod publisher;
mod queue;
mod reassembler;
mod stats;
mod subscription;
mod tables;
mod tracker;

pub use context::StreamSources;
pub use stats::Statistics;
pub use subscription::{Subscriber, SubscriptionHandle, subscribe};
