// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Checkpoint persistence.
//!
//! A checkpoint table holds one row per `(subscription, shard_id)`. User
//! checkpoints use the shard id as is; internal migration checkpoints store
//! the negated shard id so both live side by side in the same table.

pub mod backend;
mod codec;
mod store;

pub use backend::{memory::MemoryCheckpointBackend, sqlite::SqliteCheckpointBackend};
pub use codec::{decode_shard, encode_shard};
pub use store::CheckpointStore;
