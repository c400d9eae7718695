// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

pub mod error;
pub mod id;
pub mod position;

pub use error::{Error, ErrorKind, diagnostic::Diagnostic};
pub use id::{DatabaseId, Generation, LogPosition, PartitionId, RegionId, ShardId, TableId, TxnId};
pub use position::StreamPosition;

pub type Result<T> = std::result::Result<T, Error>;
