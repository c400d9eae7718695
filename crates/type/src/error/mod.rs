// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Error taxonomy for the streaming pipeline.
//!
//! Every error belongs to one [`ErrorKind`]:
//! - `Config` errors are caller mistakes and are reported synchronously
//! - `Transient` errors are retried inside the component that raised them
//! - `Fatal` errors terminate the whole subscription

pub mod diagnostic;

use crate::{LogPosition, PartitionId, ShardId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Config,
	Transient,
	Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	Config(String),

	#[error("invalid demand {0}, request must be positive")]
	InvalidDemand(i64),

	#[error("subscription has been canceled")]
	Canceled,

	#[error("table change rejected: {0}")]
	ChangeRejected(String),

	#[error("a checkpoint is already in progress")]
	CheckpointInProgress,

	#[error("checkpointing is disabled for this subscription")]
	CheckpointDisabled,

	#[error("invalid checkpoint position: {0}")]
	InvalidCheckpoint(String),

	#[error("table not found: {0}")]
	TableNotFound(String),

	#[error("link to shard {shard} failed: {message}")]
	Link {
		shard: ShardId,
		message: String,
	},

	#[error("stale schema for table {table}: row version {found}, cached version {known}")]
	StaleSchema {
		table: String,
		found: u32,
		known: u32,
	},

	#[error("store error: {0}")]
	Store(String),

	#[error("timed out: {0}")]
	Timeout(String),

	#[error("shard {shard} no longer retains position {requested}, earliest retained is {earliest}")]
	InsufficientLog {
		shard: ShardId,
		requested: LogPosition,
		earliest: LogPosition,
	},

	#[error("not authorized: {0}")]
	Unauthorized(String),

	#[error("shard {shard} unreachable after {attempts} reconnect attempts")]
	ReconnectExhausted {
		shard: ShardId,
		attempts: u32,
	},

	#[error("shard {shard} gave up waiting for partition {partition} to migrate: {message}")]
	Migration {
		shard: ShardId,
		partition: PartitionId,
		message: String,
	},

	#[error("checkpoint failed: {0}")]
	CheckpointFailed(String),

	#[error("subscriber callback failed: {0}")]
	Subscriber(String),

	#[error("codec error: {0}")]
	Codec(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::Config(_)
			| Error::InvalidDemand(_)
			| Error::Canceled
			| Error::ChangeRejected(_)
			| Error::CheckpointInProgress
			| Error::CheckpointDisabled
			| Error::InvalidCheckpoint(_) => ErrorKind::Config,
			Error::TableNotFound(_)
			| Error::Link {
				..
			}
			| Error::StaleSchema {
				..
			}
			| Error::Store(_)
			| Error::Timeout(_) => ErrorKind::Transient,
			Error::InsufficientLog {
				..
			}
			| Error::Unauthorized(_)
			| Error::ReconnectExhausted {
				..
			}
			| Error::Migration {
				..
			}
			| Error::CheckpointFailed(_)
			| Error::Subscriber(_)
			| Error::Codec(_)
			| Error::Internal(_) => ErrorKind::Fatal,
		}
	}

	#[inline]
	pub fn is_transient(&self) -> bool {
		self.kind() == ErrorKind::Transient
	}

	#[inline]
	pub fn is_fatal(&self) -> bool {
		self.kind() == ErrorKind::Fatal
	}

	pub fn store(msg: impl Into<String>) -> Self {
		Error::Store(msg.into())
	}

	pub fn codec(msg: impl Into<String>) -> Self {
		Error::Codec(msg.into())
	}

	pub fn internal(msg: impl Into<String>) -> Self {
		Error::Internal(msg.into())
	}

	pub fn config(msg: impl Into<String>) -> Self {
		Error::Config(msg.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_kind_classification() {
		assert_eq!(Error::InvalidDemand(0).kind(), ErrorKind::Config);
		assert_eq!(Error::TableNotFound("ckpt".into()).kind(), ErrorKind::Transient);
		assert!(Error::Unauthorized("denied".into()).is_fatal());
		assert!(
			Error::Link {
				shard: ShardId(1),
				message: "reset".into()
			}
			.is_transient()
		);
	}

	#[test]
	fn test_display_insufficient_log() {
		let err = Error::InsufficientLog {
			shard: ShardId(3),
			requested: LogPosition(10),
			earliest: LogPosition(42),
		};
		assert_eq!(err.to_string(), "shard rg3 no longer retains position 10, earliest retained is 42");
	}
}
