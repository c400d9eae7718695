// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

pub mod config;
pub mod generation;
pub mod interface;
pub mod key;
pub mod operation;
pub mod ownership;
pub mod partition;
pub mod record;
pub mod row;
pub mod util;
pub mod warning;

pub use config::{StatReportInterval, StreamMode, SubscriptionConfig, SubscriptionConfigBuilder};
pub use generation::PartitionGeneration;
pub use operation::{RowChange, SequenceId, StreamOperation, TransactionKind};
pub use ownership::PartitionOwnership;
pub use record::{BeforeImage, LogRecord, RecordKind};
pub use row::{FieldValue, Row, TableMetadata};
pub use shardstream_type::{
	DatabaseId, Error, ErrorKind, Generation, LogPosition, PartitionId, RegionId, Result, ShardId, StreamPosition,
	TableId, TxnId,
};
pub use util::CancellationToken;
pub use warning::StreamWarning;
