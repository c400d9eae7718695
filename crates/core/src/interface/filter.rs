// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Source-side record filter and its change protocol.
//!
//! Change requests travel in-band over the same connection as the records
//! they filter, so a transport can carry these messages verbatim.

use serde::{Deserialize, Serialize};
use shardstream_type::{LogPosition, TableId};
use uuid::Uuid;

use crate::{record::LogRecord, row::TableMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterChangeRequest {
	Add {
		request_id: Uuid,
		table_name: String,
		root_table_id: TableId,
		table_id: TableId,
		key_count: usize,
		skip_count: usize,
	},
	Remove {
		request_id: Uuid,
		table_name: String,
		root_table_id: TableId,
		table_id: TableId,
	},
}

impl FilterChangeRequest {
	pub fn add(table: &TableMetadata) -> Self {
		FilterChangeRequest::Add {
			request_id: Uuid::now_v7(),
			table_name: table.name.clone(),
			root_table_id: table.root_id,
			table_id: table.id,
			key_count: table.key_columns.len(),
			skip_count: table.skip,
		}
	}

	pub fn remove(table: &TableMetadata) -> Self {
		FilterChangeRequest::Remove {
			request_id: Uuid::now_v7(),
			table_name: table.name.clone(),
			root_table_id: table.root_id,
			table_id: table.id,
		}
	}

	pub fn request_id(&self) -> Uuid {
		match self {
			FilterChangeRequest::Add {
				request_id,
				..
			}
			| FilterChangeRequest::Remove {
				request_id,
				..
			} => *request_id,
		}
	}

	pub fn table_name(&self) -> &str {
		match self {
			FilterChangeRequest::Add {
				table_name,
				..
			}
			| FilterChangeRequest::Remove {
				table_name,
				..
			} => table_name,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterChangeStatus {
	Ok,
	/// The change would not alter the filter.
	NotApplicable,
	Fail,
	Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterChangeResponse {
	pub request_id: Uuid,
	pub status: FilterChangeStatus,
	/// First position filtered under the new predicate.
	pub effective_position: Option<LogPosition>,
	pub message: String,
}

impl FilterChangeResponse {
	pub fn new(request_id: Uuid, status: FilterChangeStatus, message: impl Into<String>) -> Self {
		Self {
			request_id,
			status,
			effective_position: None,
			message: message.into(),
		}
	}

	pub fn with_effective_position(mut self, position: LogPosition) -> Self {
		self.effective_position = Some(position);
		self
	}

	pub fn is_ok(&self) -> bool {
		self.status == FilterChangeStatus::Ok
	}
}

/// Predicate evaluated on the log-producing side of a connection.
///
/// Evaluation and changes are mutually exclusive.
pub trait FeedFilter: Send + Sync {
	/// Returns true when `record` should cross the wire.
	fn evaluate(&self, record: &LogRecord) -> bool;

	fn apply_change(&self, request: &FilterChangeRequest) -> FilterChangeResponse;

	/// Forgets per-connection state before a connection is re-established.
	fn reset_stream(&self);
}
