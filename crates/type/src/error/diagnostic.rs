// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Stable diagnostic codes for stream errors.

use std::fmt::{self, Display, Formatter};

use super::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
	pub code: String,
	pub message: String,
	pub help: Option<String>,
	pub notes: Vec<String>,
}

impl Display for Diagnostic {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "[{}] {}", self.code, self.message)?;
		if let Some(help) = &self.help {
			write!(f, " (help: {})", help)?;
		}
		Ok(())
	}
}

impl Error {
	pub fn diagnostic(&self) -> Diagnostic {
		let (code, help, notes): (&str, Option<&str>, Vec<String>) = match self {
			Error::Config(_) => ("STREAM_001", Some("Check the subscription configuration"), vec![]),
			Error::InvalidDemand(_) => ("STREAM_002", Some("Request a positive number of operations"), vec![]),
			Error::Canceled => ("STREAM_003", None, vec![]),
			Error::ChangeRejected(_) => (
				"STREAM_004",
				Some("Retry once pending table changes complete"),
				vec!["A subscription to all tables cannot change its table set".to_string()],
			),
			Error::CheckpointInProgress => {
				("STREAM_005", Some("Wait for on_checkpoint_complete before checkpointing again"), vec![])
			}
			Error::CheckpointDisabled => {
				("STREAM_006", Some("Enable checkpoints in the subscription configuration"), vec![])
			}
			Error::InvalidCheckpoint(_) => (
				"STREAM_007",
				Some("A checkpoint must cover the subscribed shards and not exceed delivered positions"),
				vec![],
			),
			Error::TableNotFound(_) => ("STREAM_008", Some("The table may still be in creation"), vec![]),
			Error::Link {
				..
			} => ("STREAM_009", None, vec![]),
			Error::StaleSchema {
				..
			} => ("STREAM_010", Some("The table schema is refreshed from the catalog"), vec![]),
			Error::Store(_) => ("STREAM_011", Some("Check the backing store availability"), vec![]),
			Error::Timeout(_) => ("STREAM_012", None, vec![]),
			Error::InsufficientLog {
				..
			} => (
				"STREAM_013",
				Some("Restart the subscription from an earlier checkpoint or from the earliest position"),
				vec!["The source no longer retains the requested log entries".to_string()],
			),
			Error::Unauthorized(_) => ("STREAM_014", Some("Check the credentials used by the transport"), vec![]),
			Error::ReconnectExhausted {
				..
			} => ("STREAM_015", Some("Raise the reconnect attempt ceiling or check the shard"), vec![]),
			Error::Migration {
				..
			} => (
				"STREAM_016",
				Some("The previous owner of the partition did not checkpoint in time"),
				vec!["Streaming the new owner earlier would reorder the partition".to_string()],
			),
			Error::CheckpointFailed(_) => ("STREAM_017", Some("Check the checkpoint table"), vec![]),
			Error::Subscriber(_) => ("STREAM_018", Some("Subscriber callbacks must not panic"), vec![]),
			Error::Codec(_) => (
				"STREAM_019",
				Some("This may indicate data corruption or version mismatch"),
				vec![],
			),
			Error::Internal(_) => ("STREAM_020", None, vec![]),
		};

		Diagnostic {
			code: code.to_string(),
			message: self.to_string(),
			help: help.map(str::to_string),
			notes,
		}
	}
}
