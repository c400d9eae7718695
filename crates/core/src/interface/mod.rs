// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Collaborators the pipeline calls but does not implement: the log
//! transport, cluster topology, the table catalog, the database directory
//! of a shard and the checkpoint table backend.

pub use catalog::*;
pub use checkpoint::*;
pub use directory::*;
pub use filter::*;
pub use topology::*;
pub use transport::*;

mod catalog;
mod checkpoint;
mod directory;
mod filter;
mod topology;
mod transport;
