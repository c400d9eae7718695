// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Test doubles for the store-facing interfaces of a subscription.

pub mod catalog;
pub mod logging;
pub mod probe;
pub mod store;
pub mod tempdir;
pub mod util;

pub use catalog::MemoryCatalog;
pub use probe::SubscriberProbe;
pub use store::{MemoryStore, TransactionBuilder};
