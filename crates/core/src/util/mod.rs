// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

mod cancel;
mod clock;

pub use cancel::CancellationToken;
pub use clock::now_millis;
