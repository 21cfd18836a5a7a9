// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Driver module - virtualization layer backends.

pub mod mock;
mod traits;
pub mod virsh;

pub use mock::MockDriver;
pub use traits::*;
pub use virsh::VirshDriver;
