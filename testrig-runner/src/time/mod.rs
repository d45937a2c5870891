// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time tracking and deadlines for tests, hooks and fixtures.

mod stopwatch;
mod timeout_manager;

pub(crate) use stopwatch::*;
pub use timeout_manager::*;
