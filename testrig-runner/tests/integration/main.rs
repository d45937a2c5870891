// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests that drive a worker through whole test groups.

mod fixtures;
mod lifecycle;
mod properties;
mod timeouts;
