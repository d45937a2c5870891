// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker configuration.
//!
//! A worker receives its configuration as a JSON blob in [`WorkerInitParams`]. The same
//! configuration can also be read from TOML, layered on top of the default config and overridden
//! by `TESTRIG_` environment variables.
//!
//! [`WorkerInitParams`]: testrig_metadata::WorkerInitParams

mod imp;

pub use imp::*;
