// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker: runs groups of tests from a single file, one test at a time.
//!
//! Each test goes through the same stages: start tracing, before hooks (including fixture setup),
//! the test function, after hooks (including test-scope fixture teardown), worker cleanup if the
//! worker is stopping, and stop tracing. Stages report steps through [`WorkerEvent`]s and record
//! their errors on the [`TestInfo`] of the test.
//!
//! [`WorkerEvent`]: testrig_metadata::WorkerEvent

mod imp;
mod recorder;
mod test_info;

pub use imp::*;
pub use recorder::*;
pub use test_info::*;
