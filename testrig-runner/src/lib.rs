// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The execution core of a testrig worker.
//!
//! A worker process receives groups of tests from a single file and runs them one at a time. For
//! each test it resolves the test's fixtures against a validated [`FixturePool`], runs hooks and
//! the test body, tears fixtures down in dependency order, and enforces deadlines on every one
//! of these steps.
//!
//! The main entry point is [`WorkerMain`]. The pieces it is built from are usable on their own:
//!
//! * [`fixtures`]: fixture declarations, pools and the fixture runner.
//! * [`time`]: the timeout manager.
//! * [`suite`]: the model of a loaded test file.
//! * [`config`]: worker configuration.
//!
//! [`FixturePool`]: fixtures::FixturePool
//! [`WorkerMain`]: worker::WorkerMain

pub mod config;
pub mod errors;
pub mod fixtures;
mod helpers;
pub mod suite;
pub mod time;
pub mod worker;
