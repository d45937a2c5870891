// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures: definitions, validated pools, and the runner that owns live instances.
//!
//! A test file declares fixtures in [`FixtureList`]s. A [`PoolBuilder`] combines the lists that
//! apply to each test into a [`FixturePool`], reporting any problems as
//! [`LoadError`](crate::errors::LoadError)s. At run time, a [`FixtureRunner`] sets up the fixtures
//! a function needs, keeps them alive for their scope, and tears them down dependents-first.

mod definition;
mod pool;
mod pool_builder;
mod runner;

pub use definition::*;
pub use pool::*;
pub use pool_builder::*;
pub use runner::*;
