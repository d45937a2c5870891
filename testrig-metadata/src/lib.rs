// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable payloads exchanged between a testrig worker and the process that
//! orchestrates it.
//!
//! The worker consumes a [`RunPayload`] and produces a stream of [`WorkerEvent`]s. The transport
//! carrying these messages is not part of this crate: everything here is plain data that
//! serializes to JSON.

mod ipc;
mod location;
mod status;

pub use ipc::*;
pub use location::*;
pub use status::*;
