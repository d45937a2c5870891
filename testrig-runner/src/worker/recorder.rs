// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::TestInfo;
use crate::errors::TestError;
use futures::future::BoxFuture;

/// Records traces of tests.
///
/// The worker calls the recorder at the start and end of every test it runs. The trace mode is
/// the value of the `trace` option fixture; what it means, and the format of whatever gets
/// recorded, is up to the implementation.
pub trait TraceRecorder: Send {
    /// Starts recording for `info` if `mode` asks for it.
    fn start_if_needed<'a>(
        &'a mut self,
        mode: &'a serde_json::Value,
        info: &'a TestInfo,
    ) -> BoxFuture<'a, Result<(), TestError>>;

    /// Stops recording for `info`, if it was started.
    fn stop_if_needed<'a>(&'a mut self, info: &'a TestInfo)
    -> BoxFuture<'a, Result<(), TestError>>;
}

/// A [`TraceRecorder`] that never records anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecorder;

impl TraceRecorder for NoopRecorder {
    fn start_if_needed<'a>(
        &'a mut self,
        _mode: &'a serde_json::Value,
        _info: &'a TestInfo,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        Box::pin(async { Ok(()) })
    }

    fn stop_if_needed<'a>(
        &'a mut self,
        _info: &'a TestInfo,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        Box::pin(async { Ok(()) })
    }
}
