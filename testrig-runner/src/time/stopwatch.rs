// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wall-clock timestamps for events.
//!
//! Durations are measured against time slots on tokio's monotonic clock. Events additionally carry
//! realtime timestamps, which come from here.

use chrono::{DateTime, Utc};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart {
        start_time: Utc::now(),
    }
}

/// The realtime start of a test.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Utc>,
}

impl StopwatchStart {
    pub(crate) fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

/// Milliseconds since the Unix epoch, as reported in step and test events.
pub(crate) fn wall_time_millis() -> i64 {
    Utc::now().timestamp_millis()
}
