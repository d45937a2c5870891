// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{Annotation, Location, StepCategory, TestInfoError, TestStatus};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// Parameters a worker process is started with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInitParams {
    /// The index of this worker among all workers ever started for the run.
    pub worker_index: u32,

    /// The index of this worker among the workers running at the same time.
    pub parallel_index: u32,

    /// The repeat-each iteration this worker runs tests for.
    #[serde(default)]
    pub repeat_each_index: u32,

    /// The project whose configuration (timeouts, option overrides) applies.
    pub project_id: SmolStr,

    /// The shared configuration blob.
    pub config: serde_json::Value,
}

/// A request to run a group of tests from a single file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    /// The test file to load.
    pub file: Utf8PathBuf,

    /// The tests to run, in order.
    pub entries: Vec<RunEntry>,
}

/// A single test within a [`RunPayload`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEntry {
    /// The id of the test.
    pub test_id: String,

    /// The retry attempt, starting at 0.
    #[serde(default)]
    pub retry: u32,
}

/// An event produced by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// A test started.
    TestBegin(TestBeginPayload),

    /// A step started.
    StepBegin(StepBeginPayload),

    /// A step finished.
    StepEnd(StepEndPayload),

    /// An attachment was added to a test.
    Attach(AttachmentPayload),

    /// A test finished.
    TestEnd(TestEndPayload),

    /// The current test group finished.
    Done(DonePayload),

    /// Errors encountered while shutting the worker down.
    TeardownErrors(TeardownErrorsPayload),
}

impl WorkerEvent {
    /// Returns the id of the test this event is about, if any.
    pub fn test_id(&self) -> Option<&str> {
        match self {
            Self::TestBegin(p) => Some(&p.test_id),
            Self::StepBegin(p) => Some(&p.test_id),
            Self::StepEnd(p) => Some(&p.test_id),
            Self::Attach(p) => Some(&p.test_id),
            Self::TestEnd(p) => Some(&p.test_id),
            Self::Done(_) | Self::TeardownErrors(_) => None,
        }
    }
}

/// Payload for [`WorkerEvent::TestBegin`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBeginPayload {
    /// The id of the test.
    pub test_id: String,

    /// Wall-clock start time, in milliseconds since the Unix epoch.
    pub start_wall_time: i64,
}

/// Payload for [`WorkerEvent::StepBegin`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBeginPayload {
    /// The id of the test the step belongs to.
    pub test_id: String,

    /// The id of this step, unique within the test.
    pub step_id: String,

    /// The id of the enclosing step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,

    /// The step category.
    pub category: StepCategory,

    /// The step title.
    pub title: String,

    /// Wall-clock time, in milliseconds since the Unix epoch.
    pub wall_time: i64,

    /// Where the step is declared, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Payload for [`WorkerEvent::StepEnd`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEndPayload {
    /// The id of the test the step belongs to.
    pub test_id: String,

    /// The id of the step.
    pub step_id: String,

    /// Wall-clock time, in milliseconds since the Unix epoch.
    pub wall_time: i64,

    /// The error the step finished with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestInfoError>,
}

/// Payload for [`WorkerEvent::Attach`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    /// The id of the test the attachment belongs to.
    pub test_id: String,

    /// The attachment name.
    pub name: String,

    /// The MIME content type.
    pub content_type: String,

    /// A path to the attachment on disk, for file attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,

    /// The attachment body, for inline attachments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// The step the attachment was added in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Payload for [`WorkerEvent::TestEnd`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEndPayload {
    /// The id of the test.
    pub test_id: String,

    /// How long the test took.
    #[serde(with = "duration_millis")]
    pub duration: Duration,

    /// The status the test finished with.
    pub status: TestStatus,

    /// All errors attributed to the test.
    pub errors: Vec<TestInfoError>,

    /// The status the test was expected to finish with.
    pub expected_status: TestStatus,

    /// Static and runtime annotations.
    pub annotations: Vec<Annotation>,

    /// The effective test timeout. Zero means the timeout was disabled.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

/// Payload for [`WorkerEvent::Done`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    /// Errors that could not be attributed to any test.
    pub fatal_errors: Vec<TestInfoError>,

    /// Tests from the group that should be reported as skipped because a `beforeAll` hook or a
    /// modifier of their suite failed.
    pub skip_tests_due_to_setup_failure: Vec<String>,

    /// Set when none of the requested test ids could be found in the loaded file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_unknown_test_ids: Option<Vec<String>>,
}

/// Payload for [`WorkerEvent::TeardownErrors`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownErrorsPayload {
    /// Errors that occurred while shutting down.
    pub fatal_errors: Vec<TestInfoError>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
