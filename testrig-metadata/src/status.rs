// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::Location;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// The status of a single test execution.
///
/// The same type is used for the status a test actually finished with and for the status it was
/// expected to finish with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    /// The test passed.
    #[default]
    Passed,

    /// The test failed.
    Failed,

    /// The test ran out of time.
    TimedOut,

    /// The test was skipped.
    Skipped,

    /// The test was interrupted because its worker was asked to stop.
    Interrupted,
}

impl TestStatus {
    /// Returns the string form used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timedOut",
            Self::Skipped => "skipped",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An annotation attached to a test, either declared statically or added at runtime by a
/// modifier such as `skip` or `slow`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// The annotation type, e.g. `skip`, `fixme`, `fail`, `slow` or a user-defined type.
    #[serde(rename = "type")]
    pub kind: SmolStr,

    /// An optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Where the annotation was added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Annotation {
    /// Creates a new annotation of the given type.
    pub fn new(kind: impl Into<SmolStr>) -> Self {
        Self {
            kind: kind.into(),
            description: None,
            location: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Sets the location.
    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }
}

/// A serialized error attributed to a test, a step, or the worker as a whole.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestInfoError {
    /// The error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// A stack-like rendering of the error, including its location when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Where the error was raised, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl TestInfoError {
    /// Creates an error with just a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stack: None,
            location: None,
        }
    }

    /// Returns the message, or an empty string if there isn't one.
    pub fn message_str(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// The category of a step reported through `stepBegin`/`stepEnd`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StepCategory {
    /// A hook, a hooks group, or worker cleanup.
    #[serde(rename = "hook")]
    Hook,

    /// Fixture setup or teardown.
    #[serde(rename = "fixture")]
    Fixture,

    /// A user-defined step.
    #[serde(rename = "test.step")]
    TestStep,

    /// An attachment being added.
    #[serde(rename = "test.attach")]
    Attach,
}

impl StepCategory {
    /// Returns the string form used on the wire, also used as the prefix of step ids.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hook => "hook",
            Self::Fixture => "fixture",
            Self::TestStep => "test.step",
            Self::Attach => "test.attach",
        }
    }

    /// Returns true for the categories that form the fixed hook/fixture hierarchy.
    pub fn is_predefined(self) -> bool {
        matches!(self, Self::Hook | Self::Fixture)
    }
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
