// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testrig.

use camino::Utf8PathBuf;
use smol_str::SmolStr;
use std::{error, fmt};
use swrite::{SWrite, swrite};
use testrig_metadata::{Location, TestInfoError};
use thiserror::Error;

/// A problem found while building or validating a [`FixturePool`](crate::fixtures::FixturePool).
///
/// Load errors are collected rather than raised, so that a single load surfaces every problem at
/// once.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{message}")]
pub struct LoadError {
    message: String,
    location: Location,
}

impl LoadError {
    pub(crate) fn new(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the offending declaration lives.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Serializes this error for reporting.
    pub fn to_info_error(&self) -> TestInfoError {
        TestInfoError {
            message: Some(self.message.clone()),
            stack: Some(format!("{}\n    at {}", self.message, self.location)),
            location: Some(self.location.clone()),
        }
    }
}

/// The error returned when a pool is built without an error collector: the first load error,
/// annotated with the location it was found at.
#[derive(Clone, Debug, Error)]
#[error("{}\n    at {}", .error.message, .error.location)]
pub struct PoolConstructError {
    error: LoadError,
    // The total number of load errors found, including this one.
    total: usize,
}

impl PoolConstructError {
    pub(crate) fn new(error: LoadError, total: usize) -> Self {
        Self { error, total }
    }

    /// The first load error.
    pub fn load_error(&self) -> &LoadError {
        &self.error
    }

    /// The total number of load errors that were found.
    pub fn total(&self) -> usize {
        self.total
    }
}

/// An error returned by [`FixtureRunner::set_pool`](crate::fixtures::FixtureRunner::set_pool).
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum SetPoolError {
    /// Test-scope fixtures from the previous test were not torn down.
    #[error("Did not teardown test scope")]
    TestScopeNotClean,

    /// The new pool resolves worker fixtures differently while worker fixtures are still live.
    #[error(
        "Detected inconsistent fixture options (digest {previous} != {new}).\n\
         Most common mistakes that lead to this issue:\n  \
         - Calling use() outside of the test file, for example in a common helper.\n  \
         - One test file imports from another test file."
    )]
    InconsistentOptions {
        /// The digest of the pool currently in use.
        previous: String,
        /// The digest of the rejected pool.
        new: String,
    },
}

/// Whether a [`TimeoutError`] was caused by a deadline or by an explicit interruption.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimeoutErrorKind {
    /// The deadline of the running operation expired.
    Timeout,

    /// The running operation was interrupted because the worker is shutting down.
    Interrupted,
}

/// The error produced when the timeout manager cuts an operation short.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{message}")]
pub struct TimeoutError {
    kind: TimeoutErrorKind,
    message: String,
    location: Option<Location>,
}

impl TimeoutError {
    pub(crate) fn new(kind: TimeoutErrorKind, message: String, location: Option<Location>) -> Self {
        Self {
            kind,
            message,
            location,
        }
    }

    /// Whether this is a real timeout or an interruption.
    pub fn kind(&self) -> TimeoutErrorKind {
        self.kind
    }

    /// Returns true if the operation was interrupted rather than timed out.
    pub fn is_interrupt(&self) -> bool {
        self.kind == TimeoutErrorKind::Interrupted
    }

    /// The phase-specific message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The location of the runnable (or fixture) that ran out of time.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }
}

/// The signal used to stop a test, hook or modifier with the `skipped` status.
///
/// This is control flow, not a failure.
#[derive(Clone, Debug, Default, Eq, PartialEq, Error)]
#[error("Test is skipped: {}", .description.as_deref().unwrap_or_default())]
pub struct SkipSignal {
    description: Option<String>,
}

impl SkipSignal {
    pub(crate) fn new(description: Option<String>) -> Self {
        Self { description }
    }

    /// The description passed to `skip()` or `fixme()`.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// A failure raised by user code: a test body, a hook, a modifier or a fixture.
#[derive(Debug, Error)]
pub struct Failure {
    message: String,
    location: Option<Location>,
    is_assertion: bool,
    #[source]
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Failure {
    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the failure was raised, if known.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Returns true if this failure came from an assertion.
    pub fn is_assertion(&self) -> bool {
        self.is_assertion
    }
}

/// The error type for everything user code runs inside the test lifecycle.
#[derive(Debug, Error)]
pub enum TestError {
    /// The current test, hook or modifier asked to be skipped.
    #[error(transparent)]
    Skip(SkipSignal),

    /// The timeout manager cut the operation short.
    #[error(transparent)]
    Timeout(TimeoutError),

    /// User code failed.
    #[error(transparent)]
    Failure(Failure),
}

impl TestError {
    /// Creates a failure with the given message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(Failure {
            message: message.into(),
            location: None,
            is_assertion: false,
            source: None,
        })
    }

    /// Creates an assertion failure with the given message.
    ///
    /// Assertion failures are the only unhandled errors that let a test marked as failing keep
    /// running in the same worker.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Failure(Failure {
            message: message.into(),
            location: None,
            is_assertion: true,
            source: None,
        })
    }

    /// Wraps an arbitrary error as a failure.
    pub fn from_error(error: impl error::Error + Send + Sync + 'static) -> Self {
        Self::Failure(Failure {
            message: error.to_string(),
            location: None,
            is_assertion: false,
            source: Some(Box::new(error)),
        })
    }

    /// Creates the skip signal.
    pub fn skip(description: Option<String>) -> Self {
        Self::Skip(SkipSignal::new(description))
    }

    /// Attaches a location to a failure. Other kinds carry their own location and are returned
    /// unchanged.
    pub fn at(mut self, location: Location) -> Self {
        if let Self::Failure(failure) = &mut self {
            failure.location = Some(location);
        }
        self
    }

    /// Returns true for the skip signal.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }

    /// Returns true for timeouts and interruptions.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true for interruptions.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Timeout(error) if error.is_interrupt())
    }

    /// Returns true for assertion failures.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Self::Failure(failure) if failure.is_assertion)
    }

    /// Returns the location associated with this error, if any.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Skip(_) => None,
            Self::Timeout(error) => error.location(),
            Self::Failure(failure) => failure.location(),
        }
    }

    /// Serializes this error for reporting.
    pub fn to_info_error(&self) -> TestInfoError {
        let message = self.to_string();
        let stack = match self.location() {
            Some(location) => format!("{message}\n    at {location}"),
            None => message.clone(),
        };
        TestInfoError {
            message: Some(message),
            stack: Some(stack),
            location: self.location().cloned(),
        }
    }
}

impl From<TimeoutError> for TestError {
    fn from(error: TimeoutError) -> Self {
        Self::Timeout(error)
    }
}

impl From<SkipSignal> for TestError {
    fn from(signal: SkipSignal) -> Self {
        Self::Skip(signal)
    }
}

impl From<Failure> for TestError {
    fn from(failure: Failure) -> Self {
        Self::Failure(failure)
    }
}

/// An error that occurred while parsing the worker configuration from TOML sources.
#[derive(Debug, Error)]
#[error("failed to parse worker config{}", .config_file.as_ref().map(|f| format!(" at `{f}`")).unwrap_or_default())]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Option<Utf8PathBuf>,
    #[source]
    err: config::ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: Option<Utf8PathBuf>, err: config::ConfigError) -> Self {
        Self { config_file, err }
    }
}

/// An error that occurred while deserializing the shared configuration blob a worker is started
/// with.
#[derive(Debug, Error)]
#[error("failed to deserialize worker config blob")]
pub struct ConfigBlobError {
    #[source]
    err: serde_json::Error,
}

impl ConfigBlobError {
    pub(crate) fn new(err: serde_json::Error) -> Self {
        Self { err }
    }
}

/// The project a worker was started for is not present in the configuration.
#[derive(Clone, Debug, Error)]
#[error("project `{project_id}` not found (known projects: {})", .known.join(", "))]
pub struct ProjectNotFound {
    project_id: SmolStr,
    known: Vec<SmolStr>,
}

impl ProjectNotFound {
    pub(crate) fn new(project_id: SmolStr, known: impl IntoIterator<Item = SmolStr>) -> Self {
        let mut known: Vec<_> = known.into_iter().collect();
        known.sort_unstable();
        Self { project_id, known }
    }
}

/// An error returned by a [`TestLoader`](crate::suite::TestLoader).
#[derive(Debug, Error)]
#[error("failed to load test file `{file}`")]
pub struct TestFileLoadError {
    file: Utf8PathBuf,
    #[source]
    err: Box<dyn error::Error + Send + Sync>,
}

impl TestFileLoadError {
    /// Creates a new error for the given file.
    pub fn new(
        file: impl Into<Utf8PathBuf>,
        err: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            file: file.into(),
            err: err.into(),
        }
    }
}

/// An error that prevents a worker from running a test group at all.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerLoadError {
    /// The configuration blob could not be read.
    #[error(transparent)]
    ConfigBlob(#[from] ConfigBlobError),

    /// The configured project does not exist.
    #[error(transparent)]
    ProjectNotFound(#[from] ProjectNotFound),

    /// The test file failed to load.
    #[error(transparent)]
    TestFile(#[from] TestFileLoadError),

    /// A fixture pool for one of the tests failed to validate.
    #[error(transparent)]
    Pool(#[from] PoolConstructError),

    /// The fixture runner could not switch to the pool of the next test.
    #[error(transparent)]
    SetPool(#[from] SetPoolError),
}

impl WorkerLoadError {
    /// Serializes this error, including its chain of causes, for reporting.
    pub fn to_info_error(&self) -> TestInfoError {
        let mut message = self.to_string();
        let mut source = error::Error::source(self);
        while let Some(err) = source {
            swrite!(message, "\n  caused by: {err}");
            source = err.source();
        }
        TestInfoError::from_message(message)
    }
}
