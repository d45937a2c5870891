// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{errors::TestError, worker::TestInfo};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::{
    any::{Any, type_name},
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};
use testrig_metadata::Location;

/// The lifetime of a fixture instance.
///
/// Scopes are ordered: a fixture may only depend on fixtures whose scope is at least as wide as
/// its own.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FixtureScope {
    /// Created per test and torn down after it.
    #[default]
    Test,

    /// Created once per worker and torn down when the worker shuts down.
    Worker,
}

impl FixtureScope {
    /// Returns the name of the scope.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a fixture is set up even when nothing asks for it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum FixtureAuto {
    /// Set up only on demand.
    #[default]
    Off,

    /// Set up for every test, and for `beforeAll`/`afterAll` hooks if worker-scoped.
    On,

    /// Set up for every test and for every hook, including `beforeAll`/`afterAll`.
    AllHooksIncluded,
}

impl FixtureAuto {
    /// Returns true unless this is [`FixtureAuto::Off`].
    pub fn is_auto(self) -> bool {
        self != Self::Off
    }
}

impl fmt::Display for FixtureAuto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("false"),
            Self::On => f.write_str("true"),
            Self::AllHooksIncluded => f.write_str("all-hooks-included"),
        }
    }
}

/// Options attached to a fixture definition.
///
/// A definition without options inherits the options of the fixture it overrides.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FixtureOptions {
    /// The fixture scope.
    pub scope: FixtureScope,

    /// Whether the fixture is set up automatically.
    pub auto: FixtureAuto,

    /// Whether the fixture is an option that can be overridden from project configuration.
    pub option: bool,

    /// A separate timeout for setup and for teardown of this fixture.
    pub timeout: Option<Duration>,

    /// The title to report in steps and messages instead of the fixture name.
    pub title: Option<String>,

    /// Whether setup and teardown are hidden from step reporting.
    pub boxed: bool,
}

impl FixtureOptions {
    /// Options for a worker-scoped fixture.
    pub fn worker() -> Self {
        Self {
            scope: FixtureScope::Worker,
            ..Self::default()
        }
    }

    /// Options for a test-scoped fixture.
    pub fn test() -> Self {
        Self::default()
    }

    /// Sets the auto mode.
    pub fn auto(mut self, auto: FixtureAuto) -> Self {
        self.auto = auto;
        self
    }

    /// Marks the fixture as an option.
    pub fn option(mut self) -> Self {
        self.option = true;
        self
    }

    /// Sets a separate timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets a custom title.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Hides the fixture from step reporting.
    pub fn boxed(mut self) -> Self {
        self.boxed = true;
        self
    }
}

/// An opaque fixture value, as provided by a fixture function or built from a plain value.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TestError>> + Send>;

/// The teardown half of a fixture function: runs once the value is no longer needed.
pub struct Teardown(TeardownFn);

impl Teardown {
    /// Creates a new teardown from an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TestError>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    pub(crate) fn run(self) -> BoxFuture<'static, Result<(), TestError>> {
        (self.0)()
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Teardown")
    }
}

/// What a fixture function provides: a value, and optionally the code that tears it down.
///
/// Setup and teardown are two halves of one value, so a fixture function can provide exactly
/// once.
#[derive(Debug)]
pub struct Provided {
    pub(crate) value: FixtureValue,
    pub(crate) teardown: Option<Teardown>,
}

impl Provided {
    /// Provides `value` with nothing to tear down.
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            teardown: None,
        }
    }

    /// Provides an already-shared value.
    pub fn shared(value: FixtureValue) -> Self {
        Self {
            value,
            teardown: None,
        }
    }

    /// Sets the teardown to run once the value is no longer needed.
    pub fn with_teardown<F, Fut>(mut self, teardown: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TestError>> + Send + 'static,
    {
        self.teardown = Some(Teardown::new(teardown));
        self
    }
}

type SetupFn =
    dyn Fn(Fixtures, TestInfo) -> BoxFuture<'static, Result<Provided, TestError>> + Send + Sync;

/// A fixture function: the names of the fixtures it depends on, plus an async setup.
///
/// Two `FixtureFn`s are the same function if one is a clone of the other.
#[derive(Clone)]
pub struct FixtureFn {
    deps: Vec<SmolStr>,
    setup: Arc<SetupFn>,
}

impl FixtureFn {
    /// Creates a new fixture function.
    pub fn new<I, S, F, Fut>(deps: I, setup: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
        F: Fn(Fixtures, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Provided, TestError>> + Send + 'static,
    {
        Self {
            deps: deps.into_iter().map(Into::into).collect(),
            setup: Arc::new(move |fixtures, info| Box::pin(setup(fixtures, info))),
        }
    }

    /// The declared dependencies, in declaration order.
    pub fn deps(&self) -> &[SmolStr] {
        &self.deps
    }

    pub(crate) fn call(
        &self,
        fixtures: Fixtures,
        info: TestInfo,
    ) -> BoxFuture<'static, Result<Provided, TestError>> {
        (self.setup)(fixtures, info)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.setup).cast::<()>() as usize
    }
}

impl fmt::Debug for FixtureFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureFn")
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// The body of a fixture definition.
#[derive(Clone, Debug)]
pub enum FixtureBody {
    /// A plain value.
    Value(serde_json::Value),

    /// A fixture function.
    Func(FixtureFn),

    /// For options: reset to the default value the option was originally declared with.
    Unset,
}

/// A single fixture definition within a [`FixtureList`].
#[derive(Clone, Debug)]
pub struct FixtureDef {
    pub(crate) body: FixtureBody,
    pub(crate) options: Option<FixtureOptions>,
}

impl FixtureDef {
    /// A plain value.
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Self {
            body: FixtureBody::Value(value.into()),
            options: None,
        }
    }

    /// A fixture function.
    pub fn func(func: FixtureFn) -> Self {
        Self {
            body: FixtureBody::Func(func),
            options: None,
        }
    }

    /// Resets an option to its declared default.
    pub fn unset() -> Self {
        Self {
            body: FixtureBody::Unset,
            options: None,
        }
    }

    /// Attaches options.
    pub fn with_options(mut self, options: FixtureOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub(crate) fn is_option(&self) -> bool {
        self.options.as_ref().is_some_and(|options| options.option)
    }
}

/// A group of fixture definitions contributed by one `extend()` or `use()` call.
#[derive(Clone, Debug)]
pub struct FixtureList {
    pub(crate) location: Location,
    pub(crate) fixtures: IndexMap<SmolStr, FixtureDef>,
}

impl FixtureList {
    /// Creates an empty list declared at `location`.
    pub fn new(location: Location) -> Self {
        Self {
            location,
            fixtures: IndexMap::new(),
        }
    }

    /// Adds a definition.
    pub fn fixture(mut self, name: impl Into<SmolStr>, def: FixtureDef) -> Self {
        self.fixtures.insert(name.into(), def);
        self
    }

    /// Where the list was declared.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Returns true if the list has no definitions.
    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }
}

/// The fixture values passed to a test, hook, modifier or fixture function, by name.
#[derive(Clone, Debug, Default)]
pub struct Fixtures {
    values: IndexMap<SmolStr, FixtureValue>,
}

impl Fixtures {
    pub(crate) fn insert(&mut self, name: SmolStr, value: FixtureValue) {
        self.values.insert(name, value);
    }

    /// Returns the value of `name` if it was provided and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.values.get(name)?.downcast_ref()
    }

    /// Returns a shared handle to the value of `name` if it was provided and has type `T`.
    pub fn get_arc<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.values.get(name)?.clone().downcast().ok()
    }

    /// Returns the value of `name`, or a failure if it is missing or has another type.
    pub fn require<T: Any + Send + Sync>(&self, name: &str) -> Result<&T, TestError> {
        self.get(name).ok_or_else(|| {
            TestError::failure(format!(
                "fixture \"{name}\" is not available as {}",
                type_name::<T>()
            ))
        })
    }

    /// Returns the value of a fixture defined as a plain value, such as an option.
    pub fn json(&self, name: &str) -> Option<&serde_json::Value> {
        self.get(name)
    }

    /// Returns true if `name` was provided.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// The provided names, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(SmolStr::as_str)
    }

    /// The number of provided values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was provided.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
