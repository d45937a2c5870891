// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The tests, suites and hooks of a loaded test file.
//!
//! Suites form a tree, stored as an arena in a [`SuiteTree`] and addressed by [`SuiteId`]. The
//! root suite represents the file itself.

use crate::{
    errors::{TestError, TestFileLoadError},
    fixtures::{FixtureList, FixturePool, Fixtures},
    time::RunnableType,
    worker::TestInfo,
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use smol_str::SmolStr;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use testrig_metadata::{Annotation, Location, TestStatus};

type BodyFn<T> =
    dyn Fn(Fixtures, TestInfo) -> BoxFuture<'static, Result<T, TestError>> + Send + Sync;

/// A test body, hook or modifier: the names of the fixtures it takes, plus an async body.
///
/// Modifiers return a `bool` condition; everything else returns `()`.
pub struct TestFunction<T = ()> {
    deps: Vec<SmolStr>,
    body: Arc<BodyFn<T>>,
}

impl<T: Send + 'static> TestFunction<T> {
    /// Creates a new function.
    pub fn new<I, S, F, Fut>(deps: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
        F: Fn(Fixtures, TestInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TestError>> + Send + 'static,
    {
        Self {
            deps: deps.into_iter().map(Into::into).collect(),
            body: Arc::new(move |fixtures, info| Box::pin(body(fixtures, info))),
        }
    }

    /// The declared parameters, in declaration order.
    pub fn deps(&self) -> &[SmolStr] {
        &self.deps
    }

    pub(crate) fn call(
        &self,
        fixtures: Fixtures,
        info: TestInfo,
    ) -> BoxFuture<'static, Result<T, TestError>> {
        (self.body)(fixtures, info)
    }
}

impl<T> Clone for TestFunction<T> {
    fn clone(&self) -> Self {
        Self {
            deps: self.deps.clone(),
            body: self.body.clone(),
        }
    }
}

impl<T> fmt::Debug for TestFunction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestFunction")
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// The fixture lists of a test type, i.e. a base test extended with fixtures.
///
/// Tests that share an `Arc<TestType>` share a base fixture pool.
#[derive(Clone, Debug, Default)]
pub struct TestType {
    fixtures: Vec<FixtureList>,
}

impl TestType {
    /// Creates a test type from fixture lists, base first.
    pub fn new(fixtures: Vec<FixtureList>) -> Self {
        Self { fixtures }
    }

    /// Returns a new test type with `list` added on top.
    pub fn extend(&self, list: FixtureList) -> Self {
        let mut fixtures = self.fixtures.clone();
        fixtures.push(list);
        Self { fixtures }
    }

    /// The fixture lists, base first.
    pub fn fixtures(&self) -> &[FixtureList] {
        &self.fixtures
    }
}

/// The kind of a hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HookKind {
    /// Runs once before the tests of a suite.
    BeforeAll,
    /// Runs once after the tests of a suite.
    AfterAll,
    /// Runs before each test of a suite.
    BeforeEach,
    /// Runs after each test of a suite.
    AfterEach,
}

impl HookKind {
    /// The runnable type used for timing the hook.
    pub fn runnable_type(self) -> RunnableType {
        match self {
            Self::BeforeAll => RunnableType::BeforeAll,
            Self::AfterAll => RunnableType::AfterAll,
            Self::BeforeEach => RunnableType::BeforeEach,
            Self::AfterEach => RunnableType::AfterEach,
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.runnable_type().as_str())
    }
}

/// A hook declared in a suite.
#[derive(Clone, Debug)]
pub struct Hook {
    /// The kind of hook.
    pub kind: HookKind,
    /// The title reported for the hook's step.
    pub title: String,
    /// Where the hook was declared.
    pub location: Location,
    /// The hook body.
    pub func: TestFunction,
}

impl Hook {
    /// Creates a hook titled after its kind.
    pub fn new(kind: HookKind, location: Location, func: TestFunction) -> Self {
        Self {
            kind,
            title: format!("{kind} hook"),
            location,
            func,
        }
    }

    /// Sets a custom title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// The kind of a conditional modifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ModifierKind {
    /// Skip the test.
    Skip,
    /// Skip the test, marking it as needing a fix.
    Fixme,
    /// Expect the test to fail.
    Fail,
    /// Triple the test's remaining time.
    Slow,
}

impl ModifierKind {
    /// The annotation type recorded when the modifier applies.
    pub fn as_str(self) -> &'static str {
        self.runnable_type().as_str()
    }

    /// The runnable type used for timing the modifier.
    pub fn runnable_type(self) -> RunnableType {
        match self {
            Self::Skip => RunnableType::Skip,
            Self::Fixme => RunnableType::Fixme,
            Self::Fail => RunnableType::Fail,
            Self::Slow => RunnableType::Slow,
        }
    }
}

impl fmt::Display for ModifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A modifier declared in a suite, applied to each of its tests when its condition holds.
#[derive(Clone, Debug)]
pub struct Modifier {
    /// What the modifier does.
    pub kind: ModifierKind,
    /// The description recorded in the annotation.
    pub description: Option<String>,
    /// Where the modifier was declared.
    pub location: Location,
    /// Computes the condition.
    pub func: TestFunction<bool>,
}

/// Identifies a suite within a [`SuiteTree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SuiteId(usize);

/// Identifies a test within a [`SuiteTree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TestIndex(usize);

/// The kind of a suite.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SuiteKind {
    /// The root suite of a test file.
    File,
    /// A describe group.
    Describe,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SuiteEntry {
    Suite(SuiteId),
    Test(TestIndex),
}

/// A suite: the file root or a describe group.
#[derive(Clone, Debug)]
pub struct Suite {
    title: String,
    kind: SuiteKind,
    location: Option<Location>,
    parent: Option<SuiteId>,
    uses: Vec<FixtureList>,
    hooks: Vec<Hook>,
    modifiers: Vec<Modifier>,
    entries: Vec<SuiteEntry>,
}

impl Suite {
    fn new(
        title: String,
        kind: SuiteKind,
        location: Option<Location>,
        parent: Option<SuiteId>,
    ) -> Self {
        Self {
            title,
            kind,
            location,
            parent,
            uses: Vec::new(),
            hooks: Vec::new(),
            modifiers: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// The suite title. Empty for anonymous describe groups.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The kind of suite.
    pub fn kind(&self) -> SuiteKind {
        self.kind
    }

    /// Where the suite was declared.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// The parent suite. `None` for the root.
    pub fn parent(&self) -> Option<SuiteId> {
        self.parent
    }

    /// Fixture lists from `use()` calls, in declaration order.
    pub fn uses(&self) -> &[FixtureList] {
        &self.uses
    }

    /// Hooks, in declaration order.
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Modifiers, in declaration order.
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }
}

/// A single test.
#[derive(Clone, Debug)]
pub struct TestCase {
    id: String,
    title: String,
    location: Location,
    parent: Option<SuiteId>,
    test_type: Arc<TestType>,
    func: TestFunction,
    timeout: Option<Duration>,
    annotations: Vec<Annotation>,
    expected_status: TestStatus,
    pool: Option<Arc<FixturePool>>,
}

impl TestCase {
    /// Creates a new test.
    pub fn new(
        test_type: Arc<TestType>,
        id: impl Into<String>,
        title: impl Into<String>,
        location: Location,
        func: TestFunction,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            location,
            parent: None,
            test_type,
            func,
            timeout: None,
            annotations: Vec::new(),
            expected_status: TestStatus::Passed,
            pool: None,
        }
    }

    /// Overrides the project timeout for this test.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a static annotation, e.g. from a `test.skip()` declaration.
    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// Sets the status the test is expected to finish with.
    pub fn with_expected_status(mut self, status: TestStatus) -> Self {
        self.expected_status = status;
        self
    }

    /// The test id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The test title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Where the test was declared.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The test type.
    pub fn test_type(&self) -> &Arc<TestType> {
        &self.test_type
    }

    /// The test body.
    pub fn func(&self) -> &TestFunction {
        &self.func
    }

    /// The per-test timeout override, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Static annotations.
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// The status the test is expected to finish with.
    pub fn expected_status(&self) -> TestStatus {
        self.expected_status
    }

    /// The fixture pool, once built by a [`PoolBuilder`](crate::fixtures::PoolBuilder).
    pub fn pool(&self) -> Option<&Arc<FixturePool>> {
        self.pool.as_ref()
    }

    pub(crate) fn set_pool(&mut self, pool: Arc<FixturePool>) {
        self.pool = Some(pool);
    }
}

/// The suites and tests of one test file.
#[derive(Clone, Debug)]
pub struct SuiteTree {
    file: Utf8PathBuf,
    suites: Vec<Suite>,
    tests: Vec<TestCase>,
}

impl SuiteTree {
    /// Creates a tree with just the root suite for `file`.
    pub fn new(file: impl Into<Utf8PathBuf>) -> Self {
        let file = file.into();
        let root = Suite::new(file.to_string(), SuiteKind::File, None, None);
        Self {
            file,
            suites: vec![root],
            tests: Vec::new(),
        }
    }

    /// The test file.
    pub fn file(&self) -> &Utf8Path {
        &self.file
    }

    /// The root suite.
    pub fn root(&self) -> SuiteId {
        SuiteId(0)
    }

    /// Adds a describe group to `parent`.
    pub fn add_describe(
        &mut self,
        parent: SuiteId,
        title: impl Into<String>,
        location: Location,
    ) -> SuiteId {
        let id = SuiteId(self.suites.len());
        self.suites.push(Suite::new(
            title.into(),
            SuiteKind::Describe,
            Some(location),
            Some(parent),
        ));
        self.suites[parent.0].entries.push(SuiteEntry::Suite(id));
        id
    }

    /// Adds a test to `parent`.
    pub fn add_test(&mut self, parent: SuiteId, mut test: TestCase) -> TestIndex {
        let index = TestIndex(self.tests.len());
        test.parent = Some(parent);
        self.tests.push(test);
        self.suites[parent.0].entries.push(SuiteEntry::Test(index));
        index
    }

    /// Adds a hook to `suite`.
    pub fn add_hook(&mut self, suite: SuiteId, hook: Hook) {
        self.suites[suite.0].hooks.push(hook);
    }

    /// Adds a modifier to `suite`.
    pub fn add_modifier(&mut self, suite: SuiteId, modifier: Modifier) {
        self.suites[suite.0].modifiers.push(modifier);
    }

    /// Adds the fixture list of a `use()` call to `suite`.
    pub fn add_use(&mut self, suite: SuiteId, list: FixtureList) {
        self.suites[suite.0].uses.push(list);
    }

    /// Returns a suite.
    pub fn suite(&self, id: SuiteId) -> &Suite {
        &self.suites[id.0]
    }

    /// Returns a test.
    pub fn test(&self, index: TestIndex) -> &TestCase {
        &self.tests[index.0]
    }

    pub(crate) fn test_mut(&mut self, index: TestIndex) -> &mut TestCase {
        &mut self.tests[index.0]
    }

    /// All tests, in declaration order.
    pub fn tests(&self) -> Vec<TestIndex> {
        self.tests_in_suite(self.root())
    }

    /// The tests in `suite` and its descendants, in declaration order.
    pub fn tests_in_suite(&self, suite: SuiteId) -> Vec<TestIndex> {
        let mut out = Vec::new();
        self.collect_tests(suite, &mut out);
        out
    }

    fn collect_tests(&self, suite: SuiteId, out: &mut Vec<TestIndex>) {
        for entry in &self.suites[suite.0].entries {
            match *entry {
                SuiteEntry::Suite(child) => self.collect_tests(child, out),
                SuiteEntry::Test(test) => out.push(test),
            }
        }
    }

    /// Looks up a test by id.
    pub fn find_test(&self, id: &str) -> Option<TestIndex> {
        self.tests().into_iter().find(|&index| self.test(index).id == id)
    }

    /// The suites enclosing a test, root first.
    pub fn ancestors(&self, test: TestIndex) -> Vec<SuiteId> {
        let mut suites = Vec::new();
        let mut current = self.tests[test.0].parent;
        while let Some(suite) = current {
            suites.push(suite);
            current = self.suites[suite.0].parent;
        }
        suites.reverse();
        suites
    }

    /// The titles of the describe groups enclosing a test, followed by the test title.
    pub fn title_path(&self, test: TestIndex) -> Vec<&str> {
        self.ancestors(test)
            .into_iter()
            .map(|suite| &self.suites[suite.0])
            .filter(|suite| suite.kind == SuiteKind::Describe && !suite.title.is_empty())
            .map(|suite| suite.title.as_str())
            .chain(std::iter::once(self.tests[test.0].title.as_str()))
            .collect()
    }

    /// Removes every test for which `keep` returns false, along with describe groups left
    /// without tests. Returns the number of remaining tests.
    pub fn retain_tests(&mut self, mut keep: impl FnMut(&TestCase) -> bool) -> usize {
        self.retain_in_suite(self.root(), &mut keep)
    }

    fn retain_in_suite(
        &mut self,
        suite: SuiteId,
        keep: &mut dyn FnMut(&TestCase) -> bool,
    ) -> usize {
        let entries = std::mem::take(&mut self.suites[suite.0].entries);
        let mut kept = Vec::with_capacity(entries.len());
        let mut count = 0;
        for entry in entries {
            match entry {
                SuiteEntry::Suite(child) => {
                    let child_count = self.retain_in_suite(child, keep);
                    if child_count > 0 {
                        count += child_count;
                        kept.push(entry);
                    }
                }
                SuiteEntry::Test(test) => {
                    if keep(&self.tests[test.0]) {
                        count += 1;
                        kept.push(entry);
                    }
                }
            }
        }
        self.suites[suite.0].entries = kept;
        count
    }
}

/// Loads test files into suite trees.
///
/// Implemented by whatever knows how to turn a test file into tests: the worker only sees the
/// resulting [`SuiteTree`].
pub trait TestLoader {
    /// Loads `file`.
    fn load_test_file(&self, file: &Utf8Path) -> Result<SuiteTree, TestFileLoadError>;
}
