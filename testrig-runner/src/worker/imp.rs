// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{NoopRecorder, TestInfo, TestInfoParams, TestStage, TraceRecorder};
use crate::{
    config::{DEFAULT_TIMEOUT, ProjectConfig, WorkerConfig},
    errors::{TestError, WorkerLoadError},
    fixtures::{AutoFixtures, FixtureBody, FixturePool, FixtureRunner, FixtureScope, PoolBuilder},
    helpers::{after_hooks_timeout, format_test_title, plural},
    suite::{HookKind, Modifier, SuiteId, SuiteTree, TestFunction, TestIndex, TestLoader},
    time::{RunnableDescription, RunnableType, TimeSlot},
};
use camino::Utf8Path;
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use swrite::{SWrite, swrite};
use testrig_metadata::{
    Annotation, DonePayload, Location, RunPayload, StepCategory, TeardownErrorsPayload,
    TestInfoError, TestStatus, WorkerEvent, WorkerInitParams,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument, warn};

/// A cloneable handle to a [`WorkerMain`], used to stop it and to report errors that happen
/// outside of its control flow.
#[derive(Clone, Debug, Default)]
pub struct WorkerHandle {
    state: Arc<Mutex<HandleState>>,
}

#[derive(Debug, Default)]
struct HandleState {
    stopped: bool,
    current_test: Option<TestInfo>,
    fatal_errors: Vec<TestInfoError>,
}

impl WorkerHandle {
    /// Asks the worker to stop, interrupting the current test.
    ///
    /// The worker finishes the current test (running its after hooks and a full cleanup) and
    /// does not start any more tests.
    pub fn stop(&self) {
        let current_test = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.current_test.clone()
        };
        if let Some(test) = current_test {
            debug!(test_id = %test.test_id(), "interrupting current test");
            test.interrupt();
        }
    }

    /// Returns true if the worker is stopping or has stopped.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Reports an error that escaped the control flow of the worker, e.g. from a background task
    /// started by a fixture.
    ///
    /// The error fails the current test. Without a current test it is a fatal worker error. In
    /// both cases the worker stops, unless the error is an assertion failure in a test that is
    /// expected to fail.
    pub fn unhandled_error(&self, error: &TestError) {
        let current_test = self.lock().current_test.clone();
        let Some(test) = current_test else {
            warn!(%error, "unhandled error outside of a test");
            {
                let mut state = self.lock();
                if state.fatal_errors.is_empty() {
                    state.fatal_errors.push(error.to_info_error());
                }
            }
            self.stop();
            return;
        };

        if test.set_has_unhandled_error() {
            test.fail_with_error(error);
        }
        let should_continue_in_this_worker =
            test.expected_status() == TestStatus::Failed && error.is_assertion();
        if !should_continue_in_this_worker {
            self.stop();
        }
    }

    fn mark_stopped(&self) {
        self.lock().stopped = true;
    }

    fn set_current_test(&self, test: Option<TestInfo>) {
        self.lock().current_test = test;
    }

    fn push_fatal_error(&self, error: TestInfoError) {
        self.lock().fatal_errors.push(error);
    }

    fn take_fatal_errors(&self) -> Vec<TestInfoError> {
        std::mem::take(&mut self.lock().fatal_errors)
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct LoadedProject {
    config: WorkerConfig,
    project: ProjectConfig,
    pool_builder: PoolBuilder,
}

impl LoadedProject {
    fn load(params: &WorkerInitParams) -> Result<Self, WorkerLoadError> {
        let config = WorkerConfig::from_blob(&params.config)?;
        let project = config.project(&params.project_id)?.clone();
        let pool_builder = PoolBuilder::for_worker(project.option_overrides());
        debug!(
            project = %project.id,
            timeout = ?project.timeout,
            debug = config.debug(),
            "loaded worker config",
        );
        Ok(Self {
            config,
            project,
            pool_builder,
        })
    }
}

// A hook or a modifier, ready to run.
#[derive(Debug)]
struct CollectedHook {
    runnable_type: RunnableType,
    title: String,
    location: Location,
    func: TestFunction,
}

/// Runs groups of tests in a single worker.
///
/// Fixture instances and the `beforeAll` state of suites carry over from one test to the next
/// within a group, and worker-scope fixtures carry over from one group to the next until the
/// worker stops.
#[derive(Debug)]
pub struct WorkerMain<L> {
    params: WorkerInitParams,
    loader: DebugIgnore<L>,
    events: UnboundedSender<WorkerEvent>,
    recorder: DebugIgnore<Box<dyn TraceRecorder>>,
    handle: WorkerHandle,
    loaded: Option<LoadedProject>,
    fixture_runner: FixtureRunner,
    skip_remaining_tests_in_suite: Option<SuiteId>,
    did_run_full_cleanup: bool,
    // Suites whose beforeAll hooks ran, with the annotations those hooks added.
    active_suites: IndexMap<SuiteId, Vec<Annotation>>,
    last_running_tests: VecDeque<String>,
    total_running_tests: usize,
}

impl<L: TestLoader> WorkerMain<L> {
    /// Creates a new worker. Events are sent to `events`.
    pub fn new(params: WorkerInitParams, loader: L, events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            params,
            loader: DebugIgnore(loader),
            events,
            recorder: DebugIgnore(Box::new(NoopRecorder)),
            handle: WorkerHandle::default(),
            loaded: None,
            fixture_runner: FixtureRunner::new(),
            skip_remaining_tests_in_suite: None,
            did_run_full_cleanup: false,
            active_suites: IndexMap::new(),
            last_running_tests: VecDeque::new(),
            total_running_tests: 0,
        }
    }

    /// Sets the trace recorder.
    pub fn with_recorder(mut self, recorder: impl TraceRecorder + 'static) -> Self {
        self.recorder = DebugIgnore(Box::new(recorder));
        self
    }

    /// Returns a handle to this worker.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// The fixture runner of this worker.
    pub fn fixture_runner(&self) -> &FixtureRunner {
        &self.fixture_runner
    }

    /// Runs the tests of `payload` in order, and finishes with a [`WorkerEvent::Done`] event.
    pub async fn run_test_group(&mut self, payload: RunPayload) {
        let mut entries: IndexMap<String, u32> = payload
            .entries
            .iter()
            .map(|entry| (entry.test_id.clone(), entry.retry))
            .collect();
        let mut tree = None;
        let mut fatal_unknown_test_ids = None;

        let result = match self.load_test_group(&payload.file, &entries) {
            Ok(Some(loaded)) => {
                let tree = tree.insert(loaded);
                self.run_tests(tree, &mut entries).await
            }
            Ok(None) => {
                warn!(file = %payload.file, "none of the requested tests were found");
                fatal_unknown_test_ids = Some(
                    payload
                        .entries
                        .iter()
                        .map(|entry| entry.test_id.clone())
                        .collect(),
                );
                self.handle.stop();
                Ok(())
            }
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            warn!(file = %payload.file, %error, "fatal error while running test group");
            self.handle.push_fatal_error(error.to_info_error());
            self.handle.stop();
        }

        let mut skip_tests_due_to_setup_failure = Vec::new();
        if let (Some(suite), Some(tree)) = (self.skip_remaining_tests_in_suite.take(), &tree) {
            for test in tree.tests_in_suite(suite) {
                let test_id = tree.test(test).id();
                if entries.contains_key(test_id) {
                    skip_tests_due_to_setup_failure.push(test_id.to_owned());
                }
            }
        }
        self.dispatch(WorkerEvent::Done(DonePayload {
            fatal_errors: self.handle.take_fatal_errors(),
            skip_tests_due_to_setup_failure,
            fatal_unknown_test_ids,
        }));
    }

    /// Stops the worker and tears down every remaining fixture.
    ///
    /// Emits a [`WorkerEvent::TeardownErrors`] event if there were fatal errors.
    pub async fn graceful_close(&mut self) {
        self.handle.stop();

        if let Err(error) = self.load_if_needed() {
            self.handle.push_fatal_error(error.to_info_error());
        }
        let info = TestInfo::new(TestInfoParams {
            worker_index: self.params.worker_index,
            parallel_index: self.params.parallel_index,
            project_name: self.project_name(),
            timeout: self.project_timeout(),
            ..Default::default()
        });
        if self.is_debug() {
            info.timeout_manager().set_ignore_timeouts(true);
        }

        // Errors are recorded on the test info.
        let runnable = RunnableDescription::new(RunnableType::Teardown);
        _ = self
            .fixture_runner
            .teardown_scope(FixtureScope::Test, &info, &runnable)
            .await;
        _ = self
            .fixture_runner
            .teardown_scope(FixtureScope::Worker, &info, &runnable)
            .await;
        for error in info.errors() {
            self.handle.push_fatal_error(error);
        }

        let mut fatal_errors = self.handle.take_fatal_errors();
        if let Some(last) = fatal_errors.last_mut() {
            self.append_process_teardown_diagnostics(last);
            debug!(count = fatal_errors.len(), "reporting teardown errors");
            self.dispatch(WorkerEvent::TeardownErrors(TeardownErrorsPayload { fatal_errors }));
        }
    }

    // ---
    // Helper methods
    // ---

    fn load_if_needed(&mut self) -> Result<&LoadedProject, WorkerLoadError> {
        let loaded = match self.loaded.take() {
            Some(loaded) => loaded,
            None => LoadedProject::load(&self.params)?,
        };
        Ok(self.loaded.insert(loaded))
    }

    fn load_test_group(
        &mut self,
        file: &Utf8Path,
        entries: &IndexMap<String, u32>,
    ) -> Result<Option<SuiteTree>, WorkerLoadError> {
        self.load_if_needed()?;
        let mut tree = self.loader.load_test_file(file)?;
        let remaining = tree.retain_tests(|test| entries.contains_key(test.id()));
        if remaining == 0 {
            return Ok(None);
        }
        if let Some(loaded) = &mut self.loaded {
            loaded.pool_builder.build_pools(&mut tree)?;
        }
        debug!(%file, tests = remaining, "loaded test group");
        Ok(Some(tree))
    }

    async fn run_tests(
        &mut self,
        tree: &SuiteTree,
        entries: &mut IndexMap<String, u32>,
    ) -> Result<(), WorkerLoadError> {
        self.active_suites.clear();
        self.did_run_full_cleanup = false;

        let tests = tree.tests();
        for (index, &test) in tests.iter().enumerate() {
            // Everything was cleaned up already, so there is nothing left to do.
            if self.handle.is_stopped() && self.did_run_full_cleanup {
                break;
            }
            let retry = entries.shift_remove(tree.test(test).id()).unwrap_or_default();
            // Boxed, since the whole lifecycle of a test makes for a large future.
            Box::pin(self.run_test(tree, test, retry, tests.get(index + 1).copied())).await?;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(test_id = %tree.test(test).id()))]
    async fn run_test(
        &mut self,
        tree: &SuiteTree,
        test: TestIndex,
        retry: u32,
        next_test: Option<TestIndex>,
    ) -> Result<(), WorkerLoadError> {
        let case = tree.test(test);
        let project_timeout = self.project_timeout();
        let project_name = self.project_name();
        let info = TestInfo::new(TestInfoParams {
            test_id: case.id().to_owned(),
            title: case.title().to_owned(),
            title_path: tree
                .title_path(test)
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
            location: Some(case.location().clone()),
            retry,
            worker_index: self.params.worker_index,
            parallel_index: self.params.parallel_index,
            project_name: project_name.clone(),
            timeout: case.timeout().unwrap_or(project_timeout),
            expected_status: case.expected_status(),
            events: Some(self.events.clone()),
        });
        if self.is_debug() {
            info.timeout_manager().set_ignore_timeouts(true);
        }

        if !self.handle.is_stopped()
            && let Some(pool) = case.pool()
        {
            self.fixture_runner.set_pool(pool.clone())?;
        }

        let suites = tree.ancestors(test);
        let reversed_suites: Vec<_> = suites.iter().rev().copied().collect();
        let next_suites: HashSet<_> = next_test
            .map(|next| tree.ancestors(next))
            .unwrap_or_default()
            .into_iter()
            .collect();

        for annotation in case.annotations() {
            info.process_annotation(annotation.clone());
        }
        // Annotations added by beforeAll hooks and modifiers of the enclosing suites.
        for suite in &suites {
            if let Some(extra) = self.active_suites.get(suite) {
                for annotation in extra.clone() {
                    info.process_annotation(annotation);
                }
            }
        }

        self.handle.set_current_test(Some(info.clone()));
        self.dispatch(WorkerEvent::TestBegin(info.test_begin_payload()));

        let is_skipped = info.expected_status() == TestStatus::Skipped;
        let has_after_all_to_run_before_next_test = reversed_suites.iter().any(|suite| {
            self.active_suites.contains_key(suite)
                && !next_suites.contains(suite)
                && tree
                    .suite(*suite)
                    .hooks()
                    .iter()
                    .any(|hook| hook.kind == HookKind::AfterAll)
        });
        if is_skipped && next_test.is_some() && !has_after_all_to_run_before_next_test {
            // The next test takes care of any cleanup.
            debug!("skipped without running hooks or fixtures");
            info.set_status(TestStatus::Skipped);
            self.handle.set_current_test(None);
            self.dispatch(WorkerEvent::TestEnd(info.test_end_payload()));
            return Ok(());
        }

        self.total_running_tests += 1;
        self.last_running_tests.push_back(format_test_title(
            &project_name,
            case.location(),
            &tree.title_path(test),
        ));
        let max_last_running_tests = self
            .loaded
            .as_ref()
            .map_or(10, |loaded| loaded.config.last_running_tests());
        while self.last_running_tests.len() > max_last_running_tests {
            self.last_running_tests.pop_front();
        }

        let mut should_run_after_each_hooks = false;
        info.set_allow_skips(true);
        // Errors are recorded on the test info.
        _ = info
            .run_as_stage(
                TestStage::new("setup and test"),
                Box::pin(self.setup_and_test(
                    tree,
                    test,
                    &info,
                    &suites,
                    is_skipped,
                    &mut should_run_after_each_hooks,
                )),
            )
            .await;

        // Available to fixture teardown and afterEach hooks.
        info.set_duration(info.timeout_manager().default_slot().elapsed());

        let after_hooks_slot = TimeSlot::new(after_hooks_timeout(project_timeout, info.timeout()));
        _ = info
            .run_as_stage(
                TestStage::new("After Hooks").with_step(StepCategory::Hook),
                Box::pin(self.after_hooks(
                    tree,
                    &info,
                    &reversed_suites,
                    &next_suites,
                    should_run_after_each_hooks,
                    &after_hooks_slot,
                )),
            )
            .await;

        if info.is_failure() {
            debug!(status = %info.status(), "test failed, stopping worker");
            self.handle.mark_stopped();
        }

        if self.handle.is_stopped() {
            // Set early so that cleanup never runs twice.
            self.did_run_full_cleanup = true;
            _ = info
                .run_as_stage(
                    TestStage::new("Worker Cleanup").with_step(StepCategory::Hook),
                    Box::pin(self.worker_cleanup(tree, &info, &reversed_suites, project_timeout)),
                )
                .await;
        }

        let tracing_slot = TimeSlot::new(project_timeout);
        _ = info
            .run_as_stage(
                TestStage::new("stop tracing").with_runnable(
                    RunnableDescription::new(RunnableType::Test).with_slot(Some(tracing_slot)),
                ),
                self.recorder.stop_if_needed(&info),
            )
            .await;

        info.set_duration(
            info.timeout_manager().default_slot().elapsed() + after_hooks_slot.elapsed(),
        );
        self.handle.set_current_test(None);
        self.dispatch(WorkerEvent::TestEnd(info.test_end_payload()));
        Ok(())
    }

    async fn setup_and_test(
        &mut self,
        tree: &SuiteTree,
        test: TestIndex,
        info: &TestInfo,
        suites: &[SuiteId],
        is_skipped: bool,
        should_run_after_each_hooks: &mut bool,
    ) -> Result<(), TestError> {
        let case = tree.test(test);
        info.run_as_stage(
            TestStage::new("start tracing")
                .with_runnable(RunnableDescription::new(RunnableType::Test)),
            start_tracing(&mut self.recorder, case.pool().map(|pool| &**pool), info),
        )
        .await?;

        if self.handle.is_stopped() || is_skipped {
            // Either this is the last test and it is skipped, or the worker is stopping before
            // it ran its full cleanup. Either way the cleanup below still has to run.
            info.set_status(TestStatus::Skipped);
            return Ok(());
        }

        let params = info
            .run_as_stage(
                TestStage::new("Before Hooks").with_step(StepCategory::Hook),
                Box::pin(async {
                    for &suite in suites {
                        self.run_before_all_hooks_for_suite(tree, suite, info).await?;
                    }

                    // Once beforeEach hooks started, every afterEach hook must run as well.
                    *should_run_after_each_hooks = true;
                    self.run_each_hooks_for_suites(tree, suites, HookKind::BeforeEach, info, None)
                        .await?;

                    self.fixture_runner
                        .resolve_parameters_for_function(
                            case.func().deps(),
                            info,
                            AutoFixtures::Test,
                            &RunnableDescription::new(RunnableType::Test),
                        )
                        .await
                }),
            )
            .await?;

        // A fixture failed to set up, so the test can't run.
        let Some(params) = params else {
            return Ok(());
        };

        info.run_as_stage(
            TestStage::new("test function")
                .with_runnable(RunnableDescription::new(RunnableType::Test)),
            case.func().call(params, info.clone()),
        )
        .await
    }

    async fn after_hooks(
        &mut self,
        tree: &SuiteTree,
        info: &TestInfo,
        reversed_suites: &[SuiteId],
        next_suites: &HashSet<SuiteId>,
        should_run_after_each_hooks: bool,
        slot: &TimeSlot,
    ) -> Result<(), TestError> {
        let mut first_error = None;

        if should_run_after_each_hooks
            && let Err(error) = self
                .run_each_hooks_for_suites(
                    tree,
                    reversed_suites,
                    HookKind::AfterEach,
                    info,
                    Some(slot.clone()),
                )
                .await
        {
            first_error.get_or_insert(error);
        }

        // Attributed to the test, since raising the test timeout is the way to fix it.
        let runnable = RunnableDescription::new(RunnableType::Test).with_slot(Some(slot.clone()));
        if let Err(error) = self
            .fixture_runner
            .teardown_scope(FixtureScope::Test, info, &runnable)
            .await
        {
            first_error.get_or_insert(error);
        }

        // If the test failed the worker stops, and afterAll hooks must run before worker fixtures
        // are torn down.
        for &suite in reversed_suites {
            if (!next_suites.contains(&suite) || info.is_failure())
                && let Err(error) = self.run_after_all_hooks_for_suite(tree, suite, info).await
            {
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn worker_cleanup(
        &mut self,
        tree: &SuiteTree,
        info: &TestInfo,
        reversed_suites: &[SuiteId],
        project_timeout: Duration,
    ) -> Result<(), TestError> {
        let mut first_error = None;

        let runnable = RunnableDescription::new(RunnableType::Test)
            .with_slot(Some(TimeSlot::new(project_timeout)));
        if let Err(error) = self
            .fixture_runner
            .teardown_scope(FixtureScope::Test, info, &runnable)
            .await
        {
            first_error.get_or_insert(error);
        }

        for &suite in reversed_suites {
            if let Err(error) = self.run_after_all_hooks_for_suite(tree, suite, info).await {
                first_error.get_or_insert(error);
            }
        }

        // Worker fixtures are not part of any test.
        let runnable = RunnableDescription::new(RunnableType::Teardown)
            .with_slot(Some(TimeSlot::new(project_timeout)));
        if let Err(error) = self
            .fixture_runner
            .teardown_scope(FixtureScope::Worker, info, &runnable)
            .await
        {
            first_error.get_or_insert(error);
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Modifiers that only need worker fixtures are evaluated once per suite, along with
    /// beforeAll hooks. Other modifiers run before each test. Modifiers come before hooks.
    fn collect_hooks_and_modifiers(
        &self,
        tree: &SuiteTree,
        suite: SuiteId,
        kind: HookKind,
    ) -> Vec<CollectedHook> {
        let suite = tree.suite(suite);
        let mut hooks = Vec::new();
        for modifier in suite.modifiers() {
            let modifier_kind = if self
                .fixture_runner
                .depends_on_worker_fixtures_only(modifier.func.deps())
            {
                HookKind::BeforeAll
            } else {
                HookKind::BeforeEach
            };
            if modifier_kind != kind {
                continue;
            }
            hooks.push(CollectedHook {
                runnable_type: modifier.kind.runnable_type(),
                title: format!("{} modifier", modifier.kind),
                location: modifier.location.clone(),
                func: modifier_function(modifier),
            });
        }
        hooks.extend(
            suite
                .hooks()
                .iter()
                .filter(|hook| hook.kind == kind)
                .map(|hook| CollectedHook {
                    runnable_type: hook.kind.runnable_type(),
                    title: hook.title.clone(),
                    location: hook.location.clone(),
                    func: hook.func.clone(),
                }),
        );
        hooks
    }

    async fn run_before_all_hooks_for_suite(
        &mut self,
        tree: &SuiteTree,
        suite: SuiteId,
        info: &TestInfo,
    ) -> Result<(), TestError> {
        if self.active_suites.contains_key(&suite) {
            return Ok(());
        }
        self.active_suites.insert(suite, Vec::new());
        self.run_all_hooks_for_suite(tree, suite, HookKind::BeforeAll, info)
            .await
    }

    async fn run_after_all_hooks_for_suite(
        &mut self,
        tree: &SuiteTree,
        suite: SuiteId,
        info: &TestInfo,
    ) -> Result<(), TestError> {
        if self.active_suites.shift_remove(&suite).is_none() {
            return Ok(());
        }
        self.run_all_hooks_for_suite(tree, suite, HookKind::AfterAll, info)
            .await
    }

    /// Runs every beforeAll or afterAll hook of `suite`, even after failures, and returns the
    /// first error.
    async fn run_all_hooks_for_suite(
        &mut self,
        tree: &SuiteTree,
        suite: SuiteId,
        kind: HookKind,
        info: &TestInfo,
    ) -> Result<(), TestError> {
        let mut first_error = None;
        for hook in self.collect_hooks_and_modifiers(tree, suite, kind) {
            let result = info
                .run_as_stage(
                    TestStage::new(hook.title.clone())
                        .with_location(Some(hook.location.clone()))
                        .with_step(StepCategory::Hook),
                    Box::pin(self.run_hook_with_own_slot(&hook, suite, kind, info)),
                )
                .await;
            let Err(error) = result else {
                continue;
            };
            let is_skip = error.is_skip();
            first_error.get_or_insert(error);
            if kind == HookKind::BeforeAll {
                // A skip in a beforeAll hook or modifier skips the rest.
                if is_skip {
                    break;
                }
                // Tell the dispatcher not to run the rest of this suite here, rather than hitting
                // the same error for each test.
                if self.skip_remaining_tests_in_suite.is_none() {
                    debug!(
                        title = %hook.title,
                        "beforeAll failed, skipping remaining tests in suite",
                    );
                    self.skip_remaining_tests_in_suite = Some(suite);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn run_hook_with_own_slot(
        &mut self,
        hook: &CollectedHook,
        suite: SuiteId,
        kind: HookKind,
        info: &TestInfo,
    ) -> Result<(), TestError> {
        let runnable = RunnableDescription::new(hook.runnable_type)
            .with_slot(Some(TimeSlot::new(self.project_timeout())))
            .with_location(Some(hook.location.clone()));
        let existing_annotations = info.annotation_count();

        let result = self
            .fixture_runner
            .resolve_parameters_and_run_function(
                &hook.func,
                info,
                AutoFixtures::AllHooksOnly,
                runnable.clone(),
            )
            .await;

        if kind == HookKind::BeforeAll
            && let Some(extra) = self.active_suites.get_mut(&suite)
        {
            // Every test of the suite inherits these.
            extra.extend(info.annotations_since(existing_annotations));
        }
        // Each beforeAll/afterAll hook gets its own test scope, torn down even if the hook
        // failed since more hooks may run.
        self.fixture_runner
            .teardown_scope(FixtureScope::Test, info, &runnable)
            .await?;
        result.map(drop)
    }

    /// Runs beforeEach or afterEach hooks, in the order of `suites`. Stops at the first skip or
    /// timeout.
    async fn run_each_hooks_for_suites(
        &mut self,
        tree: &SuiteTree,
        suites: &[SuiteId],
        kind: HookKind,
        info: &TestInfo,
        slot: Option<TimeSlot>,
    ) -> Result<(), TestError> {
        let hooks: Vec<_> = suites
            .iter()
            .flat_map(|&suite| self.collect_hooks_and_modifiers(tree, suite, kind))
            .collect();

        let mut first_error = None;
        for hook in hooks {
            let runnable = RunnableDescription::new(hook.runnable_type)
                .with_location(Some(hook.location.clone()))
                .with_slot(slot.clone());
            if info.timeout_manager().is_time_exhausted_for(&runnable) {
                debug!(title = %hook.title, "not running hook, no time left");
                continue;
            }
            let result = info
                .run_as_stage(
                    TestStage::new(hook.title.clone())
                        .with_location(Some(hook.location.clone()))
                        .with_step(StepCategory::Hook),
                    Box::pin(self.fixture_runner.resolve_parameters_and_run_function(
                        &hook.func,
                        info,
                        AutoFixtures::Test,
                        runnable,
                    )),
                )
                .await;
            if let Err(error) = result {
                if error.is_timeout() {
                    return Err(error);
                }
                let is_skip = error.is_skip();
                first_error.get_or_insert(error);
                if is_skip {
                    break;
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn append_process_teardown_diagnostics(&self, error: &mut TestInfoError) {
        if self.last_running_tests.is_empty() {
            return;
        }
        let total = self.total_running_tests;
        let shown = self.last_running_tests.len();
        let mut message = format!(
            "\n\nFailed worker ran {total} {}",
            plural::tests_str(total)
        );
        if shown < total {
            swrite!(message, ", last {shown} tests were");
        }
        message.push(':');
        for test in &self.last_running_tests {
            swrite!(message, "\n{test}");
        }

        if let Some(error_message) = &mut error.message {
            if let Some(stack) = &mut error.stack
                && let Some(index) = stack.find(error_message.as_str())
            {
                stack.insert_str(index + error_message.len(), &message);
            }
            error_message.push_str(&message);
        }
    }

    fn project_timeout(&self) -> Duration {
        self.loaded
            .as_ref()
            .map_or(DEFAULT_TIMEOUT, |loaded| loaded.project.timeout)
    }

    fn project_name(&self) -> String {
        self.loaded
            .as_ref()
            .map(|loaded| loaded.project.name.clone())
            .unwrap_or_default()
    }

    fn is_debug(&self) -> bool {
        self.loaded
            .as_ref()
            .is_some_and(|loaded| loaded.config.debug())
    }

    fn dispatch(&self, event: WorkerEvent) {
        // The receiver going away means nobody is listening anymore.
        _ = self.events.send(event);
    }
}

async fn start_tracing(
    recorder: &mut Box<dyn TraceRecorder>,
    pool: Option<&FixturePool>,
    info: &TestInfo,
) -> Result<(), TestError> {
    let Some(registration) = pool.and_then(|pool| pool.resolve("trace", None)) else {
        return Ok(());
    };
    match registration.body() {
        FixtureBody::Func(_) => Err(TestError::failure("\"trace\" option cannot be a function")),
        FixtureBody::Value(mode) => recorder.start_if_needed(mode, info).await,
        FixtureBody::Unset => Ok(()),
    }
}

// Turns a modifier into a function that evaluates its condition and applies it to the test.
fn modifier_function(modifier: &Modifier) -> TestFunction {
    let Modifier {
        kind,
        description,
        location,
        func,
    } = modifier.clone();
    TestFunction::new(func.deps().to_vec(), move |fixtures, info: TestInfo| {
        let func = func.clone();
        let description = description.clone();
        let location = location.clone();
        async move {
            let condition = func.call(fixtures, info.clone()).await?;
            info.modifier(kind, Some(location), condition, description.as_deref())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixtures::{FixtureDef, FixtureList},
        suite::{Hook, TestCase, TestType},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use smol_str::SmolStr;
    use testrig_metadata::RunEntry;
    use tokio::sync::mpsc;

    struct OneFile(SuiteTree);

    impl TestLoader for OneFile {
        fn load_test_file(
            &self,
            _file: &Utf8Path,
        ) -> Result<SuiteTree, crate::errors::TestFileLoadError> {
            Ok(self.0.clone())
        }
    }

    fn params() -> WorkerInitParams {
        WorkerInitParams {
            worker_index: 0,
            parallel_index: 0,
            repeat_each_index: 0,
            project_id: SmolStr::new("default"),
            config: json!({
                "projects": [{ "id": "default", "name": "unit", "timeout": "1s" }],
                "last-running-tests": 2,
            }),
        }
    }

    fn loc(line: u32) -> Location {
        Location::new("a.spec.ts", line, 1)
    }

    fn payload(ids: &[&str]) -> RunPayload {
        RunPayload {
            file: "a.spec.ts".into(),
            entries: ids
                .iter()
                .map(|id| RunEntry {
                    test_id: (*id).to_owned(),
                    retry: 0,
                })
                .collect(),
        }
    }

    fn statuses(events: &[WorkerEvent]) -> Vec<(String, TestStatus)> {
        events
            .iter()
            .filter_map(|event| match event {
                WorkerEvent::TestEnd(end) => Some((end.test_id.clone(), end.status)),
                _ => None,
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn unknown_test_ids() {
        let tree = SuiteTree::new("a.spec.ts");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = WorkerMain::new(params(), OneFile(tree), tx);
        worker.run_test_group(payload(&["missing"])).await;

        let events = drain(&mut rx);
        let [WorkerEvent::Done(done)] = events.as_slice() else {
            panic!("expected a single done event, got {events:?}");
        };
        assert_eq!(done.fatal_unknown_test_ids, Some(vec!["missing".to_owned()]));
        assert!(worker.handle().is_stopped());
    }

    #[tokio::test]
    async fn trace_option_must_be_a_value() {
        let test_type = Arc::new(TestType::new(vec![FixtureList::new(loc(1)).fixture(
            "trace",
            FixtureDef::func(crate::fixtures::FixtureFn::new(Vec::<SmolStr>::new(), |_, _| async {
                Ok(crate::fixtures::Provided::value(()))
            })),
        )]));
        let mut tree = SuiteTree::new("a.spec.ts");
        let root = tree.root();
        tree.add_test(
            root,
            TestCase::new(
                test_type,
                "t1",
                "traced",
                loc(2),
                TestFunction::new(Vec::<SmolStr>::new(), |_, _| async { Ok(()) }),
            ),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = WorkerMain::new(params(), OneFile(tree), tx);
        worker.run_test_group(payload(&["t1"])).await;

        let events = drain(&mut rx);
        let end = events
            .iter()
            .find_map(|event| match event {
                WorkerEvent::TestEnd(end) => Some(end),
                _ => None,
            })
            .expect("test ended");
        assert_eq!(end.status, TestStatus::Failed);
        assert_eq!(end.errors[0].message_str(), "\"trace\" option cannot be a function");
    }

    #[tokio::test]
    async fn fatal_error_lists_last_running_tests() {
        let mut tree = SuiteTree::new("a.spec.ts");
        let root = tree.root();
        for id in ["t1", "t2", "t3"] {
            tree.add_test(
                root,
                TestCase::new(
                    Arc::new(TestType::default()),
                    id,
                    format!("test {id}"),
                    loc(1),
                    TestFunction::new(Vec::<SmolStr>::new(), |_, _| async { Ok(()) }),
                ),
            );
        }
        tree.add_hook(
            root,
            Hook::new(
                HookKind::AfterAll,
                loc(9),
                TestFunction::new(Vec::<SmolStr>::new(), |_, _| async { Ok(()) }),
            ),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = WorkerMain::new(params(), OneFile(tree), tx);
        worker.run_test_group(payload(&["t1", "t2", "t3"])).await;
        assert_eq!(
            statuses(&drain(&mut rx)),
            [
                ("t1".to_owned(), TestStatus::Passed),
                ("t2".to_owned(), TestStatus::Passed),
                ("t3".to_owned(), TestStatus::Passed),
            ]
        );

        worker
            .handle()
            .unhandled_error(&TestError::failure("socket closed"));
        worker.graceful_close().await;

        let events = drain(&mut rx);
        let [WorkerEvent::TeardownErrors(teardown)] = events.as_slice() else {
            panic!("expected teardown errors, got {events:?}");
        };
        assert_eq!(
            teardown.fatal_errors[0].message_str(),
            "socket closed\n\n\
             Failed worker ran 3 tests, last 2 tests were:\n\
             [unit] › a.spec.ts:1:1 › test t2\n\
             [unit] › a.spec.ts:1:1 › test t3"
        );
    }
}
