// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::TestError,
    suite::ModifierKind,
    time::{RunnableDescription, StopwatchStart, TimeoutManager, stopwatch, wall_time_millis},
};
use camino::Utf8PathBuf;
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use testrig_metadata::{
    Annotation, AttachmentPayload, Location, StepBeginPayload, StepCategory, StepEndPayload,
    TestBeginPayload, TestEndPayload, TestInfoError, TestStatus, WorkerEvent,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// A named unit of work within a test: optionally reported as a step, optionally timed.
#[derive(Clone, Debug)]
pub(crate) struct TestStage {
    title: String,
    location: Option<Location>,
    runnable: Option<RunnableDescription>,
    step: Option<StepCategory>,
}

impl TestStage {
    pub(crate) fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            location: None,
            runnable: None,
            step: None,
        }
    }

    pub(crate) fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    pub(crate) fn with_runnable(mut self, runnable: RunnableDescription) -> Self {
        self.runnable = Some(runnable);
        self
    }

    pub(crate) fn with_step(mut self, category: StepCategory) -> Self {
        self.step = Some(category);
        self
    }

    pub(crate) fn runnable(&self) -> Option<&RunnableDescription> {
        self.runnable.as_ref()
    }
}

/// The body of an attachment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttachmentBody {
    /// A file on disk.
    Path(Utf8PathBuf),

    /// Inline text.
    Inline(String),
}

/// Parameters for creating a [`TestInfo`].
#[derive(Clone, Debug, Default)]
pub struct TestInfoParams {
    /// The id of the test.
    pub test_id: String,
    /// The test title.
    pub title: String,
    /// Describe titles followed by the test title.
    pub title_path: Vec<String>,
    /// Where the test is declared.
    pub location: Option<Location>,
    /// The retry attempt.
    pub retry: u32,
    /// See [`WorkerInitParams::worker_index`](testrig_metadata::WorkerInitParams::worker_index).
    pub worker_index: u32,
    /// See [`WorkerInitParams::parallel_index`](testrig_metadata::WorkerInitParams::parallel_index).
    pub parallel_index: u32,
    /// The display name of the project.
    pub project_name: String,
    /// The test timeout. Zero disables it.
    pub timeout: Duration,
    /// The status the test is declared to finish with.
    pub expected_status: TestStatus,
    /// Where step and attachment events are sent. Events are dropped if this is `None`.
    pub events: Option<UnboundedSender<WorkerEvent>>,
}

/// Information about the currently running test, and the handle test code uses to talk to the
/// worker.
///
/// A `TestInfo` is passed to every fixture, hook and test body. Cloning it produces another
/// handle to the same test.
#[derive(Clone)]
pub struct TestInfo {
    inner: Arc<Inner>,
}

struct Inner {
    test_id: String,
    title: String,
    title_path: Vec<String>,
    location: Option<Location>,
    retry: u32,
    worker_index: u32,
    parallel_index: u32,
    project_name: String,
    events: Option<UnboundedSender<WorkerEvent>>,
    timeout_manager: TimeoutManager,
    stopwatch: StopwatchStart,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    status: TestStatus,
    expected_status: TestStatus,
    errors: Vec<TestInfoError>,
    annotations: Vec<Annotation>,
    steps: Vec<OpenStep>,
    last_step_id: u64,
    allow_skips: bool,
    was_interrupted: bool,
    has_unhandled_error: bool,
    duration: Duration,
}

#[derive(Debug)]
struct OpenStep {
    step_id: String,
    category: StepCategory,
    // Set by soft failures while the step is open.
    soft_error: Option<TestInfoError>,
}

impl TestInfo {
    /// Creates a new `TestInfo`.
    pub fn new(params: TestInfoParams) -> Self {
        let TestInfoParams {
            test_id,
            title,
            title_path,
            location,
            retry,
            worker_index,
            parallel_index,
            project_name,
            timeout,
            expected_status,
            events,
        } = params;
        Self {
            inner: Arc::new(Inner {
                test_id,
                title,
                title_path,
                location,
                retry,
                worker_index,
                parallel_index,
                project_name,
                events,
                timeout_manager: TimeoutManager::new(timeout),
                stopwatch: stopwatch(),
                state: Mutex::new(State {
                    status: TestStatus::Passed,
                    expected_status,
                    errors: Vec::new(),
                    annotations: Vec::new(),
                    steps: Vec::new(),
                    last_step_id: 0,
                    allow_skips: false,
                    was_interrupted: false,
                    has_unhandled_error: false,
                    duration: Duration::ZERO,
                }),
            }),
        }
    }

    /// The id of the test.
    pub fn test_id(&self) -> &str {
        &self.inner.test_id
    }

    /// The test title.
    pub fn title(&self) -> &str {
        &self.inner.title
    }

    /// Describe titles followed by the test title.
    pub fn title_path(&self) -> &[String] {
        &self.inner.title_path
    }

    /// Where the test is declared.
    pub fn location(&self) -> Option<&Location> {
        self.inner.location.as_ref()
    }

    /// The retry attempt, starting at 0.
    pub fn retry(&self) -> u32 {
        self.inner.retry
    }

    /// The index of the worker running the test.
    pub fn worker_index(&self) -> u32 {
        self.inner.worker_index
    }

    /// The index of the worker among those running at the same time.
    pub fn parallel_index(&self) -> u32 {
        self.inner.parallel_index
    }

    /// The display name of the project.
    pub fn project_name(&self) -> &str {
        &self.inner.project_name
    }

    /// The current status.
    pub fn status(&self) -> TestStatus {
        self.lock().status
    }

    /// The status the test is expected to finish with.
    pub fn expected_status(&self) -> TestStatus {
        self.lock().expected_status
    }

    /// Errors recorded so far.
    pub fn errors(&self) -> Vec<TestInfoError> {
        self.lock().errors.clone()
    }

    /// Annotations recorded so far.
    pub fn annotations(&self) -> Vec<Annotation> {
        self.lock().annotations.clone()
    }

    /// How long the test took. Updated once the test function finishes, and again at the end.
    pub fn duration(&self) -> Duration {
        self.lock().duration
    }

    /// The test timeout. Zero means the timeout is disabled.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout_manager.default_slot().timeout()
    }

    /// Changes the timeout of whatever is currently running: the test, or a hook with its own slot.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.timeout_manager.set_timeout(timeout);
    }

    /// The timeout manager of this test.
    pub fn timeout_manager(&self) -> &TimeoutManager {
        &self.inner.timeout_manager
    }

    /// Skips the test. Always returns the skip signal, which should be propagated with `?`.
    pub fn skip(&self, description: Option<&str>) -> Result<(), TestError> {
        self.modifier(ModifierKind::Skip, None, true, description)
    }

    /// Skips the test if `condition` holds.
    pub fn skip_if(&self, condition: bool, description: Option<&str>) -> Result<(), TestError> {
        self.modifier(ModifierKind::Skip, None, condition, description)
    }

    /// Skips the test, marking it as needing a fix.
    pub fn fixme(&self, description: Option<&str>) -> Result<(), TestError> {
        self.modifier(ModifierKind::Fixme, None, true, description)
    }

    /// Marks the test as needing a fix and skips it if `condition` holds.
    pub fn fixme_if(&self, condition: bool, description: Option<&str>) -> Result<(), TestError> {
        self.modifier(ModifierKind::Fixme, None, condition, description)
    }

    /// Marks the test as expected to fail.
    pub fn fail(&self, description: Option<&str>) {
        self.fail_if(true, description);
    }

    /// Marks the test as expected to fail if `condition` holds.
    pub fn fail_if(&self, condition: bool, description: Option<&str>) {
        // Only skip and fixme produce an error.
        _ = self.modifier(ModifierKind::Fail, None, condition, description);
    }

    /// Triples the remaining time of the test.
    pub fn slow(&self, description: Option<&str>) {
        self.slow_if(true, description);
    }

    /// Triples the remaining time of the test if `condition` holds.
    pub fn slow_if(&self, condition: bool, description: Option<&str>) {
        _ = self.modifier(ModifierKind::Slow, None, condition, description);
    }

    /// Records a failure without stopping the test. The test and every open step fail.
    pub fn soft_fail(&self, error: &TestError) {
        let info_error = error.to_info_error();
        {
            let mut state = self.lock();
            for step in &mut state.steps {
                step.soft_error.get_or_insert_with(|| info_error.clone());
            }
        }
        self.fail_with_error(error);
    }

    /// Runs `fut` as a user-defined step.
    pub async fn step<T, F>(&self, title: impl Into<String>, fut: F) -> Result<T, TestError>
    where
        F: Future<Output = Result<T, TestError>>,
    {
        let step_id = self.begin_step(StepCategory::TestStep, title.into(), None);
        let result = fut.await;
        self.end_step(&step_id, result.as_ref().err().map(TestError::to_info_error));
        result
    }

    /// Attaches a file or some text to the test.
    pub fn attach(
        &self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        body: AttachmentBody,
    ) {
        let name = name.into();
        let step_id = self.begin_step(StepCategory::Attach, name.clone(), None);
        let (path, body) = match body {
            AttachmentBody::Path(path) => (Some(path), None),
            AttachmentBody::Inline(body) => (None, Some(body)),
        };
        self.dispatch(WorkerEvent::Attach(AttachmentPayload {
            test_id: self.inner.test_id.clone(),
            name,
            content_type: content_type.into(),
            path,
            body,
            step_id: Some(step_id.clone()),
        }));
        self.end_step(&step_id, None);
    }

    // ---
    // Lifecycle methods
    // ---

    /// Runs `fut` as `stage`.
    ///
    /// If the stage is timed, errors from `fut` and timeouts are recorded on the test. Errors are
    /// returned either way, so that the caller can decide whether to go on.
    pub(crate) async fn run_as_stage<T, F>(&self, stage: TestStage, fut: F) -> Result<T, TestError>
    where
        F: Future<Output = Result<T, TestError>>,
    {
        debug!(test_id = %self.inner.test_id, stage = %stage.title, "started stage");
        let step_id = stage
            .step
            .map(|category| self.begin_step(category, stage.title.clone(), stage.location.clone()));

        let result = match stage.runnable {
            Some(runnable) => {
                let timed = self
                    .inner
                    .timeout_manager
                    .with_runnable(Some(runnable), async {
                        let result = fut.await;
                        if let Err(error) = &result {
                            self.record_stage_error(error);
                        }
                        result
                    })
                    .await;
                match timed {
                    Ok(result) => result,
                    Err(error) => {
                        // An interruption is not a timeout.
                        if !error.is_interrupt() && !self.was_interrupted() {
                            self.fail_with_error(&TestError::Timeout(error.clone()));
                        }
                        Err(TestError::Timeout(error))
                    }
                }
            }
            None => fut.await,
        };

        if let Some(step_id) = step_id {
            self.end_step(&step_id, result.as_ref().err().map(TestError::to_info_error));
        }
        debug!(
            test_id = %self.inner.test_id,
            stage = %stage.title,
            ok = result.is_ok(),
            "finished stage",
        );
        result
    }

    fn record_stage_error(&self, error: &TestError) {
        {
            let mut state = self.lock();
            if state.allow_skips && error.is_skip() {
                if state.status == TestStatus::Passed {
                    state.status = TestStatus::Skipped;
                }
                return;
            }
        }
        self.fail_with_error(error);
    }

    pub(crate) fn fail_with_error(&self, error: &TestError) {
        let mut state = self.lock();
        if matches!(state.status, TestStatus::Passed | TestStatus::Skipped) {
            state.status = if error.is_timeout() {
                TestStatus::TimedOut
            } else {
                TestStatus::Failed
            };
        }
        state.errors.push(error.to_info_error());
    }

    /// Applies a modifier: records the annotation, then skips, marks as failing or slows down.
    pub(crate) fn modifier(
        &self,
        kind: ModifierKind,
        location: Option<Location>,
        condition: bool,
        description: Option<&str>,
    ) -> Result<(), TestError> {
        if !condition {
            return Ok(());
        }
        let description = description.map(ToOwned::to_owned);
        let mut state = self.lock();
        state.annotations.push(
            Annotation::new(kind.as_str())
                .with_description(description.clone())
                .with_location(location),
        );
        match kind {
            ModifierKind::Skip | ModifierKind::Fixme => {
                state.expected_status = TestStatus::Skipped;
                Err(TestError::skip(description))
            }
            ModifierKind::Fail => {
                if state.expected_status != TestStatus::Skipped {
                    state.expected_status = TestStatus::Failed;
                }
                Ok(())
            }
            ModifierKind::Slow => {
                drop(state);
                self.inner.timeout_manager.slow();
                Ok(())
            }
        }
    }

    /// Records an annotation declared statically or inherited from a suite.
    pub(crate) fn process_annotation(&self, annotation: Annotation) {
        let mut state = self.lock();
        match annotation.kind.as_str() {
            "skip" | "fixme" => state.expected_status = TestStatus::Skipped,
            "fail" => {
                if state.expected_status != TestStatus::Skipped {
                    state.expected_status = TestStatus::Failed;
                }
            }
            "slow" => self.inner.timeout_manager.slow(),
            _ => {}
        }
        state.annotations.push(annotation);
    }

    /// Stops the test because the worker is shutting down.
    pub(crate) fn interrupt(&self) {
        {
            let mut state = self.lock();
            state.was_interrupted = true;
            // Keep an existing failure, e.g. from an unhandled error.
            if state.status == TestStatus::Passed {
                state.status = TestStatus::Interrupted;
            }
        }
        self.inner.timeout_manager.interrupt();
    }

    pub(crate) fn was_interrupted(&self) -> bool {
        self.lock().was_interrupted
    }

    /// Returns true if the test did not finish the way it was expected to.
    pub(crate) fn is_failure(&self) -> bool {
        let state = self.lock();
        state.status != TestStatus::Skipped && state.status != state.expected_status
    }

    pub(crate) fn set_status(&self, status: TestStatus) {
        self.lock().status = status;
    }

    pub(crate) fn set_allow_skips(&self, allow_skips: bool) {
        self.lock().allow_skips = allow_skips;
    }

    pub(crate) fn set_duration(&self, duration: Duration) {
        self.lock().duration = duration;
    }

    /// Marks the test as having seen an unhandled error. Returns false if it already had one.
    pub(crate) fn set_has_unhandled_error(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.has_unhandled_error, true)
    }

    pub(crate) fn annotation_count(&self) -> usize {
        self.lock().annotations.len()
    }

    pub(crate) fn annotations_since(&self, index: usize) -> Vec<Annotation> {
        self.lock()
            .annotations
            .get(index..)
            .map(<[Annotation]>::to_vec)
            .unwrap_or_default()
    }

    pub(crate) fn test_begin_payload(&self) -> TestBeginPayload {
        TestBeginPayload {
            test_id: self.inner.test_id.clone(),
            start_wall_time: self.inner.stopwatch.start_time().timestamp_millis(),
        }
    }

    pub(crate) fn test_end_payload(&self) -> TestEndPayload {
        let timeout = self.timeout();
        let state = self.lock();
        TestEndPayload {
            test_id: self.inner.test_id.clone(),
            duration: state.duration,
            status: state.status,
            errors: state.errors.clone(),
            expected_status: state.expected_status,
            annotations: state.annotations.clone(),
            timeout,
        }
    }

    fn begin_step(
        &self,
        category: StepCategory,
        title: String,
        location: Option<Location>,
    ) -> String {
        let (step_id, parent_step_id) = {
            let mut state = self.lock();
            state.last_step_id += 1;
            let step_id = format!("{category}@{}", state.last_step_id);
            // Hooks and fixtures form a fixed hierarchy.
            let parent = if category.is_predefined() {
                state.steps.iter().rev().find(|step| step.category.is_predefined())
            } else {
                state.steps.last()
            };
            let parent_step_id = parent.map(|step| step.step_id.clone());
            state.steps.push(OpenStep {
                step_id: step_id.clone(),
                category,
                soft_error: None,
            });
            (step_id, parent_step_id)
        };
        self.dispatch(WorkerEvent::StepBegin(StepBeginPayload {
            test_id: self.inner.test_id.clone(),
            step_id: step_id.clone(),
            parent_step_id,
            category,
            title,
            wall_time: wall_time_millis(),
            location,
        }));
        step_id
    }

    fn end_step(&self, step_id: &str, error: Option<TestInfoError>) {
        let error = {
            let mut state = self.lock();
            let Some(index) = state.steps.iter().rposition(|step| step.step_id == step_id) else {
                return;
            };
            let step = state.steps.remove(index);
            error.or(step.soft_error)
        };
        self.dispatch(WorkerEvent::StepEnd(StepEndPayload {
            test_id: self.inner.test_id.clone(),
            step_id: step_id.to_owned(),
            wall_time: wall_time_millis(),
            error,
        }));
    }

    fn dispatch(&self, event: WorkerEvent) {
        if let Some(events) = &self.inner.events {
            // The receiver going away means nobody is listening anymore.
            _ = events.send(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestInfo")
            .field("test_id", &self.inner.test_id)
            .field("title", &self.inner.title)
            .field("retry", &self.inner.retry)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}
