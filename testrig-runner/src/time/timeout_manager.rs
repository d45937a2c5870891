// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deadlines for tests, hooks and fixtures.
//!
//! Time is accounted against *slots*. A slot has a timeout (zero means disabled) and the time that
//! has been spent in it so far. Several runnables can share a slot: a test body and the fixtures it
//! sets up all draw from the test's default slot, so a fixture that takes 400ms out of a 1000ms
//! slot leaves 600ms for the body. Fixtures with their own `timeout` option use a separate slot.
//!
//! At most one runnable is active at a time. Changing the timeout of the active slot (via
//! [`TimeoutManager::slow`] or [`TimeoutManager::set_timeout`]) re-arms its deadline immediately.

use crate::errors::{TimeoutError, TimeoutErrorKind};
use std::{
    fmt,
    future::Future,
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use testrig_metadata::Location;
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};
use tracing::debug;

/// The kind of code a [`RunnableDescription`] describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RunnableType {
    /// A test body, or fixtures being set up for it.
    Test,
    /// A `beforeAll` hook.
    BeforeAll,
    /// An `afterAll` hook.
    AfterAll,
    /// A `beforeEach` hook.
    BeforeEach,
    /// An `afterEach` hook.
    AfterEach,
    /// A `slow` modifier.
    Slow,
    /// A `skip` modifier.
    Skip,
    /// A `fail` modifier.
    Fail,
    /// A `fixme` modifier.
    Fixme,
    /// Worker teardown.
    Teardown,
}

impl RunnableType {
    /// Returns the name used in timeout messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::BeforeAll => "beforeAll",
            Self::AfterAll => "afterAll",
            Self::BeforeEach => "beforeEach",
            Self::AfterEach => "afterEach",
            Self::Slow => "slow",
            Self::Skip => "skip",
            Self::Fail => "fail",
            Self::Fixme => "fixme",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for RunnableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a fixture is being set up or torn down.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FixturePhase {
    /// Setup.
    Setup,
    /// Teardown.
    Teardown,
}

impl FixturePhase {
    /// Returns the phase name used in timeout messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Teardown => "teardown",
        }
    }
}

/// A budget of time shared by one or more runnables.
///
/// Cloning a `TimeSlot` produces another handle to the same budget.
#[derive(Clone, Debug, Default)]
pub struct TimeSlot {
    state: Arc<Mutex<SlotState>>,
}

/// A snapshot of a [`TimeSlot`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SlotState {
    /// The timeout of the slot. Zero means the slot never runs out.
    pub timeout: Duration,

    /// The time spent in the slot by runnables that have finished.
    pub elapsed: Duration,
}

impl TimeSlot {
    /// Creates a new slot with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState {
                timeout,
                elapsed: Duration::ZERO,
            })),
        }
    }

    /// The timeout of the slot.
    pub fn timeout(&self) -> Duration {
        self.lock().timeout
    }

    /// The time spent in the slot by runnables that have finished.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Returns a snapshot of the slot.
    pub fn snapshot(&self) -> SlotState {
        *self.lock()
    }

    /// Returns true if the slot has a timeout and has used all of it.
    pub fn is_exhausted(&self) -> bool {
        let state = self.snapshot();
        !state.timeout.is_zero() && state.elapsed >= state.timeout
    }

    fn set_timeout(&self, timeout: Duration) {
        self.lock().timeout = timeout;
    }

    fn add_elapsed(&self, elapsed: Duration) {
        self.lock().elapsed += elapsed;
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Describes a fixture being set up or torn down within a runnable.
#[derive(Clone, Debug)]
pub struct FixtureDescription {
    /// The title of the fixture, used in messages and step titles.
    pub title: String,

    /// Setup or teardown.
    pub phase: FixturePhase,

    /// Where the fixture was registered.
    pub location: Option<Location>,

    /// The fixture's own slot, if it has a `timeout` option.
    pub slot: Option<TimeSlot>,
}

/// Describes the code a [`TimeoutManager`] is timing.
#[derive(Clone, Debug)]
pub struct RunnableDescription {
    /// What kind of code this is.
    pub kind: RunnableType,

    /// Where the code was declared.
    pub location: Option<Location>,

    /// The slot to draw time from. If unset, the test's default slot is used.
    pub slot: Option<TimeSlot>,

    /// The fixture being set up or torn down, if any.
    pub fixture: Option<FixtureDescription>,
}

impl RunnableDescription {
    /// Creates a description of the given kind that draws from the default slot.
    pub fn new(kind: RunnableType) -> Self {
        Self {
            kind,
            location: None,
            slot: None,
            fixture: None,
        }
    }

    /// Sets the location.
    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    /// Sets the slot.
    pub fn with_slot(mut self, slot: Option<TimeSlot>) -> Self {
        self.slot = slot;
        self
    }

    /// Sets the fixture being set up or torn down.
    pub fn with_fixture(mut self, fixture: FixtureDescription) -> Self {
        self.fixture = Some(fixture);
        self
    }

    // A fixture's own slot wins over the runnable's slot, which wins over the default.
    fn select_slot(&self, default_slot: &TimeSlot) -> TimeSlot {
        self.fixture
            .as_ref()
            .and_then(|fixture| fixture.slot.clone())
            .or_else(|| self.slot.clone())
            .unwrap_or_else(|| default_slot.clone())
    }
}

/// Races runnables against the deadline of their slot.
///
/// Cloning a `TimeoutManager` produces another handle to the same manager, which is how the
/// worker interrupts a running test from outside.
#[derive(Clone, Debug)]
pub struct TimeoutManager {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ManagerState>,
    // Bumped whenever the deadline of the running runnable changes, or it is interrupted.
    generation: watch::Sender<u64>,
}

#[derive(Debug)]
struct ManagerState {
    default_slot: TimeSlot,
    running: Option<Running>,
    ignore_timeouts: bool,
}

#[derive(Debug)]
struct Running {
    runnable: RunnableDescription,
    slot: TimeSlot,
    start: Instant,
    deadline: Option<Instant>,
    interrupted: bool,
}

impl Running {
    fn update_deadline(&mut self, ignore_timeouts: bool) {
        let slot = self.slot.snapshot();
        self.deadline = if ignore_timeouts || slot.timeout.is_zero() {
            None
        } else {
            Some(self.start + slot.timeout.saturating_sub(slot.elapsed))
        };
    }
}

impl TimeoutManager {
    /// Creates a new manager whose default slot has the given timeout.
    pub fn new(timeout: Duration) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState {
                    default_slot: TimeSlot::new(timeout),
                    running: None,
                    ignore_timeouts: false,
                }),
                generation,
            }),
        }
    }

    /// Runs `fut` as the active runnable, failing with a [`TimeoutError`] if the slot's deadline
    /// passes first.
    ///
    /// On timeout `fut` is dropped, which cancels it. If `runnable` is `None` the future is run
    /// without a deadline.
    ///
    /// # Panics
    ///
    /// Panics if another runnable is already active.
    pub async fn with_runnable<F: Future>(
        &self,
        runnable: Option<RunnableDescription>,
        fut: F,
    ) -> Result<F::Output, TimeoutError> {
        let Some(runnable) = runnable else {
            return Ok(fut.await);
        };

        let mut changed = self.shared.generation.subscribe();
        let _guard = self.start_running(runnable);
        let mut fut = pin!(fut);

        loop {
            let (deadline, interrupted) = self.running_deadline();
            if interrupted {
                return Err(self.create_error(TimeoutErrorKind::Interrupted));
            }
            let expired = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                // A deadline that has passed wins over a result that is ready at the same time.
                biased;
                () = expired => {
                    return Err(self.create_error(TimeoutErrorKind::Timeout));
                }
                output = &mut fut => {
                    return Ok(output);
                }
                Ok(()) = changed.changed() => {}
            }
        }
    }

    /// Force-fails the active runnable with an [`Interrupted`](TimeoutErrorKind::Interrupted)
    /// error. Does nothing if no runnable is active.
    pub fn interrupt(&self) {
        {
            let mut state = self.lock();
            match &mut state.running {
                Some(running) => running.interrupted = true,
                None => return,
            }
        }
        debug!("interrupting running runnable");
        self.notify();
    }

    /// Disables (or re-enables) all deadlines, e.g. while a debugger is attached.
    pub fn set_ignore_timeouts(&self, ignore_timeouts: bool) {
        {
            let mut state = self.lock();
            state.ignore_timeouts = ignore_timeouts;
            if let Some(running) = &mut state.running {
                running.update_deadline(ignore_timeouts);
            }
        }
        self.notify();
    }

    /// Triples the time remaining in the current slot.
    ///
    /// The time already spent (including the running portion of the active runnable) is kept
    /// as-is. A disabled slot stays disabled.
    pub fn slow(&self) {
        {
            let mut state = self.lock();
            let ignore_timeouts = state.ignore_timeouts;
            let (slot, running_elapsed) = match &state.running {
                Some(running) => (running.slot.clone(), running.start.elapsed()),
                None => (state.default_slot.clone(), Duration::ZERO),
            };
            let current = slot.snapshot();
            if current.timeout.is_zero() {
                return;
            }
            let spent = current.elapsed + running_elapsed;
            let remaining = current.timeout.saturating_sub(spent);
            let timeout = spent + remaining * 3;
            debug!(
                old_timeout = ?current.timeout,
                new_timeout = ?timeout,
                "slowing down current slot",
            );
            slot.set_timeout(timeout);
            if let Some(running) = &mut state.running {
                running.update_deadline(ignore_timeouts);
            }
        }
        self.notify();
    }

    /// Overrides the timeout of the current slot. Zero disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        {
            let mut state = self.lock();
            let ignore_timeouts = state.ignore_timeouts;
            match &mut state.running {
                Some(running) => {
                    running.slot.set_timeout(timeout);
                    running.update_deadline(ignore_timeouts);
                }
                None => state.default_slot.set_timeout(timeout),
            }
        }
        self.notify();
    }

    /// Returns true if the slot `runnable` would draw from has a timeout and no time left.
    pub fn is_time_exhausted_for(&self, runnable: &RunnableDescription) -> bool {
        let default_slot = self.lock().default_slot.clone();
        runnable.select_slot(&default_slot).is_exhausted()
    }

    /// The deadline of the active runnable. `None` if nothing is running or there is no deadline.
    pub fn current_slot_deadline(&self) -> Option<Instant> {
        self.lock()
            .running
            .as_ref()
            .and_then(|running| running.deadline)
    }

    /// The kind of the active runnable, or [`RunnableType::Test`] if nothing is running.
    pub fn current_slot_type(&self) -> RunnableType {
        self.lock()
            .running
            .as_ref()
            .map_or(RunnableType::Test, |running| running.runnable.kind)
    }

    /// The timeout of the current slot: the active runnable's, or the default one.
    pub fn current_slot_timeout(&self) -> Duration {
        let state = self.lock();
        match &state.running {
            Some(running) => running.slot.timeout(),
            None => state.default_slot.timeout(),
        }
    }

    /// The default slot, used by runnables that don't carry their own.
    pub fn default_slot(&self) -> TimeSlot {
        self.lock().default_slot.clone()
    }

    fn start_running(&self, runnable: RunnableDescription) -> RunningGuard<'_> {
        let mut state = self.lock();
        assert!(
            state.running.is_none(),
            "internal error: duplicate runnable"
        );
        let slot = runnable.select_slot(&state.default_slot);
        let mut running = Running {
            runnable,
            slot,
            start: Instant::now(),
            deadline: None,
            interrupted: false,
        };
        running.update_deadline(state.ignore_timeouts);
        debug!(
            kind = %running.runnable.kind,
            fixture = running.runnable.fixture.as_ref().map(|f| f.title.as_str()),
            timeout = ?running.slot.timeout(),
            "runnable started",
        );
        state.running = Some(running);
        RunningGuard { manager: self }
    }

    fn finish_running(&self) {
        let mut state = self.lock();
        if let Some(running) = state.running.take() {
            let elapsed = running.start.elapsed();
            running.slot.add_elapsed(elapsed);
            debug!(kind = %running.runnable.kind, ?elapsed, "runnable finished");
        }
    }

    fn running_deadline(&self) -> (Option<Instant>, bool) {
        match &self.lock().running {
            Some(running) => (running.deadline, running.interrupted),
            None => (None, false),
        }
    }

    fn create_error(&self, kind: TimeoutErrorKind) -> TimeoutError {
        let state = self.lock();
        let (runnable, timeout) = match &state.running {
            Some(running) => (running.runnable.clone(), running.slot.timeout()),
            None => (
                RunnableDescription::new(RunnableType::Test),
                state.default_slot.timeout(),
            ),
        };
        drop(state);

        let (message, location) = timeout_message(&runnable, timeout);
        TimeoutError::new(kind, message, location)
    }

    fn notify(&self) {
        self.shared.generation.send_modify(|generation| *generation += 1);
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// Charges the time spent to the slot even if the runnable's future is dropped midway.
struct RunningGuard<'a> {
    manager: &'a TimeoutManager,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.manager.finish_running();
    }
}

fn timeout_message(
    runnable: &RunnableDescription,
    timeout: Duration,
) -> (String, Option<Location>) {
    let ms = timeout.as_millis();
    let fixture = runnable.fixture.as_ref();
    let location = fixture
        .and_then(|fixture| fixture.location.clone())
        .or_else(|| runnable.location.clone());

    if let Some(fixture) = fixture
        && fixture.slot.is_some()
    {
        let message = format!(
            "Fixture \"{}\" timeout of {ms}ms exceeded during {}.",
            fixture.title,
            fixture.phase.as_str(),
        );
        return (message, location);
    }

    let message = match runnable.kind {
        RunnableType::Test => match fixture {
            None => format!("Test timeout of {ms}ms exceeded."),
            Some(FixtureDescription {
                title,
                phase: FixturePhase::Setup,
                ..
            }) => format!("Test timeout of {ms}ms exceeded while setting up \"{title}\"."),
            Some(FixtureDescription {
                title,
                phase: FixturePhase::Teardown,
                ..
            }) => format!("Tearing down \"{title}\" exceeded the test timeout of {ms}ms."),
        },
        RunnableType::BeforeEach | RunnableType::AfterEach => format!(
            "Test timeout of {ms}ms exceeded while running \"{}\" hook.",
            runnable.kind,
        ),
        RunnableType::BeforeAll | RunnableType::AfterAll => {
            format!("\"{}\" hook timeout of {ms}ms exceeded.", runnable.kind)
        }
        RunnableType::Teardown => match fixture {
            None => format!("Worker teardown timeout of {ms}ms exceeded."),
            Some(FixtureDescription {
                title,
                phase: FixturePhase::Setup,
                ..
            }) => format!(
                "Worker teardown timeout of {ms}ms exceeded while setting up \"{title}\"."
            ),
            Some(FixtureDescription {
                title,
                phase: FixturePhase::Teardown,
                ..
            }) => format!(
                "Worker teardown timeout of {ms}ms exceeded while tearing down \"{title}\"."
            ),
        },
        RunnableType::Skip | RunnableType::Slow | RunnableType::Fixme | RunnableType::Fail => {
            format!("\"{}\" modifier timeout of {ms}ms exceeded.", runnable.kind)
        }
    };
    (message, location)
}
