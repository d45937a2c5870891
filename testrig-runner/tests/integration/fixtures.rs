// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use smol_str::SmolStr;
use std::{
    sync::{Arc, Mutex, Once, PoisonError},
    time::Duration,
};
use testrig_metadata::{
    DonePayload, Location, RunEntry, RunPayload, TestEndPayload, TestStatus, WorkerEvent,
    WorkerInitParams,
};
use testrig_runner::{
    errors::{TestError, TestFileLoadError},
    fixtures::{FixtureFn, Provided},
    suite::{SuiteTree, TestFunction, TestLoader},
    worker::{TestInfo, TraceRecorder, WorkerMain},
};
use tokio::sync::mpsc::{self, UnboundedReceiver};

pub(crate) const TEST_FILE: &str = "checkout.spec.ts";

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        _ = color_eyre::install();
        _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub(crate) fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub(crate) fn loc(line: u32) -> Location {
    Location::new(TEST_FILE, line, 1)
}

/// A worker config blob with a single project.
pub(crate) fn config_with_timeout(timeout: &str) -> Value {
    json!({
        "projects": [{ "id": "default", "name": "chromium", "timeout": timeout }],
    })
}

pub(crate) fn default_config() -> Value {
    config_with_timeout("1s")
}

pub(crate) fn init_params(config: Value) -> WorkerInitParams {
    WorkerInitParams {
        worker_index: 3,
        parallel_index: 1,
        repeat_each_index: 0,
        project_id: SmolStr::new("default"),
        config,
    }
}

pub(crate) fn payload(ids: &[&str]) -> RunPayload {
    RunPayload {
        file: TEST_FILE.into(),
        entries: ids
            .iter()
            .map(|id| RunEntry {
                test_id: (*id).to_owned(),
                retry: 0,
            })
            .collect(),
    }
}

/// Serves the same suite tree for every file.
#[derive(Debug)]
pub(crate) struct FixedLoader(pub(crate) SuiteTree);

impl TestLoader for FixedLoader {
    fn load_test_file(&self, _file: &Utf8Path) -> Result<SuiteTree, TestFileLoadError> {
        Ok(self.0.clone())
    }
}

pub(crate) fn make_worker(
    tree: SuiteTree,
    config: Value,
) -> (WorkerMain<FixedLoader>, UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = WorkerMain::new(init_params(config), FixedLoader(tree), tx);
    (worker, rx)
}

pub(crate) fn drain(rx: &mut UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn test_ends(events: &[WorkerEvent]) -> Vec<&TestEndPayload> {
    events
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::TestEnd(end) => Some(end),
            _ => None,
        })
        .collect()
}

pub(crate) fn statuses(events: &[WorkerEvent]) -> Vec<(&str, TestStatus)> {
    test_ends(events)
        .into_iter()
        .map(|end| (end.test_id.as_str(), end.status))
        .collect()
}

pub(crate) fn error_messages(end: &TestEndPayload) -> Vec<&str> {
    end.errors.iter().map(|error| error.message_str()).collect()
}

pub(crate) fn done(events: &[WorkerEvent]) -> &DonePayload {
    match events.last() {
        Some(WorkerEvent::Done(done)) => done,
        other => panic!("expected the group to end with a done event, got {other:?}"),
    }
}

/// Records what ran, in order, across fixtures, hooks and tests.
#[derive(Clone, Debug, Default)]
pub(crate) struct OrderLog(Arc<Mutex<Vec<String>>>);

impl OrderLog {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A function that logs `entry` when called.
pub(crate) fn logged(log: &OrderLog, entry: &'static str, deps: &[&'static str]) -> TestFunction {
    let log = log.clone();
    TestFunction::new(deps.iter().copied(), move |_, _| {
        let log = log.clone();
        async move {
            log.push(entry);
            Ok(())
        }
    })
}

/// A function that never finishes on its own.
pub(crate) fn hangs(deps: &[&'static str]) -> TestFunction {
    TestFunction::new(deps.iter().copied(), |_, _| async {
        std::future::pending::<()>().await;
        Ok(())
    })
}

/// A fixture function that logs `<name> up` and `<name> down`.
pub(crate) fn logged_fixture(
    log: &OrderLog,
    name: &'static str,
    deps: &[&'static str],
) -> FixtureFn {
    let log = log.clone();
    FixtureFn::new(deps.iter().copied(), move |_, _| {
        let log = log.clone();
        async move {
            log.push(format!("{name} up"));
            Ok(Provided::value(name).with_teardown(move || async move {
                log.push(format!("{name} down"));
                Ok(())
            }))
        }
    })
}

/// A trace recorder that logs when it is asked to start and stop.
#[derive(Debug)]
pub(crate) struct LoggingRecorder(pub(crate) OrderLog);

impl TraceRecorder for LoggingRecorder {
    fn start_if_needed<'a>(
        &'a mut self,
        mode: &'a Value,
        info: &'a TestInfo,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        Box::pin(async move {
            let mode = mode.as_str().unwrap_or("?");
            self.0.push(format!("start {mode} {}", info.test_id()));
            Ok(())
        })
    }

    fn stop_if_needed<'a>(
        &'a mut self,
        info: &'a TestInfo,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        Box::pin(async move {
            self.0.push(format!("stop {}", info.test_id()));
            Ok(())
        })
    }
}
