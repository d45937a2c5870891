// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use pretty_assertions::assert_eq;
use serde_json::json;
use smol_str::SmolStr;
use std::sync::Arc;
use testrig_metadata::{StepCategory, TestStatus, WorkerEvent};
use testrig_runner::{
    errors::TestError,
    fixtures::{FixtureDef, FixtureList, FixtureOptions},
    suite::{Hook, HookKind, Modifier, ModifierKind, SuiteTree, TestCase, TestFunction, TestType},
    worker::AttachmentBody,
};
use test_case::test_case;
use tokio::time::sleep;

fn db_and_page(log: &OrderLog) -> Arc<TestType> {
    Arc::new(TestType::new(vec![
        FixtureList::new(loc(1))
            .fixture(
                "db",
                FixtureDef::func(logged_fixture(log, "db", &[]))
                    .with_options(FixtureOptions::worker()),
            )
            .fixture("page", FixtureDef::func(logged_fixture(log, "page", &["db"]))),
    ]))
}

#[tokio::test]
async fn worker_fixtures_outlive_tests() -> Result<()> {
    test_init();

    let log = OrderLog::default();
    let test_type = db_and_page(&log);
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(
            test_type.clone(),
            "t1",
            "adds to cart",
            loc(10),
            logged(&log, "t1", &["page"]),
        ),
    );
    tree.add_test(
        root,
        TestCase::new(test_type, "t2", "pays", loc(20), logged(&log, "t2", &["page"])),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1", "t2"])).await;

    let events = drain(&mut rx);
    assert_eq!(
        statuses(&events),
        [("t1", TestStatus::Passed), ("t2", TestStatus::Passed)]
    );
    let done = done(&events);
    ensure!(done.fatal_errors.is_empty(), "no fatal errors: {:?}", done.fatal_errors);
    ensure!(done.skip_tests_due_to_setup_failure.is_empty());
    assert_eq!(
        log.take(),
        ["db up", "page up", "t1", "page down", "page up", "t2", "page down"]
    );
    ensure!(worker.fixture_runner().is_live("db"), "db is kept for the next group");
    ensure!(!worker.handle().is_stopped());

    worker.graceful_close().await;
    assert_eq!(log.take(), ["db down"]);
    let events = drain(&mut rx);
    ensure!(events.is_empty(), "clean close reports nothing, got {events:?}");

    Ok(())
}

#[tokio::test]
async fn before_all_failure_skips_rest_of_suite() -> Result<()> {
    test_init();

    let log = OrderLog::default();
    let test_type = Arc::new(TestType::default());
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    let group = tree.add_describe(root, "payments", loc(2));
    tree.add_hook(
        group,
        Hook::new(
            HookKind::BeforeAll,
            loc(3),
            TestFunction::new(Vec::<SmolStr>::new(), |_, _| async {
                Err(TestError::failure("database unavailable"))
            }),
        ),
    );
    tree.add_hook(group, Hook::new(HookKind::AfterAll, loc(4), logged(&log, "afterAll", &[])));
    for (id, line) in [("t1", 10), ("t2", 20), ("t3", 30)] {
        tree.add_test(
            group,
            TestCase::new(
                test_type.clone(),
                id,
                format!("case {id}"),
                loc(line),
                logged(&log, id, &[]),
            ),
        );
    }
    tree.add_test(
        root,
        TestCase::new(test_type, "t4", "unrelated", loc(40), logged(&log, "t4", &[])),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker
        .run_test_group(payload(&["t1", "t2", "t3", "t4"]))
        .await;

    let events = drain(&mut rx);
    assert_eq!(statuses(&events), [("t1", TestStatus::Failed)]);
    assert_eq!(error_messages(test_ends(&events)[0]), ["database unavailable"]);
    // t4 is outside the failing suite, so it is simply not run here.
    assert_eq!(done(&events).skip_tests_due_to_setup_failure, ["t2", "t3"]);
    assert_eq!(log.take(), ["afterAll"], "afterAll runs once, the test body never");
    ensure!(worker.handle().is_stopped(), "a failed test stops the worker");

    Ok(())
}

#[tokio::test]
async fn hooks_run_in_suite_order() {
    test_init();

    let log = OrderLog::default();
    let test_type = Arc::new(TestType::default());
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    for (kind, entry) in [
        (HookKind::BeforeAll, "root beforeAll"),
        (HookKind::AfterAll, "root afterAll"),
        (HookKind::BeforeEach, "root beforeEach"),
        (HookKind::AfterEach, "root afterEach"),
    ] {
        tree.add_hook(root, Hook::new(kind, loc(1), logged(&log, entry, &[])));
    }
    let group = tree.add_describe(root, "cart", loc(5));
    for (kind, entry) in [
        (HookKind::BeforeEach, "cart beforeEach"),
        (HookKind::AfterEach, "cart afterEach"),
        (HookKind::AfterAll, "cart afterAll"),
    ] {
        tree.add_hook(group, Hook::new(kind, loc(6), logged(&log, entry, &[])));
    }
    tree.add_test(
        group,
        TestCase::new(test_type.clone(), "t1", "in cart", loc(10), logged(&log, "t1", &[])),
    );
    tree.add_test(
        root,
        TestCase::new(test_type, "t2", "at root", loc(20), logged(&log, "t2", &[])),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1", "t2"])).await;

    assert_eq!(
        statuses(&drain(&mut rx)),
        [("t1", TestStatus::Passed), ("t2", TestStatus::Passed)]
    );
    assert_eq!(
        log.take(),
        [
            "root beforeAll",
            "root beforeEach",
            "cart beforeEach",
            "t1",
            "cart afterEach",
            "root afterEach",
            "cart afterAll",
            "root beforeEach",
            "t2",
            "root afterEach",
            "root afterAll",
        ]
    );
}

#[tokio::test]
async fn steps_and_attachments() -> Result<()> {
    test_init();

    let test_type = Arc::new(TestType::new(vec![FixtureList::new(loc(1)).fixture(
        "page",
        FixtureDef::func(logged_fixture(&OrderLog::default(), "page", &[])),
    )]));
    let body = TestFunction::new(["page"], |_, info| async move {
        info.step("log in", async {
            info.attach("console", "text/plain", AttachmentBody::Inline("ready".to_owned()));
            Ok(())
        })
        .await
    });
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(root, TestCase::new(test_type, "t1", "logs in", loc(10), body));

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1"])).await;
    let events = drain(&mut rx);
    assert_eq!(statuses(&events), [("t1", TestStatus::Passed)]);

    let steps: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::StepBegin(step) => Some(step),
            _ => None,
        })
        .collect();
    let titles: Vec<_> = steps
        .iter()
        .map(|step| (step.category, step.title.as_str()))
        .collect();
    assert_eq!(
        titles,
        [
            (StepCategory::Hook, "Before Hooks"),
            (StepCategory::Fixture, "fixture: page"),
            (StepCategory::TestStep, "log in"),
            (StepCategory::Attach, "console"),
            (StepCategory::Hook, "After Hooks"),
            (StepCategory::Fixture, "fixture: page"),
        ]
    );
    assert_eq!(steps[1].parent_step_id.as_deref(), Some(steps[0].step_id.as_str()));
    assert_eq!(steps[2].parent_step_id, None);
    assert_eq!(steps[3].parent_step_id.as_deref(), Some(steps[2].step_id.as_str()));
    assert_eq!(steps[5].parent_step_id.as_deref(), Some(steps[4].step_id.as_str()));

    let attachment = events
        .iter()
        .find_map(|event| match event {
            WorkerEvent::Attach(attachment) => Some(attachment),
            _ => None,
        })
        .expect("attachment was sent");
    assert_eq!(attachment.body.as_deref(), Some("ready"));
    assert_eq!(attachment.step_id.as_deref(), Some(steps[3].step_id.as_str()));

    let ends = events
        .iter()
        .filter(|event| matches!(event, WorkerEvent::StepEnd(_)))
        .count();
    ensure!(ends == steps.len(), "every step ends");

    Ok(())
}

#[test_case(ModifierKind::Skip, TestStatus::Skipped ; "skip")]
#[test_case(ModifierKind::Fixme, TestStatus::Skipped ; "fixme")]
#[test_case(ModifierKind::Fail, TestStatus::Failed ; "fail")]
#[tokio::test]
async fn suite_modifiers_apply_to_every_test(kind: ModifierKind, expected: TestStatus) {
    test_init();

    let test_type = Arc::new(TestType::default());
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_modifier(
        root,
        Modifier {
            kind,
            description: Some("flaky backend".to_owned()),
            location: loc(2),
            func: TestFunction::new(Vec::<SmolStr>::new(), |_, _| async { Ok(true) }),
        },
    );
    let failing = TestFunction::new(Vec::<SmolStr>::new(), |_, _| async {
        Err(TestError::assertion("expected 2, got 3"))
    });
    for (id, line) in [("t1", 10), ("t2", 20)] {
        tree.add_test(
            root,
            TestCase::new(test_type.clone(), id, format!("case {id}"), loc(line), failing.clone()),
        );
    }

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1", "t2"])).await;
    let events = drain(&mut rx);

    let ends = test_ends(&events);
    assert_eq!(ends.len(), 2, "both tests ran: {events:?}");
    for end in ends {
        assert_eq!(end.status, expected);
        assert_eq!(end.expected_status, expected);
        let annotation = &end.annotations[0];
        assert_eq!(annotation.kind, kind.as_str());
        assert_eq!(annotation.description.as_deref(), Some("flaky backend"));
    }
    assert!(!worker.handle().is_stopped(), "expected outcomes keep the worker going");
}

#[tokio::test]
async fn skip_from_test_body() {
    test_init();

    let body = TestFunction::new(Vec::<SmolStr>::new(), |_, info| async move {
        info.skip(Some("no payments on sundays"))?;
        Err(TestError::failure("unreachable"))
    });
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(Arc::new(TestType::default()), "t1", "pays", loc(10), body),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1"])).await;
    let events = drain(&mut rx);
    let end = test_ends(&events)[0];
    assert_eq!(end.status, TestStatus::Skipped);
    ensure_no_errors(end);
    assert_eq!(
        end.annotations[0].description.as_deref(),
        Some("no payments on sundays")
    );
}

fn ensure_no_errors(end: &testrig_metadata::TestEndPayload) {
    assert!(end.errors.is_empty(), "unexpected errors: {:?}", end.errors);
}

#[tokio::test]
async fn statically_skipped_tests_run_no_fixtures() {
    test_init();

    let log = OrderLog::default();
    let test_type = db_and_page(&log);
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(test_type.clone(), "t1", "skipped", loc(10), logged(&log, "t1", &["page"]))
            .with_expected_status(TestStatus::Skipped),
    );
    tree.add_test(
        root,
        TestCase::new(test_type, "t2", "runs", loc(20), logged(&log, "t2", &["page"])),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1", "t2"])).await;

    assert_eq!(
        statuses(&drain(&mut rx)),
        [("t1", TestStatus::Skipped), ("t2", TestStatus::Passed)]
    );
    assert_eq!(log.take(), ["db up", "page up", "t2", "page down"]);
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_current_test() -> Result<()> {
    test_init();

    let log = OrderLog::default();
    let test_type = db_and_page(&log);
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(test_type.clone(), "t1", "hangs", loc(10), hangs(&["page"])),
    );
    tree.add_test(
        root,
        TestCase::new(test_type, "t2", "never runs", loc(20), logged(&log, "t2", &["page"])),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    let handle = worker.handle();
    tokio::join!(worker.run_test_group(payload(&["t1", "t2"])), async {
        sleep(ms(100)).await;
        handle.stop();
    });

    let events = drain(&mut rx);
    assert_eq!(statuses(&events), [("t1", TestStatus::Interrupted)]);
    ensure_no_errors(test_ends(&events)[0]);
    assert_eq!(log.take(), ["db up", "page up", "page down", "db down"]);
    ensure!(
        !worker.fixture_runner().is_live("db"),
        "worker fixtures are torn down when the worker stops"
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn interrupt_stops_remaining_after_each_hooks() {
    test_init();

    let log = OrderLog::default();
    let test_type = Arc::new(TestType::default());
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_hook(
        root,
        Hook::new(HookKind::AfterEach, loc(1), logged(&log, "outer afterEach", &[])),
    );
    let group = tree.add_describe(root, "checkout", loc(5));
    tree.add_hook(group, Hook::new(HookKind::AfterEach, loc(6), hangs(&[])));
    tree.add_test(group, TestCase::new(test_type, "t1", "pays", loc(10), logged(&log, "t1", &[])));

    // Without a timeout, only the interruption ends the hanging hook.
    let (mut worker, mut rx) = make_worker(tree, config_with_timeout("0s"));
    let handle = worker.handle();
    tokio::join!(worker.run_test_group(payload(&["t1"])), async {
        sleep(ms(100)).await;
        handle.stop();
    });

    assert_eq!(statuses(&drain(&mut rx)), [("t1", TestStatus::Interrupted)]);
    assert_eq!(log.take(), ["t1"]);
}

#[tokio::test(start_paused = true)]
async fn unhandled_error_fails_current_test() {
    test_init();

    let test_type = Arc::new(TestType::default());
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(root, TestCase::new(test_type.clone(), "t1", "hangs", loc(10), hangs(&[])));
    tree.add_test(root, TestCase::new(test_type, "t2", "never runs", loc(20), hangs(&[])));

    let (mut worker, mut rx) = make_worker(tree, default_config());
    let handle = worker.handle();
    tokio::join!(worker.run_test_group(payload(&["t1", "t2"])), async {
        sleep(ms(100)).await;
        handle.unhandled_error(&TestError::failure("connection reset"));
    });

    let events = drain(&mut rx);
    assert_eq!(statuses(&events), [("t1", TestStatus::Failed)]);
    assert_eq!(error_messages(test_ends(&events)[0]), ["connection reset"]);
    assert!(worker.handle().is_stopped());
    assert!(done(&events).fatal_errors.is_empty());
}

#[tokio::test]
async fn trace_mode_comes_from_project_options() {
    test_init();

    let log = OrderLog::default();
    let test_type = Arc::new(TestType::new(vec![FixtureList::new(loc(1)).fixture(
        "trace",
        FixtureDef::value("off").with_options(FixtureOptions::worker().option()),
    )]));
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(root, TestCase::new(test_type, "t1", "traced", loc(10), logged(&log, "t1", &[])));

    let config = json!({
        "projects": [{ "id": "default", "name": "chromium", "use": { "trace": "on" } }],
    });
    let (worker, mut rx) = make_worker(tree, config);
    let mut worker = worker.with_recorder(LoggingRecorder(log.clone()));
    worker.run_test_group(payload(&["t1"])).await;

    assert_eq!(statuses(&drain(&mut rx)), [("t1", TestStatus::Passed)]);
    assert_eq!(log.take(), ["start on t1", "t1", "stop t1"]);
}

#[tokio::test]
async fn unknown_project_is_fatal() {
    test_init();

    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(Arc::new(TestType::default()), "t1", "never runs", loc(10), hangs(&[])),
    );
    let config = json!({ "projects": [{ "id": "firefox" }] });
    let (mut worker, mut rx) = make_worker(tree, config);
    worker.run_test_group(payload(&["t1"])).await;

    let events = drain(&mut rx);
    ensure_no_test_events(&events);
    let done = done(&events);
    assert_eq!(done.fatal_errors.len(), 1);
    assert_eq!(
        done.fatal_errors[0].message_str(),
        "project `default` not found (known projects: firefox)"
    );
}

fn ensure_no_test_events(events: &[WorkerEvent]) {
    assert!(
        events.iter().all(|event| event.test_id().is_none()),
        "no test should have started: {events:?}"
    );
}

// The stack size of a default spawned thread, independent of RUST_MIN_STACK.
const DEFAULT_THREAD_STACK: usize = 2 * 1024 * 1024;

#[test]
fn nested_suites_fit_on_a_default_stack() {
    test_init();

    let log = OrderLog::default();
    let test_type = db_and_page(&log);
    let mut tree = SuiteTree::new(TEST_FILE);
    let mut suite = tree.root();
    for depth in 0..4 {
        suite = tree.add_describe(suite, format!("level {depth}"), loc(depth + 1));
        for kind in [
            HookKind::BeforeAll,
            HookKind::BeforeEach,
            HookKind::AfterEach,
            HookKind::AfterAll,
        ] {
            tree.add_hook(suite, Hook::new(kind, loc(depth + 1), logged(&log, "hook", &["db"])));
        }
    }
    tree.add_test(
        suite,
        TestCase::new(test_type, "t1", "deep", loc(10), logged(&log, "t1", &["page"])),
    );

    let outcome = std::thread::Builder::new()
        .stack_size(DEFAULT_THREAD_STACK)
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime builds");
            runtime.block_on(async move {
                let (mut worker, mut rx) = make_worker(tree, default_config());
                worker.run_test_group(payload(&["t1"])).await;
                worker.graceful_close().await;
                test_ends(&drain(&mut rx))
                    .into_iter()
                    .map(|end| (end.test_id.clone(), end.status))
                    .collect::<Vec<_>>()
            })
        })
        .expect("thread spawns")
        .join()
        .expect("worker thread did not crash");

    assert_eq!(outcome, [("t1".to_owned(), TestStatus::Passed)]);
    assert_eq!(log.take().iter().filter(|entry| *entry == "hook").count(), 16);
}
