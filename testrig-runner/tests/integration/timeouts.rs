// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use pretty_assertions::assert_eq;
use smol_str::SmolStr;
use std::sync::{Arc, Mutex};
use testrig_metadata::{TestStatus, WorkerEvent};
use testrig_runner::{
    fixtures::{FixtureDef, FixtureFn, FixtureList, FixtureOptions, Provided},
    suite::{Hook, HookKind, SuiteTree, TestCase, TestFunction, TestType},
};
use tokio::time::{Instant, sleep};

fn sleeping_fixture(duration: std::time::Duration) -> FixtureFn {
    FixtureFn::new(Vec::<SmolStr>::new(), move |_, _| async move {
        sleep(duration).await;
        Ok(Provided::value(()))
    })
}

#[tokio::test(start_paused = true)]
async fn fixture_timeout_is_its_own() -> Result<()> {
    test_init();

    let log = OrderLog::default();
    let test_type = Arc::new(TestType::new(vec![FixtureList::new(loc(1)).fixture(
        "slowDb",
        FixtureDef::func(sleeping_fixture(ms(10_000)))
            .with_options(FixtureOptions::worker().timeout(ms(100))),
    )]));
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(test_type, "t1", "queries", loc(10), logged(&log, "t1", &["slowDb"])),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    let started = Instant::now();
    worker.run_test_group(payload(&["t1"])).await;
    let elapsed = started.elapsed();

    let events = drain(&mut rx);
    let end = test_ends(&events)[0];
    assert_eq!(end.status, TestStatus::TimedOut);
    assert_eq!(
        error_messages(end),
        ["Fixture \"slowDb\" timeout of 100ms exceeded during setup."]
    );
    assert_eq!(
        end.errors[0].location.as_ref(),
        Some(&loc(1)),
        "attributed to the fixture declaration"
    );
    ensure!(log.take().is_empty(), "the test body never ran");
    ensure!(elapsed < ms(1000), "fixture slot expired first, took {elapsed:?}");
    ensure!(worker.handle().is_stopped());
    ensure!(!worker.fixture_runner().is_live("slowDb"));

    // Setup never finished, but teardown is still attempted as part of worker cleanup.
    let steps: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::StepBegin(step) => Some(step),
            _ => None,
        })
        .collect();
    let cleanup = steps
        .iter()
        .find(|step| step.title == "Worker Cleanup")
        .expect("worker cleanup ran");
    let slow_db: Vec<_> = steps
        .iter()
        .filter(|step| step.title == "fixture: slowDb")
        .map(|step| step.parent_step_id.as_deref())
        .collect();
    assert_eq!(slow_db.len(), 2, "a setup step and a teardown step");
    assert_eq!(slow_db[1], Some(cleanup.step_id.as_str()));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn setup_time_counts_against_test() -> Result<()> {
    test_init();

    let body_started = Arc::new(Mutex::new(None));
    let test_type = Arc::new(TestType::new(vec![FixtureList::new(loc(1)).fixture(
        "page",
        FixtureDef::func(sleeping_fixture(ms(400))),
    )]));
    let body = {
        let body_started = body_started.clone();
        TestFunction::new(["page"], move |_, _| {
            let body_started = body_started.clone();
            async move {
                *body_started.lock().unwrap() = Some(Instant::now());
                std::future::pending::<()>().await;
                Ok(())
            }
        })
    };
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(test_type, "t1", "loads", loc(10), body).with_timeout(ms(1000)),
    );

    let (mut worker, mut rx) = make_worker(tree, config_with_timeout("5s"));
    let started = Instant::now();
    worker.run_test_group(payload(&["t1"])).await;
    let finished = Instant::now();

    let events = drain(&mut rx);
    let end = test_ends(&events)[0];
    assert_eq!(end.status, TestStatus::TimedOut);
    assert_eq!(error_messages(end), ["Test timeout of 1000ms exceeded."]);
    assert_eq!(end.timeout, ms(1000));

    let body_started = body_started.lock().unwrap().expect("test body started");
    let setup = body_started - started;
    let body = finished - body_started;
    ensure!(setup >= ms(400) && setup < ms(450), "setup took {setup:?}");
    ensure!(body >= ms(600) && body < ms(650), "body ran for {body:?}");
    ensure!(
        end.duration >= ms(1000) && end.duration < ms(1050),
        "reported duration {:?}",
        end.duration
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_triples_remaining_time() {
    test_init();

    let body = TestFunction::new(Vec::<SmolStr>::new(), |_, info| async move {
        info.slow(Some("large catalog"));
        sleep(ms(2500)).await;
        Ok(())
    });
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    tree.add_test(
        root,
        TestCase::new(Arc::new(TestType::default()), "t1", "browses", loc(10), body),
    );

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1"])).await;

    let events = drain(&mut rx);
    let end = test_ends(&events)[0];
    assert_eq!(end.status, TestStatus::Passed, "errors: {:?}", end.errors);
    assert_eq!(end.timeout, ms(3000));
    assert_eq!(end.annotations[0].kind, "slow");
}

#[tokio::test(start_paused = true)]
async fn all_hooks_have_their_own_slots() {
    test_init();

    let test_type = Arc::new(TestType::default());
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    // Close to the project timeout, but drawn from a separate slot.
    tree.add_hook(
        root,
        Hook::new(
            HookKind::BeforeAll,
            loc(2),
            TestFunction::new(Vec::<SmolStr>::new(), |_, _| async {
                sleep(ms(900)).await;
                Ok(())
            }),
        ),
    );
    tree.add_hook(
        root,
        Hook::new(
            HookKind::AfterAll,
            loc(3),
            TestFunction::new(Vec::<SmolStr>::new(), |_, _| async {
                sleep(ms(5000)).await;
                Ok(())
            }),
        ),
    );
    let body = TestFunction::new(Vec::<SmolStr>::new(), |_, _| async {
        sleep(ms(900)).await;
        Ok(())
    });
    tree.add_test(root, TestCase::new(test_type, "t1", "first", loc(10), body));

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1"])).await;

    let events = drain(&mut rx);
    let end = test_ends(&events)[0];
    assert_eq!(end.status, TestStatus::TimedOut);
    assert_eq!(
        error_messages(end),
        ["\"afterAll\" hook timeout of 1000ms exceeded."]
    );
}

#[tokio::test(start_paused = true)]
async fn after_each_gets_fresh_time_after_timeout() {
    test_init();

    let log = OrderLog::default();
    let test_type = Arc::new(TestType::default());
    let mut tree = SuiteTree::new(TEST_FILE);
    let root = tree.root();
    let after_each = {
        let log = log.clone();
        TestFunction::new(Vec::<SmolStr>::new(), move |_, _| {
            let log = log.clone();
            async move {
                sleep(ms(500)).await;
                log.push("afterEach");
                Ok(())
            }
        })
    };
    tree.add_hook(root, Hook::new(HookKind::AfterEach, loc(2), after_each));
    tree.add_test(root, TestCase::new(test_type, "t1", "hangs", loc(10), hangs(&[])));

    let (mut worker, mut rx) = make_worker(tree, default_config());
    worker.run_test_group(payload(&["t1"])).await;

    let events = drain(&mut rx);
    let end = test_ends(&events)[0];
    assert_eq!(end.status, TestStatus::TimedOut);
    assert_eq!(error_messages(end), ["Test timeout of 1000ms exceeded."]);
    assert_eq!(log.take(), ["afterEach"]);
}
