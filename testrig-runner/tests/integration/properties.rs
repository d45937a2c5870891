// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::ms;
use proptest::{
    collection::{btree_map, vec},
    prelude::*,
};
use std::collections::BTreeMap;
use testrig_metadata::Location;
use testrig_runner::{
    fixtures::{
        FixtureDef, FixtureFn, FixtureList, FixtureOptions, FixturePool, PoolOptions, Provided,
        RegistrationIds,
    },
    time::{RunnableDescription, RunnableType, TimeoutManager},
};
use test_strategy::proptest;
use tokio::time::{Instant, sleep};

fn worker_list<'a>(values: impl Iterator<Item = (&'a String, &'a u32)>) -> FixtureList {
    values.fold(FixtureList::new(Location::new("fixtures.ts", 1, 1)), |list, (name, value)| {
        list.fixture(
            format!("w_{name}"),
            FixtureDef::value(*value).with_options(FixtureOptions::worker()),
        )
    })
}

fn build(ids: &mut RegistrationIds, lists: &[FixtureList]) -> FixturePool {
    FixturePool::try_new(ids, lists, PoolOptions::default()).expect("pool is valid")
}

#[proptest]
fn digest_depends_on_worker_fixtures_only(
    #[strategy(btree_map("[a-z]{1,8}", any::<u32>(), 1..8))] worker_values: BTreeMap<String, u32>,
    #[strategy(vec("[a-z]{1,8}", 0..4))] test_names: Vec<String>,
) {
    let mut ids = RegistrationIds::new();
    let forward = build(&mut ids, &[worker_list(worker_values.iter())]);
    let backward = build(&mut ids, &[worker_list(worker_values.iter().rev())]);
    prop_assert_eq!(forward.digest(), backward.digest());

    let tests = test_names
        .iter()
        .fold(FixtureList::new(Location::new("fixtures.ts", 2, 1)), |list, name| {
            list.fixture(format!("t_{name}"), FixtureDef::value(name.as_str()))
        });
    let with_tests = build(&mut ids, &[worker_list(worker_values.iter()), tests]);
    prop_assert_eq!(forward.digest(), with_tests.digest());

    let mut changed = worker_values.clone();
    if let Some(value) = changed.values_mut().next() {
        *value = value.wrapping_add(1);
    }
    let changed = build(&mut ids, &[worker_list(changed.iter())]);
    prop_assert_ne!(forward.digest(), changed.digest());
}

#[proptest]
fn cycles_name_every_member(#[strategy(2usize..8)] len: usize) {
    let names: Vec<_> = (0..len).map(|i| format!("f{i}")).collect();
    let list = names
        .iter()
        .enumerate()
        .fold(FixtureList::new(Location::new("fixtures.ts", 1, 1)), |list, (i, name)| {
            let next = names[(i + 1) % len].clone();
            let func = FixtureFn::new([next], |_, _| async { Ok(Provided::value(())) });
            list.fixture(name.as_str(), FixtureDef::func(func))
        });

    let error = FixturePool::try_new(&mut RegistrationIds::new(), &[list], PoolOptions::default())
        .expect_err("fixtures form a cycle");
    prop_assert_eq!(error.total(), 1);
    let message = error.load_error().message();
    prop_assert!(message.starts_with("Fixtures \"f0\" -> "), "{}", message);
    prop_assert!(message.contains("form a dependency cycle"), "{}", message);
    for name in &names {
        prop_assert!(message.contains(&format!("\"{name}\"")), "{} missing from {}", name, message);
    }
}

#[proptest(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
fn runnables_share_the_default_slot(#[strategy(0u64..1000)] setup_ms: u64) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime builds");

    let (result, body_time) = runtime.block_on(async {
        let manager = TimeoutManager::new(ms(1000));
        let runnable = RunnableDescription::new(RunnableType::Test);
        manager
            .with_runnable(Some(runnable.clone()), sleep(ms(setup_ms)))
            .await
            .expect("setup fits in the slot");

        let started = Instant::now();
        let result = manager
            .with_runnable(Some(runnable), std::future::pending::<()>())
            .await;
        (result, started.elapsed())
    });

    let error = result.expect_err("the body never finishes");
    prop_assert_eq!(error.message(), "Test timeout of 1000ms exceeded.");
    let remaining = ms(1000 - setup_ms);
    prop_assert!(
        body_time >= remaining && body_time < remaining + ms(5),
        "body ran for {:?}, expected {:?}",
        body_time,
        remaining
    );
}
