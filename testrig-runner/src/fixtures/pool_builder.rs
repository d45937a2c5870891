// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{FixturePool, OptionOverrides, PoolOptions, RegistrationIds};
use crate::{
    errors::{LoadError, PoolConstructError},
    suite::{SuiteKind, SuiteTree, TestType},
};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PoolBuilderKind {
    Loader,
    Worker,
}

/// Builds the fixture pool of every test in a [`SuiteTree`].
///
/// A test's pool is the pool of its test type, extended with the `use()` lists of its enclosing
/// suites. The builder keeps the [`RegistrationIds`] table, so it should live as long as the
/// process.
#[derive(Debug)]
pub struct PoolBuilder {
    kind: PoolBuilderKind,
    ids: RegistrationIds,
    // Keyed by test type address. The `Arc<TestType>` is held so the address stays unique.
    test_type_pools: HashMap<usize, (Arc<TestType>, Arc<FixturePool>)>,
    option_overrides: Option<OptionOverrides>,
}

impl PoolBuilder {
    /// A builder for a worker: the first load error fails the build.
    pub fn for_worker(option_overrides: Option<OptionOverrides>) -> Self {
        Self::new(PoolBuilderKind::Worker, option_overrides)
    }

    /// A builder for the loader: load errors are collected and returned.
    pub fn for_loader(option_overrides: Option<OptionOverrides>) -> Self {
        Self::new(PoolBuilderKind::Loader, option_overrides)
    }

    fn new(kind: PoolBuilderKind, option_overrides: Option<OptionOverrides>) -> Self {
        Self {
            kind,
            ids: RegistrationIds::new(),
            test_type_pools: HashMap::new(),
            option_overrides,
        }
    }

    /// Builds and assigns the pool of every test in `tree`, validating the parameters of tests,
    /// hooks and modifiers against it.
    ///
    /// For a loader builder, returns every load error found. For a worker builder, fails with
    /// the first one.
    pub fn build_pools(
        &mut self,
        tree: &mut SuiteTree,
    ) -> Result<Vec<LoadError>, PoolConstructError> {
        let mut errors = Vec::new();

        for test in tree.tests() {
            let test_type = tree.test(test).test_type().clone();
            let mut pool = self.test_type_pool(&test_type, &mut errors);

            for suite_id in tree.ancestors(test) {
                let suite = tree.suite(suite_id);
                if !suite.uses().is_empty() {
                    pool = Arc::new(FixturePool::new(
                        &mut self.ids,
                        suite.uses(),
                        PoolOptions {
                            parent: Some(&pool),
                            disallow_worker_fixtures: suite.kind() == SuiteKind::Describe,
                            option_overrides: None,
                        },
                        &mut |error| errors.push(error),
                    ));
                }
                for hook in suite.hooks() {
                    pool.validate_function(
                        hook.func.deps(),
                        &format!("{} hook", hook.kind),
                        &hook.location,
                        &mut |error| errors.push(error),
                    );
                }
                for modifier in suite.modifiers() {
                    pool.validate_function(
                        modifier.func.deps(),
                        &format!("{} modifier", modifier.kind),
                        &modifier.location,
                        &mut |error| errors.push(error),
                    );
                }
            }

            let case = tree.test(test);
            pool.validate_function(
                case.func().deps(),
                "Test",
                case.location(),
                &mut |error| errors.push(error),
            );
            debug!(test_id = %case.id(), digest = %pool.digest(), "assigned fixture pool");
            tree.test_mut(test).set_pool(pool);

            if self.kind == PoolBuilderKind::Worker && !errors.is_empty() {
                let total = errors.len();
                let first = errors.swap_remove(0);
                return Err(PoolConstructError::new(first, total));
            }
        }

        Ok(errors)
    }

    fn test_type_pool(
        &mut self,
        test_type: &Arc<TestType>,
        errors: &mut Vec<LoadError>,
    ) -> Arc<FixturePool> {
        let key = Arc::as_ptr(test_type) as usize;
        if let Some((_, pool)) = self.test_type_pools.get(&key) {
            return pool.clone();
        }
        let pool = Arc::new(FixturePool::new(
            &mut self.ids,
            test_type.fixtures(),
            PoolOptions {
                parent: None,
                disallow_worker_fixtures: false,
                option_overrides: self.option_overrides.as_ref(),
            },
            &mut |error| errors.push(error),
        ));
        self.test_type_pools
            .insert(key, (test_type.clone(), pool.clone()));
        pool
    }
}
