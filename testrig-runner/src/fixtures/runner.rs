// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    FixtureAuto, FixtureBody, FixtureId, FixturePool, FixtureRegistration, FixtureScope,
    FixtureValue, Fixtures, Teardown,
};
use crate::{
    errors::{SetPoolError, TestError},
    suite::TestFunction,
    time::{FixtureDescription, FixturePhase, RunnableDescription, TimeSlot},
    worker::{TestInfo, TestStage},
};
use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;
use std::{collections::HashSet, sync::Arc};
use testrig_metadata::StepCategory;
use tracing::{debug, warn};

/// Which auto fixtures to set up when resolving parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AutoFixtures {
    /// All auto fixtures, as for a test or a `beforeEach`/`afterEach` hook.
    Test,

    /// Worker-scoped auto fixtures plus those marked `all-hooks-included`, as for
    /// `beforeAll`/`afterAll` hooks.
    AllHooksOnly,

    /// Worker-scoped auto fixtures only.
    Worker,
}

#[derive(Debug)]
struct FixtureInstance {
    registration: Arc<FixtureRegistration>,
    value: Option<FixtureValue>,
    failed: bool,
    teardown: Option<Teardown>,
    // Instances this one depends on.
    deps: IndexSet<FixtureId>,
    // Live instances that depend on this one.
    usages: IndexSet<FixtureId>,
}

impl FixtureInstance {
    fn new(registration: Arc<FixtureRegistration>) -> Self {
        Self {
            registration,
            value: None,
            failed: false,
            teardown: None,
            deps: IndexSet::new(),
            usages: IndexSet::new(),
        }
    }
}

/// Owns the live fixture instances of a worker.
///
/// Instances are created on demand, at most one per registration, and torn down per scope in
/// reverse order of creation, dependents first.
#[derive(Debug)]
pub struct FixtureRunner {
    pool: Option<Arc<FixturePool>>,
    instances: IndexMap<FixtureId, FixtureInstance>,
    test_scope_clean: bool,
}

impl Default for FixtureRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureRunner {
    /// Creates a runner with no pool and no live instances.
    pub fn new() -> Self {
        Self {
            pool: None,
            instances: IndexMap::new(),
            test_scope_clean: true,
        }
    }

    /// Switches to the pool of the next test.
    ///
    /// Fails if test-scoped fixtures were not torn down, or if worker fixtures are live and the
    /// new pool would resolve them differently.
    pub fn set_pool(&mut self, pool: Arc<FixturePool>) -> Result<(), SetPoolError> {
        if !self.test_scope_clean {
            return Err(SetPoolError::TestScopeNotClean);
        }
        if let Some(current) = &self.pool
            && current.digest() != pool.digest()
            && !self.instances.is_empty()
        {
            return Err(SetPoolError::InconsistentOptions {
                previous: current.digest().to_owned(),
                new: pool.digest().to_owned(),
            });
        }
        self.pool = Some(pool);
        Ok(())
    }

    /// The pool currently in use.
    pub fn pool(&self) -> Option<&Arc<FixturePool>> {
        self.pool.as_ref()
    }

    /// Returns true if every parameter resolves to a worker-scoped fixture.
    pub fn depends_on_worker_fixtures_only(&self, deps: &[SmolStr]) -> bool {
        let Some(pool) = &self.pool else {
            return false;
        };
        deps.iter().all(|name| {
            pool.resolve(name, None)
                .is_some_and(|registration| registration.scope() == FixtureScope::Worker)
        })
    }

    /// The number of live instances in `scope`.
    pub fn instance_count(&self, scope: FixtureScope) -> usize {
        self.instances
            .values()
            .filter(|instance| instance.registration.scope() == scope)
            .count()
    }

    /// Returns true if there is a live instance of the fixture currently registered as `name`.
    pub fn is_live(&self, name: &str) -> bool {
        self.pool
            .as_ref()
            .and_then(|pool| pool.registration(name))
            .is_some_and(|registration| self.instances.contains_key(&registration.id()))
    }

    /// Sets up everything a function with the given parameters needs, and returns the parameter
    /// values.
    ///
    /// Auto fixtures selected by `auto` are set up first, worker-scoped ones before test-scoped
    /// ones, then the parameters. Dependencies are always set up before their dependents.
    /// Returns `Ok(None)` if a required fixture failed now or earlier.
    pub async fn resolve_parameters_for_function(
        &mut self,
        deps: &[SmolStr],
        info: &TestInfo,
        auto: AutoFixtures,
        runnable: &RunnableDescription,
    ) -> Result<Option<Fixtures>, TestError> {
        let pool = self.current_pool()?;

        let mut auto_fixtures: Vec<_> = pool
            .auto_fixtures()
            .filter(|registration| match auto {
                AutoFixtures::Test => true,
                AutoFixtures::AllHooksOnly => {
                    registration.scope() == FixtureScope::Worker
                        || registration.auto() == FixtureAuto::AllHooksIncluded
                }
                AutoFixtures::Worker => registration.scope() == FixtureScope::Worker,
            })
            .collect();
        auto_fixtures.sort_by_key(|registration| registration.scope() != FixtureScope::Worker);

        let mut ordered = IndexMap::new();
        let mut visiting = HashSet::new();
        for registration in auto_fixtures {
            collect_in_setup_order(&pool, registration, &mut ordered, &mut visiting);
        }
        for name in deps {
            if let Some(registration) = pool.resolve(name, None) {
                collect_in_setup_order(&pool, registration, &mut ordered, &mut visiting);
            }
        }

        for registration in ordered.values() {
            Box::pin(self.setup_fixture_for_registration(&pool, registration, info, runnable))
                .await?;
            let failed = self
                .instances
                .get(&registration.id())
                .is_none_or(|instance| instance.failed);
            if failed {
                return Ok(None);
            }
        }

        let mut params = Fixtures::default();
        for name in deps {
            let value = pool
                .resolve(name, None)
                .and_then(|registration| self.instances.get(&registration.id()))
                .filter(|instance| !instance.failed)
                .and_then(|instance| instance.value.clone());
            match value {
                Some(value) => params.insert(name.clone(), value),
                None => return Ok(None),
            }
        }
        Ok(Some(params))
    }

    /// Resolves the parameters of `func` and runs it as `runnable`.
    ///
    /// Returns `Ok(false)` without running it if a required fixture failed.
    pub async fn resolve_parameters_and_run_function(
        &mut self,
        func: &TestFunction,
        info: &TestInfo,
        auto: AutoFixtures,
        runnable: RunnableDescription,
    ) -> Result<bool, TestError> {
        let Some(params) =
            Box::pin(self.resolve_parameters_for_function(func.deps(), info, auto, &runnable))
                .await?
        else {
            return Ok(false);
        };
        info.run_as_stage(
            TestStage::new("function").with_runnable(runnable),
            func.call(params, info.clone()),
        )
        .await?;
        Ok(true)
    }

    /// Tears down every live instance of `scope`.
    ///
    /// Dependents are torn down before what they depend on. Teardown continues past errors and
    /// the first error is returned, except that an interruption stops it immediately. Either
    /// way, no instance of `scope` is left behind.
    pub async fn teardown_scope(
        &mut self,
        scope: FixtureScope,
        info: &TestInfo,
        runnable: &RunnableDescription,
    ) -> Result<(), TestError> {
        let mut collector = IndexSet::new();
        for &id in self.instances.keys().rev() {
            self.collect_in_teardown_order(id, scope, &mut collector);
        }
        debug!(%scope, count = collector.len(), "tearing down fixtures");

        let mut first_error = None;
        for &id in &collector {
            match Box::pin(self.teardown_instance(id, info, runnable)).await {
                Ok(()) => {}
                Err(error) if error.is_interrupt() => {
                    first_error = Some(error);
                    break;
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        // After an interruption the remaining instances are dropped without running teardown.
        for &id in &collector {
            self.remove_instance(id);
        }
        if scope == FixtureScope::Test {
            self.test_scope_clean = true;
        }
        first_error.map_or(Ok(()), Err)
    }

    fn current_pool(&self) -> Result<Arc<FixturePool>, TestError> {
        self.pool
            .clone()
            .ok_or_else(|| TestError::failure("internal error: no fixture pool set"))
    }

    async fn setup_fixture_for_registration(
        &mut self,
        pool: &FixturePool,
        registration: &Arc<FixtureRegistration>,
        info: &TestInfo,
        runnable: &RunnableDescription,
    ) -> Result<(), TestError> {
        if registration.scope() == FixtureScope::Test {
            self.test_scope_clean = false;
        }
        if self.instances.contains_key(&registration.id()) {
            return Ok(());
        }

        let id = registration.id();
        self.instances
            .insert(id, FixtureInstance::new(registration.clone()));

        let mut params = Fixtures::default();
        let mut dep_ids = IndexSet::new();
        let mut deps_ok = true;
        for name in registration.deps() {
            let dep = pool
                .resolve(name, Some(registration.as_ref()))
                .and_then(|dep| self.instances.get_mut(&dep.id()));
            let Some(dep) = dep else {
                deps_ok = false;
                break;
            };
            dep.usages.insert(id);
            dep_ids.insert(dep.registration.id());
            match (&dep.value, dep.failed) {
                (Some(value), false) => params.insert(name.clone(), value.clone()),
                _ => {
                    deps_ok = false;
                    break;
                }
            }
        }

        let Some(instance) = self.instances.get_mut(&id) else {
            return Ok(());
        };
        instance.deps = dep_ids;
        if !deps_ok {
            debug!(fixture = %registration.name(), "dependency failed, not setting up");
            instance.failed = true;
            return Ok(());
        }

        let func = match registration.body() {
            FixtureBody::Func(func) => func.clone(),
            FixtureBody::Value(value) => {
                instance.value = Some(Arc::new(value.clone()));
                return Ok(());
            }
            FixtureBody::Unset => {
                instance.value = Some(Arc::new(serde_json::Value::Null));
                return Ok(());
            }
        };

        let result = info
            .run_as_stage(
                fixture_stage(registration, FixturePhase::Setup, runnable),
                func.call(params, info.clone()),
            )
            .await;

        let Some(instance) = self.instances.get_mut(&id) else {
            return result.map(drop);
        };
        match result {
            Ok(provided) => {
                instance.value = Some(provided.value);
                instance.teardown = provided.teardown;
                Ok(())
            }
            Err(error) => {
                instance.failed = true;
                Err(error)
            }
        }
    }

    fn collect_in_teardown_order(
        &self,
        id: FixtureId,
        scope: FixtureScope,
        collector: &mut IndexSet<FixtureId>,
    ) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        if instance.registration.scope() != scope {
            return;
        }
        for &usage in &instance.usages {
            self.collect_in_teardown_order(usage, scope, collector);
        }
        collector.insert(id);
    }

    async fn teardown_instance(
        &mut self,
        id: FixtureId,
        info: &TestInfo,
        runnable: &RunnableDescription,
    ) -> Result<(), TestError> {
        let Some(instance) = self.instances.get_mut(&id) else {
            return Ok(());
        };
        let registration = instance.registration.clone();
        if !instance.usages.is_empty() {
            warn!(
                fixture = %registration.name(),
                "internal error: fixture integrity, tearing down while still in use",
            );
            instance.usages.clear();
        }
        let teardown = instance.teardown.take();

        let mut result = Ok(());
        if registration.is_function() {
            let stage = fixture_stage(&registration, FixturePhase::Teardown, runnable);
            let exhausted = stage
                .runnable()
                .is_some_and(|runnable| info.timeout_manager().is_time_exhausted_for(runnable));
            if !exhausted {
                result = info
                    .run_as_stage(stage, async move {
                        match teardown {
                            Some(teardown) => teardown.run().await,
                            None => Ok(()),
                        }
                    })
                    .await;
            }
        }

        self.remove_instance(id);
        result
    }

    fn remove_instance(&mut self, id: FixtureId) {
        let Some(instance) = self.instances.shift_remove(&id) else {
            return;
        };
        for dep in &instance.deps {
            if let Some(dep) = self.instances.get_mut(dep) {
                dep.usages.shift_remove(&id);
            }
        }
        debug!(fixture = %instance.registration.name(), "fixture instance removed");
    }
}

fn collect_in_setup_order(
    pool: &FixturePool,
    registration: &Arc<FixtureRegistration>,
    ordered: &mut IndexMap<FixtureId, Arc<FixtureRegistration>>,
    visiting: &mut HashSet<FixtureId>,
) {
    if ordered.contains_key(&registration.id()) || !visiting.insert(registration.id()) {
        return;
    }
    for name in registration.deps() {
        if let Some(dep) = pool.resolve(name, Some(registration.as_ref())) {
            collect_in_setup_order(pool, dep, ordered, visiting);
        }
    }
    ordered.insert(registration.id(), registration.clone());
}

fn fixture_stage(
    registration: &FixtureRegistration,
    phase: FixturePhase,
    runnable: &RunnableDescription,
) -> TestStage {
    let title = registration.title();
    let location = Some(registration.location().clone());
    let fixture = FixtureDescription {
        title: title.to_owned(),
        phase,
        location: location.clone(),
        slot: registration.timeout().map(TimeSlot::new),
    };
    let stage = TestStage::new(format!("fixture: {title}"))
        .with_location(location)
        .with_runnable(runnable.clone().with_fixture(fixture));
    if registration.is_boxed() {
        stage
    } else {
        stage.with_step(StepCategory::Fixture)
    }
}
