// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    FixtureAuto, FixtureBody, FixtureDef, FixtureFn, FixtureList, FixtureOptions, FixtureScope,
};
use crate::errors::{LoadError, PoolConstructError};
use indexmap::IndexMap;
use itertools::Itertools;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    sync::Arc,
    time::Duration,
};
use testrig_metadata::Location;
use tracing::debug;

/// The stable id of a registration.
///
/// Ids are assigned by a [`RegistrationIds`] table. Two registrations with the same name, the
/// same overridden registration and the same function (or plain value) get the same id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FixtureId(u64);

impl fmt::Display for FixtureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum BodyIdentity {
    Func(usize),
    // Plain values are identified by their canonical JSON rendering.
    Value(String),
}

/// Allocates [`FixtureId`]s.
///
/// A single table should be shared by every pool built in a process, so that ids (and the
/// digests derived from them) agree between pools.
///
/// Functions are identified by address, so the table holds on to every function it has
/// assigned an id to. An address is never reused while the table is alive.
#[derive(Debug, Default)]
pub struct RegistrationIds {
    ids: HashMap<(SmolStr, Option<FixtureId>), HashMap<BodyIdentity, FixtureId>>,
    functions: Vec<FixtureFn>,
    next: u64,
}

impl RegistrationIds {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn assign(
        &mut self,
        name: &SmolStr,
        super_id: Option<FixtureId>,
        body: &FixtureBody,
    ) -> FixtureId {
        let identity = match body {
            FixtureBody::Func(func) => BodyIdentity::Func(func.identity()),
            FixtureBody::Value(value) => BodyIdentity::Value(value.to_string()),
            FixtureBody::Unset => BodyIdentity::Value(String::new()),
        };
        let by_body = self.ids.entry((name.clone(), super_id)).or_default();
        match by_body.entry(identity) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let id = FixtureId(self.next);
                self.next += 1;
                if let FixtureBody::Func(func) = body {
                    self.functions.push(func.clone());
                }
                *entry.insert(id)
            }
        }
    }
}

/// A fixture as resolved within a pool: a definition plus its effective options, its
/// dependencies, and the registration it overrides.
#[derive(Debug)]
pub struct FixtureRegistration {
    id: FixtureId,
    name: SmolStr,
    location: Location,
    scope: FixtureScope,
    body: FixtureBody,
    auto: FixtureAuto,
    option: bool,
    timeout: Option<Duration>,
    custom_title: Option<String>,
    boxed: bool,
    deps: Vec<SmolStr>,
    super_registration: Option<Arc<FixtureRegistration>>,
    option_override: bool,
}

impl FixtureRegistration {
    /// The stable id of this registration.
    pub fn id(&self) -> FixtureId {
        self.id
    }

    /// The fixture name.
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    /// Where the definition lives.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The fixture scope.
    pub fn scope(&self) -> FixtureScope {
        self.scope
    }

    /// The body: a plain value or a function. Never [`FixtureBody::Unset`].
    pub fn body(&self) -> &FixtureBody {
        &self.body
    }

    /// The auto mode.
    pub fn auto(&self) -> FixtureAuto {
        self.auto
    }

    /// Whether this fixture is an option.
    pub fn is_option(&self) -> bool {
        self.option
    }

    /// The fixture's own timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The title to report: the custom title if set, otherwise the name.
    pub fn title(&self) -> &str {
        self.custom_title.as_deref().unwrap_or(&self.name)
    }

    /// Whether setup and teardown are hidden from step reporting.
    pub fn is_boxed(&self) -> bool {
        self.boxed
    }

    /// The dependencies, in declaration order.
    pub fn deps(&self) -> &[SmolStr] {
        &self.deps
    }

    /// The registration this one overrides, if any.
    pub fn super_registration(&self) -> Option<&Arc<FixtureRegistration>> {
        self.super_registration.as_ref()
    }

    /// Whether this registration was produced by a configuration-level option override.
    pub fn is_option_override(&self) -> bool {
        self.option_override
    }

    pub(crate) fn is_function(&self) -> bool {
        matches!(self.body, FixtureBody::Func(_))
    }
}

/// Option values configured for a project, applied on top of every fixture list that declares
/// them as options.
#[derive(Clone, Debug)]
pub struct OptionOverrides {
    /// The overridden values, by option name.
    pub values: serde_json::Map<String, serde_json::Value>,

    /// The location to attribute overridden registrations to.
    pub location: Location,
}

/// Options for [`FixturePool::new`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolOptions<'a> {
    /// The pool to start from. Its registrations are copied, not shared.
    pub parent: Option<&'a FixturePool>,

    /// Reject worker-scoped definitions, as for `use()` inside a describe group.
    pub disallow_worker_fixtures: bool,

    /// Project-level option values.
    pub option_overrides: Option<&'a OptionOverrides>,
}

/// An immutable, validated set of fixture registrations, keyed by name.
#[derive(Clone, Debug)]
pub struct FixturePool {
    registrations: IndexMap<SmolStr, Arc<FixtureRegistration>>,
    digest: String,
}

impl FixturePool {
    /// Builds and validates a pool, reporting every problem to `on_load_error`.
    ///
    /// The pool is always returned. Registrations with errors are kept as-is, so a pool with
    /// load errors must not be used to run tests.
    pub fn new(
        ids: &mut RegistrationIds,
        lists: &[FixtureList],
        options: PoolOptions<'_>,
        on_load_error: &mut dyn FnMut(LoadError),
    ) -> Self {
        let mut pool = Self {
            registrations: options
                .parent
                .map(|parent| parent.registrations.clone())
                .unwrap_or_default(),
            digest: String::new(),
        };

        for list in lists {
            pool.append(ids, list, options.disallow_worker_fixtures, false, on_load_error);

            let Some(overrides) = options.option_overrides else {
                continue;
            };
            let selected: IndexMap<_, _> = list
                .fixtures
                .iter()
                .filter(|(_, def)| def.is_option())
                .filter_map(|(name, def)| {
                    let value = overrides.values.get(name.as_str())?;
                    let def = FixtureDef {
                        body: FixtureBody::Value(value.clone()),
                        options: def.options.clone(),
                    };
                    Some((name.clone(), def))
                })
                .collect();
            if !selected.is_empty() {
                let list = FixtureList {
                    location: overrides.location.clone(),
                    fixtures: selected,
                };
                pool.append(ids, &list, options.disallow_worker_fixtures, true, on_load_error);
            }
        }

        pool.digest = pool.validate(on_load_error);
        debug!(
            registrations = pool.registrations.len(),
            digest = %pool.digest,
            "built fixture pool",
        );
        pool
    }

    /// Builds and validates a pool, failing with the first problem found.
    pub fn try_new(
        ids: &mut RegistrationIds,
        lists: &[FixtureList],
        options: PoolOptions<'_>,
    ) -> Result<Self, PoolConstructError> {
        let mut errors = Vec::new();
        let pool = Self::new(ids, lists, options, &mut |error| errors.push(error));
        let total = errors.len();
        match errors.into_iter().next() {
            Some(first) => Err(PoolConstructError::new(first, total)),
            None => Ok(pool),
        }
    }

    fn append(
        &mut self,
        ids: &mut RegistrationIds,
        list: &FixtureList,
        disallow_worker_fixtures: bool,
        option_override: bool,
        on_load_error: &mut dyn FnMut(LoadError),
    ) {
        for (name, def) in &list.fixtures {
            let previous = self.registrations.get(name).cloned();

            let options = match (&previous, &def.options) {
                (Some(previous), Some(options)) => {
                    if previous.scope != options.scope {
                        on_load_error(LoadError::new(
                            format!(
                                "Fixture \"{name}\" has already been registered as a \
                                 {{ scope: '{}' }} fixture defined in {}.",
                                previous.scope,
                                previous.location.display_user(),
                            ),
                            list.location.clone(),
                        ));
                        continue;
                    }
                    if previous.auto != options.auto {
                        on_load_error(LoadError::new(
                            format!(
                                "Fixture \"{name}\" has already been registered as a \
                                 {{ auto: '{}' }} fixture defined in {}.",
                                previous.auto,
                                previous.location.display_user(),
                            ),
                            list.location.clone(),
                        ));
                        continue;
                    }
                    options.clone()
                }
                (Some(previous), None) => FixtureOptions {
                    scope: previous.scope,
                    auto: previous.auto,
                    option: previous.option,
                    timeout: previous.timeout,
                    title: previous.custom_title.clone(),
                    boxed: previous.boxed,
                },
                (None, Some(options)) => options.clone(),
                (None, None) => FixtureOptions::default(),
            };

            if options.scope == FixtureScope::Worker && disallow_worker_fixtures {
                on_load_error(LoadError::new(
                    format!(
                        "Cannot use({{ {name} }}) in a describe group, because it forces a new \
                         worker.\nMake it top-level in the test file or put in the configuration \
                         file."
                    ),
                    list.location.clone(),
                ));
                continue;
            }

            let body = match &def.body {
                FixtureBody::Unset => match &previous {
                    Some(previous) if options.option => original_option_body(previous),
                    _ => FixtureBody::Value(serde_json::Value::Null),
                },
                body => body.clone(),
            };

            let deps = match &body {
                FixtureBody::Func(func) => {
                    match checked_deps(func.deps(), &format!("Fixture \"{name}\"")) {
                        Ok(deps) => deps,
                        Err(message) => {
                            on_load_error(LoadError::new(message, list.location.clone()));
                            continue;
                        }
                    }
                }
                _ => Vec::new(),
            };

            let id = ids.assign(name, previous.as_ref().map(|p| p.id), &body);

            let registration = FixtureRegistration {
                id,
                name: name.clone(),
                location: list.location.clone(),
                scope: options.scope,
                body,
                auto: options.auto,
                option: options.option,
                timeout: options.timeout,
                custom_title: options.title,
                boxed: options.boxed,
                deps,
                super_registration: previous,
                option_override,
            };
            self.registrations.insert(name.clone(), Arc::new(registration));
        }
    }

    // Validates every registration and returns the digest.
    fn validate(&self, on_load_error: &mut dyn FnMut(LoadError)) -> String {
        let mut validator = Validator {
            pool: self,
            markers: HashMap::new(),
            stack: Vec::new(),
            has_errors: false,
            on_load_error,
        };

        // Non-boxed registrations go first, so that errors name the fixtures users wrote.
        // Boxed ones are only checked if that turned up nothing.
        let names: Vec<_> = self.registrations.keys().sorted().collect();
        for name in &names {
            let registration = &self.registrations[*name];
            if !registration.boxed {
                validator.visit(registration, true);
            }
        }
        if !validator.has_errors {
            for name in &names {
                let registration = &self.registrations[*name];
                if registration.boxed {
                    validator.visit(registration, false);
                }
            }
        }

        let mut hasher = Sha256::new();
        for name in names {
            let registration = &self.registrations[name];
            if registration.scope == FixtureScope::Worker {
                hasher.update(format!("{};", registration.id));
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Returns the registration `name` refers to.
    ///
    /// When a fixture refers to its own name, that means the registration it overrides.
    pub fn resolve<'a>(
        &'a self,
        name: &str,
        for_fixture: Option<&'a FixtureRegistration>,
    ) -> Option<&'a Arc<FixtureRegistration>> {
        match for_fixture {
            Some(fixture) if fixture.name == name => fixture.super_registration.as_ref(),
            _ => self.registrations.get(name),
        }
    }

    /// Returns the registration for `name`.
    pub fn registration(&self, name: &str) -> Option<&Arc<FixtureRegistration>> {
        self.registrations.get(name)
    }

    /// The registrations that are set up without being asked for.
    pub fn auto_fixtures(&self) -> impl Iterator<Item = &Arc<FixtureRegistration>> {
        self.registrations
            .values()
            .filter(|registration| registration.auto.is_auto())
    }

    /// Checks that every parameter of a test, hook or modifier names a registered fixture.
    ///
    /// `prefix` describes the function in messages, e.g. `beforeEach hook`.
    pub fn validate_function(
        &self,
        deps: &[SmolStr],
        prefix: &str,
        location: &Location,
        on_load_error: &mut dyn FnMut(LoadError),
    ) {
        let deps = match checked_deps(deps, prefix) {
            Ok(deps) => deps,
            Err(message) => {
                on_load_error(LoadError::new(message, location.clone()));
                return;
            }
        };
        for name in deps {
            if !self.registrations.contains_key(&name) {
                on_load_error(LoadError::new(
                    format!("{prefix} has unknown parameter \"{name}\"."),
                    location.clone(),
                ));
            }
        }
    }

    /// The digest of the worker-scoped registrations.
    ///
    /// Two pools with the same digest resolve every worker fixture to the same registration.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// All registrations, in the order they were first registered.
    pub fn registrations(&self) -> impl Iterator<Item = &Arc<FixtureRegistration>> {
        self.registrations.values()
    }

    /// The number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns true if there are no registrations.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

// For resetting an option: walks down the chain of registrations to the project-level override,
// or to the value the option was declared with if there is none.
fn original_option_body(previous: &Arc<FixtureRegistration>) -> FixtureBody {
    let mut original = previous;
    while !original.option_override {
        match &original.super_registration {
            Some(next) => original = next,
            None => break,
        }
    }
    original.body.clone()
}

fn checked_deps(deps: &[SmolStr], prefix: &str) -> Result<Vec<SmolStr>, String> {
    for dep in deps {
        if dep.is_empty() {
            return Err(format!("{prefix} has an empty parameter name."));
        }
        if dep.starts_with("...") {
            return Err(format!(
                "{prefix} has a rest parameter \"{dep}\". List all used fixtures explicitly."
            ));
        }
    }
    Ok(deps.to_vec())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Marker {
    Visiting,
    Visited,
}

struct Validator<'a, 'b> {
    pool: &'a FixturePool,
    // Keyed by registration address: distinct registrations may share an id.
    markers: HashMap<*const FixtureRegistration, Marker>,
    stack: Vec<&'a Arc<FixtureRegistration>>,
    has_errors: bool,
    on_load_error: &'b mut dyn FnMut(LoadError),
}

impl<'a> Validator<'a, '_> {
    fn visit(&mut self, registration: &'a Arc<FixtureRegistration>, hide_boxed: bool) {
        if self.markers.contains_key(&Arc::as_ptr(registration)) {
            return;
        }
        self.markers
            .insert(Arc::as_ptr(registration), Marker::Visiting);
        self.stack.push(registration);

        for name in &registration.deps {
            let Some(dep) = self.pool.resolve(name, Some(registration.as_ref())) else {
                let message = if *name == registration.name {
                    format!(
                        "Fixture \"{name}\" references itself, but does not have a base \
                         implementation."
                    )
                } else {
                    format!(
                        "Fixture \"{}\" has unknown parameter \"{name}\".",
                        registration.name
                    )
                };
                self.error(message, &registration.location);
                continue;
            };

            if registration.scope > dep.scope {
                self.error(
                    format!(
                        "{} fixture \"{}\" cannot depend on a {} fixture \"{name}\" defined in {}.",
                        registration.scope,
                        registration.name,
                        dep.scope,
                        dep.location.display_user(),
                    ),
                    &registration.location,
                );
                continue;
            }

            match self.markers.get(&Arc::as_ptr(dep)).copied() {
                None => self.visit(dep, hide_boxed),
                Some(Marker::Visiting) => self.report_cycle(dep, hide_boxed),
                Some(Marker::Visited) => {}
            }
        }

        self.markers
            .insert(Arc::as_ptr(registration), Marker::Visited);
        self.stack.pop();
    }

    fn report_cycle(&mut self, dep: &Arc<FixtureRegistration>, hide_boxed: bool) {
        let start = self
            .stack
            .iter()
            .position(|r| Arc::ptr_eq(r, dep))
            .unwrap_or_default();
        let cycle = &self.stack[start..];
        let mut members: Vec<_> = cycle
            .iter()
            .filter(|r| !hide_boxed || !r.boxed)
            .collect();
        if members.is_empty() {
            // Only boxed fixtures take part, so there is nothing else to name.
            members = cycle.iter().collect();
        }

        let names = members
            .iter()
            .map(|r| format!("\"{}\"", r.name))
            .chain(std::iter::once(format!("\"{}\"", dep.name)))
            .join(" -> ");
        let locations = members
            .iter()
            .map(|r| r.location.display_user().to_string())
            .chain(std::iter::once(dep.location.display_user().to_string()))
            .join(" -> ");
        self.error(
            format!("Fixtures {names} form a dependency cycle: {locations}"),
            &dep.location,
        );
    }

    fn error(&mut self, message: String, location: &Location) {
        self.has_errors = true;
        (self.on_load_error)(LoadError::new(message, location.clone()));
    }
}
