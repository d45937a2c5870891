// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for testrig-runner.

use itertools::Itertools;
use std::time::Duration;
use testrig_metadata::Location;

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }
}

/// Formats a test for worker diagnostics: `[project] › file:line:column › describe › title`.
pub(crate) fn format_test_title(
    project_name: &str,
    location: &Location,
    title_path: &[impl AsRef<str>],
) -> String {
    let project = if project_name.is_empty() {
        String::new()
    } else {
        format!("[{project_name}] › ")
    };
    let titles = title_path.iter().map(AsRef::as_ref).join(" › ");
    format!("{project}{location} › {titles}")
}

/// The timeout of the slot shared by `afterEach` hooks and test-scope teardown: the larger of the
/// project and test timeouts, unless either is disabled.
pub(crate) fn after_hooks_timeout(project_timeout: Duration, test_timeout: Duration) -> Duration {
    if project_timeout.is_zero() || test_timeout.is_zero() {
        Duration::ZERO
    } else {
        project_timeout.max(test_timeout)
    }
}
