// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a source file where a test, hook or fixture was declared.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Location {
    /// The file the declaration lives in.
    pub file: Utf8PathBuf,

    /// The 1-based line number.
    pub line: u32,

    /// The 1-based column number.
    pub column: u32,
}

impl Location {
    /// Creates a new `Location`.
    pub fn new(file: impl Into<Utf8PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// The file this location points into.
    pub fn file(&self) -> &Utf8Path {
        &self.file
    }

    /// Returns true if this location refers to a declaration built into the framework rather than
    /// to user code.
    ///
    /// Builtin locations use a file name in angle brackets, e.g. `<builtin>`, or an empty file.
    pub fn is_builtin(&self) -> bool {
        let file = self.file.as_str();
        file.is_empty() || (file.starts_with('<') && file.ends_with('>'))
    }

    /// Formats the location for inclusion in a user-facing message, replacing framework-internal
    /// locations with `<builtin>`.
    pub fn display_user(&self) -> DisplayUserLocation<'_> {
        DisplayUserLocation(self)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Returned by [`Location::display_user`].
#[derive(Clone, Copy, Debug)]
pub struct DisplayUserLocation<'a>(&'a Location);

impl fmt::Display for DisplayUserLocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_builtin() {
            f.write_str("<builtin>")
        } else {
            fmt::Display::fmt(self.0, f)
        }
    }
}
