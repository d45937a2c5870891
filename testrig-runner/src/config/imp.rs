// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ConfigBlobError, ConfigParseError, ProjectNotFound},
    fixtures::OptionOverrides,
};
use camino::Utf8Path;
use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use smol_str::SmolStr;
use std::time::Duration;
use testrig_metadata::Location;
use tracing::debug;

/// The timeout used when a project doesn't set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by all workers of a run.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    #[serde(default)]
    projects: Vec<ProjectConfig>,

    #[serde(default)]
    debug: bool,

    #[serde(default = "default_last_running_tests", alias = "last_running_tests")]
    last_running_tests: usize,
}

impl WorkerConfig {
    /// Contains the default config as a TOML file.
    ///
    /// Config files are layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Environment configuration uses this prefix, plus a _.
    pub const ENVIRONMENT_PREFIX: &'static str = "TESTRIG";

    /// Reads the config from the default config, then `file` if given, then the environment.
    pub fn from_sources(file: Option<&Utf8Path>) -> Result<Self, ConfigParseError> {
        Self::read_from_sources(file, Self::environment())
    }

    /// Deserializes the config blob a worker was started with.
    pub fn from_blob(blob: &serde_json::Value) -> Result<Self, ConfigBlobError> {
        serde_json::from_value(blob.clone()).map_err(ConfigBlobError::new)
    }

    /// Returns the project with the given id.
    pub fn project(&self, id: &str) -> Result<&ProjectConfig, ProjectNotFound> {
        self.projects
            .iter()
            .find(|project| project.id == id)
            .ok_or_else(|| {
                ProjectNotFound::new(
                    id.into(),
                    self.projects.iter().map(|project| project.id.clone()),
                )
            })
    }

    /// All projects, in declaration order.
    pub fn projects(&self) -> &[ProjectConfig] {
        &self.projects
    }

    /// Returns true if timeouts should be ignored.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// How many of the most recently started tests to keep for teardown diagnostics.
    pub fn last_running_tests(&self) -> usize {
        self.last_running_tests
    }

    // ---
    // Helper methods
    // ---

    pub(crate) fn read_from_sources(
        file: Option<&Utf8Path>,
        environment: Environment,
    ) -> Result<Self, ConfigParseError> {
        let mut builder = Self::make_default_config();
        if let Some(file) = file {
            builder = builder.add_source(File::new(file.as_str(), FileFormat::Toml));
        }
        builder = builder.add_source(environment);

        let config_file = file.map(ToOwned::to_owned);
        let config = builder
            .build()
            .and_then(|config| config.try_deserialize::<Self>())
            .map_err(|err| ConfigParseError::new(config_file, err))?;
        debug!(
            projects = config.projects.len(),
            debug = config.debug,
            "read worker config",
        );
        Ok(config)
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn environment() -> Environment {
        Environment::with_prefix(Self::ENVIRONMENT_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }
}

fn default_last_running_tests() -> usize {
    10
}

/// Configuration for a single project.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    /// The project id, matched against [`WorkerInitParams::project_id`].
    ///
    /// [`WorkerInitParams::project_id`]: testrig_metadata::WorkerInitParams::project_id
    pub id: SmolStr,

    /// The display name, used in diagnostics.
    #[serde(default)]
    pub name: String,

    /// The default timeout for each test and hook. Zero disables it.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Values for fixtures declared as options.
    #[serde(default, rename = "use")]
    pub use_options: serde_json::Map<String, serde_json::Value>,
}

impl ProjectConfig {
    /// The option overrides to apply to test types, if the project sets any.
    pub fn option_overrides(&self) -> Option<OptionOverrides> {
        if self.use_options.is_empty() {
            return None;
        }
        Some(OptionOverrides {
            values: self.use_options.clone(),
            location: Location::new(format!("project#{}", self.id), 1, 1),
        })
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}
