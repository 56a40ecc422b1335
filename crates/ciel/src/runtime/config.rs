//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ciel_common::paths::{self, CIEL_SCRATCH_DIR};
use ciel_common::{CielError, CielResult};
use serde::{Deserialize, Serialize};

/// Runtime configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CielConfig {
    /// Login shell used by [`Container::run_command`](super::Container::run_command).
    pub shell: PathBuf,
    /// Init-system binary that marks a root filesystem as bootable.
    pub init_marker: PathBuf,
    /// Directory holding transient mount targets.
    pub scratch_dir: PathBuf,
    /// Whether containers boot by default when the filesystem allows it.
    pub prefer_boot: bool,
    /// Properties applied to every new container.
    pub properties: Vec<String>,
    /// How long to wait for a booted machine to register (seconds).
    pub boot_timeout: u64,
}

impl Default for CielConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(paths::DEFAULT_SHELL),
            init_marker: PathBuf::from(paths::DEFAULT_INIT_MARKER),
            scratch_dir: CIEL_SCRATCH_DIR.clone(),
            prefer_boot: true,
            properties: Vec::new(),
            boot_timeout: 30,
        }
    }
}

impl CielConfig {
    /// Load a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> CielResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| CielError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Parse a TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid configuration.
    pub fn from_toml(content: &str) -> CielResult<Self> {
        toml::from_str(content).map_err(|e| CielError::Config {
            message: e.to_string(),
        })
    }

    /// Load the user configuration file if there is one, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn discover() -> CielResult<Self> {
        match paths::config_file() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "Loading configuration");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Set the login shell.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set the init-system marker path.
    #[must_use]
    pub fn with_init_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.init_marker = marker.into();
        self
    }

    /// Set the scratch directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Set the default boot preference.
    #[must_use]
    pub const fn with_prefer_boot(mut self, prefer_boot: bool) -> Self {
        self.prefer_boot = prefer_boot;
        self
    }

    /// Append a default property.
    #[must_use]
    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.properties.push(property.into());
        self
    }

    /// Set the boot registration timeout.
    #[must_use]
    pub const fn with_boot_timeout(mut self, seconds: u64) -> Self {
        self.boot_timeout = seconds;
        self
    }

    /// Boot registration timeout as a [`Duration`].
    #[must_use]
    pub const fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout)
    }
}
