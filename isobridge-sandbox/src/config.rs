//! Sandbox construction options.
//!
//! Keys are camelCase (`ramLimit`, `timeLimit`, ...) with snake_case aliases so
//! the same record can be written in JSON or TOML. Unrecognized keys are kept
//! in [`SandboxOptions::extra`] and handed to plugins untouched.

use crate::error::SandboxError;
use crate::limits::{ResourceLimits, DEFAULT_MEMORY_LIMIT_MIB, DEFAULT_TIME_LIMIT_MS};
use crate::tolerance::Tolerance;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration record for [`crate::Sandbox::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOptions {
    /// Memory ceiling in MiB
    #[serde(default = "default_ram_limit", alias = "ram_limit")]
    pub ram_limit: u64,

    /// Time limit in milliseconds, re-armed by every `execute()`
    #[serde(default = "default_time_limit", alias = "time_limit")]
    pub time_limit: u64,

    /// Forward guest `console` output to the host
    #[serde(default)]
    pub logging: bool,

    /// Opaque identifier, stored but never interpreted
    #[serde(default)]
    pub token: String,

    /// Plugin names, loaded in order at construction
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Source injected and run at construction
    #[serde(default)]
    pub script: Option<String>,

    /// Root of the project-local plugin namespace (defaults to the cwd)
    #[serde(default, alias = "plugin_root")]
    pub plugin_root: Option<PathBuf>,

    #[serde(default)]
    pub tolerance: Tolerance,

    /// Everything else, passed through to plugins
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_ram_limit() -> u64 {
    DEFAULT_MEMORY_LIMIT_MIB
}

fn default_time_limit() -> u64 {
    DEFAULT_TIME_LIMIT_MS
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            ram_limit: default_ram_limit(),
            time_limit: default_time_limit(),
            logging: false,
            token: String::new(),
            plugins: Vec::new(),
            script: None,
            plugin_root: None,
            tolerance: Tolerance::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl SandboxOptions {
    /// Parse options from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse options: {}", e)))
    }

    /// Load options from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn with_ram_limit(mut self, mib: u64) -> Self {
        self.ram_limit = mib;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit.as_millis() as u64;
        self
    }

    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Append a plugin name to the load order
    pub fn with_plugin(mut self, name: impl Into<String>) -> Self {
        self.plugins.push(name.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_plugin_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.plugin_root = Some(root.into());
        self
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Resource limits derived from `ramLimit` and `timeLimit`
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.ram_limit, self.time_limit)
    }

    /// Root for project-local plugin resolution
    pub fn plugin_root(&self) -> Result<PathBuf> {
        match &self.plugin_root {
            Some(root) => Ok(root.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}
