//! Plugin resolution and loading.
//!
//! A plugin name resolves in two tiers: first the process-wide
//! [`PluginNamespace`] filled by host code, then the project-local
//! `sandbox_plugins/<name>/plugin.toml` under the plugin root (the working
//! directory unless `pluginRoot` says otherwise). Resolved plugins are invoked
//! one at a time, in configured order, as `register(sandbox, None, options)`.

use crate::config::SandboxOptions;
use crate::error::SandboxError;
use crate::sandbox::Sandbox;
use crate::tolerance::BestEffort;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

/// Directory, relative to the plugin root, holding project-local plugins.
pub const LOCAL_PLUGIN_DIR: &str = "sandbox_plugins";

/// Manifest file inside each project-local plugin directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Placeholder for the reserved middle argument of [`Plugin::register`].
///
/// Uninhabited: the argument is always `None`.
#[derive(Debug)]
pub enum Reserved {}

/// Registration entry point of a plugin.
///
/// A plugin has no return contract beyond success; its effect is the calls it
/// makes back into the sandbox (`register_plugin`, `inject_global_object`,
/// `inject_script`).
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn register(
        &self,
        sandbox: &Sandbox,
        reserved: Option<&Reserved>,
        options: &SandboxOptions,
    ) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Plugin`].
pub struct FnPlugin<F> {
    f: F,
}

impl<F, Fut> FnPlugin<F>
where
    F: Fn(Sandbox, SandboxOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Plugin for FnPlugin<F>
where
    F: Fn(Sandbox, SandboxOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn register(
        &self,
        sandbox: &Sandbox,
        _reserved: Option<&Reserved>,
        options: &SandboxOptions,
    ) -> anyhow::Result<()> {
        (self.f)(sandbox.clone(), options.clone()).await
    }
}

/// A plugin runs its script inside the sandbox with `options` in scope.
#[derive(Debug, Clone)]
pub struct ScriptPlugin {
    path: PathBuf,
}

impl ScriptPlugin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Plugin for ScriptPlugin {
    async fn register(
        &self,
        sandbox: &Sandbox,
        _reserved: Option<&Reserved>,
        options: &SandboxOptions,
    ) -> anyhow::Result<()> {
        let source = tokio::fs::read_to_string(&self.path).await?;
        let options = serde_json::to_value(options)?;
        sandbox.run_plugin_script(&source, &options).await?;
        Ok(())
    }
}

/// What a plugin name resolved to.
#[derive(Clone, Default)]
pub struct PluginRecord {
    pub root_path: PathBuf,
    pub default_export: Option<Arc<dyn Plugin>>,
    pub plugin: Option<Arc<dyn Plugin>>,
    pub middleware: Option<Arc<dyn Plugin>>,
}

impl PluginRecord {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Default::default()
        }
    }

    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugin = Some(Arc::new(plugin));
        self
    }

    pub fn with_default_export(mut self, plugin: impl Plugin + 'static) -> Self {
        self.default_export = Some(Arc::new(plugin));
        self
    }

    pub fn with_middleware(mut self, plugin: impl Plugin + 'static) -> Self {
        self.middleware = Some(Arc::new(plugin));
        self
    }

    /// The dedicated plugin entry point, else the default export.
    pub fn entry_point(&self) -> Option<Arc<dyn Plugin>> {
        self.plugin.clone().or_else(|| self.default_export.clone())
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("root_path", &self.root_path)
            .field("default_export", &self.default_export.is_some())
            .field("plugin", &self.plugin.is_some())
            .field("middleware", &self.middleware.is_some())
            .finish()
    }
}

/// Name → record table consulted before the project-local directory.
#[derive(Default)]
pub struct PluginNamespace {
    records: RwLock<HashMap<String, PluginRecord>>,
}

impl PluginNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide namespace used by [`Sandbox::new`].
    pub fn global() -> &'static PluginNamespace {
        static GLOBAL: OnceLock<PluginNamespace> = OnceLock::new();
        GLOBAL.get_or_init(PluginNamespace::new)
    }

    /// Register a record, returning the one it replaced.
    pub fn register(&self, name: impl Into<String>, record: PluginRecord) -> Option<PluginRecord> {
        let name = name.into();
        tracing::debug!(plugin = %name, root = %record.root_path.display(), "plugin registered");
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, record)
    }

    pub fn unregister(&self, name: &str) -> Option<PluginRecord> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<PluginRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// `plugin.toml`: script paths relative to the plugin directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Dedicated plugin entry point
    #[serde(default)]
    pub plugin: Option<PathBuf>,
    /// Default export, used when `plugin` is absent
    #[serde(default)]
    pub main: Option<PathBuf>,
    #[serde(default)]
    pub middleware: Option<PathBuf>,
}

impl PluginManifest {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse plugin manifest: {}", e)))
    }

    /// Build a record whose entry points run the listed scripts.
    pub fn into_record(self, dir: &Path) -> PluginRecord {
        let script = |path: Option<PathBuf>| {
            path.map(|p| Arc::new(ScriptPlugin::new(dir.join(p))) as Arc<dyn Plugin>)
        };
        PluginRecord {
            root_path: dir.to_path_buf(),
            default_export: script(self.main),
            plugin: script(self.plugin),
            middleware: script(self.middleware),
        }
    }
}

/// Two-tier name resolution.
pub struct PluginResolver<'a> {
    namespace: &'a PluginNamespace,
    root: PathBuf,
}

impl<'a> PluginResolver<'a> {
    pub fn new(namespace: &'a PluginNamespace, root: impl Into<PathBuf>) -> Self {
        Self {
            namespace,
            root: root.into(),
        }
    }

    /// Resolve a name, or explain why it cannot be resolved.
    pub async fn resolve(&self, name: &str) -> std::result::Result<PluginRecord, String> {
        if !is_valid_name(name) {
            return Err(format!("invalid plugin name `{}`", name));
        }

        if let Some(record) = self.namespace.get(name) {
            tracing::debug!(plugin = %name, "resolved from global namespace");
            return Ok(record);
        }

        let dir = self.root.join(LOCAL_PLUGIN_DIR).join(name);
        let manifest_path = dir.join(MANIFEST_FILE);
        let content = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(format!("plugin `{}` not found", name));
            }
            Err(e) => {
                return Err(format!(
                    "failed to read {}: {}",
                    manifest_path.display(),
                    e
                ));
            }
        };
        let manifest = PluginManifest::from_toml_str(&content).map_err(|e| e.to_string())?;
        tracing::debug!(plugin = %name, dir = %dir.display(), "resolved from project directory");
        Ok(manifest.into_record(&dir))
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

/// Result of loading one configured plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginOutcome {
    pub name: String,
    /// Root path of the invoked plugin, or why it was skipped.
    pub outcome: BestEffort<PathBuf>,
}

/// Resolve and invoke every plugin named in `options`, in order.
///
/// Each plugin is awaited before the next one starts. Unresolvable or
/// non-invocable plugins are skipped (an error under strict tolerance); a
/// plugin whose registration fails is logged and loading continues.
pub(crate) async fn load_plugins(
    sandbox: &Sandbox,
    namespace: &PluginNamespace,
    options: &SandboxOptions,
) -> Result<Vec<PluginOutcome>> {
    let resolver = PluginResolver::new(namespace, options.plugin_root()?);
    let strict = options.tolerance.is_strict();
    let mut outcomes = Vec::with_capacity(options.plugins.len());

    for name in &options.plugins {
        let entry = resolver.resolve(name).await.and_then(|record| {
            record
                .entry_point()
                .map(|entry| (record.root_path.clone(), entry))
                .ok_or_else(|| format!("plugin `{}` has no invocable entry point", name))
        });

        let outcome = match entry {
            Err(reason) => {
                if strict {
                    return Err(SandboxError::Plugin { reason });
                }
                tracing::warn!(sandbox = %sandbox.id(), plugin = %name, reason = %reason, "skipping plugin");
                BestEffort::tolerated(reason)
            }
            Ok((root, entry)) => match entry.register(sandbox, None, options).await {
                Ok(()) => {
                    tracing::info!(sandbox = %sandbox.id(), plugin = %name, "plugin registered");
                    BestEffort::Value(root)
                }
                Err(e) => {
                    tracing::warn!(
                        sandbox = %sandbox.id(),
                        plugin = %name,
                        error = %format!("{:#}", e),
                        "plugin registration failed"
                    );
                    BestEffort::tolerated(format!("{:#}", e))
                }
            },
        };

        outcomes.push(PluginOutcome {
            name: name.clone(),
            outcome,
        });
    }

    Ok(outcomes)
}
