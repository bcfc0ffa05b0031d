//! The sandbox instance: lifecycle, injection and execution.

use crate::bootstrap;
use crate::bridge::BridgeStats;
use crate::capability::CapabilityObject;
use crate::config::SandboxOptions;
use crate::cpu::{CpuClock, CpuTime};
use crate::engine::{Command, EngineConfig, EngineHandle, Reply, Target};
use crate::error::SandboxError;
use crate::events::{EventBus, EventKind, SandboxEvent, Subscription};
use crate::execution::{SandboxId, SandboxState, StateCell};
use crate::limits::ResourceLimits;
use crate::plugin::{self, PluginNamespace, PluginOutcome};
use crate::tolerance::BestEffort;
use crate::Result;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Handle to one sandbox instance.
///
/// Cheap to clone; all clones drive the same isolate. Calls are served in the
/// order they are made. Destroying through any clone destroys the instance.
///
/// Host functions reachable from guest code must not call back into the
/// sandbox that is running them.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<Inner>,
}

struct Inner {
    id: SandboxId,
    options: SandboxOptions,
    limits: ResourceLimits,
    state: Arc<StateCell>,
    engine: Mutex<Option<EngineHandle>>,
    clock: Arc<CpuClock>,
    frozen_cpu: Mutex<Option<CpuTime>>,
    timer: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    events: Arc<EventBus>,
    plugin_outcomes: Mutex<Vec<PluginOutcome>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Sandbox {
    /// Create a sandbox: start the engine, bootstrap the context, load the
    /// configured plugins and run the initial script.
    ///
    /// Async host functions are driven by the tokio runtime this is called
    /// from, so that runtime must outlive the sandbox.
    pub async fn new(options: SandboxOptions) -> Result<Self> {
        Self::with_namespace(options, PluginNamespace::global()).await
    }

    /// Like [`Sandbox::new`], resolving plugins against `namespace` instead
    /// of the process-wide one.
    pub async fn with_namespace(
        options: SandboxOptions,
        namespace: &PluginNamespace,
    ) -> Result<Self> {
        let host = tokio::runtime::Handle::try_current()
            .map_err(|e| SandboxError::Engine(format!("no tokio runtime: {}", e)))?;
        let id = SandboxId::new();
        let limits = options.limits();
        let state = Arc::new(StateCell::new());
        let events = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();
        let console = bootstrap::console_capability(
            id,
            options.token.clone(),
            options.logging,
            events.clone(),
        );

        let engine = EngineHandle::spawn(EngineConfig {
            id,
            limits,
            strict: options.tolerance.is_strict(),
            console,
            state: state.clone(),
            shutdown: shutdown.clone(),
            host,
        })
        .await?;

        let sandbox = Sandbox {
            inner: Arc::new(Inner {
                id,
                clock: engine.clock(),
                engine: Mutex::new(Some(engine)),
                options,
                limits,
                state,
                frozen_cpu: Mutex::new(None),
                timer: Mutex::new(None),
                shutdown,
                events,
                plugin_outcomes: Mutex::new(Vec::new()),
            }),
        };

        tracing::info!(
            sandbox = %id,
            ram_limit_mib = limits.memory_limit_mib,
            time_limit_ms = limits.time_limit.as_millis() as u64,
            "sandbox created"
        );

        if let Err(e) = sandbox.finish_construction(namespace).await {
            tracing::warn!(sandbox = %id, error = %e, "sandbox construction failed");
            sandbox.destroy();
            return Err(e);
        }

        sandbox.inner.state.transition(SandboxState::Ready);
        Ok(sandbox)
    }

    async fn finish_construction(&self, namespace: &PluginNamespace) -> Result<()> {
        let options = &self.inner.options;
        if !options.plugins.is_empty() {
            let outcomes = plugin::load_plugins(self, namespace, options).await?;
            *lock(&self.inner.plugin_outcomes) = outcomes;
        }
        if let Some(script) = &options.script {
            self.inject_script(script.clone()).await?;
        }
        Ok(())
    }

    pub fn id(&self) -> SandboxId {
        self.inner.id
    }

    /// The opaque token from the options.
    pub fn token(&self) -> &str {
        &self.inner.options.token
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SandboxState {
        self.inner.state.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.is_destroyed()
    }

    /// Per-plugin results of the construction-time plugin load.
    pub fn plugin_outcomes(&self) -> Vec<PluginOutcome> {
        lock(&self.inner.plugin_outcomes).clone()
    }

    /// Live CPU time while alive; the value frozen at destruction afterwards.
    pub fn cpu_time(&self) -> CpuTime {
        match *lock(&self.inner.frozen_cpu) {
            Some(frozen) => frozen,
            None => self.inner.clock.read(),
        }
    }

    pub fn cpu_time_ms(&self) -> f64 {
        self.cpu_time().as_millis_f64()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let sender = match lock(&self.inner.engine).as_ref() {
            Some(engine) => engine.sender(),
            None => return Err(SandboxError::Destroyed),
        };
        let (reply, response) = oneshot::channel();
        let sent = sender.send(build(reply));
        drop(sender);
        sent.map_err(|_| SandboxError::Destroyed)?;

        let result = match response.await {
            Ok(result) => result,
            Err(_) if self.is_destroyed() => Err(SandboxError::Destroyed),
            Err(_) => Err(SandboxError::Engine(
                "engine thread stopped unexpectedly".into(),
            )),
        };

        if let Err(SandboxError::MemoryLimit { .. }) = &result {
            self.destroy();
        }
        result
    }

    /// Marshal `object` into the guest global `name`, then run `extra`.
    pub async fn inject_global_object(
        &self,
        name: &str,
        object: CapabilityObject,
        extra: Option<&str>,
    ) -> Result<()> {
        let target = Target::Global(name.to_string());
        let extra = extra.map(str::to_string);
        self.request(|reply| Command::Capability {
            object,
            target,
            extra,
            reply,
        })
        .await
    }

    /// Marshal `object` into `Plugins[name]`, then run `extra`.
    pub async fn register_plugin(
        &self,
        name: &str,
        object: CapabilityObject,
        extra: Option<&str>,
    ) -> Result<()> {
        let target = Target::Plugin(name.to_string());
        let extra = extra.map(str::to_string);
        self.request(|reply| Command::Capability {
            object,
            target,
            extra,
            reply,
        })
        .await
    }

    /// Compile and immediately run `source` in the context.
    pub async fn inject_script(&self, source: impl Into<String>) -> Result<()> {
        let source = source.into();
        self.request(|reply| Command::Inject {
            label: "[isobridge:script]",
            source,
            reply,
        })
        .await
    }

    /// Run a file as a global script and make its exports `require`-able
    /// under the file stem.
    ///
    /// Top-level declarations become guest globals, as with
    /// [`inject_script`](Sandbox::inject_script). While the file runs,
    /// `module` and `exports` are globals; they are removed afterwards.
    pub async fn inject_module(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                SandboxError::Config(format!(
                    "cannot derive module name from path: {}",
                    path.display()
                ))
            })?
            .to_owned();
        let source = tokio::fs::read_to_string(path).await?;
        tracing::debug!(sandbox = %self.inner.id, module = %name, path = %path.display(), "injecting module");

        self.request(|reply| Command::Module {
            name,
            source,
            reply,
        })
        .await
    }

    pub(crate) async fn run_plugin_script(&self, source: &str, options: &Value) -> Result<()> {
        let source = bootstrap::plugin_entry_script(source, options);
        self.request(|reply| Command::Inject {
            label: "[isobridge:plugin]",
            source,
            reply,
        })
        .await
    }

    /// Replace the stored compiled script.
    pub async fn compile_script(&self, source: impl Into<String>) -> Result<()> {
        let source = source.into();
        self.request(|reply| Command::Compile { source, reply }).await
    }

    /// Read a guest global by dotted path.
    ///
    /// Under best-effort tolerance this never fails: `undefined` and a
    /// destroyed instance give [`BestEffort::Absent`], other failures give
    /// [`BestEffort::Tolerated`].
    pub async fn get_context_property(&self, path: &str) -> Result<BestEffort<Value>> {
        let path_owned = path.to_string();
        let result = self
            .request(|reply| Command::Property {
                path: path_owned,
                reply,
            })
            .await;

        let strict = self.inner.options.tolerance.is_strict();
        match result {
            Ok(Some(value)) => Ok(BestEffort::Value(value)),
            Ok(None) => Ok(BestEffort::Absent),
            Err(e) if strict => Err(e),
            Err(SandboxError::Destroyed) => Ok(BestEffort::Absent),
            Err(e) => {
                tracing::debug!(sandbox = %self.inner.id, path, error = %e, "property read tolerated");
                Ok(BestEffort::tolerated(e.to_string()))
            }
        }
    }

    /// Live entries in the capability table: root references not yet
    /// released and host functions still reachable from the guest.
    pub async fn bridge_stats(&self) -> Result<BridgeStats> {
        self.request(|reply| Command::BridgeStats { reply }).await
    }

    /// Run the compiled script and return its (settled) result.
    ///
    /// Re-arms the time limit first. The timer is not cleared when this
    /// returns: the instance is destroyed once the limit elapses after the
    /// most recent `execute`. A run interrupted that way returns
    /// [`SandboxError::Destroyed`].
    pub async fn execute(&self) -> Result<Value> {
        if self.is_destroyed() {
            return Err(SandboxError::Destroyed);
        }
        self.arm_timer();

        self.inner.state.transition(SandboxState::Executing);
        let result = self.request(|reply| Command::Execute { reply }).await;
        self.inner.state.transition(SandboxState::Ready);
        result
    }

    /// Evaluate `source`; if it yields a function, call it with no arguments.
    /// Promises are awaited. The stored compiled script is left untouched.
    pub async fn eval(&self, source: impl Into<String>) -> Result<Value> {
        let source = source.into();
        self.inner.state.transition(SandboxState::Executing);
        let result = self.request(|reply| Command::Eval { source, reply }).await;
        self.inner.state.transition(SandboxState::Ready);
        result
    }

    fn arm_timer(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.timer).replace(token.clone()) {
            previous.cancel();
        }

        let limit = self.inner.limits.time_limit;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    if let Some(inner) = weak.upgrade() {
                        tracing::warn!(
                            sandbox = %inner.id,
                            time_limit_ms = limit.as_millis() as u64,
                            "time limit reached"
                        );
                        inner.teardown();
                    }
                }
            }
        });
    }

    /// Subscribe to lifecycle events.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&SandboxEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, callback)
    }

    /// Tear the instance down. Idempotent.
    pub fn destroy(&self) {
        self.inner.teardown();
    }
}

impl Inner {
    fn teardown(&self) {
        let Some(engine) = lock(&self.engine).take() else {
            return;
        };

        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }

        let cpu = self.clock.read();
        *lock(&self.frozen_cpu) = Some(cpu);

        self.state.transition(SandboxState::Destroyed);
        self.shutdown.cancel();
        engine.terminate();
        // Dropping the last sender lets the engine thread drain and exit;
        // the isolate is disposed there.
        drop(engine);

        let cpu_time_ms = cpu.as_millis_f64();
        tracing::info!(sandbox = %self.id, cpu_time_ms, "sandbox destroyed");
        self.events.close_with(&SandboxEvent::Destroy {
            id: self.id,
            cpu_time_ms,
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
