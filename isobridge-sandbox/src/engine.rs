//! Engine thread: one `JsRuntime` per sandbox, driven by a command loop.
//!
//! V8 isolates are `!Send`, so every sandbox gets a dedicated OS thread
//! running a current-thread tokio runtime. The public handle talks to it
//! through an unbounded command channel; commands are served strictly in
//! arrival order and each carries its own `oneshot` reply.

use crate::bootstrap;
use crate::bridge::{self, BridgeStats, CapabilityTable, HostRuntime};
use crate::capability::CapabilityObject;
use crate::cpu::CpuClock;
use crate::error::SandboxError;
use crate::execution::{SandboxId, StateCell};
use crate::limits::ResourceLimits;
use crate::Result;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Where a marshaled capability object lands in the guest.
#[derive(Debug, Clone)]
pub(crate) enum Target {
    Global(String),
    Plugin(String),
}

pub(crate) enum Command {
    /// Run source text in the context, discarding its completion value.
    Inject {
        label: &'static str,
        source: String,
        reply: Reply<()>,
    },
    /// Run a file as a global script with `module`/`exports` in scope.
    Module {
        name: String,
        source: String,
        reply: Reply<()>,
    },
    Capability {
        object: CapabilityObject,
        target: Target,
        extra: Option<String>,
        reply: Reply<()>,
    },
    Compile {
        source: String,
        reply: Reply<()>,
    },
    Execute {
        reply: Reply<Value>,
    },
    Eval {
        source: String,
        reply: Reply<Value>,
    },
    /// `None` when the path resolves to `undefined`.
    Property {
        path: String,
        reply: Reply<Option<Value>>,
    },
    BridgeStats {
        reply: Reply<BridgeStats>,
    },
}

pub(crate) struct EngineConfig {
    pub id: SandboxId,
    pub limits: ResourceLimits,
    pub strict: bool,
    pub console: CapabilityObject,
    pub state: Arc<StateCell>,
    pub shutdown: CancellationToken,
    /// Runtime of the sandbox owner; async host functions run there.
    pub host: tokio::runtime::Handle,
}

/// Handle-side view of a running engine thread.
pub(crate) struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    isolate: v8::IsolateHandle,
    clock: Arc<CpuClock>,
}

impl EngineHandle {
    /// Start the engine thread and wait until bootstrap has finished.
    pub(crate) async fn spawn(config: EngineConfig) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_name = format!("isobridge-{}", config.id);

        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if ready_tx.send(Err(SandboxError::Engine(e.to_string()))).is_err() {
                            tracing::warn!("sandbox creator dropped before engine failed");
                        }
                        return;
                    }
                };
                rt.block_on(run(config, receiver, ready_tx));
            })?;

        let ready = ready_rx
            .await
            .map_err(|_| SandboxError::Engine("engine thread exited during startup".into()))??;

        Ok(Self {
            commands,
            isolate: ready.isolate,
            clock: ready.clock,
        })
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    pub(crate) fn clock(&self) -> Arc<CpuClock> {
        self.clock.clone()
    }

    /// Interrupt whatever script is running. The isolate stays terminated.
    pub(crate) fn terminate(&self) -> bool {
        self.isolate.terminate_execution()
    }
}

struct Ready {
    isolate: v8::IsolateHandle,
    clock: Arc<CpuClock>,
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution once and grants 1 MiB so the termination can unwind.
extern "C" fn near_heap_limit(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points into the `Box<HeapLimitState>` owned by `Engine`,
    // which is declared after (and so dropped after) the runtime.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

struct Engine {
    // Field order is drop order: the compiled script goes before its isolate,
    // and the heap callback state outlives both.
    compiled: Option<v8::Global<v8::UnboundScript>>,
    runtime: JsRuntime,
    heap: Box<HeapLimitState>,
    id: SandboxId,
    limit_mib: u64,
    state: Arc<StateCell>,
    shutdown: CancellationToken,
    /// Set once the heap limit fired; the isolate is unusable afterwards.
    poisoned: bool,
}

async fn run(
    config: EngineConfig,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<Ready>>,
) {
    let EngineConfig {
        id,
        limits,
        strict,
        console,
        state,
        shutdown,
        host,
    } = config;

    let clock = Arc::new(CpuClock::for_current_thread());
    let mut engine = Engine::new(id, &limits, state, shutdown, host);

    if let Err(e) = engine.bootstrap(&console, strict).await {
        if ready.send(Err(e)).is_err() {
            tracing::warn!(sandbox = %id, "sandbox creator dropped during bootstrap");
        }
        return;
    }
    clock.publish();

    let handshake = Ready {
        isolate: engine.runtime.v8_isolate().thread_safe_handle(),
        clock: clock.clone(),
    };
    if ready.send(Ok(handshake)).is_err() {
        return;
    }

    while let Some(command) = receiver.recv().await {
        engine.dispatch(command).await;
        clock.publish();
    }

    tracing::debug!(sandbox = %id, "engine thread stopping");
}

fn respond<T>(reply: Reply<T>, result: Result<T>) {
    if reply.send(result).is_err() {
        tracing::trace!("caller dropped before reply");
    }
}

fn exception_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    if tc.has_terminated() {
        return "execution terminated".to_string();
    }
    match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "unknown script error".to_string(),
    }
}

impl Engine {
    fn new(
        id: SandboxId,
        limits: &ResourceLimits,
        state: Arc<StateCell>,
        shutdown: CancellationToken,
        host: tokio::runtime::Handle,
    ) -> Self {
        let create_params = v8::CreateParams::default().heap_limits(0, limits.heap_bytes());
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![bridge::extension()],
            create_params: Some(create_params),
            ..Default::default()
        });
        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(CapabilityTable::new());
            op_state.put(HostRuntime::new(host, shutdown.clone()));
        }

        let heap = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit,
            &*heap as *const HeapLimitState as *mut std::ffi::c_void,
        );

        Self {
            compiled: None,
            runtime,
            heap,
            id,
            limit_mib: limits.memory_limit_mib,
            state,
            shutdown,
            poisoned: false,
        }
    }

    async fn bootstrap(&mut self, console: &CapabilityObject, strict: bool) -> Result<()> {
        let reference = self.register(console);
        self.inject("[isobridge:console]", bootstrap::console_prelude(reference))
            .await?;
        self.inject("[isobridge:bootstrap]", bootstrap::bootstrap_script(strict))
            .await?;
        tracing::debug!(sandbox = %self.id, strict, "bootstrap complete");
        Ok(())
    }

    fn closed(&self) -> bool {
        self.poisoned || self.state.is_destroyed()
    }

    async fn dispatch(&mut self, command: Command) {
        if self.closed() {
            match command {
                Command::Inject { reply, .. }
                | Command::Module { reply, .. }
                | Command::Capability { reply, .. }
                | Command::Compile { reply, .. } => respond(reply, Err(SandboxError::Destroyed)),
                Command::Execute { reply } | Command::Eval { reply, .. } => {
                    respond(reply, Err(SandboxError::Destroyed))
                }
                Command::Property { reply, .. } => respond(reply, Err(SandboxError::Destroyed)),
                Command::BridgeStats { reply } => respond(reply, Err(SandboxError::Destroyed)),
            }
            return;
        }

        match command {
            Command::Inject {
                label,
                source,
                reply,
            } => respond(reply, self.inject(label, source).await),
            Command::Module {
                name,
                source,
                reply,
            } => respond(reply, self.module(&name, source).await),
            Command::Capability {
                object,
                target,
                extra,
                reply,
            } => {
                let reference = self.register(&object);
                let script = match &target {
                    Target::Global(name) => {
                        bootstrap::inject_global_script(name, reference, extra.as_deref())
                    }
                    Target::Plugin(name) => {
                        bootstrap::register_plugin_script(name, reference, extra.as_deref())
                    }
                };
                tracing::debug!(sandbox = %self.id, ?target, reference, "injecting capability");
                respond(reply, self.inject("[isobridge:capability]", script).await);
            }
            Command::Compile { source, reply } => {
                let result = self.compile(&source);
                respond(reply, result);
            }
            Command::Execute { reply } => {
                let started = Instant::now();
                let result = self.execute().await;
                tracing::debug!(
                    sandbox = %self.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "execute finished"
                );
                respond(reply, result);
            }
            Command::Eval { source, reply } => respond(reply, self.eval(source).await),
            Command::Property { path, reply } => respond(reply, self.property(&path)),
            Command::BridgeStats { reply } => respond(reply, Ok(self.bridge_stats())),
        }
    }

    fn register(&mut self, object: &CapabilityObject) -> u32 {
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<CapabilityTable>()
            .register_reference(object)
    }

    fn bridge_stats(&mut self) -> BridgeStats {
        self.runtime
            .op_state()
            .borrow()
            .borrow::<CapabilityTable>()
            .stats()
    }

    /// Map an engine failure onto the sandbox taxonomy.
    fn failure(&mut self, message: String) -> SandboxError {
        if self.heap.triggered.load(Ordering::SeqCst) {
            self.poisoned = true;
            tracing::warn!(sandbox = %self.id, limit_mib = self.limit_mib, "heap limit reached");
            SandboxError::MemoryLimit {
                limit_mib: self.limit_mib,
            }
        } else if self.state.is_destroyed() {
            SandboxError::Destroyed
        } else {
            SandboxError::script(message)
        }
    }

    async fn inject(&mut self, label: &'static str, source: String) -> Result<()> {
        if let Err(e) = self.runtime.execute_script(label, source) {
            return Err(self.failure(e.to_string()));
        }
        self.drain().await
    }

    /// Run `source` as a global script between the module prelude and
    /// epilogue. Top-level declarations land on the global object; the
    /// temporary `module`/`exports` globals never outlive the call.
    async fn module(&mut self, name: &str, source: String) -> Result<()> {
        self.inject("[isobridge:module]", bootstrap::module_prelude())
            .await?;
        let loaded = self.inject("[isobridge:module]", source).await;
        if self.closed() {
            return loaded;
        }
        let epilogue = bootstrap::module_epilogue(name, loaded.is_ok());
        let cleanup = self.inject("[isobridge:module]", epilogue).await;
        loaded.and(cleanup)
    }

    /// Drive pending async ops to completion.
    async fn drain(&mut self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            r = self.runtime.run_event_loop(PollEventLoopOptions::default()) => {
                Some(r.map_err(|e| e.to_string()))
            }
        };
        match outcome {
            None => Err(SandboxError::Destroyed),
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(self.failure(message)),
        }
    }

    /// Resolve `value` if it is a promise, driving the event loop meanwhile.
    async fn settle(&mut self, value: v8::Global<v8::Value>) -> Result<v8::Global<v8::Value>> {
        let resolved = Box::pin(self.runtime.resolve(value));
        let shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            r = self.runtime.with_event_loop_promise(resolved, PollEventLoopOptions::default()) => {
                Some(r.map_err(|e| e.to_string()))
            }
        };
        match outcome {
            None => Err(SandboxError::Destroyed),
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(self.failure(message)),
        }
    }

    /// Copy a guest value out through `JSON.stringify`, so cycles and
    /// throwing `toJSON` hooks surface as marshal errors.
    fn to_json(&mut self, value: v8::Global<v8::Value>) -> Result<Value> {
        let text = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, value);
            if local.is_undefined() || local.is_function() || local.is_symbol() {
                return Ok(Value::Null);
            }
            let tc = &mut v8::TryCatch::new(scope);
            match v8::json::stringify(tc, local) {
                Some(text) => Ok(text.to_rust_string_lossy(tc)),
                None => Err((tc.has_terminated(), exception_message(tc))),
            }
        };

        match text {
            // `toJSON` returned undefined.
            Ok(text) if text.is_empty() => Ok(Value::Null),
            Ok(text) => {
                serde_json::from_str(&text).map_err(|e| SandboxError::Marshal(e.to_string()))
            }
            Err((true, message)) => Err(self.failure(message)),
            Err((false, message)) => {
                if self.heap.triggered.load(Ordering::SeqCst) {
                    return Err(self.failure(message));
                }
                Err(SandboxError::Marshal(message))
            }
        }
    }

    fn compile(&mut self, source: &str) -> Result<()> {
        // Release the previous handle before compiling its replacement.
        self.compiled = None;

        let compiled = {
            let scope = &mut self.runtime.handle_scope();
            let tc = &mut v8::TryCatch::new(scope);
            let code = v8::String::new(tc, source)
                .ok_or_else(|| "script source is too large".to_string());
            match code {
                Ok(code) => match v8::Script::compile(tc, code, None) {
                    Some(script) => {
                        let unbound = script.get_unbound_script(tc);
                        Ok(v8::Global::new(tc, unbound))
                    }
                    None => Err(exception_message(tc)),
                },
                Err(message) => Err(message),
            }
        };

        match compiled {
            Ok(compiled) => {
                self.compiled = Some(compiled);
                Ok(())
            }
            Err(message) => Err(self.failure(message)),
        }
    }

    fn run_compiled(&mut self) -> Result<v8::Global<v8::Value>> {
        let outcome = {
            let Some(compiled) = self.compiled.as_ref() else {
                return Err(SandboxError::NotCompiled);
            };
            let scope = &mut self.runtime.handle_scope();
            let tc = &mut v8::TryCatch::new(scope);
            let unbound = v8::Local::new(tc, compiled);
            let script = unbound.bind_to_current_context(tc);
            match script.run(tc) {
                Some(value) => Ok(v8::Global::new(tc, value)),
                None => Err(exception_message(tc)),
            }
        };
        match outcome {
            Ok(value) => Ok(value),
            Err(message) => Err(self.failure(message)),
        }
    }

    async fn execute(&mut self) -> Result<Value> {
        let value = self.run_compiled()?;
        let value = self.settle(value).await?;
        self.to_json(value)
    }

    /// Call `value` with no arguments if it is a function; pass it through otherwise.
    fn apply(&mut self, value: v8::Global<v8::Value>) -> Result<v8::Global<v8::Value>> {
        let outcome = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, &value);
            match v8::Local::<v8::Function>::try_from(local) {
                Err(_) => Ok(None),
                Ok(function) => {
                    let tc = &mut v8::TryCatch::new(scope);
                    let receiver: v8::Local<v8::Value> = v8::undefined(tc).into();
                    match function.call(tc, receiver, &[]) {
                        Some(result) => Ok(Some(v8::Global::new(tc, result))),
                        None => Err(exception_message(tc)),
                    }
                }
            }
        };
        match outcome {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Ok(value),
            Err(message) => Err(self.failure(message)),
        }
    }

    async fn eval(&mut self, source: String) -> Result<Value> {
        let value = match self.runtime.execute_script("[isobridge:eval]", source) {
            Ok(value) => value,
            Err(e) => return Err(self.failure(e.to_string())),
        };
        let value = self.apply(value)?;
        let value = self.settle(value).await?;
        self.to_json(value)
    }

    fn property(&mut self, path: &str) -> Result<Option<Value>> {
        let script = bootstrap::property_script(path);
        let value = match self.runtime.execute_script("[isobridge:property]", script) {
            Ok(value) => value,
            Err(e) => return Err(self.failure(e.to_string())),
        };
        // Functions and symbols have no data form; report them like undefined.
        let absent = {
            let scope = &mut self.runtime.handle_scope();
            let local = v8::Local::new(scope, &value);
            local.is_undefined() || local.is_function() || local.is_symbol()
        };
        if absent {
            return Ok(None);
        }
        self.to_json(value).map(Some)
    }
}
