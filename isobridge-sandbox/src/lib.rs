//! isobridge sandbox - capability bridge for isolated script execution
//!
//! Runs untrusted JavaScript inside a memory- and time-bounded V8 isolate and
//! exposes a controlled set of host capabilities (functions, objects,
//! plugins) to it. Values cross the boundary as copies; guest code never
//! sees host memory or the raw engine bindings.

mod bootstrap;
mod bridge;
mod capability;
mod config;
mod cpu;
mod engine;
mod error;
mod events;
mod execution;
mod limits;
mod plugin;
mod sandbox;
mod tolerance;

pub use bridge::{BridgeStats, CapabilityTable, Descriptor};
pub use capability::{BlockingFn, Capability, CapabilityObject, FutureFn, HostFunction};
pub use config::SandboxOptions;
pub use cpu::CpuTime;
pub use error::SandboxError;
pub use events::{ConsoleLevel, EventBus, EventKind, SandboxEvent, Subscription};
pub use execution::{SandboxId, SandboxState};
pub use limits::{ResourceLimits, DEFAULT_MEMORY_LIMIT_MIB, DEFAULT_TIME_LIMIT_MS};
pub use plugin::{
    FnPlugin, Plugin, PluginManifest, PluginNamespace, PluginOutcome, PluginRecord,
    PluginResolver, Reserved, ScriptPlugin, LOCAL_PLUGIN_DIR, MANIFEST_FILE,
};
pub use sandbox::Sandbox;
pub use tolerance::{BestEffort, Tolerance};

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
