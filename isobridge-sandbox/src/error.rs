//! Sandbox error types.
//!
//! Every public operation surfaces failures through [`SandboxError`]. Host
//! callbacks (capability functions, plugins) report their own failures as
//! `anyhow::Error`, which the bridge turns into guest-visible exceptions.

use thiserror::Error;

/// Unified error type for sandbox instances.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The instance was destroyed, either explicitly or by its time limit.
    #[error("sandbox has been destroyed")]
    Destroyed,

    /// Guest code failed to compile or threw at runtime.
    #[error("script error: {message}")]
    Script {
        /// Message reported by the engine, including the guest exception.
        message: String,
    },

    /// A value could not cross the boundary.
    #[error("marshaling error: {0}")]
    Marshal(String),

    /// The isolate reached its heap ceiling and was terminated.
    #[error("memory limit of {limit_mib} MiB exceeded")]
    MemoryLimit {
        /// Configured ceiling in MiB.
        limit_mib: u64,
    },

    /// `execute` was called before any script was compiled.
    #[error("no script has been compiled")]
    NotCompiled,

    /// The engine thread could not be started or stopped unexpectedly.
    #[error("engine error: {0}")]
    Engine(String),

    /// A plugin could not be resolved (strict tolerance only).
    #[error("plugin error: {reason}")]
    Plugin {
        /// Human-readable description of what went wrong.
        reason: String,
    },

    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Build a [`SandboxError::Script`] from any displayable engine error.
    pub(crate) fn script(message: impl ToString) -> Self {
        SandboxError::Script {
            message: message.to_string(),
        }
    }
}
