//! Best-effort results and the tolerance policy.
//!
//! Introspection and plugin loading deliberately swallow some failures.
//! Instead of discarding them, those paths return a [`BestEffort`] so callers
//! (and tests) can tell a tolerated failure apart from a real value.

use serde::{Deserialize, Serialize};

/// How lifecycle and introspection failures are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tolerance {
    /// Swallow the failure and report it as [`BestEffort::Tolerated`].
    #[default]
    BestEffort,
    /// Surface the failure as an error.
    Strict,
}

impl Tolerance {
    pub fn is_strict(self) -> bool {
        matches!(self, Tolerance::Strict)
    }
}

/// Outcome of an operation that never fails under [`Tolerance::BestEffort`].
#[derive(Debug, Clone, PartialEq)]
pub enum BestEffort<T> {
    /// The operation produced a value.
    Value(T),
    /// Nothing was there (e.g. an `undefined` guest property).
    Absent,
    /// The operation failed and the failure was swallowed.
    Tolerated {
        /// Why it failed.
        reason: String,
    },
}

impl<T> BestEffort<T> {
    pub(crate) fn tolerated(reason: impl Into<String>) -> Self {
        BestEffort::Tolerated {
            reason: reason.into(),
        }
    }

    /// Return the value, if any.
    pub fn value(self) -> Option<T> {
        match self {
            BestEffort::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, BestEffort::Value(_))
    }

    pub fn is_tolerated(&self) -> bool {
        matches!(self, BestEffort::Tolerated { .. })
    }
}
