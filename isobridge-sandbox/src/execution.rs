//! Sandbox identity and lifecycle state

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Unique sandbox identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(pub uuid::Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a sandbox instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Engine created, bootstrap and plugins still running
    Constructing,
    /// Accepting injections and executions
    Ready,
    /// A compiled script or `eval` is running
    Executing,
    /// Terminal
    Destroyed,
}

impl SandboxState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SandboxState::Constructing,
            1 => SandboxState::Ready,
            2 => SandboxState::Executing,
            _ => SandboxState::Destroyed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SandboxState::Constructing => 0,
            SandboxState::Ready => 1,
            SandboxState::Executing => 2,
            SandboxState::Destroyed => 3,
        }
    }
}

/// State cell shared between the handle and the engine thread.
///
/// `Destroyed` is terminal: once stored, no other transition is accepted.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SandboxState::Constructing.as_u8()))
    }

    pub(crate) fn get(&self) -> SandboxState {
        SandboxState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.get() == SandboxState::Destroyed
    }

    /// Move to `next` unless already destroyed. Returns the previous state.
    pub(crate) fn transition(&self, next: SandboxState) -> SandboxState {
        let destroyed = SandboxState::Destroyed.as_u8();
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != destroyed).then_some(next.as_u8())
            })
            .unwrap_or(destroyed);
        SandboxState::from_u8(previous)
    }
}
