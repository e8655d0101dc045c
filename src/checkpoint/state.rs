/// State access seam between the checkpoint manager and whatever owns the
/// mutable document/session state.
///
/// The core never interprets snapshot contents. Owners implement
/// [`StateAccessor`] and register one accessor per [`RollbackScope`].
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Opaque snapshot of externally owned state
pub type Snapshot = serde_json::Value;

/// Extent of state restored by a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackScope {
    /// Only the state owned by the operation itself
    OperationOnly,

    /// Agent-level state (memory, scratchpads)
    AgentState,

    /// The full document being edited
    DocumentState,

    /// Every registered scope at once
    SystemWide,
}

impl RollbackScope {
    /// Scopes that own their own accessor (everything except `SystemWide`)
    pub const CONCRETE: [RollbackScope; 3] = [
        RollbackScope::OperationOnly,
        RollbackScope::AgentState,
        RollbackScope::DocumentState,
    ];

    /// Stable key used inside system-wide snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackScope::OperationOnly => "operation_only",
            RollbackScope::AgentState => "agent_state",
            RollbackScope::DocumentState => "document_state",
            RollbackScope::SystemWide => "system_wide",
        }
    }
}

impl fmt::Display for RollbackScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read/write access to externally owned state
#[cfg_attr(test, mockall::automock)]
pub trait StateAccessor: Send + Sync {
    /// Capture the current state
    fn read(&self) -> Result<Snapshot>;

    /// Replace the current state with `snapshot`
    fn write(&self, snapshot: Snapshot) -> Result<()>;
}

/// Shared in-memory state cell
///
/// Useful when the owner keeps its state as JSON already; clones share the
/// same underlying value.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<Snapshot>>,
}

impl SharedState {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Current value
    pub fn get(&self) -> Snapshot {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mutate the value in place
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }
}

impl StateAccessor for SharedState {
    fn read(&self) -> Result<Snapshot> {
        Ok(self.get())
    }

    fn write(&self, snapshot: Snapshot) -> Result<()> {
        self.update(|value| *value = snapshot);
        Ok(())
    }
}
