//! Contracts of the collaborators the controller drives.
//!
//! These traits are the seams where the surrounding engine plugs in:
//! resource-group accounting, catalog cleanup, per-query context teardown,
//! recovery orchestration, and warning collection. The controller holds each
//! behind an `Arc<dyn ...>` handed over at construction.

use crate::session::{QueryId, Session};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Identifier of a resource group, e.g. `global.adhoc`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct ResourceGroupId(String);

impl ResourceGroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sentinel for "no soft memory reservation configured".
pub const UNLIMITED_MEMORY: u64 = u64::MAX;

/// Resource-group admission accounting.
pub trait ResourceGroupManager: Send + Sync + 'static {
    fn is_group_registered(&self, group: &ResourceGroupId) -> bool;

    /// Soft memory reservation for the group, or [`UNLIMITED_MEMORY`].
    fn soft_reserved_memory(&self, group: &ResourceGroupId) -> u64;
}

/// Failure raised by a cleanup collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("cleanup failed: {0}")]
pub struct CleanupError(pub String);

/// Catalog metadata service; releases per-query connector state.
pub trait Metadata: Send + Sync + 'static {
    fn cleanup_query(&self, session: &Session) -> Result<(), CleanupError>;
}

/// Per-query execution context registry on this coordinator.
pub trait TaskContextManager: Send + Sync + 'static {
    fn cleanup_context(&self, query_id: &QueryId) -> Result<(), CleanupError>;
}

/// State of the recovery orchestration for a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    /// No recovery activity.
    Normal,
    /// Stages are being stopped so the query can be rescheduled.
    StoppingForReschedule,
    /// The query is being placed onto a new set of workers.
    Rescheduling,
}

/// Failure raised when a recovery reschedule cannot be carried out.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("reschedule failed: {0}")]
pub struct RescheduleError(pub String);

/// Node-snapshot recovery orchestration.
pub trait RecoveryManager: Send + Sync + 'static {
    fn state(&self) -> RecoveryState;

    /// Requests that the query be placed again after its stages stopped.
    fn reschedule_query(&self) -> Result<(), RescheduleError>;
}

/// A warning to surface to the client alongside results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

/// Accumulates warnings raised during planning and execution.
pub trait WarningCollector: Send + Sync + 'static {
    fn warnings(&self) -> Vec<Warning>;
}

/// Collector for when warnings are not tracked.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopWarningCollector;

impl WarningCollector for NoopWarningCollector {
    fn warnings(&self) -> Vec<Warning> {
        Vec::new()
    }
}

/// Identifier of a memory pool on the coordinator.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct MemoryPoolId(String);

impl MemoryPoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The pool every query starts in.
    pub fn general() -> Self {
        Self::new("general")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryPoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A memory-pool assignment with its reassignment version.
///
/// The version lets racing pool moves be ordered: a reassignment carries a
/// higher version than the one it replaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VersionedMemoryPool {
    pub id: MemoryPoolId,
    pub version: u64,
}

impl VersionedMemoryPool {
    pub fn new(id: MemoryPoolId, version: u64) -> Self {
        Self { id, version }
    }
}

impl Default for VersionedMemoryPool {
    fn default() -> Self {
        Self::new(MemoryPoolId::general(), 0)
    }
}
