//! Test doubles for driving a query lifecycle without a real engine.
//!
//! These stubs record every interaction so tests can assert on transaction
//! finalization, cleanup counts, and reschedule requests. They are used by
//! the crate's own unit, integration, and property tests, and are exported
//! for embedders who want to exercise code built on the controller.

use crate::controller::collaborators::{
    CleanupError, Metadata, RecoveryManager, RecoveryState, RescheduleError, ResourceGroupId,
    ResourceGroupManager, TaskContextManager, Warning, WarningCollector, UNLIMITED_MEMORY,
};
use crate::session::{QueryId, Session};
use crate::transaction::{TransactionError, TransactionId, TransactionManager};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory transaction manager with injectable commit/abort outcomes.
#[derive(Default)]
pub struct StubTransactionManager {
    next_id: AtomicU64,
    open: Mutex<HashSet<TransactionId>>,
    auto_commit: Mutex<HashSet<TransactionId>>,
    commit_error: Mutex<Option<TransactionError>>,
    abort_error: Mutex<Option<TransactionError>>,
    commits: AtomicUsize,
    aborts: AtomicUsize,
    fails: AtomicUsize,
}

impl StubTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent commit fail with `message`.
    pub fn fail_commits(&self, message: &str) {
        *self.commit_error.lock().unwrap() = Some(TransactionError(message.to_string()));
    }

    /// Makes every subsequent abort fail with `message`.
    pub fn fail_aborts(&self, message: &str) {
        *self.abort_error.lock().unwrap() = Some(TransactionError(message.to_string()));
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn fails(&self) -> usize {
        self.fails.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionManager for StubTransactionManager {
    fn begin(&self, auto_commit: bool) -> TransactionId {
        let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.open.lock().unwrap().insert(id);
        if auto_commit {
            self.auto_commit.lock().unwrap().insert(id);
        }
        id
    }

    fn transaction_exists(&self, id: TransactionId) -> bool {
        self.open.lock().unwrap().contains(&id)
    }

    fn is_auto_commit(&self, id: TransactionId) -> bool {
        self.auto_commit.lock().unwrap().contains(&id)
    }

    async fn commit(&self, id: TransactionId) -> Result<(), TransactionError> {
        if let Some(error) = self.commit_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.open.lock().unwrap().remove(&id);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self, id: TransactionId) -> Result<(), TransactionError> {
        if let Some(error) = self.abort_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.open.lock().unwrap().remove(&id);
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fail(&self, id: TransactionId) {
        self.open.lock().unwrap().remove(&id);
        self.fails.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resource-group manager answering from fixed values.
pub struct StaticResourceGroups {
    pub registered: bool,
    pub soft_reserved_memory: u64,
}

impl StaticResourceGroups {
    /// An unregistered group: throttling stays disabled.
    pub fn unregistered() -> Self {
        Self {
            registered: false,
            soft_reserved_memory: UNLIMITED_MEMORY,
        }
    }

    /// A registered group with a soft reservation: throttling enabled.
    pub fn throttled(soft_reserved_memory: u64) -> Self {
        Self {
            registered: true,
            soft_reserved_memory,
        }
    }
}

impl ResourceGroupManager for StaticResourceGroups {
    fn is_group_registered(&self, _group: &ResourceGroupId) -> bool {
        self.registered
    }

    fn soft_reserved_memory(&self, _group: &ResourceGroupId) -> u64 {
        self.soft_reserved_memory
    }
}

/// Metadata stub counting cleanup calls, optionally failing them.
#[derive(Default)]
pub struct RecordingMetadata {
    cleanups: AtomicUsize,
    fail_message: Mutex<Option<String>>,
}

impl RecordingMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_cleanup(&self, message: &str) {
        *self.fail_message.lock().unwrap() = Some(message.to_string());
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl Metadata for RecordingMetadata {
    fn cleanup_query(&self, _session: &Session) -> Result<(), CleanupError> {
        if let Some(message) = self.fail_message.lock().unwrap().clone() {
            return Err(CleanupError(message));
        }
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Task-context registry stub counting teardown calls.
#[derive(Default)]
pub struct RecordingTaskContexts {
    cleanups: AtomicUsize,
}

impl RecordingTaskContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl TaskContextManager for RecordingTaskContexts {
    fn cleanup_context(&self, _query_id: &QueryId) -> Result<(), CleanupError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recovery manager answering from a settable state.
#[derive(Default)]
pub struct StaticRecovery {
    state: Mutex<Option<RecoveryState>>,
    fail_message: Mutex<Option<String>>,
    reschedules: AtomicUsize,
}

impl StaticRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: RecoveryState) {
        *self.state.lock().unwrap() = Some(state);
    }

    pub fn fail_reschedule(&self, message: &str) {
        *self.fail_message.lock().unwrap() = Some(message.to_string());
    }

    pub fn reschedules(&self) -> usize {
        self.reschedules.load(Ordering::SeqCst)
    }
}

impl RecoveryManager for StaticRecovery {
    fn state(&self) -> RecoveryState {
        self.state.lock().unwrap().unwrap_or(RecoveryState::Normal)
    }

    fn reschedule_query(&self) -> Result<(), RescheduleError> {
        if let Some(message) = self.fail_message.lock().unwrap().clone() {
            return Err(RescheduleError(message));
        }
        self.reschedules.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Warning collector returning a fixed list.
#[derive(Default)]
pub struct StaticWarnings {
    pub warnings: Vec<Warning>,
}

impl WarningCollector for StaticWarnings {
    fn warnings(&self) -> Vec<Warning> {
        self.warnings.clone()
    }
}
