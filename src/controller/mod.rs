//! Query lifecycle control.
//!
//! [`QueryController`] owns a single query's state from submission through
//! its terminal outcome. It composes the pieces that have to stay correct
//! under concurrent callers:
//!
//! - the state machine over [`QueryState`] with terminal absorption;
//! - phase timing and heartbeats;
//! - atomic memory watermarks;
//! - the output publisher feeding result readers;
//! - transaction finalization (auto-commit on finishing, abort on failure);
//! - one-shot cleanup and the one-shot final snapshot.
//!
//! External collaborators (dispatcher, planner, scheduler, memory manager)
//! call the transition methods; a periodic poller calls the snapshot
//! methods with the current stage tree. Nothing here blocks a caller on
//! listener or transaction work: both are handed to the notification
//! executor.

pub mod collaborators;
pub mod memory;
pub mod query_state;
pub mod snapshot;

use crate::error::{FailureKind, QueryFailure, SessionError};
use crate::notify::NotificationExecutor;
use crate::output::{ColumnType, QueryOutputInfo, QueryOutputPublisher};
use crate::session::{QueryId, QueryInput, QueryOutput, SelectedRole, Session};
use crate::stage::{all_stages, BasicStageStats, StageInfo, TaskId, TaskLocation};
use crate::state::StateMachine;
use crate::timing::QueryPhaseTimer;
use crate::transaction::{TransactionId, TransactionManager};
use chrono::{DateTime, Utc};
use collaborators::{
    CleanupError, Metadata, RecoveryManager, RecoveryState, ResourceGroupId, ResourceGroupManager,
    TaskContextManager, VersionedMemoryPool, WarningCollector, UNLIMITED_MEMORY,
};
use dashmap::{DashMap, DashSet};
use memory::{MemorySnapshot, MemoryTracker};
use query_state::QueryState;
use snapshot::{BasicQuerySnapshot, QuerySnapshot, QueryStats};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, warn};

/// One-shot holder of the final snapshot.
///
/// Equality is pointer identity so the pruning compare-and-set replaces
/// exactly the snapshot it derived from, never a racing writer's.
#[derive(Clone, Debug, Default)]
struct FinalSnapshotCell(Option<Arc<QuerySnapshot>>);

impl PartialEq for FinalSnapshotCell {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Transaction-id requests accumulated for the client.
///
/// Starting and clearing are mutually exclusive within one query; the
/// single lock keeps the exclusivity check and the write atomic.
#[derive(Default)]
struct TransactionRequest {
    started: Option<TransactionId>,
    clear: bool,
}

/// Everything needed to begin a query lifecycle.
pub struct BeginQuery {
    pub query: String,
    pub prepared_query: Option<String>,
    pub session: Session,
    pub self_uri: String,
    pub resource_group: ResourceGroupId,
    /// True when the client manages the transaction itself; suppresses the
    /// implicit auto-commit transaction.
    pub transaction_control: bool,
    pub transaction_manager: Arc<dyn TransactionManager>,
    pub resource_group_manager: Arc<dyn ResourceGroupManager>,
    pub metadata: Arc<dyn Metadata>,
    pub task_contexts: Arc<dyn TaskContextManager>,
    pub warning_collector: Arc<dyn WarningCollector>,
    pub executor: Arc<dyn NotificationExecutor>,
}

/// Owns one query's lifecycle. Thread-safe; shared as `Arc<QueryController>`.
pub struct QueryController {
    query_id: QueryId,
    query: String,
    prepared_query: Option<String>,
    session: Session,
    self_uri: String,
    resource_group: ResourceGroupId,
    throttling_enabled: bool,
    recovery_enabled: bool,

    transaction_manager: Arc<dyn TransactionManager>,
    metadata: Arc<dyn Metadata>,
    task_contexts: Arc<dyn TaskContextManager>,
    warning_collector: Arc<dyn WarningCollector>,
    executor: Arc<dyn NotificationExecutor>,

    state: StateMachine<QueryState>,
    final_snapshot: StateMachine<FinalSnapshotCell>,
    timer: QueryPhaseTimer,
    output: QueryOutputPublisher,
    memory: MemoryTracker,
    memory_pool: RwLock<VersionedMemoryPool>,

    cleaned_up: AtomicBool,
    running_async: AtomicBool,

    set_catalog: RwLock<Option<String>>,
    set_schema: RwLock<Option<String>>,
    set_path: RwLock<Option<String>>,
    set_session_properties: DashMap<String, String>,
    reset_session_properties: DashSet<String>,
    set_roles: DashMap<String, SelectedRole>,
    added_prepared_statements: DashMap<String, String>,
    deallocated_prepared_statements: DashSet<String>,

    transaction_request: Mutex<TransactionRequest>,
    update_type: RwLock<Option<String>>,
    failure_cause: Mutex<Option<QueryFailure>>,
    inputs: Mutex<HashSet<QueryInput>>,
    output_target: Mutex<Option<QueryOutput>>,
}

impl QueryController {
    /// Begins a query lifecycle.
    ///
    /// When the session carries no transaction and the client did not ask
    /// for transaction control, an auto-commit transaction is opened on the
    /// session's behalf; the controller finalizes it on the terminal path.
    ///
    /// Every controller must eventually reach a terminal state, otherwise
    /// the transaction and per-query contexts are never released.
    pub fn begin(begin: BeginQuery) -> Arc<QueryController> {
        let BeginQuery {
            query,
            prepared_query,
            mut session,
            self_uri,
            resource_group,
            transaction_control,
            transaction_manager,
            resource_group_manager,
            metadata,
            task_contexts,
            warning_collector,
            executor,
        } = begin;

        if session.transaction_id().is_none() && !transaction_control {
            let transaction_id = transaction_manager.begin(true);
            session = session.with_transaction(transaction_id);
        }

        let query_id = session.query_id().clone();
        let throttling_enabled = resource_group_manager.is_group_registered(&resource_group)
            && resource_group_manager.soft_reserved_memory(&resource_group) != UNLIMITED_MEMORY;
        let recovery_enabled = session.recovery_enabled();

        let controller = Arc::new(QueryController {
            query,
            prepared_query,
            self_uri,
            resource_group,
            throttling_enabled,
            recovery_enabled,
            transaction_manager,
            metadata,
            task_contexts,
            warning_collector,
            state: StateMachine::new(
                format!("query {query_id}"),
                Arc::clone(&executor),
                QueryState::Queued,
                QueryState::terminal_states(),
            ),
            final_snapshot: StateMachine::new(
                format!("final-snapshot {query_id}"),
                Arc::clone(&executor),
                FinalSnapshotCell::default(),
                Vec::new(),
            ),
            timer: QueryPhaseTimer::new(),
            output: QueryOutputPublisher::new(Arc::clone(&executor)),
            memory: MemoryTracker::new(),
            memory_pool: RwLock::new(VersionedMemoryPool::default()),
            cleaned_up: AtomicBool::new(false),
            running_async: AtomicBool::new(false),
            set_catalog: RwLock::new(None),
            set_schema: RwLock::new(None),
            set_path: RwLock::new(None),
            set_session_properties: DashMap::new(),
            reset_session_properties: DashSet::new(),
            set_roles: DashMap::new(),
            added_prepared_statements: DashMap::new(),
            deallocated_prepared_statements: DashSet::new(),
            transaction_request: Mutex::new(TransactionRequest::default()),
            update_type: RwLock::new(None),
            failure_cause: Mutex::new(None),
            inputs: Mutex::new(HashSet::new()),
            output_target: Mutex::new(None),
            executor,
            query_id: query_id.clone(),
            session,
        });

        controller.state.add_listener(move |state| {
            debug!(query_id = %query_id, state = %state, "query state changed");
        });

        controller
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn prepared_query(&self) -> Option<&str> {
        self.prepared_query.as_deref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn self_uri(&self) -> &str {
        &self.self_uri
    }

    pub fn resource_group(&self) -> &ResourceGroupId {
        &self.resource_group
    }

    /// True when the resource group is registered with a bounded soft
    /// memory reservation; sampled once at construction.
    pub fn throttling_enabled(&self) -> bool {
        self.throttling_enabled
    }

    pub fn recovery_enabled(&self) -> bool {
        self.recovery_enabled
    }

    pub fn memory_pool(&self) -> VersionedMemoryPool {
        self.read_lock(&self.memory_pool).clone()
    }

    pub fn set_memory_pool(&self, pool: VersionedMemoryPool) {
        *self.write_lock(&self.memory_pool) = pool;
    }

    // ------------------------------------------------------------------
    // State machine surface
    // ------------------------------------------------------------------

    pub fn state(&self) -> QueryState {
        self.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.state.get().is_terminal()
    }

    /// Registers a state-change observer.
    ///
    /// Notifications run on the notification executor and may arrive out of
    /// order across concurrent transitions; re-read [`Self::state`] when
    /// ordering matters.
    pub fn add_state_change_listener(&self, listener: impl Fn(QueryState) + Send + Sync + 'static) {
        self.state.add_listener(listener);
    }

    /// Completes when the state differs from `current`.
    pub async fn wait_for_state_change(&self, current: QueryState) -> QueryState {
        self.state.wait_for_change(current).await
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    pub fn to_waiting_for_resources(&self) -> bool {
        self.timer.begin_waiting_for_resources();
        self.state.set_if(QueryState::WaitingForResources, |current| {
            *current < QueryState::WaitingForResources
        })
    }

    pub fn to_dispatching(&self) -> bool {
        self.timer.begin_dispatching();
        self.state
            .set_if(QueryState::Dispatching, |current| *current < QueryState::Dispatching)
    }

    pub fn to_planning(&self) -> bool {
        self.timer.begin_planning();
        self.state
            .set_if(QueryState::Planning, |current| *current < QueryState::Planning)
    }

    /// Enters STARTING, either from an earlier phase or from RECOVERING.
    /// On the recovery edge the output publisher forgets its exchange
    /// locations so the resumed stages can announce fresh ones.
    pub fn to_starting(&self) -> bool {
        self.timer.begin_starting();
        self.state.set_if(QueryState::Starting, |current| {
            if *current < QueryState::Starting {
                return true;
            }
            if *current == QueryState::Recovering {
                self.output.reset_for_resume();
                return true;
            }
            false
        })
    }

    pub fn to_running(&self) -> bool {
        self.timer.begin_running();
        self.state
            .set_if(QueryState::Running, |current| *current < QueryState::Running)
    }

    pub fn to_recovering(&self) -> bool {
        self.state.set_if(QueryState::Recovering, |current| {
            *current == QueryState::Running || *current == QueryState::Suspended
        })
    }

    pub fn to_suspended(&self) -> bool {
        self.state
            .set_if(QueryState::Suspended, |current| *current == QueryState::Running)
    }

    pub fn to_resume_running(&self) -> bool {
        self.state
            .set_if(QueryState::Running, |current| *current == QueryState::Suspended)
    }

    /// Enters FINISHING and finalizes the query.
    ///
    /// Cleanup runs first; a cleanup failure converts the finishing into a
    /// failure. With an auto-commit transaction active, FINISHED is reached
    /// only through the asynchronous commit continuation, so a concurrent
    /// failure can still preempt it.
    pub fn to_finishing(self: &Arc<Self>) -> bool {
        self.timer.begin_finishing();

        if !self.state.set_if(QueryState::Finishing, |current| {
            *current != QueryState::Finishing && !current.is_terminal()
        }) {
            return false;
        }

        self.running_async.store(false, Ordering::Release);
        if let Err(error) = self.cleanup() {
            self.to_failed(QueryFailure::new(FailureKind::Cleanup, error.to_string()));
            return true;
        }

        match self.session.transaction_id() {
            Some(id)
                if self.transaction_manager.transaction_exists(id)
                    && self.transaction_manager.is_auto_commit(id) =>
            {
                let this = Arc::clone(self);
                let transaction_manager = Arc::clone(&self.transaction_manager);
                self.executor.execute(Box::pin(async move {
                    match transaction_manager.commit(id).await {
                        Ok(()) => this.finish(),
                        Err(error) => {
                            this.to_failed(QueryFailure::new(
                                FailureKind::TransactionCommit,
                                error.to_string(),
                            ));
                        }
                    }
                }));
            }
            _ => self.finish(),
        }
        true
    }

    fn finish(&self) {
        self.timer.end_query();
        self.state
            .set_if(QueryState::Finished, |current| !current.is_terminal());
    }

    /// Drives the query to FAILED with `cause`.
    ///
    /// Returns whether this call won the terminal transition; losers (the
    /// query already ended) leave no trace beyond a debug log.
    pub fn to_failed(&self, cause: QueryFailure) -> bool {
        self.fail(cause)
    }

    /// Cancels the query: identical to a failure carrying the synthetic
    /// user-canceled cause.
    pub fn to_canceled(&self) -> bool {
        self.fail(QueryFailure::user_canceled())
    }

    fn fail(&self, cause: QueryFailure) -> bool {
        self.cleanup_quietly();
        self.timer.end_query();

        // The cause must be recorded before the transition becomes visible:
        // a listener observing FAILED must be able to read it. The record
        // is only exposed once the transition to FAILED succeeds.
        {
            let mut slot = self.lock(&self.failure_cause);
            if slot.is_none() {
                *slot = Some(cause.clone());
            }
        }

        let failed = self
            .state
            .set_if(QueryState::Failed, |current| !current.is_terminal());

        if failed {
            debug!(query_id = %self.query_id, failure = %cause, "query failed");
            self.resolve_failed_transaction();
        } else {
            debug!(query_id = %self.query_id, failure = %cause, "failure reported after query ended");
        }
        failed
    }

    /// Aborts an auto-commit transaction asynchronously; everything else is
    /// marked failed synchronously. An abort error falls back to failing
    /// the transaction directly.
    fn resolve_failed_transaction(&self) {
        let Some(id) = self.session.transaction_id() else {
            return;
        };
        if self.transaction_manager.transaction_exists(id)
            && self.transaction_manager.is_auto_commit(id)
        {
            let transaction_manager = Arc::clone(&self.transaction_manager);
            self.executor.execute(Box::pin(async move {
                if let Err(abort_error) = transaction_manager.abort(id).await {
                    error!(
                        transaction_id = %id,
                        error = %abort_error,
                        "error aborting transaction of failed query; failing it directly"
                    );
                    transaction_manager.fail(id);
                }
            }));
        } else {
            self.transaction_manager.fail(id);
        }
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Releases per-query collaborator state. Runs at most once; later
    /// callers see the latch and return immediately.
    fn cleanup(&self) -> Result<(), CleanupError> {
        if self
            .cleaned_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.metadata.cleanup_query(&self.session)?;
            self.task_contexts.cleanup_context(&self.query_id)?;
        }
        Ok(())
    }

    fn cleanup_quietly(&self) {
        if let Err(cleanup_error) = self.cleanup() {
            error!(query_id = %self.query_id, error = %cleanup_error, "error cleaning up query");
        }
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Applies memory reservation deltas; see [`MemoryTracker::update`].
    pub fn update_memory_usage(
        &self,
        delta_user: i64,
        delta_revocable: i64,
        delta_total: i64,
        task_user: i64,
        task_revocable: i64,
        task_total: i64,
    ) {
        self.memory.update(
            delta_user,
            delta_revocable,
            delta_total,
            task_user,
            task_revocable,
            task_total,
        );
    }

    pub fn memory_usage(&self) -> MemorySnapshot {
        self.memory.snapshot()
    }

    // ------------------------------------------------------------------
    // Output publication
    // ------------------------------------------------------------------

    pub fn add_output_info_listener(&self, listener: impl Fn(QueryOutputInfo) + Send + Sync + 'static) {
        self.output.add_output_info_listener(listener);
    }

    pub fn add_output_task_failure_listener(
        &self,
        listener: impl Fn(TaskId, QueryFailure) + Send + Sync + 'static,
    ) {
        self.output.add_task_failure_listener(listener);
    }

    pub fn set_columns(&self, column_names: Vec<String>, column_types: Vec<ColumnType>) {
        self.output.set_columns(column_names, column_types);
    }

    pub fn update_output_locations(
        &self,
        new_locations: Vec<(TaskId, TaskLocation)>,
        no_more_locations: bool,
    ) {
        self.output.update_output_locations(new_locations, no_more_locations);
    }

    pub fn record_output_task_failure(&self, task_id: TaskId, failure: QueryFailure) {
        self.output.record_task_failure(task_id, failure);
    }

    pub fn current_output_info(&self) -> Option<QueryOutputInfo> {
        self.output.current_output_info()
    }

    // ------------------------------------------------------------------
    // Session mutation accumulators
    // ------------------------------------------------------------------

    pub fn set_catalog(&self, catalog: impl Into<String>) {
        *self.write_lock(&self.set_catalog) = Some(catalog.into());
    }

    pub fn set_schema(&self, schema: impl Into<String>) {
        *self.write_lock(&self.set_schema) = Some(schema.into());
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *self.write_lock(&self.set_path) = Some(path.into());
    }

    pub fn add_set_session_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.set_session_properties.insert(name.into(), value.into());
    }

    pub fn add_reset_session_property(&self, name: impl Into<String>) {
        self.reset_session_properties.insert(name.into());
    }

    pub fn add_set_role(&self, catalog: impl Into<String>, role: SelectedRole) {
        self.set_roles.insert(catalog.into(), role);
    }

    pub fn add_prepared_statement(&self, name: impl Into<String>, statement: impl Into<String>) {
        self.added_prepared_statements.insert(name.into(), statement.into());
    }

    /// Marks a prepared statement for deallocation.
    ///
    /// The name must exist in the session's registry; asking to remove an
    /// unknown statement is a client error, not a contract violation.
    pub fn remove_prepared_statement(&self, name: &str) -> Result<(), SessionError> {
        if !self.session.prepared_statements().contains_key(name) {
            return Err(SessionError::PreparedStatementNotFound(name.to_string()));
        }
        self.deallocated_prepared_statements.insert(name.to_string());
        Ok(())
    }

    /// Records the transaction started on the client's behalf. Only the
    /// first write survives.
    ///
    /// # Panics
    ///
    /// Panics if a clear-transaction request was already recorded; starting
    /// and clearing in the same request is a contract violation.
    pub fn set_started_transaction_id(&self, transaction_id: TransactionId) {
        let mut request = self.lock(&self.transaction_request);
        assert!(
            !request.clear,
            "cannot start and clear transaction in the same request"
        );
        if request.started.is_none() {
            request.started = Some(transaction_id);
        }
    }

    /// Requests that the client's transaction binding be cleared.
    ///
    /// # Panics
    ///
    /// Panics if a started-transaction id was already recorded.
    pub fn set_clear_transaction(&self) {
        let mut request = self.lock(&self.transaction_request);
        assert!(
            request.started.is_none(),
            "cannot start and clear transaction in the same request"
        );
        request.clear = true;
    }

    pub fn set_update_type(&self, update_type: impl Into<String>) {
        *self.write_lock(&self.update_type) = Some(update_type.into());
    }

    pub fn set_inputs(&self, inputs: Vec<QueryInput>) {
        *self.lock(&self.inputs) = inputs.into_iter().collect();
    }

    pub fn set_output(&self, output: Option<QueryOutput>) {
        *self.lock(&self.output_target) = output;
    }

    // ------------------------------------------------------------------
    // Timing
    // ------------------------------------------------------------------

    pub fn record_heartbeat(&self) {
        self.timer.record_heartbeat();
    }

    pub fn begin_analysis(&self) {
        self.timer.begin_analysis();
    }

    pub fn end_analysis(&self) {
        self.timer.end_analysis();
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.timer.create_time()
    }

    pub fn execution_start_time(&self) -> Option<DateTime<Utc>> {
        self.timer.execution_start_time()
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.timer.last_heartbeat()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.timer.end_time()
    }

    // ------------------------------------------------------------------
    // Running-async hint
    // ------------------------------------------------------------------

    /// Marks the query as detached from its client while RUNNING. Reset
    /// when finishing begins.
    pub fn set_running_async(&self, running_async: bool) {
        if running_async && self.state.get() == QueryState::Running {
            let _ = self
                .running_async
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    pub fn is_running_async(&self) -> bool {
        self.running_async.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Failure introspection
    // ------------------------------------------------------------------

    /// The failure cause, exposed only once FAILED is committed.
    pub fn failure_info(&self) -> Option<QueryFailure> {
        if self.state.get() != QueryState::Failed {
            return None;
        }
        self.lock(&self.failure_cause).clone()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Composes the lightweight snapshot from a pre-aggregated roll-up.
    pub fn basic_snapshot(&self, root_stage: Option<BasicStageStats>) -> BasicQuerySnapshot {
        // The state must be sampled first: sampling it later could pair a
        // terminal state with stage telemetry that predates it.
        let state = self.state.get();

        let error_kind = if state == QueryState::Failed {
            self.lock(&self.failure_cause).as_ref().map(|f| f.kind())
        } else {
            None
        };

        snapshot::basic_snapshot(
            self.query_id.clone(),
            self.session.clone(),
            self.resource_group.clone(),
            state,
            self.memory_pool().id,
            self.self_uri.clone(),
            self.query.clone(),
            self.prepared_query.clone(),
            root_stage.unwrap_or_else(BasicStageStats::empty),
            error_kind,
            &self.timer,
            &self.memory,
            self.recovery_enabled,
        )
    }

    /// Composes the complete snapshot by walking the supplied stage tree.
    pub fn full_snapshot(&self, root_stage: Option<StageInfo>) -> QuerySnapshot {
        // Sampled first, same as basic_snapshot.
        let state = self.state.get();

        let failure = if state == QueryState::Failed {
            self.lock(&self.failure_cause).clone()
        } else {
            None
        };

        let complete_info = all_stages(root_stage.as_ref())
            .iter()
            .all(|stage| stage.complete_info);
        let scheduled = snapshot::is_scheduled(root_stage.as_ref());
        let stats = QueryStats::aggregate(root_stage.as_ref(), &self.timer, &self.memory);

        let transaction_request = self.lock(&self.transaction_request);
        let started_transaction_id = transaction_request.started;
        let clear_transaction_id = transaction_request.clear;
        drop(transaction_request);

        QuerySnapshot {
            query_id: self.query_id.clone(),
            session: self.session.clone(),
            state,
            memory_pool: self.memory_pool().id,
            scheduled,
            self_uri: self.self_uri.clone(),
            column_names: self.output.column_names(),
            query: self.query.clone(),
            prepared_query: self.prepared_query.clone(),
            stats,
            set_catalog: self.read_lock(&self.set_catalog).clone(),
            set_schema: self.read_lock(&self.set_schema).clone(),
            set_path: self.read_lock(&self.set_path).clone(),
            set_session_properties: self
                .set_session_properties
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect::<HashMap<_, _>>(),
            reset_session_properties: self
                .reset_session_properties
                .iter()
                .map(|name| name.key().clone())
                .collect::<BTreeSet<_>>(),
            set_roles: self
                .set_roles
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect::<HashMap<_, _>>(),
            added_prepared_statements: self
                .added_prepared_statements
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect::<HashMap<_, _>>(),
            deallocated_prepared_statements: self
                .deallocated_prepared_statements
                .iter()
                .map(|name| name.key().clone())
                .collect::<BTreeSet<_>>(),
            started_transaction_id,
            clear_transaction_id,
            update_type: self.read_lock(&self.update_type).clone(),
            output_stage: root_stage,
            failure,
            warnings: self.warning_collector.warnings(),
            inputs: self.lock(&self.inputs).clone(),
            output: self.lock(&self.output_target).clone(),
            complete_info,
            resource_group: self.resource_group.clone(),
            running_async: self.is_running_async(),
            recovery_enabled: self.recovery_enabled,
        }
    }

    /// Composes the full snapshot, retains it if final, and drives the
    /// recovery handoff.
    ///
    /// The recovery read is deliberately coupled to snapshot assembly: when
    /// recovery is enabled, the collaborator reports it is stopping for a
    /// reschedule, and every stage is done, this method transitions to
    /// RECOVERING and requests the reschedule. That read races with
    /// external callers driving transitions concurrently; callers that lose
    /// the race observe the transition refused, which is benign.
    pub fn update_snapshot(
        &self,
        root_stage: Option<StageInfo>,
        recovery: Option<&dyn RecoveryManager>,
    ) -> Arc<QuerySnapshot> {
        let query_snapshot = Arc::new(self.full_snapshot(root_stage));

        if query_snapshot.is_final() {
            let cell = FinalSnapshotCell(Some(Arc::clone(&query_snapshot)));
            self.final_snapshot.set_if(cell, |current| current.0.is_none());
        } else if self.recovery_enabled {
            if let Some(recovery) = recovery {
                if recovery.state() == RecoveryState::StoppingForReschedule
                    && query_snapshot.all_stages_done()
                {
                    debug!(query_id = %self.query_id, "all stages stopped; entering recovery");
                    self.to_recovering();
                    if let Err(reschedule_error) = recovery.reschedule_query() {
                        warn!(
                            query_id = %self.query_id,
                            error = %reschedule_error,
                            "error rescheduling query"
                        );
                        self.to_failed(QueryFailure::new(
                            FailureKind::Reschedule,
                            reschedule_error.to_string(),
                        ));
                    }
                }
            }
        }

        query_snapshot
    }

    /// The retained final snapshot, once one was observed.
    pub fn final_snapshot(&self) -> Option<Arc<QuerySnapshot>> {
        self.final_snapshot.get().0
    }

    /// Registers an observer of the final snapshot, fired exactly once when
    /// (or after) the final snapshot is retained.
    pub fn add_final_snapshot_listener(
        &self,
        listener: impl Fn(Arc<QuerySnapshot>) + Send + Sync + 'static,
    ) {
        let fired = AtomicBool::new(false);
        self.final_snapshot.add_listener(move |cell: FinalSnapshotCell| {
            if let Some(query_snapshot) = cell.0 {
                if fired
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    listener(query_snapshot);
                }
            }
        });
    }

    /// Swaps the retained final snapshot for its pruned variant, freeing
    /// plan fragments, task lists, sub-stages, and operator summaries while
    /// keeping every scalar. No-op until a final snapshot exists.
    pub fn prune_final_snapshot(&self) {
        let Some(retained) = self.final_snapshot.get().0 else {
            return;
        };
        if retained.output_stage.is_none() {
            return;
        }
        let pruned = Arc::new(retained.pruned());
        self.final_snapshot
            .set_if(FinalSnapshotCell(Some(pruned)), |current| {
                matches!(&current.0, Some(existing) if Arc::ptr_eq(existing, &retained))
            });
    }

    // ------------------------------------------------------------------
    // Lock helpers: a poisoned lock only means a panicking reader; the
    // protected values are always left consistent, so keep going.
    // ------------------------------------------------------------------

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
        lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
        lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for QueryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryController")
            .field("query_id", &self.query_id)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::collaborators::NoopWarningCollector;
    use super::*;
    use crate::notify::InlineExecutor;
    use crate::stage::{PlanFragment, SourceKind, StageId, StageState, StageStats};
    use crate::testing::{
        RecordingMetadata, RecordingTaskContexts, StaticRecovery, StaticResourceGroups,
        StubTransactionManager,
    };

    struct Fixture {
        controller: Arc<QueryController>,
        transactions: Arc<StubTransactionManager>,
        metadata: Arc<RecordingMetadata>,
        task_contexts: Arc<RecordingTaskContexts>,
    }

    fn fixture() -> Fixture {
        fixture_with(Session::new(QueryId::new("q1"), "alice"), false)
    }

    fn fixture_with(session: Session, transaction_control: bool) -> Fixture {
        let transactions = Arc::new(StubTransactionManager::new());
        let metadata = Arc::new(RecordingMetadata::new());
        let task_contexts = Arc::new(RecordingTaskContexts::new());
        let controller = QueryController::begin(BeginQuery {
            query: "SELECT orderkey FROM orders".into(),
            prepared_query: None,
            session,
            self_uri: "http://coordinator:8080/v1/query/q1".into(),
            resource_group: ResourceGroupId::new("global.adhoc"),
            transaction_control,
            transaction_manager: transactions.clone(),
            resource_group_manager: Arc::new(StaticResourceGroups::unregistered()),
            metadata: metadata.clone(),
            task_contexts: task_contexts.clone(),
            warning_collector: Arc::new(NoopWarningCollector),
            executor: Arc::new(InlineExecutor),
        });
        Fixture {
            controller,
            transactions,
            metadata,
            task_contexts,
        }
    }

    fn finished_stage() -> StageInfo {
        StageInfo {
            stage_id: StageId(0),
            state: StageState::Finished,
            plan: Some(PlanFragment {
                fragment_id: 0,
                partitioned_sources: vec![SourceKind::TableScan],
            }),
            stats: StageStats {
                total_tasks: 3,
                raw_input_bytes: 1024,
                ..StageStats::default()
            },
            tasks: vec![TaskId::new(0, 0)],
            sub_stages: Vec::new(),
            complete_info: true,
            failure: None,
        }
    }

    #[test]
    fn test_begin_opens_auto_commit_transaction() {
        let fixture = fixture();
        let transaction_id = fixture.controller.session().transaction_id();
        assert!(transaction_id.is_some());
        assert!(fixture
            .transactions
            .is_auto_commit(transaction_id.unwrap()));
    }

    #[test]
    fn test_begin_with_transaction_control_leaves_session_alone() {
        let fixture = fixture_with(Session::new(QueryId::new("q1"), "alice"), true);
        assert!(fixture.controller.session().transaction_id().is_none());
    }

    #[test]
    fn test_throttling_requires_registered_group_with_bounded_reservation() {
        let session = Session::new(QueryId::new("q1"), "alice");
        let transactions = Arc::new(StubTransactionManager::new());
        let controller = QueryController::begin(BeginQuery {
            query: "SELECT 1".into(),
            prepared_query: None,
            session,
            self_uri: "http://coordinator:8080/v1/query/q1".into(),
            resource_group: ResourceGroupId::new("global.etl"),
            transaction_control: true,
            transaction_manager: transactions,
            resource_group_manager: Arc::new(StaticResourceGroups::throttled(1 << 30)),
            metadata: Arc::new(RecordingMetadata::new()),
            task_contexts: Arc::new(RecordingTaskContexts::new()),
            warning_collector: Arc::new(NoopWarningCollector),
            executor: Arc::new(InlineExecutor),
        });

        assert!(controller.throttling_enabled());
        assert!(!fixture().controller.throttling_enabled());
    }

    #[test]
    fn test_forward_transitions_fire_in_order() {
        let fixture = fixture();
        let controller = &fixture.controller;

        assert!(controller.to_waiting_for_resources());
        assert!(controller.to_dispatching());
        assert!(controller.to_planning());
        assert!(controller.to_starting());
        assert!(controller.to_running());
        assert_eq!(controller.state(), QueryState::Running);
    }

    #[test]
    fn test_forward_transitions_may_skip_phases() {
        let fixture = fixture();
        assert!(fixture.controller.to_running());
        assert_eq!(fixture.controller.state(), QueryState::Running);
    }

    #[test]
    fn test_backward_transitions_are_refused() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();

        assert!(!controller.to_planning());
        assert!(!controller.to_dispatching());
        assert_eq!(controller.state(), QueryState::Running);
    }

    #[test]
    fn test_suspend_and_resume() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();

        assert!(controller.to_suspended());
        assert_eq!(controller.state(), QueryState::Suspended);
        // A plain to_running must not resume a suspended query.
        assert!(!controller.to_running());
        assert!(controller.to_resume_running());
        assert_eq!(controller.state(), QueryState::Running);
    }

    #[test]
    fn test_recovering_reachable_from_running_and_suspended_only() {
        let from_running = fixture();
        let controller = &from_running.controller;

        assert!(!controller.to_recovering());
        controller.to_running();
        assert!(controller.to_recovering());

        let from_suspended = fixture();
        let controller = &from_suspended.controller;
        controller.to_running();
        controller.to_suspended();
        assert!(controller.to_recovering());
    }

    #[test]
    fn test_starting_from_recovering_resets_output_locations() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.set_columns(vec!["id".into()], vec![ColumnType::Bigint]);
        controller.update_output_locations(
            vec![(TaskId::new(0, 0), TaskLocation::new("http://w/results", "i0"))],
            true,
        );

        controller.to_running();
        assert!(controller.to_recovering());
        assert!(controller.to_starting());

        let info = controller.current_output_info().unwrap();
        assert!(info.exchange_locations.is_empty());
        assert!(!info.no_more_locations);
    }

    #[test]
    fn test_finishing_commits_and_finishes() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();

        assert!(controller.to_finishing());
        assert_eq!(controller.state(), QueryState::Finished);
        assert_eq!(fixture.transactions.commits(), 1);
        assert_eq!(fixture.metadata.cleanups(), 1);
        assert_eq!(fixture.task_contexts.cleanups(), 1);
        assert!(controller.failure_info().is_none());
        assert!(controller.end_time().is_some());

        // Finishing twice does not fire again, and cleanup stays at one.
        assert!(!controller.to_finishing());
        assert_eq!(fixture.metadata.cleanups(), 1);
    }

    #[test]
    fn test_finishing_without_transaction_finishes_directly() {
        let fixture = fixture_with(Session::new(QueryId::new("q1"), "alice"), true);
        let controller = &fixture.controller;
        controller.to_running();

        assert!(controller.to_finishing());
        assert_eq!(controller.state(), QueryState::Finished);
        assert_eq!(fixture.transactions.commits(), 0);
    }

    #[test]
    fn test_commit_failure_fails_query_with_commit_cause() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();
        fixture.transactions.fail_commits("commit refused");

        assert!(controller.to_finishing());
        assert_eq!(controller.state(), QueryState::Failed);
        let failure = controller.failure_info().unwrap();
        assert_eq!(failure.kind(), FailureKind::TransactionCommit);
        assert!(failure.message().contains("commit refused"));
        assert_eq!(fixture.metadata.cleanups(), 1);
    }

    #[test]
    fn test_cleanup_failure_converts_finishing_to_failure() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();
        fixture.metadata.fail_cleanup("connector teardown failed");

        assert!(controller.to_finishing());
        assert_eq!(controller.state(), QueryState::Failed);
        assert_eq!(
            controller.failure_info().unwrap().kind(),
            FailureKind::Cleanup
        );
        // The commit never ran.
        assert_eq!(fixture.transactions.commits(), 0);
    }

    #[test]
    fn test_failed_aborts_auto_commit_transaction() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();

        assert!(controller.to_failed(QueryFailure::new(FailureKind::External, "worker lost")));
        assert_eq!(controller.state(), QueryState::Failed);
        assert_eq!(fixture.transactions.aborts(), 1);
        assert_eq!(fixture.transactions.fails(), 0);
        assert_eq!(fixture.metadata.cleanups(), 1);
    }

    #[test]
    fn test_abort_error_falls_back_to_direct_fail() {
        let fixture = fixture();
        let controller = &fixture.controller;
        fixture.transactions.fail_aborts("abort refused");

        assert!(controller.to_failed(QueryFailure::new(FailureKind::External, "boom")));
        assert_eq!(fixture.transactions.aborts(), 0);
        assert_eq!(fixture.transactions.fails(), 1);
    }

    #[test]
    fn test_canceled_carries_user_canceled_cause() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();

        assert!(controller.to_canceled());
        assert_eq!(controller.state(), QueryState::Failed);
        assert_eq!(
            controller.failure_info().unwrap().kind(),
            FailureKind::UserCanceled
        );
    }

    #[test]
    fn test_failure_cause_first_write_wins() {
        let fixture = fixture();
        let controller = &fixture.controller;

        assert!(controller.to_failed(QueryFailure::new(FailureKind::External, "first")));
        assert!(!controller.to_failed(QueryFailure::new(FailureKind::External, "second")));

        assert_eq!(controller.failure_info().unwrap().message(), "first");
    }

    #[test]
    fn test_failure_info_hidden_outside_failed_state() {
        let fixture = fixture();
        assert!(fixture.controller.failure_info().is_none());
        fixture.controller.to_running();
        assert!(fixture.controller.failure_info().is_none());
    }

    #[test]
    fn test_terminal_state_absorbs_later_transitions() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();
        controller.to_finishing();
        assert_eq!(controller.state(), QueryState::Finished);

        assert!(!controller.to_failed(QueryFailure::new(FailureKind::External, "late")));
        assert!(!controller.to_canceled());
        assert!(!controller.to_running());
        assert_eq!(controller.state(), QueryState::Finished);
        assert!(controller.failure_info().is_none());
    }

    #[test]
    #[should_panic(expected = "same request")]
    fn test_start_after_clear_transaction_panics() {
        let fixture = fixture();
        fixture.controller.set_clear_transaction();
        fixture
            .controller
            .set_started_transaction_id(TransactionId::new(9));
    }

    #[test]
    #[should_panic(expected = "same request")]
    fn test_clear_after_start_transaction_panics() {
        let fixture = fixture();
        fixture
            .controller
            .set_started_transaction_id(TransactionId::new(9));
        fixture.controller.set_clear_transaction();
    }

    #[test]
    fn test_started_transaction_id_first_write_wins() {
        let fixture = fixture();
        fixture
            .controller
            .set_started_transaction_id(TransactionId::new(1));
        fixture
            .controller
            .set_started_transaction_id(TransactionId::new(2));

        let snapshot = fixture.controller.full_snapshot(None);
        assert_eq!(snapshot.started_transaction_id, Some(TransactionId::new(1)));
    }

    #[test]
    fn test_remove_prepared_statement_requires_known_name() {
        let session = Session::new(QueryId::new("q1"), "alice")
            .with_prepared_statement("find_user", "SELECT * FROM users WHERE id = ?");
        let fixture = fixture_with(session, false);

        assert_eq!(fixture.controller.remove_prepared_statement("find_user"), Ok(()));
        assert_eq!(
            fixture.controller.remove_prepared_statement("missing"),
            Err(SessionError::PreparedStatementNotFound("missing".into()))
        );
    }

    #[test]
    fn test_running_async_only_sticks_while_running() {
        let fixture = fixture();
        let controller = &fixture.controller;

        controller.set_running_async(true);
        assert!(!controller.is_running_async());

        controller.to_running();
        controller.set_running_async(true);
        assert!(controller.is_running_async());

        controller.to_finishing();
        assert!(!controller.is_running_async());
    }

    #[test]
    fn test_session_accumulators_surface_in_snapshot() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.set_catalog("hive");
        controller.set_schema("analytics");
        controller.add_set_session_property("join_distribution_type", "BROADCAST");
        controller.add_reset_session_property("task_concurrency");
        controller.add_set_role("hive", SelectedRole::Role("admin".into()));
        controller.add_prepared_statement("q", "SELECT 1");
        controller.set_update_type("INSERT");
        controller.set_inputs(vec![QueryInput {
            catalog: "hive".into(),
            schema: "analytics".into(),
            table: "orders".into(),
        }]);

        let snapshot = controller.full_snapshot(None);
        assert_eq!(snapshot.set_catalog.as_deref(), Some("hive"));
        assert_eq!(snapshot.set_schema.as_deref(), Some("analytics"));
        assert_eq!(
            snapshot.set_session_properties.get("join_distribution_type"),
            Some(&"BROADCAST".to_string())
        );
        assert!(snapshot.reset_session_properties.contains("task_concurrency"));
        assert_eq!(
            snapshot.set_roles.get("hive"),
            Some(&SelectedRole::Role("admin".into()))
        );
        assert_eq!(snapshot.update_type.as_deref(), Some("INSERT"));
        assert_eq!(snapshot.inputs.len(), 1);
    }

    #[test]
    fn test_basic_snapshot_samples_state_and_error() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();
        controller.to_failed(QueryFailure::new(FailureKind::External, "exceeded limit"));

        let snapshot = controller.basic_snapshot(None);
        assert_eq!(snapshot.state, QueryState::Failed);
        assert_eq!(snapshot.error_kind, Some(FailureKind::External));
        assert!(!snapshot.scheduled);
    }

    #[test]
    fn test_update_snapshot_retains_final_snapshot_once() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();
        controller.to_finishing();

        let first = controller.update_snapshot(Some(finished_stage()), None);
        assert!(first.is_final());
        assert!(Arc::ptr_eq(
            &controller.final_snapshot().unwrap(),
            &first
        ));

        // A later final snapshot does not displace the retained one.
        let second = controller.update_snapshot(Some(finished_stage()), None);
        assert!(second.is_final());
        assert!(Arc::ptr_eq(&controller.final_snapshot().unwrap(), &first));
    }

    #[test]
    fn test_final_snapshot_listener_fires_exactly_once() {
        let fixture = fixture();
        let controller = &fixture.controller;
        let deliveries = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let deliveries_clone = Arc::clone(&deliveries);
        controller.add_final_snapshot_listener(move |_| {
            deliveries_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(deliveries.load(Ordering::SeqCst), 0);

        controller.to_running();
        controller.to_finishing();
        controller.update_snapshot(Some(finished_stage()), None);
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);

        // Pruning republishes the cell but the wrapper already fired.
        controller.prune_final_snapshot();
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prune_replaces_retained_snapshot_preserving_scalars() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.to_running();
        controller.to_finishing();
        controller.update_snapshot(Some(finished_stage()), None);

        let before = controller.final_snapshot().unwrap();
        controller.prune_final_snapshot();
        let after = controller.final_snapshot().unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        let stage = after.output_stage.as_ref().unwrap();
        assert!(stage.plan.is_none());
        assert!(stage.tasks.is_empty());
        assert_eq!(after.stats.total_tasks, before.stats.total_tasks);
        assert_eq!(after.stats.raw_input_bytes, before.stats.raw_input_bytes);
        assert_eq!(after.stats.elapsed_time, before.stats.elapsed_time);
    }

    #[test]
    fn test_update_snapshot_enters_recovery_when_stages_stopped() {
        let session = Session::new(QueryId::new("q1"), "alice").with_recovery_enabled(true);
        let fixture = fixture_with(session, false);
        let controller = &fixture.controller;
        controller.to_running();

        let recovery = StaticRecovery::new();
        recovery.set_state(RecoveryState::StoppingForReschedule);

        let mut stage = finished_stage();
        stage.complete_info = false; // still mid-flight, not a final snapshot
        controller.update_snapshot(Some(stage), Some(&recovery));

        assert_eq!(controller.state(), QueryState::Recovering);
        assert_eq!(recovery.reschedules(), 1);
    }

    #[test]
    fn test_reschedule_failure_fails_query() {
        let session = Session::new(QueryId::new("q1"), "alice").with_recovery_enabled(true);
        let fixture = fixture_with(session, false);
        let controller = &fixture.controller;
        controller.to_running();

        let recovery = StaticRecovery::new();
        recovery.set_state(RecoveryState::StoppingForReschedule);
        recovery.fail_reschedule("no healthy workers");

        let mut stage = finished_stage();
        stage.complete_info = false;
        controller.update_snapshot(Some(stage), Some(&recovery));

        assert_eq!(controller.state(), QueryState::Failed);
        assert_eq!(
            controller.failure_info().unwrap().kind(),
            FailureKind::Reschedule
        );
    }

    #[test]
    fn test_update_snapshot_ignores_recovery_when_stages_running() {
        let session = Session::new(QueryId::new("q1"), "alice").with_recovery_enabled(true);
        let fixture = fixture_with(session, false);
        let controller = &fixture.controller;
        controller.to_running();

        let recovery = StaticRecovery::new();
        recovery.set_state(RecoveryState::StoppingForReschedule);

        let mut stage = finished_stage();
        stage.state = StageState::Running;
        stage.complete_info = false;
        controller.update_snapshot(Some(stage), Some(&recovery));

        assert_eq!(controller.state(), QueryState::Running);
        assert_eq!(recovery.reschedules(), 0);
    }

    #[test]
    fn test_memory_usage_flows_into_snapshots() {
        let fixture = fixture();
        let controller = &fixture.controller;
        controller.update_memory_usage(2048, 0, 2048, 512, 0, 512);
        controller.update_memory_usage(-1024, 0, -1024, 256, 0, 256);

        let usage = controller.memory_usage();
        assert_eq!(usage.current_user, 1024);
        assert_eq!(usage.peak_user, 2048);

        let snapshot = controller.full_snapshot(None);
        assert_eq!(snapshot.stats.peak_user_memory, 2048);
        assert_eq!(snapshot.stats.peak_task_user_memory, 512);
    }
}
