//! Point-in-time query snapshots and their assembly.
//!
//! Two granularities exist, mirroring what pollers need:
//!
//! - [`BasicQuerySnapshot`]: cheap, composed from a pre-aggregated
//!   [`BasicStageStats`] roll-up; used by list endpoints and heartbeats.
//! - [`QuerySnapshot`]: the complete view, composed by walking the supplied
//!   stage tree and summing per-stage counters.
//!
//! A snapshot that reports itself final is written once into the
//! controller's one-shot cell; afterwards only a pruned variant (structural
//! shrinkage, identical scalar telemetry) may replace it.

use crate::controller::collaborators::{MemoryPoolId, ResourceGroupId, Warning};
use crate::controller::memory::MemoryTracker;
use crate::controller::query_state::QueryState;
use crate::error::{FailureKind, QueryFailure};
use crate::session::{QueryInput, QueryOutput, SelectedRole, Session};
use crate::stage::{
    all_stages, BasicStageStats, BlockedReason, OperatorSummary, StageGcStatistics, StageInfo,
    StageState,
};
use crate::timing::QueryPhaseTimer;
use crate::transaction::TransactionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Lightweight statistics for the basic snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct BasicQueryStats {
    pub create_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub queued_time: Duration,
    pub elapsed_time: Duration,
    pub execution_time: Duration,

    pub failed_tasks: u32,
    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub completed_drivers: u64,

    pub raw_input_bytes: u64,
    pub raw_input_rows: u64,

    pub cumulative_user_memory: f64,
    pub user_memory_reservation: u64,
    pub total_memory_reservation: u64,
    pub peak_user_memory: i64,
    pub peak_total_memory: i64,

    pub total_cpu_time: Duration,
    pub total_scheduled_time: Duration,

    pub fully_blocked: bool,
    pub blocked_reasons: BTreeSet<BlockedReason>,
    pub progress_percentage: Option<f64>,
}

/// Lightweight point-in-time view of a query.
#[derive(Clone, Debug, Serialize)]
pub struct BasicQuerySnapshot {
    pub query_id: crate::session::QueryId,
    pub session: Session,
    pub resource_group: ResourceGroupId,
    pub state: QueryState,
    pub memory_pool: MemoryPoolId,
    pub scheduled: bool,
    pub self_uri: String,
    pub query: String,
    pub prepared_query: Option<String>,
    pub stats: BasicQueryStats,
    pub error_kind: Option<FailureKind>,
    pub recovery_enabled: bool,
}

/// Aggregated statistics for the full snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct QueryStats {
    pub create_time: DateTime<Utc>,
    pub execution_start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    pub elapsed_time: Duration,
    pub queued_time: Duration,
    pub resource_waiting_time: Duration,
    pub dispatching_time: Duration,
    pub planning_time: Duration,
    pub analysis_time: Duration,
    pub execution_time: Duration,
    pub finishing_time: Duration,

    pub total_tasks: u32,
    pub running_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,

    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub blocked_drivers: u64,
    pub completed_drivers: u64,

    pub cumulative_user_memory: f64,
    pub user_memory_reservation: u64,
    pub revocable_memory_reservation: u64,
    pub total_memory_reservation: u64,
    pub peak_user_memory: i64,
    pub peak_revocable_memory: i64,
    pub peak_total_memory: i64,
    pub peak_task_user_memory: i64,
    pub peak_task_revocable_memory: i64,
    pub peak_task_total_memory: i64,

    pub scheduled: bool,
    pub total_scheduled_time: Duration,
    pub total_cpu_time: Duration,
    pub total_blocked_time: Duration,
    pub fully_blocked: bool,
    pub blocked_reasons: BTreeSet<BlockedReason>,

    pub raw_input_bytes: u64,
    pub raw_input_rows: u64,
    pub processed_input_bytes: u64,
    pub processed_input_rows: u64,
    pub output_bytes: u64,
    pub output_rows: u64,
    pub physical_written_bytes: u64,

    pub stage_gc_statistics: Vec<StageGcStatistics>,
    pub operator_summaries: Vec<OperatorSummary>,
}

impl QueryStats {
    /// Walks the stage tree and sums per-stage counters into query totals.
    ///
    /// Raw- and processed-input counters only accumulate for stages whose
    /// plan reads a table scan directly; exchange-fed stages would
    /// double-count data already attributed to the stage that scanned it.
    /// Output counters come from the root stage alone.
    pub(crate) fn aggregate(
        root_stage: Option<&StageInfo>,
        timer: &QueryPhaseTimer,
        memory: &MemoryTracker,
    ) -> QueryStats {
        let stages = all_stages(root_stage);

        let mut stats = QueryStats {
            create_time: timer.create_time(),
            execution_start_time: timer.execution_start_time(),
            last_heartbeat: timer.last_heartbeat(),
            end_time: timer.end_time(),

            elapsed_time: timer.elapsed_time(),
            queued_time: timer.queued_time(),
            resource_waiting_time: timer.resource_waiting_time(),
            dispatching_time: timer.dispatching_time(),
            planning_time: timer.planning_time(),
            analysis_time: timer.analysis_time(),
            execution_time: timer.execution_time(),
            finishing_time: timer.finishing_time(),

            total_tasks: 0,
            running_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,

            total_drivers: 0,
            queued_drivers: 0,
            running_drivers: 0,
            blocked_drivers: 0,
            completed_drivers: 0,

            cumulative_user_memory: 0.0,
            user_memory_reservation: 0,
            revocable_memory_reservation: 0,
            total_memory_reservation: 0,
            peak_user_memory: memory.peak_user(),
            peak_revocable_memory: memory.peak_revocable(),
            peak_total_memory: memory.peak_total(),
            peak_task_user_memory: memory.peak_task_user(),
            peak_task_revocable_memory: memory.peak_task_revocable(),
            peak_task_total_memory: memory.peak_task_total(),

            scheduled: is_scheduled(root_stage),
            total_scheduled_time: Duration::ZERO,
            total_cpu_time: Duration::ZERO,
            total_blocked_time: Duration::ZERO,
            fully_blocked: root_stage.is_some(),
            blocked_reasons: BTreeSet::new(),

            raw_input_bytes: 0,
            raw_input_rows: 0,
            processed_input_bytes: 0,
            processed_input_rows: 0,
            output_bytes: 0,
            output_rows: 0,
            physical_written_bytes: 0,

            stage_gc_statistics: Vec::new(),
            operator_summaries: Vec::new(),
        };

        for stage in &stages {
            let stage_stats = &stage.stats;
            stats.total_tasks += stage_stats.total_tasks;
            stats.running_tasks += stage_stats.running_tasks;
            stats.completed_tasks += stage_stats.completed_tasks;
            stats.failed_tasks += stage_stats.failed_tasks;

            stats.total_drivers += stage_stats.total_drivers;
            stats.queued_drivers += stage_stats.queued_drivers;
            stats.running_drivers += stage_stats.running_drivers;
            stats.blocked_drivers += stage_stats.blocked_drivers;
            stats.completed_drivers += stage_stats.completed_drivers;

            stats.cumulative_user_memory += stage_stats.cumulative_user_memory;
            stats.user_memory_reservation += stage_stats.user_memory_reservation;
            stats.revocable_memory_reservation += stage_stats.revocable_memory_reservation;
            stats.total_memory_reservation += stage_stats.total_memory_reservation;

            stats.total_scheduled_time += stage_stats.total_scheduled_time;
            stats.total_cpu_time += stage_stats.total_cpu_time;
            stats.total_blocked_time += stage_stats.total_blocked_time;

            if !stage.state.is_done() {
                stats.fully_blocked &= stage_stats.fully_blocked;
                stats
                    .blocked_reasons
                    .extend(stage_stats.blocked_reasons.iter().copied());
            }

            if stage
                .plan
                .as_ref()
                .is_some_and(|plan| plan.has_table_scan_source())
            {
                stats.raw_input_bytes += stage_stats.raw_input_bytes;
                stats.raw_input_rows += stage_stats.raw_input_rows;
                stats.processed_input_bytes += stage_stats.processed_input_bytes;
                stats.processed_input_rows += stage_stats.processed_input_rows;
            }

            stats.physical_written_bytes += stage_stats.physical_written_bytes;

            stats.stage_gc_statistics.push(stage_stats.gc_info.clone());
            stats
                .operator_summaries
                .extend(stage_stats.operator_summaries.iter().cloned());
        }

        if let Some(root) = root_stage {
            stats.output_bytes = root.stats.output_bytes;
            stats.output_rows = root.stats.output_rows;
        }

        stats
    }

    /// Structural shrinkage for the pruned final snapshot: scalar counters
    /// and timings are untouched, the operator-summary list is dropped.
    fn pruned(&self) -> QueryStats {
        let mut stats = self.clone();
        stats.operator_summaries = Vec::new();
        stats
    }
}

/// Complete point-in-time view of a query.
#[derive(Clone, Debug, Serialize)]
pub struct QuerySnapshot {
    pub query_id: crate::session::QueryId,
    pub session: Session,
    pub state: QueryState,
    pub memory_pool: MemoryPoolId,
    pub scheduled: bool,
    pub self_uri: String,
    pub column_names: Vec<String>,
    pub query: String,
    pub prepared_query: Option<String>,
    pub stats: QueryStats,

    pub set_catalog: Option<String>,
    pub set_schema: Option<String>,
    pub set_path: Option<String>,
    pub set_session_properties: HashMap<String, String>,
    pub reset_session_properties: BTreeSet<String>,
    pub set_roles: HashMap<String, SelectedRole>,
    pub added_prepared_statements: HashMap<String, String>,
    pub deallocated_prepared_statements: BTreeSet<String>,

    pub started_transaction_id: Option<TransactionId>,
    pub clear_transaction_id: bool,
    pub update_type: Option<String>,

    pub output_stage: Option<StageInfo>,
    pub failure: Option<QueryFailure>,
    pub warnings: Vec<Warning>,
    pub inputs: HashSet<QueryInput>,
    pub output: Option<QueryOutput>,

    pub complete_info: bool,
    pub resource_group: ResourceGroupId,
    pub running_async: bool,
    pub recovery_enabled: bool,
}

impl QuerySnapshot {
    /// A snapshot is final once the query is terminal and every stage has
    /// collected its complete info. Final snapshots are the ones retained.
    pub fn is_final(&self) -> bool {
        self.state.is_terminal() && self.complete_info
    }

    /// True when every stage in the tree is done (vacuously true for an
    /// empty tree).
    pub fn all_stages_done(&self) -> bool {
        all_stages(self.output_stage.as_ref())
            .iter()
            .all(|stage| stage.state.is_done())
    }

    /// Approximate heap footprint of this snapshot, in bytes.
    ///
    /// Recomputed on every call; retained snapshots are polled with this to
    /// decide when pruning is worth it.
    pub fn retained_size_bytes(&self) -> usize {
        let stage_bytes: usize = all_stages(self.output_stage.as_ref())
            .iter()
            .map(|stage| {
                std::mem::size_of::<StageInfo>()
                    + stage.tasks.len() * std::mem::size_of::<crate::stage::TaskId>()
                    + stage.stats.operator_summaries.len()
                        * std::mem::size_of::<OperatorSummary>()
            })
            .sum();
        let string_bytes = self.query.len()
            + self.self_uri.len()
            + self.column_names.iter().map(String::len).sum::<usize>()
            + self.prepared_query.as_ref().map_or(0, String::len);
        std::mem::size_of::<Self>()
            + string_bytes
            + stage_bytes
            + self.stats.operator_summaries.len() * std::mem::size_of::<OperatorSummary>()
    }

    /// Builds the structurally-shrunken variant retained after pruning:
    /// plan fragments, task lists, sub-stage lists, and operator summaries
    /// are dropped; every scalar counter and timing survives unchanged.
    pub fn pruned(&self) -> QuerySnapshot {
        let mut snapshot = self.clone();
        snapshot.stats = self.stats.pruned();
        snapshot.output_stage = self.output_stage.as_ref().map(|stage| {
            let mut pruned = stage.clone();
            pruned.plan = None;
            pruned.tasks = Vec::new();
            pruned.sub_stages = Vec::new();
            pruned.stats.operator_summaries = Vec::new();
            pruned
        });
        snapshot.running_async = false;
        snapshot
    }
}

/// A query counts as scheduled once a root stage exists and every stage is
/// either running or done; a stage stopping for recovery is neither.
pub(crate) fn is_scheduled(root_stage: Option<&StageInfo>) -> bool {
    if root_stage.is_none() {
        return false;
    }
    all_stages(root_stage).iter().all(|stage| {
        stage.state == StageState::Running
            || (stage.state.is_done() && stage.state != StageState::Recovering)
    })
}

/// Composes the lightweight snapshot from a pre-aggregated roll-up.
#[allow(clippy::too_many_arguments)]
pub(crate) fn basic_snapshot(
    query_id: crate::session::QueryId,
    session: Session,
    resource_group: ResourceGroupId,
    state: QueryState,
    memory_pool: MemoryPoolId,
    self_uri: String,
    query: String,
    prepared_query: Option<String>,
    stage_stats: BasicStageStats,
    error_kind: Option<FailureKind>,
    timer: &QueryPhaseTimer,
    memory: &MemoryTracker,
    recovery_enabled: bool,
) -> BasicQuerySnapshot {
    let stats = BasicQueryStats {
        create_time: timer.create_time(),
        end_time: timer.end_time(),
        queued_time: timer.queued_time(),
        elapsed_time: timer.elapsed_time(),
        execution_time: timer.execution_time(),

        failed_tasks: stage_stats.failed_tasks,
        total_drivers: stage_stats.total_drivers,
        queued_drivers: stage_stats.queued_drivers,
        running_drivers: stage_stats.running_drivers,
        completed_drivers: stage_stats.completed_drivers,

        raw_input_bytes: stage_stats.raw_input_bytes,
        raw_input_rows: stage_stats.raw_input_rows,

        cumulative_user_memory: stage_stats.cumulative_user_memory,
        user_memory_reservation: stage_stats.user_memory_reservation,
        total_memory_reservation: stage_stats.total_memory_reservation,
        peak_user_memory: memory.peak_user(),
        peak_total_memory: memory.peak_total(),

        total_cpu_time: stage_stats.total_cpu_time,
        total_scheduled_time: stage_stats.total_scheduled_time,

        fully_blocked: stage_stats.fully_blocked,
        blocked_reasons: stage_stats.blocked_reasons.clone(),
        progress_percentage: stage_stats.progress_percentage,
    };

    BasicQuerySnapshot {
        query_id,
        session,
        resource_group,
        state,
        memory_pool,
        scheduled: stage_stats.is_scheduled,
        self_uri,
        query,
        prepared_query,
        stats,
        error_kind,
        recovery_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{PlanFragment, SourceKind, StageId, StageStats, TaskId};

    fn stage(id: u32, state: StageState) -> StageInfo {
        StageInfo {
            stage_id: StageId(id),
            state,
            plan: None,
            stats: StageStats::default(),
            tasks: Vec::new(),
            sub_stages: Vec::new(),
            complete_info: true,
            failure: None,
        }
    }

    fn timer() -> QueryPhaseTimer {
        QueryPhaseTimer::new()
    }

    #[test]
    fn test_aggregate_sums_task_and_driver_counts() {
        let mut root = stage(0, StageState::Running);
        root.stats.total_tasks = 2;
        root.stats.total_drivers = 10;
        let mut child = stage(1, StageState::Running);
        child.stats.total_tasks = 3;
        child.stats.total_drivers = 7;
        root.sub_stages.push(child);

        let stats = QueryStats::aggregate(Some(&root), &timer(), &MemoryTracker::new());
        assert_eq!(stats.total_tasks, 5);
        assert_eq!(stats.total_drivers, 17);
    }

    #[test]
    fn test_raw_input_counted_only_for_table_scan_stages() {
        let mut root = stage(0, StageState::Running);
        root.plan = Some(PlanFragment {
            fragment_id: 0,
            partitioned_sources: vec![SourceKind::Exchange],
        });
        root.stats.raw_input_bytes = 100;
        root.stats.raw_input_rows = 1;

        let mut scan = stage(1, StageState::Running);
        scan.plan = Some(PlanFragment {
            fragment_id: 1,
            partitioned_sources: vec![SourceKind::TableScan],
        });
        scan.stats.raw_input_bytes = 500;
        scan.stats.raw_input_rows = 5;
        root.sub_stages.push(scan);

        let stats = QueryStats::aggregate(Some(&root), &timer(), &MemoryTracker::new());
        assert_eq!(stats.raw_input_bytes, 500);
        assert_eq!(stats.raw_input_rows, 5);
    }

    #[test]
    fn test_output_counters_come_from_root_only() {
        let mut root = stage(0, StageState::Running);
        root.stats.output_bytes = 11;
        root.stats.output_rows = 2;
        let mut child = stage(1, StageState::Running);
        child.stats.output_bytes = 99;
        child.stats.output_rows = 9;
        root.sub_stages.push(child);

        let stats = QueryStats::aggregate(Some(&root), &timer(), &MemoryTracker::new());
        assert_eq!(stats.output_bytes, 11);
        assert_eq!(stats.output_rows, 2);
    }

    #[test]
    fn test_fully_blocked_is_conjunction_over_non_done_stages() {
        let mut root = stage(0, StageState::Running);
        root.stats.fully_blocked = true;
        let mut done_child = stage(1, StageState::Finished);
        done_child.stats.fully_blocked = false; // done stages are ignored
        root.sub_stages.push(done_child);

        let stats = QueryStats::aggregate(Some(&root), &timer(), &MemoryTracker::new());
        assert!(stats.fully_blocked);

        let mut unblocked_child = stage(2, StageState::Running);
        unblocked_child.stats.fully_blocked = false;
        root.sub_stages.push(unblocked_child);

        let stats = QueryStats::aggregate(Some(&root), &timer(), &MemoryTracker::new());
        assert!(!stats.fully_blocked);
    }

    #[test]
    fn test_no_root_stage_is_not_fully_blocked_and_not_scheduled() {
        let stats = QueryStats::aggregate(None, &timer(), &MemoryTracker::new());
        assert!(!stats.fully_blocked);
        assert!(!stats.scheduled);
    }

    #[test]
    fn test_scheduled_requires_running_or_done_stages() {
        let mut root = stage(0, StageState::Running);
        root.sub_stages.push(stage(1, StageState::Finished));
        assert!(is_scheduled(Some(&root)));

        root.sub_stages.push(stage(2, StageState::Scheduling));
        assert!(!is_scheduled(Some(&root)));
    }

    #[test]
    fn test_recovering_stage_is_not_scheduled() {
        let mut root = stage(0, StageState::Running);
        root.sub_stages.push(stage(1, StageState::Recovering));
        assert!(!is_scheduled(Some(&root)));
    }

    fn snapshot_with_stage(stage_info: StageInfo) -> QuerySnapshot {
        let timer = timer();
        let memory = MemoryTracker::new();
        QuerySnapshot {
            query_id: crate::session::QueryId::new("q"),
            session: Session::new(crate::session::QueryId::new("q"), "alice"),
            state: QueryState::Finished,
            memory_pool: MemoryPoolId::general(),
            scheduled: true,
            self_uri: "http://coordinator/v1/query/q".into(),
            column_names: vec!["id".into()],
            query: "SELECT 1".into(),
            prepared_query: None,
            stats: QueryStats::aggregate(Some(&stage_info), &timer, &memory),
            set_catalog: None,
            set_schema: None,
            set_path: None,
            set_session_properties: HashMap::new(),
            reset_session_properties: BTreeSet::new(),
            set_roles: HashMap::new(),
            added_prepared_statements: HashMap::new(),
            deallocated_prepared_statements: BTreeSet::new(),
            started_transaction_id: None,
            clear_transaction_id: false,
            update_type: None,
            output_stage: Some(stage_info),
            failure: None,
            warnings: Vec::new(),
            inputs: HashSet::new(),
            output: None,
            complete_info: true,
            resource_group: ResourceGroupId::new("global"),
            running_async: true,
            recovery_enabled: false,
        }
    }

    #[test]
    fn test_pruned_drops_structure_keeps_scalars() {
        let mut root = stage(0, StageState::Finished);
        root.plan = Some(PlanFragment {
            fragment_id: 0,
            partitioned_sources: vec![SourceKind::TableScan],
        });
        root.tasks = vec![TaskId::new(0, 0)];
        root.sub_stages.push(stage(1, StageState::Finished));
        root.stats.total_tasks = 4;
        root.stats.operator_summaries = vec![OperatorSummary {
            operator_type: "TableScan".into(),
            input_rows: 1,
            input_bytes: 2,
            output_rows: 1,
            output_bytes: 2,
            blocked: Duration::ZERO,
        }];

        let snapshot = snapshot_with_stage(root);
        let pruned = snapshot.pruned();

        let stage = pruned.output_stage.as_ref().unwrap();
        assert!(stage.plan.is_none());
        assert!(stage.tasks.is_empty());
        assert!(stage.sub_stages.is_empty());
        assert!(stage.stats.operator_summaries.is_empty());
        assert!(pruned.stats.operator_summaries.is_empty());
        assert!(!pruned.running_async);

        // Scalar telemetry is untouched.
        assert_eq!(pruned.stats.total_tasks, snapshot.stats.total_tasks);
        assert_eq!(pruned.stats.elapsed_time, snapshot.stats.elapsed_time);
        assert_eq!(pruned.stats.peak_user_memory, snapshot.stats.peak_user_memory);
        assert_eq!(stage.stats.total_tasks, 4);
        assert!(pruned.retained_size_bytes() <= snapshot.retained_size_bytes());
    }

    #[test]
    fn test_is_final_requires_terminal_state_and_complete_info() {
        let mut snapshot = snapshot_with_stage(stage(0, StageState::Finished));
        assert!(snapshot.is_final());

        snapshot.state = QueryState::Running;
        assert!(!snapshot.is_final());

        snapshot.state = QueryState::Failed;
        snapshot.complete_info = false;
        assert!(!snapshot.is_final());
    }
}
