//! Stage telemetry supplied by the distributed scheduler.
//!
//! The controller does not compute stage statistics; it receives a tree of
//! [`StageInfo`] (or a pre-aggregated [`BasicStageStats`] roll-up) from the
//! poller and folds it into query snapshots. Everything here is plain data.

use crate::error::QueryFailure;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Identifier of a stage within a query's distributed plan.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task within a stage.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TaskId {
    pub stage: u32,
    pub task: u32,
}

impl TaskId {
    pub fn new(stage: u32, task: u32) -> Self {
        Self { stage, task }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.task)
    }
}

/// Where a task exposes its output exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskLocation {
    /// Base URI of the task's exchange endpoint.
    pub uri: String,
    /// Instance id distinguishing restarts of the same task.
    pub instance_id: String,
}

impl TaskLocation {
    pub fn new(uri: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            instance_id: instance_id.into(),
        }
    }
}

/// Execution state of a stage, as reported by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StageState {
    Planned,
    Scheduling,
    Scheduled,
    Running,
    /// The stage is being torn down for a recovery reschedule.
    Recovering,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl StageState {
    /// Terminal stage states.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Aborted | Self::Failed
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Planned => "Planned",
            Self::Scheduling => "Scheduling",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Recovering => "Recovering",
            Self::Finished => "Finished",
            Self::Canceled => "Canceled",
            Self::Aborted => "Aborted",
            Self::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Why a stage reports itself fully blocked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum BlockedReason {
    WaitingForMemory,
}

/// Garbage-collection telemetry reported by a stage's worker runtimes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageGcStatistics {
    pub stage_id: u32,
    pub tasks: u32,
    pub full_gc_tasks: u32,
    pub total_full_gc: Duration,
    pub max_full_gc: Duration,
}

/// Per-operator roll-up carried in stage statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperatorSummary {
    pub operator_type: String,
    pub input_rows: u64,
    pub input_bytes: u64,
    pub output_rows: u64,
    pub output_bytes: u64,
    pub blocked: Duration,
}

/// Counters reported for a single stage.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StageStats {
    pub total_tasks: u32,
    pub running_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,

    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub blocked_drivers: u64,
    pub completed_drivers: u64,

    pub user_memory_reservation: u64,
    pub revocable_memory_reservation: u64,
    pub total_memory_reservation: u64,
    /// Integral of user memory over time, in byte-seconds.
    pub cumulative_user_memory: f64,

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

    pub gc_info: StageGcStatistics,
    pub operator_summaries: Vec<OperatorSummary>,
}

/// Kinds of partitioned source a plan fragment can read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    /// A connector table scan.
    TableScan,
    /// A remote exchange fed by downstream stages.
    Exchange,
    /// An inline constant relation.
    Values,
}

/// The part of a stage's plan the controller cares about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlanFragment {
    pub fragment_id: u32,
    pub partitioned_sources: Vec<SourceKind>,
}

impl PlanFragment {
    /// True when the fragment reads at least one table scan directly.
    /// Raw-input counters only count for such fragments; exchange-fed
    /// stages would double-count bytes already attributed downstream.
    pub fn has_table_scan_source(&self) -> bool {
        self.partitioned_sources
            .iter()
            .any(|source| *source == SourceKind::TableScan)
    }
}

/// One node in the stage tree supplied to snapshot assembly.
#[derive(Clone, Debug, Serialize)]
pub struct StageInfo {
    pub stage_id: StageId,
    pub state: StageState,
    pub plan: Option<PlanFragment>,
    pub stats: StageStats,
    pub tasks: Vec<TaskId>,
    pub sub_stages: Vec<StageInfo>,
    /// True once the stage has collected final info from all its tasks.
    pub complete_info: bool,
    pub failure: Option<QueryFailure>,
}

impl StageInfo {
    /// Flattens this stage and all descendants, parents first.
    pub fn all_stages(&self) -> Vec<&StageInfo> {
        let mut stages = vec![self];
        let mut index = 0;
        while index < stages.len() {
            let stage = stages[index];
            stages.extend(stage.sub_stages.iter());
            index += 1;
        }
        stages
    }
}

/// Flattens an optional stage tree, parents first.
pub fn all_stages(root: Option<&StageInfo>) -> Vec<&StageInfo> {
    root.map(StageInfo::all_stages).unwrap_or_default()
}

/// Pre-aggregated roll-up used for the lightweight snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BasicStageStats {
    pub is_scheduled: bool,

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

    pub total_cpu_time: Duration,
    pub total_scheduled_time: Duration,

    pub fully_blocked: bool,
    pub blocked_reasons: BTreeSet<BlockedReason>,

    /// Completed fraction of total drivers, when known.
    pub progress_percentage: Option<f64>,
}

impl BasicStageStats {
    /// The roll-up used before any stage exists.
    pub fn empty() -> Self {
        Self::default()
    }
}
