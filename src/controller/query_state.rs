//! The query state enum and its phase ordering.

use serde::Serialize;
use std::fmt;

/// Lifecycle state of a query.
///
/// Variants are declared in phase order, so the derived `Ord` gives the
/// "has the query progressed past X" comparisons the transition predicates
/// rely on. `Finished` and `Failed` are terminal and absorb all further
/// transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QueryState {
    /// Accepted, waiting in the dispatch queue.
    Queued,
    /// Waiting for resource-group capacity.
    WaitingForResources,
    /// Being handed to a coordinator.
    Dispatching,
    /// Being analyzed and planned.
    Planning,
    /// Distributed scheduling is bringing up stages.
    Starting,
    /// Stages are executing.
    Running,
    /// Execution paused by the resource manager.
    Suspended,
    /// Being torn down for a recovery reschedule; re-enters via `Starting`.
    Recovering,
    /// Output is drained, transaction finalization in flight.
    Finishing,
    /// Completed successfully.
    Finished,
    /// Ended with a failure (including user cancellation).
    Failed,
}

impl QueryState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// The terminal set, for seeding the state machine.
    pub fn terminal_states() -> Vec<QueryState> {
        vec![Self::Finished, Self::Failed]
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "Queued",
            Self::WaitingForResources => "WaitingForResources",
            Self::Dispatching => "Dispatching",
            Self::Planning => "Planning",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Recovering => "Recovering",
            Self::Finishing => "Finishing",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}
