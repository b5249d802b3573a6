//! Incremental publication of query output metadata.
//!
//! As the terminal stage schedules its tasks, the exchange locations where
//! results can be fetched trickle in. [`QueryOutputPublisher`] maintains the
//! evolving output schema and location set and fans updates out to
//! subscribers, including subscribers that arrive after the information is
//! already complete. Per-task failure signals from the output stage flow
//! through the same object so result readers can react to a dead task.
//!
//! All state lives behind one monitor. Listener lists are copied under the
//! monitor and invoked through the notification executor outside it; the
//! monitor is never held across an executor call.

use crate::error::QueryFailure;
use crate::notify::NotificationExecutor;
use crate::stage::{TaskId, TaskLocation};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQL type of an output column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    Boolean,
    Integer,
    Bigint,
    Double,
    Varchar,
    Varbinary,
    Date,
    Timestamp,
}

/// Observer of output-info updates.
pub type OutputInfoListener = Arc<dyn Fn(QueryOutputInfo) + Send + Sync>;

/// Observer of output-stage task failures.
pub type TaskFailureListener = Arc<dyn Fn(TaskId, QueryFailure) + Send + Sync>;

/// Point-in-time view of the query's output metadata.
///
/// Published only once the schema is known; the location set may still be
/// growing while `no_more_locations` is false.
#[derive(Clone, Debug, Serialize)]
pub struct QueryOutputInfo {
    pub column_names: Vec<String>,
    pub column_types: Vec<ColumnType>,
    /// Exchange locations in arrival order.
    pub exchange_locations: Vec<(TaskId, TaskLocation)>,
    pub no_more_locations: bool,
}

#[derive(Default)]
struct OutputState {
    column_names: Option<Vec<String>>,
    column_types: Option<Vec<ColumnType>>,
    exchange_locations: Vec<(TaskId, TaskLocation)>,
    no_more_locations: bool,
    output_info_listeners: Vec<OutputInfoListener>,
    task_failures: Vec<(TaskId, QueryFailure)>,
    task_failure_listeners: Vec<TaskFailureListener>,
}

impl OutputState {
    fn output_info(&self) -> Option<QueryOutputInfo> {
        let column_names = self.column_names.as_ref()?;
        let column_types = self.column_types.as_ref()?;
        Some(QueryOutputInfo {
            column_names: column_names.clone(),
            column_types: column_types.clone(),
            exchange_locations: self.exchange_locations.clone(),
            no_more_locations: self.no_more_locations,
        })
    }

    fn upsert_location(&mut self, task_id: TaskId, location: TaskLocation) {
        match self
            .exchange_locations
            .iter_mut()
            .find(|(existing, _)| *existing == task_id)
        {
            Some((_, existing)) => *existing = location,
            None => self.exchange_locations.push((task_id, location)),
        }
    }

    fn knows_location(&self, task_id: TaskId, location: &TaskLocation) -> bool {
        self.exchange_locations
            .iter()
            .any(|(existing_id, existing)| *existing_id == task_id && existing == location)
    }
}

/// Publishes output schema, exchange locations, and output-task failures.
pub struct QueryOutputPublisher {
    executor: Arc<dyn NotificationExecutor>,
    state: Mutex<OutputState>,
}

impl QueryOutputPublisher {
    pub fn new(executor: Arc<dyn NotificationExecutor>) -> Self {
        Self {
            executor,
            state: Mutex::new(OutputState::default()),
        }
    }

    /// Registers an output-info observer.
    ///
    /// If output info is already publishable the observer is scheduled once
    /// with the current view before this call returns; either way it
    /// receives every subsequent publication.
    pub fn add_output_info_listener(&self, listener: impl Fn(QueryOutputInfo) + Send + Sync + 'static) {
        let listener: OutputInfoListener = Arc::new(listener);
        let current = {
            let mut state = self.lock_state();
            state.output_info_listeners.push(Arc::clone(&listener));
            state.output_info()
        };
        if let Some(info) = current {
            self.executor.execute(Box::pin(async move { listener(info) }));
        }
    }

    /// Registers an output-task-failure observer.
    ///
    /// Already-recorded failures are replayed to the observer once, then it
    /// receives future failures as they arrive.
    pub fn add_task_failure_listener(
        &self,
        listener: impl Fn(TaskId, QueryFailure) + Send + Sync + 'static,
    ) {
        let listener: TaskFailureListener = Arc::new(listener);
        let recorded = {
            let mut state = self.lock_state();
            state.task_failure_listeners.push(Arc::clone(&listener));
            state.task_failures.clone()
        };
        if !recorded.is_empty() {
            self.executor.execute(Box::pin(async move {
                for (task_id, failure) in recorded {
                    listener(task_id, failure);
                }
            }));
        }
    }

    /// Sets the output schema. May be called at most once.
    ///
    /// # Panics
    ///
    /// Panics if names and types disagree in arity, or if the schema was
    /// already set. Both are contract violations by the planner.
    pub fn set_columns(&self, column_names: Vec<String>, column_types: Vec<ColumnType>) {
        assert_eq!(
            column_names.len(),
            column_types.len(),
            "column names and types must be the same size"
        );

        let (info, listeners) = {
            let mut state = self.lock_state();
            assert!(
                state.column_names.is_none() && state.column_types.is_none(),
                "output columns already set"
            );
            state.column_names = Some(column_names);
            state.column_types = Some(column_types);
            (state.output_info(), state.output_info_listeners.clone())
        };
        self.publish(info, listeners);
    }

    /// Adds exchange locations; `no_more` latches sticky-true.
    ///
    /// # Panics
    ///
    /// Panics if locations are added after the latch is set, unless the
    /// delta is a subset of the already-known locations (an idempotent
    /// replay).
    pub fn update_output_locations(
        &self,
        new_locations: Vec<(TaskId, TaskLocation)>,
        no_more_locations: bool,
    ) {
        let (info, listeners) = {
            let mut state = self.lock_state();
            if state.no_more_locations {
                let all_known = new_locations
                    .iter()
                    .all(|(task_id, location)| state.knows_location(*task_id, location));
                assert!(all_known, "new locations added after no more locations set");
                return;
            }

            for (task_id, location) in new_locations {
                state.upsert_location(task_id, location);
            }
            state.no_more_locations = no_more_locations;
            (state.output_info(), state.output_info_listeners.clone())
        };
        self.publish(info, listeners);
    }

    /// Records a failure of an output-stage task and notifies observers.
    /// The first failure recorded for a task wins.
    pub fn record_task_failure(&self, task_id: TaskId, failure: QueryFailure) {
        let listeners = {
            let mut state = self.lock_state();
            if state.task_failures.iter().any(|(existing, _)| *existing == task_id) {
                return;
            }
            state.task_failures.push((task_id, failure.clone()));
            state.task_failure_listeners.clone()
        };
        for listener in listeners {
            let failure = failure.clone();
            self.executor
                .execute(Box::pin(async move { listener(task_id, failure) }));
        }
    }

    /// Clears locations and reopens the latch so a resumed query can
    /// re-announce its exchanges. Used on the RECOVERING -> STARTING edge.
    pub(crate) fn reset_for_resume(&self) {
        let mut state = self.lock_state();
        state.exchange_locations.clear();
        state.no_more_locations = false;
    }

    /// The current view, if the schema is known.
    pub fn current_output_info(&self) -> Option<QueryOutputInfo> {
        self.lock_state().output_info()
    }

    /// Output column names, empty until the schema is set.
    pub fn column_names(&self) -> Vec<String> {
        self.lock_state().column_names.clone().unwrap_or_default()
    }

    fn publish(&self, info: Option<QueryOutputInfo>, listeners: Vec<OutputInfoListener>) {
        let Some(info) = info else {
            return;
        };
        for listener in listeners {
            let info = info.clone();
            self.executor.execute(Box::pin(async move { listener(info) }));
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OutputState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
