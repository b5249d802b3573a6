//! Wall-clock and monotonic timing for query lifecycle phases.
//!
//! [`QueryPhaseTimer`] records when each lifecycle phase begins and derives
//! elapsed durations by differencing monotonic readings, so reported times
//! are immune to wall-clock adjustment. Wall-clock timestamps are kept only
//! where they are user-facing: creation, execution start, end of query, and
//! the heartbeat.
//!
//! Phase-begin operations overwrite on repeat: the last write wins. The end
//! of the query is a single monotonic stamp.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Records phase-begin instants and derived durations for one query.
pub struct QueryPhaseTimer {
    create_time: DateTime<Utc>,
    create_instant: Instant,
    phases: Mutex<PhaseInstants>,
    last_heartbeat: Mutex<DateTime<Utc>>,
}

#[derive(Default)]
struct PhaseInstants {
    queued: Option<Duration>,
    waiting_for_resources_start: Option<Instant>,
    waiting_for_resources: Option<Duration>,
    dispatching_start: Option<Instant>,
    dispatching: Option<Duration>,
    planning_start: Option<Instant>,
    planning: Option<Duration>,
    analysis_start: Option<Instant>,
    analysis: Option<Duration>,
    execution_start_time: Option<DateTime<Utc>>,
    execution_start: Option<Instant>,
    finishing_start: Option<Instant>,
    end_time: Option<DateTime<Utc>>,
    end_instant: Option<Instant>,
}

impl QueryPhaseTimer {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            create_time: now,
            create_instant: Instant::now(),
            phases: Mutex::new(PhaseInstants::default()),
            last_heartbeat: Mutex::new(now),
        }
    }

    /// Marks the end of the queued phase.
    pub fn begin_waiting_for_resources(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        phases.queued = Some(now - self.create_instant);
        phases.waiting_for_resources_start = Some(now);
    }

    pub fn begin_dispatching(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        phases.waiting_for_resources = elapsed_since(phases.waiting_for_resources_start, now);
        phases.dispatching_start = Some(now);
    }

    pub fn begin_planning(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        phases.dispatching = elapsed_since(phases.dispatching_start, now);
        phases.planning_start = Some(now);
    }

    /// Marks the end of planning; execution is timed from here on.
    pub fn begin_starting(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        phases.planning = elapsed_since(phases.planning_start, now);
    }

    pub fn begin_running(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        phases.execution_start_time = Some(Utc::now());
        phases.execution_start = Some(now);
    }

    pub fn begin_finishing(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        phases.finishing_start = Some(now);
    }

    /// Stamps the end of the query. The first stamp wins; the failure and
    /// finishing paths may both reach this.
    pub fn end_query(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        if phases.end_instant.is_none() {
            phases.end_instant = Some(now);
            phases.end_time = Some(Utc::now());
        }
    }

    pub fn begin_analysis(&self) {
        let now = Instant::now();
        self.lock_phases().analysis_start = Some(now);
    }

    pub fn end_analysis(&self) {
        let now = Instant::now();
        let mut phases = self.lock_phases();
        phases.analysis = elapsed_since(phases.analysis_start, now);
    }

    /// Refreshes the heartbeat to the current wall-clock time.
    pub fn record_heartbeat(&self) {
        let mut heartbeat = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *heartbeat = Utc::now();
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn execution_start_time(&self) -> Option<DateTime<Utc>> {
        self.lock_phases().execution_start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.lock_phases().end_time
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time from creation to the end of the query, or to now while running.
    pub fn elapsed_time(&self) -> Duration {
        let phases = self.lock_phases();
        match phases.end_instant {
            Some(end) => end - self.create_instant,
            None => self.create_instant.elapsed(),
        }
    }

    pub fn queued_time(&self) -> Duration {
        self.lock_phases().queued.unwrap_or_default()
    }

    pub fn resource_waiting_time(&self) -> Duration {
        let phases = self.lock_phases();
        finished_or_running(
            phases.waiting_for_resources,
            phases.waiting_for_resources_start,
            phases.end_instant,
        )
    }

    pub fn dispatching_time(&self) -> Duration {
        let phases = self.lock_phases();
        finished_or_running(
            phases.dispatching,
            phases.dispatching_start,
            phases.end_instant,
        )
    }

    pub fn planning_time(&self) -> Duration {
        let phases = self.lock_phases();
        finished_or_running(phases.planning, phases.planning_start, phases.end_instant)
    }

    pub fn analysis_time(&self) -> Duration {
        let phases = self.lock_phases();
        finished_or_running(phases.analysis, phases.analysis_start, phases.end_instant)
    }

    /// Time spent executing, from the transition to RUNNING until the end of
    /// the query (or now while still running).
    pub fn execution_time(&self) -> Duration {
        let phases = self.lock_phases();
        finished_or_running(None, phases.execution_start, phases.end_instant)
    }

    pub fn finishing_time(&self) -> Duration {
        let phases = self.lock_phases();
        finished_or_running(None, phases.finishing_start, phases.end_instant)
    }

    fn lock_phases(&self) -> MutexGuard<'_, PhaseInstants> {
        self.phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for QueryPhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_since(start: Option<Instant>, now: Instant) -> Option<Duration> {
    start.map(|start| now - start)
}

/// Resolves a phase duration: a recorded value wins, otherwise the phase is
/// measured from its start to the end of the query or to now.
fn finished_or_running(
    recorded: Option<Duration>,
    start: Option<Instant>,
    end: Option<Instant>,
) -> Duration {
    if let Some(duration) = recorded {
        return duration;
    }
    match start {
        Some(start) => end.unwrap_or_else(Instant::now) - start,
        None => Duration::ZERO,
    }
}
