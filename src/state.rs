//! Generic terminal-absorbing state cell.
//!
//! [`StateMachine`] holds one value of an enumerated type together with a
//! declared set of *terminal* values. Once a terminal value is assigned the
//! cell absorbs every further write, no matter what predicate the writer
//! supplies. Every successful transition fans out to registered listeners on
//! the notification executor.
//!
//! # Listener contract
//!
//! Listeners are invoked asynchronously, one notification task per listener
//! per transition. Because delivery is asynchronous, notifications for two
//! concurrent transitions may be observed out of order; listeners must treat
//! the delivered value as a hint and re-read [`StateMachine::get`] when
//! ordering matters. A listener that panics poisons only its own
//! notification task, never the mutator.
//!
//! # Example
//!
//! ```ignore
//! use querygrid::state::StateMachine;
//!
//! let machine = StateMachine::new("door", executor, Door::Open, vec![Door::Welded]);
//! let closed = machine.set_if(Door::Closed, |current| *current == Door::Open);
//! assert!(closed);
//! ```

use crate::notify::NotificationExecutor;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::trace;

/// Observer of state transitions.
pub type StateChangeListener<S> = Arc<dyn Fn(S) + Send + Sync>;

/// Thread-safe cell over an enumerated state type with terminal absorption.
pub struct StateMachine<S> {
    name: String,
    executor: Arc<dyn NotificationExecutor>,
    terminal_states: Vec<S>,
    state: watch::Sender<S>,
    listeners: Mutex<Vec<StateChangeListener<S>>>,
}

impl<S> StateMachine<S>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Creates a state machine holding `initial`.
    ///
    /// `terminal_states` lists the absorbing values; it may be empty for a
    /// cell that never seals.
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn NotificationExecutor>,
        initial: S,
        terminal_states: Vec<S>,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            name: name.into(),
            executor,
            terminal_states,
            state,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current value.
    pub fn get(&self) -> S {
        self.state.borrow().clone()
    }

    /// Returns true if `state` belongs to the terminal set.
    pub fn is_terminal(&self, state: &S) -> bool {
        self.terminal_states.contains(state)
    }

    /// Conditionally transitions to `target`.
    ///
    /// Atomically: if the current value is non-terminal, differs from
    /// `target`, and `predicate(current)` holds, the cell is assigned
    /// `target` and all listeners are notified. Returns whether the
    /// transition fired. Terminal values absorb the write without consulting
    /// the predicate.
    pub fn set_if(&self, target: S, predicate: impl FnOnce(&S) -> bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if self.terminal_states.contains(current) {
                return false;
            }
            if *current == target || !predicate(current) {
                return false;
            }
            *current = target.clone();
            true
        });

        if changed {
            trace!(machine = %self.name, state = ?target, "state changed");
            self.fire_state_changed(target);
        }
        changed
    }

    /// Registers a transition observer.
    ///
    /// The observer is immediately scheduled once with the current value, so
    /// a late registrant never misses the state it attached under.
    pub fn add_listener(&self, listener: impl Fn(S) + Send + Sync + 'static) {
        let listener: StateChangeListener<S> = Arc::new(listener);
        let current = {
            let mut listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.push(Arc::clone(&listener));
            self.get()
        };
        self.executor
            .execute(Box::pin(async move { listener(current) }));
    }

    /// Completes when the current value differs from `current`.
    ///
    /// Returns immediately if the value has already moved on.
    pub async fn wait_for_change(&self, current: S) -> S {
        let mut receiver = self.state.subscribe();
        let result = match receiver.wait_for(|state| *state != current).await {
            Ok(state) => state.clone(),
            // The sender lives in self, so the channel cannot close while
            // this borrow is held; fall back to the latest value regardless.
            Err(_) => self.get(),
        };
        result
    }

    /// Copies the listener list under the lock, then schedules each
    /// notification outside it.
    fn fire_state_changed(&self, new_state: S) {
        let listeners = {
            let listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.clone()
        };
        for listener in listeners {
            let state = new_state.clone();
            self.executor
                .execute(Box::pin(async move { listener(state) }));
        }
    }
}

impl<S: fmt::Debug + Clone> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
