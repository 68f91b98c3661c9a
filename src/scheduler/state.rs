// src/scheduler/state.rs

//! Pure per-build state machine for the scheduler.
//!
//! No IO and no async here: the worker pool in [`super`] drives this behind
//! a mutex, and tests drive it directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::graph::{ExecutionPlan, TaskId};
use crate::types::TaskState;

/// One recorded state change. `seq` totally orders all transitions of a build.
#[derive(Debug, Clone)]
pub struct Transition {
    pub seq: u64,
    pub task: TaskId,
    pub state: TaskState,
    pub at: Instant,
}

#[derive(Debug)]
pub struct ExecutionState {
    plan: Arc<ExecutionPlan>,
    states: Vec<TaskState>,
    /// Dependencies not yet terminal, per node.
    waiting_on: Vec<usize>,
    ready: VecDeque<usize>,
    /// Claimed or running.
    in_flight: usize,
    continue_on_failure: bool,
    halted: bool,
    cancelled: bool,
    failures: usize,
    timeline: Vec<Transition>,
}

impl ExecutionState {
    pub fn new(plan: Arc<ExecutionPlan>, continue_on_failure: bool) -> Self {
        let n = plan.len();
        let waiting_on: Vec<usize> = (0..n).map(|i| plan.dependencies(i).len()).collect();
        let mut state = Self {
            plan,
            states: vec![TaskState::Pending; n],
            waiting_on,
            ready: VecDeque::new(),
            in_flight: 0,
            continue_on_failure,
            halted: false,
            cancelled: false,
            failures: 0,
            timeline: Vec::new(),
        };
        let roots: Vec<usize> = state
            .plan
            .order()
            .iter()
            .copied()
            .filter(|&i| state.waiting_on[i] == 0)
            .collect();
        for i in roots {
            state.mark_ready(i);
        }
        state
    }

    fn transition(&mut self, idx: usize, next: TaskState) -> bool {
        let current = self.states[idx];
        if !current.can_transition_to(next) {
            warn!(
                task = %self.plan.node(idx).id,
                from = %current,
                to = %next,
                "ignoring illegal state transition"
            );
            return false;
        }
        self.states[idx] = next;
        self.timeline.push(Transition {
            seq: self.timeline.len() as u64,
            task: self.plan.node(idx).id.clone(),
            state: next,
            at: Instant::now(),
        });
        true
    }

    fn mark_ready(&mut self, idx: usize) {
        if self.transition(idx, TaskState::Ready) {
            self.ready.push_back(idx);
        }
    }

    /// Take the next ready node. The node stays `Ready` until
    /// [`start`](Self::start) so cancellation can still leave it untouched.
    pub fn claim_next(&mut self) -> Option<usize> {
        if self.halted || self.cancelled {
            return None;
        }
        while let Some(idx) = self.ready.pop_front() {
            if self.states[idx] == TaskState::Ready {
                self.in_flight += 1;
                return Some(idx);
            }
        }
        None
    }

    /// `Ready -> Running`. Returns `false` if dispatch has stopped (cancel,
    /// halt) or the node was skipped in the meantime.
    pub fn start(&mut self, idx: usize) -> bool {
        if self.halted || self.cancelled || self.states[idx] != TaskState::Ready {
            return false;
        }
        self.transition(idx, TaskState::Running)
    }

    /// Give up on a claimed or running node without a terminal state.
    pub fn abandon(&mut self, idx: usize) {
        self.in_flight = self.in_flight.saturating_sub(1);
        debug!(task = %self.plan.node(idx).id, state = %self.states[idx], "abandoned node");
    }

    /// Record a terminal state for a running node. Returns nodes that became
    /// ready as a result.
    pub fn complete(&mut self, idx: usize, outcome: TaskState) -> Vec<usize> {
        self.in_flight = self.in_flight.saturating_sub(1);
        if !self.transition(idx, outcome) {
            return Vec::new();
        }

        if outcome == TaskState::Failed {
            self.failures += 1;
            self.skip_dependents_of(idx);
            if !self.continue_on_failure {
                self.halt();
            }
            return Vec::new();
        }

        let mut newly_ready = Vec::new();
        for &d in self.plan.dependents(idx).to_vec().iter() {
            self.waiting_on[d] = self.waiting_on[d].saturating_sub(1);
            if self.waiting_on[d] == 0 && self.states[d] == TaskState::Pending {
                self.mark_ready(d);
                newly_ready.push(d);
            }
        }
        newly_ready
    }

    fn skip_dependents_of(&mut self, failed: usize) {
        let mut stack: Vec<usize> = self.plan.dependents(failed).to_vec();
        while let Some(i) = stack.pop() {
            if matches!(self.states[i], TaskState::Pending | TaskState::Ready) {
                debug!(
                    task = %self.plan.node(i).id,
                    upstream = %self.plan.node(failed).id,
                    "skipping dependent of failed task"
                );
                self.transition(i, TaskState::Skipped);
                stack.extend_from_slice(self.plan.dependents(i));
            }
        }
    }

    /// Stop dispatch after a failure: every node that has not started is
    /// skipped.
    fn halt(&mut self) {
        self.halted = true;
        for i in 0..self.states.len() {
            if matches!(self.states[i], TaskState::Pending | TaskState::Ready) {
                self.transition(i, TaskState::Skipped);
            }
        }
        self.ready.clear();
    }

    /// Stop dispatch. Nodes that have not started keep their state.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Workers stop pulling once this holds.
    pub fn is_done(&self) -> bool {
        self.cancelled
            || self.halted
            || self.all_terminal()
            || (self.ready.is_empty() && self.in_flight == 0)
    }

    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn state_of(&self, idx: usize) -> TaskState {
        self.states[idx]
    }

    pub fn states(&self) -> &[TaskState] {
        &self.states
    }

    pub fn timeline(&self) -> &[Transition] {
        &self.timeline
    }
}
