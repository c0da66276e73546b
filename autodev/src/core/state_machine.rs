//! Workflow state bookkeeping: transitions, history, and their analysis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::context::{Context, ContextKey, ErrorRecord, StepResult};
use crate::core::types::WorkflowState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateEvent {
    Transition,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub state: WorkflowState,
    pub event: StateEvent,
    pub trigger: String,
    /// Context slots touched by this entry.
    #[serde(default)]
    pub updated: Vec<ContextKey>,
}

/// Persisted state (`report/state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub current_state: WorkflowState,
    pub session_started: DateTime<Utc>,
    pub context: Context,
    pub history: Vec<HistoryEntry>,
    pub transitions: Vec<Transition>,
}

/// In-memory state machine. Logs only grow until `reset`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMachine {
    current: WorkflowState,
    session_started: DateTime<Utc>,
    context: Context,
    history: Vec<HistoryEntry>,
    transitions: Vec<Transition>,
}

impl StateMachine {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: WorkflowState::Idle,
            session_started: now,
            context: Context::default(),
            history: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            current: snapshot.current_state,
            session_started: snapshot.session_started,
            context: snapshot.context,
            history: snapshot.history,
            transitions: snapshot.transitions,
        }
    }

    pub fn current(&self) -> WorkflowState {
        self.current
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn session_started(&self) -> DateTime<Utc> {
        self.session_started
    }

    /// Move to `to`, merge `patch` into the context, and log both.
    pub fn apply(
        &mut self,
        to: WorkflowState,
        trigger: &str,
        patch: Vec<StepResult>,
        now: DateTime<Utc>,
    ) -> &Transition {
        let from = self.current;
        self.current = to;
        let updated = self.context.merge(patch, now);
        self.history.push(HistoryEntry {
            timestamp: now,
            state: to,
            event: StateEvent::Transition,
            trigger: trigger.to_string(),
            updated,
        });
        self.transitions.push(Transition {
            from,
            to,
            trigger: trigger.to_string(),
            timestamp: now,
        });
        &self.transitions[self.transitions.len() - 1]
    }

    /// Record an error without changing state.
    pub fn record_error(&mut self, message: &str, now: DateTime<Utc>) {
        self.context.last_error = Some(ErrorRecord {
            message: message.to_string(),
            state: self.current,
            timestamp: now,
        });
        self.context.last_update = Some(now);
        self.history.push(HistoryEntry {
            timestamp: now,
            state: self.current,
            event: StateEvent::Error,
            trigger: message.to_string(),
            updated: Vec::new(),
        });
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        *self = Self::new(now);
    }

    /// Snapshot with logs truncated to their newest entries.
    pub fn snapshot(
        &self,
        now: DateTime<Utc>,
        history_cap: usize,
        transitions_cap: usize,
    ) -> StateSnapshot {
        StateSnapshot {
            timestamp: now,
            current_state: self.current,
            session_started: self.session_started,
            context: self.context.clone(),
            history: tail(&self.history, history_cap),
            transitions: tail(&self.transitions, transitions_cap),
        }
    }
}

fn tail<T: Clone>(items: &[T], cap: usize) -> Vec<T> {
    items[items.len().saturating_sub(cap)..].to_vec()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    /// `"FROM->TO"` → occurrences.
    pub common_transitions: BTreeMap<String, u32>,
    pub state_frequency: BTreeMap<WorkflowState, u32>,
    pub error_states: u32,
    /// `DONE / (DONE + STOP) * 100`, or 0 when neither occurred.
    pub success_rate: f64,
}

pub fn analyze_patterns(transitions: &[Transition], history: &[HistoryEntry]) -> PatternAnalysis {
    let mut common_transitions = BTreeMap::new();
    for t in transitions {
        *common_transitions
            .entry(format!("{}->{}", t.from, t.to))
            .or_insert(0) += 1;
    }

    let mut state_frequency = BTreeMap::new();
    let mut error_states = 0;
    let mut done = 0u32;
    let mut stopped = 0u32;
    for entry in history
        .iter()
        .filter(|e| e.event == StateEvent::Transition)
    {
        *state_frequency.entry(entry.state).or_insert(0) += 1;
        if entry.state.is_error_state() {
            error_states += 1;
        }
        match entry.state {
            WorkflowState::Done => done += 1,
            WorkflowState::Stop => stopped += 1,
            _ => {}
        }
    }

    let success_rate = if done + stopped == 0 {
        0.0
    } else {
        f64::from(done) / f64::from(done + stopped) * 100.0
    };

    PatternAnalysis {
        common_transitions,
        state_frequency,
        error_states,
        success_rate,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub state: WorkflowState,
    /// Percentage of observed transitions out of the current state.
    pub probability: f64,
}

/// Likely next states from `current`, most probable first.
pub fn predict_next_state(current: WorkflowState, transitions: &[Transition]) -> Vec<Prediction> {
    let mut counts: BTreeMap<WorkflowState, u32> = BTreeMap::new();
    let mut total = 0u32;
    for t in transitions.iter().filter(|t| t.from == current) {
        *counts.entry(t.to).or_insert(0) += 1;
        total += 1;
    }
    let mut predictions: Vec<Prediction> = counts
        .into_iter()
        .map(|(state, count)| Prediction {
            state,
            probability: f64::from(count) / f64::from(total) * 100.0,
        })
        .collect();
    predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    predictions
}

/// Seconds spent in each state.
///
/// The gap between consecutive transitions is attributed to the state being
/// exited, and the current state accrues the time from the last transition
/// until `now`.
pub fn time_per_state(
    transitions: &[Transition],
    current: WorkflowState,
    session_started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> BTreeMap<WorkflowState, f64> {
    let mut totals = BTreeMap::new();
    let mut since = session_started;
    for t in transitions {
        let secs = seconds_between(since, t.timestamp);
        *totals.entry(t.from).or_insert(0.0) += secs;
        since = t.timestamp;
    }
    *totals.entry(current).or_insert(0.0) += seconds_between(since, now);
    totals
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = end.signed_duration_since(start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}
