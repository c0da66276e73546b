//! Budget bookkeeping: consumption counters, stop conditions, and reports.
//!
//! All functions take the current time explicitly so limits can be evaluated
//! deterministically in tests.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::halt::{BudgetExhaustedError, StopReason};

/// Hard limits for a single session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_iterations: u32,
    pub max_seconds: u64,
    pub max_changed_files: u32,
    pub max_diff_kb: f64,
    pub max_no_improvement_cycles: u32,
    pub max_test_failure_rate: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_seconds: 20 * 60,
            max_changed_files: 15,
            max_diff_kb: 200.0,
            max_no_improvement_cycles: 2,
            max_test_failure_rate: 0.5,
        }
    }
}

/// Consumption counters. They only ever grow within a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    pub iterations: u32,
    pub changed_files: u32,
    pub diff_kb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopConditions {
    pub no_improvement_cycles: u32,
    /// Running failure rate in `[0, 1]`.
    pub test_failure_rate: f64,
}

/// One audited budget mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BudgetEvent {
    SessionStart {
        restored: bool,
    },
    Iteration {
        iteration: u32,
    },
    Files {
        count: u32,
        total: u32,
    },
    Diff {
        kb: f64,
        total_kb: f64,
    },
    TestResult {
        success: bool,
        improved: bool,
        failure_rate: f64,
        no_improvement_cycles: u32,
    },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: BudgetEvent,
}

/// Persisted budget snapshot (`report/budget-state.json`).
///
/// Limits are not persisted: they always come from the current configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub consumed: Consumption,
    pub stop_conditions: StopConditions,
    pub history: Vec<AuditEntry>,
}

impl BudgetSnapshot {
    /// True if the snapshot was taken less than `ttl` before `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        match age.to_std() {
            Ok(age) => age < ttl,
            // Snapshot from the future (clock skew): treat as fresh.
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remaining {
    pub iterations: u32,
    pub seconds: u64,
    pub changed_files: u32,
    pub diff_kb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePercentages {
    pub iterations: f64,
    pub time: f64,
    pub files: f64,
    pub diff: f64,
}

/// Point-in-time budget view stored in the workflow context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub limits: BudgetLimits,
    pub consumed: Consumption,
    pub elapsed_secs: u64,
    pub remaining: Remaining,
    pub percentages: UsagePercentages,
    pub stop_conditions: StopConditions,
    pub can_proceed: bool,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub iterations: String,
    pub time: String,
    pub files: String,
    pub diff: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportUsage {
    pub iterations: String,
    pub time: String,
    pub files: String,
    pub diff: String,
}

/// Audit events grouped under the iteration that preceded them.
///
/// Iteration `0` holds events recorded before the first iteration began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub iteration: u32,
    pub events: Vec<AuditEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub summary: ReportSummary,
    pub usage: ReportUsage,
    pub stop_reason: String,
    pub timeline: Vec<TimelineEntry>,
}

/// In-memory budget for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    limits: BudgetLimits,
    started_at: DateTime<Utc>,
    consumed: Consumption,
    stop_conditions: StopConditions,
    history: Vec<AuditEntry>,
}

impl Budget {
    pub fn new(limits: BudgetLimits, now: DateTime<Utc>) -> Self {
        Self {
            limits,
            started_at: now,
            consumed: Consumption::default(),
            stop_conditions: StopConditions::default(),
            history: Vec::new(),
        }
    }

    /// Rebuild a session from a persisted snapshot, keeping its original start time.
    pub fn from_snapshot(limits: BudgetLimits, snapshot: BudgetSnapshot) -> Self {
        Self {
            limits,
            started_at: snapshot.started_at,
            consumed: snapshot.consumed,
            stop_conditions: snapshot.stop_conditions,
            history: snapshot.history,
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn consumed(&self) -> &Consumption {
        &self.consumed
    }

    pub fn stop_conditions(&self) -> &StopConditions {
        &self.stop_conditions
    }

    pub fn history(&self) -> &[AuditEntry] {
        &self.history
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        let secs = now.signed_duration_since(self.started_at).num_seconds();
        u64::try_from(secs).unwrap_or(0)
    }

    /// First exhausted limit in priority order, or `InProgress`.
    pub fn stop_reason(&self, now: DateTime<Utc>) -> StopReason {
        let limits = &self.limits;
        if self.consumed.iterations >= limits.max_iterations {
            StopReason::MaxIterations
        } else if self.elapsed_secs(now) >= limits.max_seconds {
            StopReason::TimeLimit
        } else if self.consumed.changed_files >= limits.max_changed_files {
            StopReason::FileLimit
        } else if self.consumed.diff_kb >= limits.max_diff_kb {
            StopReason::DiffLimit
        } else if self.stop_conditions.no_improvement_cycles >= limits.max_no_improvement_cycles {
            StopReason::NoImprovement
        } else if self.stop_conditions.test_failure_rate > limits.max_test_failure_rate {
            StopReason::HighFailureRate
        } else {
            StopReason::InProgress
        }
    }

    pub fn can_proceed(&self, now: DateTime<Utc>) -> bool {
        self.stop_reason(now) == StopReason::InProgress
    }

    /// Error unless more files and diff can still be changed.
    pub fn ensure_change_capacity(&self) -> Result<()> {
        if self.consumed.changed_files >= self.limits.max_changed_files {
            return Err(BudgetExhaustedError {
                reason: StopReason::FileLimit,
            }
            .into());
        }
        if self.consumed.diff_kb >= self.limits.max_diff_kb {
            return Err(BudgetExhaustedError {
                reason: StopReason::DiffLimit,
            }
            .into());
        }
        Ok(())
    }

    /// Remaining wall-clock time, or a budget error when none is left.
    pub fn remaining_time(&self, now: DateTime<Utc>) -> Result<Duration> {
        let remaining = self
            .limits
            .max_seconds
            .saturating_sub(self.elapsed_secs(now));
        if remaining == 0 {
            return Err(BudgetExhaustedError {
                reason: StopReason::TimeLimit,
            }
            .into());
        }
        Ok(Duration::from_secs(remaining))
    }

    pub fn start_session(&mut self, restored: bool, now: DateTime<Utc>) {
        self.push(now, BudgetEvent::SessionStart { restored });
    }

    pub fn consume_iteration(&mut self, now: DateTime<Utc>) {
        self.consumed.iterations += 1;
        let iteration = self.consumed.iterations;
        self.push(now, BudgetEvent::Iteration { iteration });
    }

    pub fn consume_files(&mut self, count: u32, now: DateTime<Utc>) {
        self.consumed.changed_files += count;
        let total = self.consumed.changed_files;
        self.push(now, BudgetEvent::Files { count, total });
    }

    pub fn consume_diff_kb(&mut self, kb: f64, now: DateTime<Utc>) {
        let kb = if kb.is_finite() { kb.max(0.0) } else { 0.0 };
        self.consumed.diff_kb += kb;
        let total_kb = self.consumed.diff_kb;
        self.push(now, BudgetEvent::Diff { kb, total_kb });
    }

    /// Fold a test outcome into the running failure rate and improvement streak.
    pub fn record_test_result(&mut self, success: bool, improved: bool, now: DateTime<Utc>) {
        let runs = f64::from(self.consumed.iterations);
        let failure = if success { 0.0 } else { 1.0 };
        let rate = (self.stop_conditions.test_failure_rate * runs + failure) / (runs + 1.0);
        self.stop_conditions.test_failure_rate = rate;
        if improved {
            self.stop_conditions.no_improvement_cycles = 0;
        } else {
            self.stop_conditions.no_improvement_cycles += 1;
        }
        let no_improvement_cycles = self.stop_conditions.no_improvement_cycles;
        self.push(
            now,
            BudgetEvent::TestResult {
                success,
                improved,
                failure_rate: rate,
                no_improvement_cycles,
            },
        );
    }

    /// Zero every counter and restart the session clock.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.started_at = now;
        self.consumed = Consumption::default();
        self.stop_conditions = StopConditions::default();
        self.history.clear();
        self.push(now, BudgetEvent::Reset);
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Remaining {
        Remaining {
            iterations: self
                .limits
                .max_iterations
                .saturating_sub(self.consumed.iterations),
            seconds: self.limits.max_seconds.saturating_sub(self.elapsed_secs(now)),
            changed_files: self
                .limits
                .max_changed_files
                .saturating_sub(self.consumed.changed_files),
            diff_kb: (self.limits.max_diff_kb - self.consumed.diff_kb).max(0.0),
        }
    }

    pub fn percentages(&self, now: DateTime<Utc>) -> UsagePercentages {
        UsagePercentages {
            iterations: percent(
                f64::from(self.consumed.iterations),
                f64::from(self.limits.max_iterations),
            ),
            time: percent(
                self.elapsed_secs(now) as f64,
                self.limits.max_seconds as f64,
            ),
            files: percent(
                f64::from(self.consumed.changed_files),
                f64::from(self.limits.max_changed_files),
            ),
            diff: percent(self.consumed.diff_kb, self.limits.max_diff_kb),
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> BudgetStatus {
        let stop_reason = self.stop_reason(now);
        BudgetStatus {
            limits: self.limits.clone(),
            consumed: self.consumed.clone(),
            elapsed_secs: self.elapsed_secs(now),
            remaining: self.remaining(now),
            percentages: self.percentages(now),
            stop_conditions: self.stop_conditions.clone(),
            can_proceed: stop_reason == StopReason::InProgress,
            stop_reason,
        }
    }

    pub fn report(&self, now: DateTime<Utc>) -> BudgetReport {
        let stop_reason = self.stop_reason(now);
        let percentages = self.percentages(now);
        BudgetReport {
            summary: ReportSummary {
                iterations: format!(
                    "{}/{}",
                    self.consumed.iterations, self.limits.max_iterations
                ),
                time: format_duration(self.elapsed_secs(now)),
                files: format!(
                    "{}/{}",
                    self.consumed.changed_files, self.limits.max_changed_files
                ),
                diff: format!("{:.1} KB", self.consumed.diff_kb),
                completed: stop_reason != StopReason::InProgress,
            },
            usage: ReportUsage {
                iterations: format!("{:.1}%", percentages.iterations),
                time: format!("{:.1}%", percentages.time),
                files: format!("{:.1}%", percentages.files),
                diff: format!("{:.1}%", percentages.diff),
            },
            stop_reason: stop_reason.to_string(),
            timeline: timeline(&self.history),
        }
    }

    /// Snapshot for persistence, keeping only the newest `history_cap` audit entries.
    pub fn snapshot(&self, now: DateTime<Utc>, history_cap: usize) -> BudgetSnapshot {
        let skip = self.history.len().saturating_sub(history_cap);
        BudgetSnapshot {
            timestamp: now,
            started_at: self.started_at,
            consumed: self.consumed.clone(),
            stop_conditions: self.stop_conditions.clone(),
            history: self.history[skip..].to_vec(),
        }
    }

    fn push(&mut self, timestamp: DateTime<Utc>, event: BudgetEvent) {
        self.history.push(AuditEntry { timestamp, event });
    }
}

fn percent(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 100.0;
    }
    value / limit * 100.0
}

/// Format whole seconds as `"{m}m {s}s"`.
pub fn format_duration(secs: u64) -> String {
    format!("{}m {}s", secs / 60, secs % 60)
}

/// Group audit entries by the iteration that preceded them.
pub fn timeline(history: &[AuditEntry]) -> Vec<TimelineEntry> {
    let mut entries: Vec<TimelineEntry> = Vec::new();
    let mut current = TimelineEntry {
        iteration: 0,
        events: Vec::new(),
    };
    for entry in history {
        if let BudgetEvent::Iteration { iteration } = entry.event {
            let finished = std::mem::replace(
                &mut current,
                TimelineEntry {
                    iteration,
                    events: Vec::new(),
                },
            );
            if finished.iteration > 0 || !finished.events.is_empty() {
                entries.push(finished);
            }
        }
        current.events.push(entry.clone());
    }
    if current.iteration > 0 || !current.events.is_empty() {
        entries.push(current);
    }
    entries
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn iteration_limit_blocks_at_boundary() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        budget.consume_iteration(now);
        budget.consume_iteration(now);
        assert!(budget.can_proceed(now));
        budget.consume_iteration(now);
        assert!(!budget.can_proceed(now));
        assert_eq!(budget.stop_reason(now), StopReason::MaxIterations);
    }

    #[test]
    fn time_limit_uses_session_start() {
        let start = t0();
        let budget = Budget::new(BudgetLimits::default(), start);
        let just_before = start + TimeDelta::seconds(1199);
        let at_limit = start + TimeDelta::seconds(1200);
        assert!(budget.can_proceed(just_before));
        assert_eq!(budget.stop_reason(at_limit), StopReason::TimeLimit);
        assert!(budget.remaining_time(at_limit).is_err());
        assert_eq!(
            budget.remaining_time(just_before).expect("remaining"),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn stop_reasons_follow_priority_order() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        budget.consume_files(15, now);
        budget.consume_diff_kb(250.0, now);
        assert_eq!(budget.stop_reason(now), StopReason::FileLimit);
        for _ in 0..3 {
            budget.consume_iteration(now);
        }
        assert_eq!(budget.stop_reason(now), StopReason::MaxIterations);
    }

    #[test]
    fn failure_rate_uses_iteration_weighted_average() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        budget.consume_iteration(now);
        budget.record_test_result(false, false, now);
        // (0 * 1 + 1) / 2
        assert!((budget.stop_conditions().test_failure_rate - 0.5).abs() < f64::EPSILON);
        assert!(budget.can_proceed(now), "0.5 is not above the 0.5 threshold");

        budget.consume_iteration(now);
        budget.record_test_result(false, false, now);
        // (0.5 * 2 + 1) / 3
        let rate = budget.stop_conditions().test_failure_rate;
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(budget.stop_reason(now), StopReason::NoImprovement);
    }

    #[test]
    fn improvement_resets_no_improvement_streak() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        budget.record_test_result(true, false, now);
        assert_eq!(budget.stop_conditions().no_improvement_cycles, 1);
        budget.record_test_result(true, true, now);
        assert_eq!(budget.stop_conditions().no_improvement_cycles, 0);
        assert!(budget.can_proceed(now));
    }

    #[test]
    fn change_capacity_reports_the_exhausted_limit() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        budget.ensure_change_capacity().expect("fresh budget has capacity");
        budget.consume_diff_kb(200.0, now);
        let err = budget.ensure_change_capacity().expect_err("diff exhausted");
        let halt = err
            .downcast_ref::<BudgetExhaustedError>()
            .expect("typed error");
        assert_eq!(halt.reason, StopReason::DiffLimit);
    }

    #[test]
    fn negative_diff_does_not_decrease_consumption() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        budget.consume_diff_kb(10.0, now);
        budget.consume_diff_kb(-4.0, now);
        assert!((budget.consumed().diff_kb - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_freshness_respects_ttl() {
        let now = t0();
        let budget = Budget::new(BudgetLimits::default(), now);
        let snapshot = budget.snapshot(now, 100);
        let ttl = Duration::from_secs(30 * 60);
        assert!(snapshot.is_fresh(now + TimeDelta::minutes(29), ttl));
        assert!(!snapshot.is_fresh(now + TimeDelta::minutes(31), ttl));
    }

    #[test]
    fn snapshot_keeps_newest_history_entries() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        for _ in 0..5 {
            budget.consume_files(1, now);
        }
        let snapshot = budget.snapshot(now, 2);
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(
            snapshot.history[1].event,
            BudgetEvent::Files { count: 1, total: 5 }
        );
    }

    #[test]
    fn report_formats_summary_and_groups_timeline() {
        let now = t0();
        let mut budget = Budget::new(BudgetLimits::default(), now);
        budget.start_session(false, now);
        budget.consume_iteration(now);
        budget.consume_files(2, now);
        budget.consume_diff_kb(12.345, now);
        budget.consume_iteration(now);
        let report = budget.report(now + TimeDelta::seconds(65));

        assert_eq!(report.summary.iterations, "2/3");
        assert_eq!(report.summary.time, "1m 5s");
        assert_eq!(report.summary.diff, "12.3 KB");
        assert!(!report.summary.completed);
        assert_eq!(report.stop_reason, "In progress");

        let groups: Vec<(u32, usize)> = report
            .timeline
            .iter()
            .map(|entry| (entry.iteration, entry.events.len()))
            .collect();
        assert_eq!(groups, vec![(0, 1), (1, 3), (2, 1)]);
    }

    #[test]
    fn reset_clears_counters_and_restarts_clock() {
        let start = t0();
        let mut budget = Budget::new(BudgetLimits::default(), start);
        budget.consume_iteration(start);
        budget.consume_files(3, start);
        let later = start + TimeDelta::minutes(10);
        budget.reset(later);
        assert_eq!(budget.consumed(), &Consumption::default());
        assert_eq!(budget.elapsed_secs(later), 0);
        assert_eq!(budget.history().len(), 1);
    }

    #[test]
    fn audit_entries_serialize_flat() {
        let entry = AuditEntry {
            timestamp: t0(),
            event: BudgetEvent::Iteration { iteration: 2 },
        };
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["event"], "iteration");
        assert_eq!(json["iteration"], 2);
        let back: AuditEntry = serde_json::from_value(json).expect("parse");
        assert_eq!(back, entry);
    }
}
