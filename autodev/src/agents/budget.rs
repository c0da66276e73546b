//! Budget agent: the session budget plus its persisted snapshot.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{Budget, BudgetReport, BudgetSnapshot, BudgetStatus, Remaining};
use crate::core::halt::StopReason;
use crate::io::config::BudgetConfig;
use crate::io::paths::ProjectPaths;
use crate::io::store::{load_json, write_json};

/// Owns the session [`Budget`] and rewrites `report/budget-state.json` after
/// every mutation.
#[derive(Debug)]
pub struct BudgetAgent {
    budget: Budget,
    path: PathBuf,
    history_cap: usize,
}

impl BudgetAgent {
    /// Restore a recent session or start a fresh one, then persist.
    ///
    /// A snapshot older than the session TTL (or unreadable) is discarded.
    #[instrument(skip_all)]
    pub fn initialize(paths: &ProjectPaths, cfg: &BudgetConfig) -> Result<Self> {
        let now = Utc::now();
        let path = paths.budget_state_path.clone();
        let snapshot = match load_json::<BudgetSnapshot>(&path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "ignoring unreadable budget snapshot");
                None
            }
        };
        let ttl: Duration = cfg.session_ttl();
        let (mut budget, restored) = match snapshot {
            Some(snapshot) if snapshot.is_fresh(now, ttl) => {
                debug!(started_at = %snapshot.started_at, "restoring budget session");
                (Budget::from_snapshot(cfg.limits(), snapshot), true)
            }
            Some(_) => {
                info!("budget snapshot expired, starting fresh session");
                (Budget::new(cfg.limits(), now), false)
            }
            None => (Budget::new(cfg.limits(), now), false),
        };
        budget.start_session(restored, now);
        let agent = Self {
            budget,
            path,
            history_cap: cfg.history_cap,
        };
        agent.persist()?;
        Ok(agent)
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn can_proceed(&self) -> bool {
        self.budget.can_proceed(Utc::now())
    }

    pub fn stop_reason(&self) -> StopReason {
        self.budget.stop_reason(Utc::now())
    }

    pub fn remaining(&self) -> Remaining {
        self.budget.remaining(Utc::now())
    }

    pub fn remaining_time(&self) -> Result<Duration> {
        self.budget.remaining_time(Utc::now())
    }

    pub fn ensure_change_capacity(&self) -> Result<()> {
        self.budget.ensure_change_capacity()
    }

    pub fn consume_iteration(&mut self) -> Result<()> {
        self.budget.consume_iteration(Utc::now());
        debug!(iterations = self.budget.consumed().iterations, "iteration consumed");
        self.persist()
    }

    pub fn consume_files(&mut self, count: u32) -> Result<()> {
        self.budget.consume_files(count, Utc::now());
        self.persist()
    }

    pub fn consume_diff_kb(&mut self, kb: f64) -> Result<()> {
        self.budget.consume_diff_kb(kb, Utc::now());
        self.persist()
    }

    pub fn record_test_result(&mut self, success: bool, improved: bool) -> Result<()> {
        self.budget.record_test_result(success, improved, Utc::now());
        let conditions = self.budget.stop_conditions();
        debug!(
            success,
            improved,
            failure_rate = conditions.test_failure_rate,
            no_improvement_cycles = conditions.no_improvement_cycles,
            "test result recorded"
        );
        self.persist()
    }

    pub fn status(&self) -> BudgetStatus {
        self.budget.status(Utc::now())
    }

    pub fn report(&self) -> BudgetReport {
        self.budget.report(Utc::now())
    }

    pub fn reset(&mut self) -> Result<()> {
        info!("resetting budget");
        self.budget.reset(Utc::now());
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.budget.snapshot(Utc::now(), self.history_cap);
        write_json(&self.path, &snapshot)
            .with_context(|| format!("persist budget {}", self.path.display()))
    }
}
