//! Automated execution controller.
//!
//! Every decision passes the same gates in order: automation enabled, type
//! enabled, daily cap, percentage boundary, bid range, then the confidence tier.
//! Gating, applying and counting for one account run under that account's lock
//! so concurrent submissions cannot overshoot a daily cap.

use std::collections::HashMap;
use std::sync::Arc;

use bidopt_core::config::{AutomationConfig, AutomationDefaults, AutomationMode, SafetyBoundary};
use bidopt_core::error::{OptimizerError, OptimizerResult};
use bidopt_core::notify::{
    deliver, Notification, NotificationKind, NotificationSeverity, NotificationSink,
};
use bidopt_core::ports::{AdPlatform, PlatformChange};
use bidopt_core::types::{ExecutionType, OptimizationSuggestion, SuggestionType};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, ExecutionBatch, ExecutionResult, ExecutionStatus, OutcomeCounts};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    Auto,
    Supervised,
    Manual,
}

/// A concrete change proposed for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDecision {
    pub id: Uuid,
    pub suggestion_id: Option<Uuid>,
    pub account_id: String,
    pub target_id: String,
    pub execution_type: ExecutionType,
    pub current_value: f64,
    pub new_value: f64,
    /// 0–100.
    pub confidence: f64,
    pub reasoning: String,
    /// Keyword text for negative-keyword additions.
    pub text: Option<String>,
}

impl ExecutionDecision {
    pub fn new(
        account_id: impl Into<String>,
        target_id: impl Into<String>,
        execution_type: ExecutionType,
        current_value: f64,
        new_value: f64,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            suggestion_id: None,
            account_id: account_id.into(),
            target_id: target_id.into(),
            execution_type,
            current_value,
            new_value,
            confidence,
            reasoning: String::new(),
            text: None,
        }
    }

    /// `None` for suggestions that change nothing.
    pub fn from_suggestion(suggestion: &OptimizationSuggestion) -> Option<Self> {
        let execution_type = match suggestion.suggestion_type {
            SuggestionType::Maintain => return None,
            SuggestionType::BidIncrease | SuggestionType::BidDecrease => {
                ExecutionType::BidAdjustment
            }
            SuggestionType::Pause => ExecutionType::Pause,
            SuggestionType::NegativeKeyword => ExecutionType::NegativeKeyword,
        };
        Some(Self {
            id: Uuid::new_v4(),
            suggestion_id: Some(suggestion.id),
            account_id: suggestion.account_id.clone(),
            target_id: suggestion.target_id.clone(),
            execution_type,
            current_value: suggestion.current_value,
            new_value: suggestion.suggested_value,
            confidence: suggestion.confidence * 100.0,
            reasoning: suggestion.reasoning.clone(),
            text: None,
        })
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Signed change in percent. Zero current values count as unbounded.
    pub fn change_percent(&self) -> f64 {
        if self.current_value.abs() < f64::EPSILON {
            if self.new_value.abs() < f64::EPSILON {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (self.new_value - self.current_value) / self.current_value.abs() * 100.0
        }
    }
}

/// Per-account per-day execution summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySummary {
    pub account_id: String,
    pub date: NaiveDate,
    pub outcomes: OutcomeCounts,
    pub executions_by_type: HashMap<ExecutionType, u32>,
}

type CounterKey = (String, NaiveDate, ExecutionType);

pub struct ExecutionController {
    defaults: AutomationDefaults,
    platform: Arc<dyn AdPlatform>,
    notifier: Arc<dyn NotificationSink>,
    audit: AuditLog,
    configs: DashMap<String, AutomationConfig>,
    boundaries: DashMap<String, SafetyBoundary>,
    counters: DashMap<CounterKey, u32>,
    /// Day of the last retention purge.
    purged_on: Mutex<Option<NaiveDate>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExecutionController {
    pub fn new(
        defaults: AutomationDefaults,
        platform: Arc<dyn AdPlatform>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            defaults,
            platform,
            notifier,
            audit: AuditLog::new(),
            configs: DashMap::new(),
            boundaries: DashMap::new(),
            counters: DashMap::new(),
            purged_on: Mutex::new(None),
            locks: DashMap::new(),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // ─── Per-account state ──────────────────────────────────────────────

    /// Current automation config, seeded from defaults on first access.
    pub fn config(&self, account_id: &str) -> AutomationConfig {
        self.configs
            .entry(account_id.to_string())
            .or_insert_with(|| self.defaults.config.clone())
            .clone()
    }

    pub fn set_config(&self, account_id: &str, config: AutomationConfig) {
        self.configs.insert(account_id.to_string(), config);
    }

    pub fn boundary(&self, account_id: &str) -> SafetyBoundary {
        self.boundaries
            .entry(account_id.to_string())
            .or_insert_with(|| self.defaults.boundary.clone())
            .clone()
    }

    pub fn set_boundary(&self, account_id: &str, boundary: SafetyBoundary) -> OptimizerResult<()> {
        if boundary.min_bid > boundary.max_bid {
            return Err(OptimizerError::Config(format!(
                "min bid {} exceeds max bid {}",
                boundary.min_bid, boundary.max_bid
            )));
        }
        self.boundaries.insert(account_id.to_string(), boundary);
        Ok(())
    }

    pub fn daily_count(&self, account_id: &str, date: NaiveDate, execution_type: ExecutionType) -> u32 {
        self.counters
            .get(&(account_id.to_string(), date, execution_type))
            .map(|c| *c)
            .unwrap_or(0)
    }

    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ─── Execution ──────────────────────────────────────────────────────

    pub fn execute(&self, decision: &ExecutionDecision) -> ExecutionResult {
        self.execute_at(decision, Utc::now())
    }

    pub fn execute_at(&self, decision: &ExecutionDecision, now: DateTime<Utc>) -> ExecutionResult {
        self.execute_inner(decision, now, None)
    }

    fn execute_inner(
        &self,
        decision: &ExecutionDecision,
        now: DateTime<Utc>,
        batch_id: Option<Uuid>,
    ) -> ExecutionResult {
        self.purge_on_rollover(now.date_naive());
        let lock = self.account_lock(&decision.account_id);
        let _guard = lock.lock();

        let (status, reason, tier, attempts) = match self.gate(decision, now.date_naive()) {
            Err(reason) => (ExecutionStatus::Blocked, reason, None, 0),
            Ok(tier) => {
                let config = self.config(&decision.account_id);
                if tier == ExecutionTier::Manual && config.mode != AutomationMode::Approval {
                    (
                        ExecutionStatus::Skipped,
                        format!(
                            "Confidence {:.0} below supervised threshold {:.0}; needs approval",
                            decision.confidence, config.supervised_confidence
                        ),
                        Some(tier),
                        0,
                    )
                } else {
                    match self.apply(decision) {
                        Ok(attempts) => {
                            *self
                                .counters
                                .entry((
                                    decision.account_id.clone(),
                                    now.date_naive(),
                                    decision.execution_type,
                                ))
                                .or_insert(0) += 1;
                            (
                                ExecutionStatus::Success,
                                format!("Applied ({tier:?})"),
                                Some(tier),
                                attempts,
                            )
                        }
                        Err((attempts, e)) => (
                            ExecutionStatus::Failed,
                            OptimizerError::ApplyFailure(e.to_string()).to_string(),
                            Some(tier),
                            attempts,
                        ),
                    }
                }
            }
        };

        let counter = match status {
            ExecutionStatus::Success => "automation.executions.success",
            ExecutionStatus::Failed => "automation.executions.failed",
            ExecutionStatus::Skipped => "automation.executions.skipped",
            ExecutionStatus::Blocked => "automation.executions.blocked",
            ExecutionStatus::RolledBack => "automation.executions.rolled_back",
        };
        metrics::counter!(counter).increment(1);

        self.audit.record(ExecutionResult {
            id: Uuid::new_v4(),
            sequence: 0,
            batch_id,
            decision_id: decision.id,
            suggestion_id: decision.suggestion_id,
            account_id: decision.account_id.clone(),
            target_id: decision.target_id.clone(),
            execution_type: decision.execution_type,
            previous_value: decision.current_value,
            new_value: decision.new_value,
            confidence: decision.confidence,
            tier,
            status,
            reason,
            attempts,
            executed_at: now,
            rolled_back_by: None,
        })
    }

    /// Safety checks. `Err` carries the block reason; `Ok` the confidence tier.
    fn gate(&self, decision: &ExecutionDecision, date: NaiveDate) -> Result<ExecutionTier, String> {
        let config = self.config(&decision.account_id);
        let boundary = self.boundary(&decision.account_id);

        if !config.enabled {
            return Err(match &config.stop_reason {
                Some(why) => format!("Automation disabled: {why}"),
                None => "Automation disabled".to_string(),
            });
        }
        if !config.enabled_types.contains(&decision.execution_type) {
            return Err(format!("{} is not enabled", decision.execution_type));
        }

        let limit = boundary.daily_limit(decision.execution_type);
        let used = self.daily_count(&decision.account_id, date, decision.execution_type);
        if used >= limit {
            return Err(format!(
                "Daily limit reached for {} ({used}/{limit})",
                decision.execution_type
            ));
        }

        if let Some(max) = boundary.max_change_percent(decision.execution_type) {
            let change = decision.change_percent();
            if change.abs() > max {
                return Err(OptimizerError::BoundaryViolation(format!(
                    "{} change {change:+.1}% exceeds {max:.0}%",
                    decision.execution_type
                ))
                .to_string());
            }
        }

        if decision.execution_type == ExecutionType::BidAdjustment
            && (decision.new_value < boundary.min_bid || decision.new_value > boundary.max_bid)
        {
            return Err(OptimizerError::BoundaryViolation(format!(
                "bid {:.2} outside [{:.2}, {:.2}]",
                decision.new_value, boundary.min_bid, boundary.max_bid
            ))
            .to_string());
        }

        Ok(tier_for(decision.confidence, &config))
    }

    /// Push the change, retrying up to the configured attempts.
    fn apply(&self, decision: &ExecutionDecision) -> Result<u32, (u32, anyhow::Error)> {
        let change = PlatformChange {
            account_id: decision.account_id.clone(),
            target_id: decision.target_id.clone(),
            execution_type: decision.execution_type,
            new_value: decision.new_value,
            text: decision.text.clone(),
        };
        let max_attempts = self.defaults.apply_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.platform.apply(&change) {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt >= max_attempts => return Err((attempt, e)),
                Err(e) => {
                    warn!(
                        target_id = %decision.target_id,
                        attempt,
                        error = %e,
                        "Apply failed, retrying"
                    );
                }
            }
        }
    }

    // ─── Batches ────────────────────────────────────────────────────────

    pub fn execute_batch(&self, account_id: &str, decisions: &[ExecutionDecision]) -> ExecutionBatch {
        self.execute_batch_at(account_id, decisions, Utc::now())
    }

    /// Run every decision for one account. Items are isolated: a failure is
    /// recorded and the batch moves on.
    pub fn execute_batch_at(
        &self,
        account_id: &str,
        decisions: &[ExecutionDecision],
        now: DateTime<Utc>,
    ) -> ExecutionBatch {
        self.purge_stale_counters(now.date_naive());

        let batch_id = Uuid::new_v4();
        let mut outcomes = OutcomeCounts::default();
        let mut result_ids = Vec::with_capacity(decisions.len());
        for decision in decisions {
            let result = if decision.account_id == account_id {
                self.execute_inner(decision, now, Some(batch_id))
            } else {
                self.audit.record(ExecutionResult {
                    id: Uuid::new_v4(),
                    sequence: 0,
                    batch_id: Some(batch_id),
                    decision_id: decision.id,
                    suggestion_id: decision.suggestion_id,
                    account_id: decision.account_id.clone(),
                    target_id: decision.target_id.clone(),
                    execution_type: decision.execution_type,
                    previous_value: decision.current_value,
                    new_value: decision.new_value,
                    confidence: decision.confidence,
                    tier: None,
                    status: ExecutionStatus::Blocked,
                    reason: format!("Decision belongs to another account than batch {account_id}"),
                    attempts: 0,
                    executed_at: now,
                    rolled_back_by: None,
                })
            };
            outcomes.add(result.status);
            result_ids.push(result.id);
        }

        metrics::histogram!("automation.batch.size").record(decisions.len() as f64);
        info!(
            account_id,
            batch_id = %batch_id,
            total = decisions.len(),
            success = outcomes.success,
            failed = outcomes.failed,
            skipped = outcomes.skipped,
            blocked = outcomes.blocked,
            "Batch executed"
        );

        if outcomes.failed > 0 {
            deliver(
                self.notifier.as_ref(),
                Notification::new(
                    account_id,
                    NotificationKind::BatchFailure,
                    NotificationSeverity::Warning,
                    "Batch execution had failures",
                    format!(
                        "{} of {} changes failed to apply",
                        outcomes.failed,
                        decisions.len()
                    ),
                )
                .with_details(serde_json::json!({
                    "batch_id": batch_id,
                    "success": outcomes.success,
                    "failed": outcomes.failed,
                })),
            );
        }

        let emergency_stopped = self.should_stop(account_id, &outcomes, decisions.len());
        if emergency_stopped {
            self.emergency_stop(
                account_id,
                &format!(
                    "{} of {} changes failed in batch {batch_id}",
                    outcomes.failed,
                    decisions.len()
                ),
            );
        }

        let batch = ExecutionBatch {
            id: batch_id,
            account_id: account_id.to_string(),
            outcomes,
            result_ids,
            emergency_stopped,
            started_at: now,
            completed_at: Utc::now(),
        };
        self.audit.record_batch(batch.clone());
        batch
    }

    fn should_stop(&self, account_id: &str, outcomes: &OutcomeCounts, total: usize) -> bool {
        if outcomes.failed == 0 {
            return false;
        }
        let triggers = self.boundary(account_id).emergency_stop;
        if outcomes.failed >= triggers.max_batch_failures {
            return true;
        }
        total >= triggers.min_batch_size_for_ratio as usize
            && outcomes.failed as f64 / total as f64 >= triggers.max_batch_failure_ratio
    }

    // ─── Emergency stop ─────────────────────────────────────────────────

    pub fn emergency_stop(&self, account_id: &str, reason: &str) {
        {
            let mut config = self
                .configs
                .entry(account_id.to_string())
                .or_insert_with(|| self.defaults.config.clone());
            config.enabled = false;
            config.stop_reason = Some(reason.to_string());
        }
        warn!(account_id, reason, "Emergency stop");
        metrics::counter!("automation.emergency_stops").increment(1);
        deliver(
            self.notifier.as_ref(),
            Notification::new(
                account_id,
                NotificationKind::EmergencyStop,
                NotificationSeverity::Critical,
                "Automation emergency stop",
                reason,
            ),
        );
    }

    /// Re-enable automation after an emergency stop. Only ever called by an operator.
    pub fn resume_automation(&self, account_id: &str) {
        {
            let mut config = self
                .configs
                .entry(account_id.to_string())
                .or_insert_with(|| self.defaults.config.clone());
            config.enabled = true;
            config.stop_reason = None;
        }
        info!(account_id, "Automation resumed");
        deliver(
            self.notifier.as_ref(),
            Notification::new(
                account_id,
                NotificationKind::AutomationResumed,
                NotificationSeverity::Info,
                "Automation resumed",
                "Automated execution re-enabled",
            ),
        );
    }

    // ─── Counters & summaries ───────────────────────────────────────────

    /// Drop daily counters older than the retention window. Returns how many went.
    pub fn purge_stale_counters(&self, today: NaiveDate) -> usize {
        let cutoff = today - Duration::days(self.defaults.counter_retention_days);
        let before = self.counters.len();
        self.counters.retain(|(_, date, _), _| *date >= cutoff);
        before - self.counters.len()
    }

    /// Purge once per new day seen by `execute`.
    fn purge_on_rollover(&self, today: NaiveDate) {
        {
            let mut purged_on = self.purged_on.lock();
            if purged_on.is_some_and(|day| day >= today) {
                return;
            }
            *purged_on = Some(today);
        }
        let purged = self.purge_stale_counters(today);
        if purged > 0 {
            info!(%today, purged, "Stale daily counters purged");
        }
    }

    pub fn daily_summary(&self, account_id: &str, date: NaiveDate) -> DailySummary {
        let executions_by_type = ExecutionType::ALL
            .iter()
            .map(|t| (*t, self.daily_count(account_id, date, *t)))
            .filter(|(_, n)| *n > 0)
            .collect();
        DailySummary {
            account_id: account_id.to_string(),
            date,
            outcomes: self.audit.outcomes_on(account_id, date),
            executions_by_type,
        }
    }

    pub fn send_daily_summary(&self, account_id: &str, date: NaiveDate) -> DailySummary {
        let summary = self.daily_summary(account_id, date);
        let o = &summary.outcomes;
        deliver(
            self.notifier.as_ref(),
            Notification::new(
                account_id,
                NotificationKind::DailySummary,
                NotificationSeverity::Info,
                format!("Automation summary for {date}"),
                format!(
                    "{} applied, {} failed, {} skipped, {} blocked",
                    o.success, o.failed, o.skipped, o.blocked
                ),
            )
            .with_details(serde_json::to_value(&summary).unwrap_or_default()),
        );
        summary
    }

    // ─── Reverts ────────────────────────────────────────────────────────

    /// Submit the inverse of a successful execution through the normal gates.
    /// The original is marked `rolled_back` only if the revert applies.
    pub fn revert(&self, result_id: &Uuid, now: DateTime<Utc>) -> OptimizerResult<ExecutionResult> {
        let original = self
            .audit
            .get(result_id)
            .ok_or_else(|| OptimizerError::NotFound(format!("execution result {result_id}")))?;
        if original.status != ExecutionStatus::Success {
            return Err(OptimizerError::InvalidTransition(format!(
                "cannot revert a {} execution",
                original.status
            )));
        }
        if !original.execution_type.is_magnitude_bounded() {
            return Err(OptimizerError::InvalidTransition(format!(
                "{} executions cannot be reverted automatically",
                original.execution_type
            )));
        }

        let mut decision = ExecutionDecision::new(
            &original.account_id,
            &original.target_id,
            original.execution_type,
            original.new_value,
            original.previous_value,
            100.0,
        );
        decision.reasoning = format!("Rollback of execution {result_id}");

        let result = self.execute_at(&decision, now);
        if result.status == ExecutionStatus::Success {
            self.audit.mark_rolled_back(result_id, result.id)?;
        }
        Ok(result)
    }
}

fn tier_for(confidence: f64, config: &AutomationConfig) -> ExecutionTier {
    if confidence >= config.auto_execute_confidence {
        ExecutionTier::Auto
    } else if confidence >= config.supervised_confidence {
        ExecutionTier::Supervised
    } else {
        ExecutionTier::Manual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidopt_core::notify::{capture_notifier, CaptureNotifier};
    use bidopt_core::ports::RecordingAdPlatform;

    fn setup() -> (ExecutionController, Arc<RecordingAdPlatform>, Arc<CaptureNotifier>) {
        let platform = Arc::new(RecordingAdPlatform::new());
        let notifier = capture_notifier();
        let controller = ExecutionController::new(
            AutomationDefaults::default(),
            platform.clone(),
            notifier.clone(),
        );
        (controller, platform, notifier)
    }

    fn bid(target: &str, from: f64, to: f64, confidence: f64) -> ExecutionDecision {
        ExecutionDecision::new("acct-1", target, ExecutionType::BidAdjustment, from, to, confidence)
    }

    #[test]
    fn test_auto_execution_success() {
        let (c, platform, _) = setup();
        let r = c.execute(&bid("kw-1", 1.0, 1.2, 90.0));
        assert_eq!(r.status, ExecutionStatus::Success);
        assert_eq!(r.tier, Some(ExecutionTier::Auto));
        assert_eq!(platform.applied().len(), 1);
        assert_eq!(
            c.daily_count("acct-1", r.date(), ExecutionType::BidAdjustment),
            1
        );
    }

    #[test]
    fn test_tiers() {
        let (c, _, _) = setup();
        assert_eq!(
            c.execute(&bid("kw-1", 1.0, 1.1, 65.0)).tier,
            Some(ExecutionTier::Supervised)
        );
        let manual = c.execute(&bid("kw-2", 1.0, 1.1, 40.0));
        assert_eq!(manual.status, ExecutionStatus::Skipped);
        assert_eq!(manual.tier, Some(ExecutionTier::Manual));

        let mut cfg = c.config("acct-1");
        cfg.mode = AutomationMode::Approval;
        c.set_config("acct-1", cfg);
        assert_eq!(
            c.execute(&bid("kw-2", 1.0, 1.1, 40.0)).status,
            ExecutionStatus::Success
        );
    }

    #[test]
    fn test_boundary_checks() {
        let (c, platform, _) = setup();
        let too_big = c.execute(&bid("kw-1", 1.0, 1.6, 95.0));
        assert_eq!(too_big.status, ExecutionStatus::Blocked);
        assert!(too_big.reason.contains("exceeds 50%"));

        let too_low = c.execute(&bid("kw-1", 0.02, 0.015, 95.0));
        assert_eq!(too_low.status, ExecutionStatus::Blocked);

        // budget has its own 30% cap
        let budget = ExecutionDecision::new(
            "acct-1",
            "camp-1",
            ExecutionType::BudgetAdjustment,
            100.0,
            135.0,
            95.0,
        );
        let mut cfg = c.config("acct-1");
        cfg.enabled_types.insert(ExecutionType::BudgetAdjustment);
        c.set_config("acct-1", cfg);
        assert_eq!(c.execute(&budget).status, ExecutionStatus::Blocked);

        // pauses carry no magnitude cap
        let pause = ExecutionDecision::new("acct-1", "kw-9", ExecutionType::Pause, 1.0, 0.0, 95.0);
        assert_eq!(c.execute(&pause).status, ExecutionStatus::Success);
        assert_eq!(platform.applied().len(), 1);
    }

    #[test]
    fn test_disabled_type_blocked() {
        let (c, _, _) = setup();
        let placement = ExecutionDecision::new(
            "acct-1",
            "camp-1",
            ExecutionType::PlacementAdjustment,
            10.0,
            12.0,
            95.0,
        );
        let r = c.execute(&placement);
        assert_eq!(r.status, ExecutionStatus::Blocked);
        assert!(r.reason.contains("not enabled"));
    }

    #[test]
    fn test_daily_limit_resets_next_day() {
        let (c, _, _) = setup();
        let mut boundary = c.boundary("acct-1");
        boundary.max_daily_bid_adjustments = 2;
        c.set_boundary("acct-1", boundary).unwrap();

        let day1 = Utc::now();
        let statuses: Vec<_> = (0..4)
            .map(|i| c.execute_at(&bid(&format!("kw-{i}"), 1.0, 1.1, 90.0), day1).status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Success,
                ExecutionStatus::Success,
                ExecutionStatus::Blocked,
                ExecutionStatus::Blocked
            ]
        );

        let day2 = day1 + Duration::days(1);
        assert_eq!(
            c.execute_at(&bid("kw-5", 1.0, 1.1, 90.0), day2).status,
            ExecutionStatus::Success
        );
    }

    #[test]
    fn test_apply_retries_then_fails() {
        let (c, platform, notifier) = setup();
        platform.fail_for("kw-bad");
        let batch = c.execute_batch(
            "acct-1",
            &[bid("kw-bad", 1.0, 1.1, 90.0), bid("kw-ok", 1.0, 1.1, 90.0)],
        );
        assert_eq!(batch.outcomes.failed, 1);
        assert_eq!(batch.outcomes.success, 1);
        assert_eq!(platform.attempts("kw-bad"), 2);
        assert_eq!(notifier.count_kind(NotificationKind::BatchFailure), 1);
        // failed applies do not consume the daily cap
        assert_eq!(
            c.daily_count("acct-1", Utc::now().date_naive(), ExecutionType::BidAdjustment),
            1
        );
        assert!(!batch.emergency_stopped);
    }

    #[test]
    fn test_batch_failures_trigger_emergency_stop() {
        let (c, platform, notifier) = setup();
        let decisions: Vec<_> = (0..6)
            .map(|i| {
                let target = format!("kw-{i}");
                if i < 3 {
                    platform.fail_for(target.clone());
                }
                bid(&target, 1.0, 1.1, 90.0)
            })
            .collect();
        let batch = c.execute_batch("acct-1", &decisions);
        assert!(batch.emergency_stopped);
        assert!(!c.config("acct-1").enabled);
        assert_eq!(notifier.count_kind(NotificationKind::EmergencyStop), 1);

        let after = c.execute(&bid("kw-9", 1.0, 1.1, 90.0));
        assert_eq!(after.status, ExecutionStatus::Blocked);
        assert!(after.reason.contains("batch"));
    }

    #[test]
    fn test_emergency_stop_and_resume() {
        let (c, _, notifier) = setup();
        c.emergency_stop("acct-1", "runaway spend");
        assert_eq!(
            c.execute(&bid("kw-1", 1.0, 1.1, 90.0)).status,
            ExecutionStatus::Blocked
        );
        c.resume_automation("acct-1");
        assert_eq!(
            c.execute(&bid("kw-1", 1.0, 1.1, 90.0)).status,
            ExecutionStatus::Success
        );
        assert_eq!(notifier.count_kind(NotificationKind::EmergencyStop), 1);
        assert_eq!(notifier.count_kind(NotificationKind::AutomationResumed), 1);
    }

    #[test]
    fn test_purge_stale_counters() {
        let (c, _, _) = setup();
        let now = Utc::now();
        c.execute_at(&bid("kw-2", 1.0, 1.1, 90.0), now);
        // an older day seen after today does not trigger a purge on its own
        c.execute_at(&bid("kw-1", 1.0, 1.1, 90.0), now - Duration::days(10));
        assert_eq!(c.purge_stale_counters(now.date_naive()), 1);
        assert_eq!(
            c.daily_count("acct-1", now.date_naive(), ExecutionType::BidAdjustment),
            1
        );
    }

    #[test]
    fn test_single_executions_purge_on_day_rollover() {
        let (c, _, _) = setup();
        let now = Utc::now();
        let old = now - Duration::days(10);
        c.execute_at(&bid("kw-1", 1.0, 1.1, 90.0), old);
        assert_eq!(
            c.daily_count("acct-1", old.date_naive(), ExecutionType::BidAdjustment),
            1
        );

        c.execute_at(&bid("kw-2", 1.0, 1.1, 90.0), now);
        assert_eq!(
            c.daily_count("acct-1", old.date_naive(), ExecutionType::BidAdjustment),
            0
        );
        assert_eq!(
            c.daily_count("acct-1", now.date_naive(), ExecutionType::BidAdjustment),
            1
        );
        assert_eq!(c.purge_stale_counters(now.date_naive()), 0);
    }

    #[test]
    fn test_daily_summary_notification() {
        let (c, _, notifier) = setup();
        c.execute(&bid("kw-1", 1.0, 1.1, 90.0));
        c.execute(&bid("kw-2", 1.0, 1.1, 30.0));
        let summary = c.send_daily_summary("acct-1", Utc::now().date_naive());
        assert_eq!(summary.outcomes.success, 1);
        assert_eq!(summary.outcomes.skipped, 1);
        assert_eq!(summary.executions_by_type[&ExecutionType::BidAdjustment], 1);
        assert_eq!(notifier.count_kind(NotificationKind::DailySummary), 1);
    }

    #[test]
    fn test_revert() {
        let (c, platform, _) = setup();
        let original = c.execute(&bid("kw-1", 1.0, 1.3, 90.0));
        let revert = c.revert(&original.id, Utc::now()).unwrap();
        assert_eq!(revert.status, ExecutionStatus::Success);
        assert!((revert.new_value - 1.0).abs() < 1e-9);
        assert_eq!(
            c.audit().get(&original.id).unwrap().status,
            ExecutionStatus::RolledBack
        );
        assert_eq!(platform.applied().len(), 2);
        assert!(c.revert(&original.id, Utc::now()).is_err());
    }
}
