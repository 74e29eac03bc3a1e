//! Post-hoc rollback evaluation of applied adjustments.
//!
//! Each applied adjustment carries an estimated profit change and the actual
//! profit measured 7, 14 and 30 days later. Rules compare the two and raise
//! rollback suggestions, which an operator approves or rejects. Approved ones
//! are executed through the controller like any other change.

use std::sync::Arc;

use bidopt_core::config::RollbackConfig;
use bidopt_core::error::{OptimizerError, OptimizerResult};
use bidopt_core::notify::{
    deliver, Notification, NotificationKind, NotificationSeverity, NotificationSink,
};
use bidopt_core::types::ExecutionType;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::audit::{ExecutionResult, ExecutionStatus};
use crate::controller::ExecutionController;

/// Tracking horizons in days, shallowest first.
pub const TRACKING_WINDOWS: [u32; 3] = [7, 14, 30];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    /// Id of the execution result that applied the change.
    pub id: Uuid,
    pub account_id: String,
    pub target_id: String,
    pub execution_type: ExecutionType,
    pub previous_value: f64,
    pub new_value: f64,
    pub estimated_profit_change: f64,
    pub actual_profit_7d: Option<f64>,
    pub actual_profit_14d: Option<f64>,
    pub actual_profit_30d: Option<f64>,
    pub applied_at: DateTime<Utc>,
}

impl AppliedAdjustment {
    pub fn from_result(result: &ExecutionResult, estimated_profit_change: f64) -> Self {
        Self {
            id: result.id,
            account_id: result.account_id.clone(),
            target_id: result.target_id.clone(),
            execution_type: result.execution_type,
            previous_value: result.previous_value,
            new_value: result.new_value,
            estimated_profit_change,
            actual_profit_7d: None,
            actual_profit_14d: None,
            actual_profit_30d: None,
            applied_at: result.executed_at,
        }
    }

    pub fn actual_profit(&self, window_days: u32) -> Option<f64> {
        match window_days {
            7 => self.actual_profit_7d,
            14 => self.actual_profit_14d,
            30 => self.actual_profit_30d,
            _ => None,
        }
    }

    fn set_actual_profit(&mut self, window_days: u32, value: f64) -> OptimizerResult<()> {
        let slot = match window_days {
            7 => &mut self.actual_profit_7d,
            14 => &mut self.actual_profit_14d,
            30 => &mut self.actual_profit_30d,
            other => {
                return Err(OptimizerError::Config(format!(
                    "unsupported tracking window {other}d"
                )))
            }
        };
        *slot = Some(value);
        Ok(())
    }

    pub fn is_increase(&self) -> bool {
        self.new_value > self.previous_value
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentDirection {
    #[default]
    Any,
    IncreasesOnly,
    DecreasesOnly,
}

impl AdjustmentDirection {
    fn admits(&self, adjustment: &AppliedAdjustment) -> bool {
        match self {
            Self::Any => true,
            Self::IncreasesOnly => adjustment.is_increase(),
            Self::DecreasesOnly => !adjustment.is_increase(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRule {
    pub id: Uuid,
    pub account_id: String,
    pub name: String,
    pub enabled: bool,
    /// Suggest a rollback when realized profit is below this percent of the estimate.
    pub threshold_percent: f64,
    pub min_tracking_days: u32,
    pub direction: AdjustmentDirection,
}

impl RollbackRule {
    pub fn new(
        account_id: impl Into<String>,
        name: impl Into<String>,
        threshold_percent: f64,
        min_tracking_days: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            name: name.into(),
            enabled: true,
            threshold_percent,
            min_tracking_days,
            direction: AdjustmentDirection::Any,
        }
    }

    /// Deepest tracking window not beyond `min_tracking_days`.
    pub fn tracking_window(&self) -> Option<u32> {
        TRACKING_WINDOWS
            .iter()
            .rev()
            .copied()
            .find(|w| *w <= self.min_tracking_days)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    /// Closed because another suggestion already reverted the adjustment.
    Superseded,
}

impl RollbackStatus {
    pub fn can_transition_to(self, next: RollbackStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Executed)
        )
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSuggestion {
    pub id: Uuid,
    pub account_id: String,
    pub adjustment_id: Uuid,
    pub rule_id: Uuid,
    pub target_id: String,
    pub tracking_days: u32,
    pub estimated_profit: f64,
    pub actual_profit: f64,
    pub profit_difference_percent: f64,
    pub reason: String,
    pub status: RollbackStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub revert_result_id: Option<Uuid>,
}

/// Realized profit as a percent of the estimate, and whether it warrants a
/// rollback against `threshold`.
///
/// * estimate > 0: `actual / estimate * 100`, triggering below the threshold.
/// * estimate == 0: triggers only on a realized loss, reported as -100%.
/// * estimate < 0: 100% when the loss matches the estimate, scaled by how far
///   actual lands from it; a break-even-or-better outcome never triggers.
pub fn profit_difference(estimated: f64, actual: f64, threshold: f64) -> (f64, bool) {
    if estimated > 0.0 {
        let pct = actual / estimated * 100.0;
        (pct, pct < threshold)
    } else if estimated == 0.0 {
        if actual < 0.0 {
            (-100.0, true)
        } else {
            (100.0, false)
        }
    } else {
        let pct = 100.0 + (actual - estimated) / estimated.abs() * 100.0;
        (pct, actual < 0.0 && pct < threshold)
    }
}

/// `None` when the rule is disabled, the tracking value is not yet measured,
/// the direction filter excludes the adjustment, or profit is on track.
pub fn evaluate_adjustment(
    adjustment: &AppliedAdjustment,
    rule: &RollbackRule,
    now: DateTime<Utc>,
) -> Option<RollbackSuggestion> {
    if !rule.enabled {
        return None;
    }
    let window = rule.tracking_window()?;
    let actual = adjustment.actual_profit(window)?;
    if !rule.direction.admits(adjustment) {
        return None;
    }

    let estimated = adjustment.estimated_profit_change;
    let (pct, triggered) = profit_difference(estimated, actual, rule.threshold_percent);
    if !triggered {
        return None;
    }

    Some(RollbackSuggestion {
        id: Uuid::new_v4(),
        account_id: adjustment.account_id.clone(),
        adjustment_id: adjustment.id,
        rule_id: rule.id,
        target_id: adjustment.target_id.clone(),
        tracking_days: window,
        estimated_profit: estimated,
        actual_profit: actual,
        profit_difference_percent: pct,
        reason: format!(
            "{}: {window}-day profit {actual:.2} is {pct:.0}% of estimated {estimated:.2} (threshold {:.0}%)",
            rule.name, rule.threshold_percent
        ),
        status: RollbackStatus::Pending,
        created_at: now,
        resolved_at: None,
        revert_result_id: None,
    })
}

pub struct RollbackManager {
    config: RollbackConfig,
    controller: Arc<ExecutionController>,
    notifier: Arc<dyn NotificationSink>,
    rules: DashMap<Uuid, RollbackRule>,
    adjustments: DashMap<Uuid, AppliedAdjustment>,
    suggestions: DashMap<Uuid, RollbackSuggestion>,
}

impl RollbackManager {
    pub fn new(
        config: RollbackConfig,
        controller: Arc<ExecutionController>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            controller,
            notifier,
            rules: DashMap::new(),
            adjustments: DashMap::new(),
            suggestions: DashMap::new(),
        }
    }

    pub fn add_rule(&self, rule: RollbackRule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn remove_rule(&self, rule_id: &Uuid) -> Option<RollbackRule> {
        self.rules.remove(rule_id).map(|(_, r)| r)
    }

    pub fn rules_for(&self, account_id: &str) -> Vec<RollbackRule> {
        self.rules
            .iter()
            .filter(|r| r.account_id == account_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Start tracking a successful execution.
    pub fn track(&self, result: &ExecutionResult, estimated_profit_change: f64) -> OptimizerResult<()> {
        if result.status != ExecutionStatus::Success {
            return Err(OptimizerError::InvalidTransition(format!(
                "only successful executions are tracked, got {}",
                result.status
            )));
        }
        self.adjustments.insert(
            result.id,
            AppliedAdjustment::from_result(result, estimated_profit_change),
        );
        Ok(())
    }

    pub fn record_actual_profit(
        &self,
        adjustment_id: &Uuid,
        window_days: u32,
        profit: f64,
    ) -> OptimizerResult<()> {
        self.adjustments
            .get_mut(adjustment_id)
            .ok_or_else(|| OptimizerError::NotFound(format!("adjustment {adjustment_id}")))?
            .set_actual_profit(window_days, profit)
    }

    /// Evaluate every tracked adjustment of the account against its enabled
    /// rules. Returns the newly raised suggestions.
    pub fn evaluate_all(&self, account_id: &str, now: DateTime<Utc>) -> Vec<RollbackSuggestion> {
        let rules = self.rules_for(account_id);
        let adjustments: Vec<AppliedAdjustment> = self
            .adjustments
            .iter()
            .filter(|a| a.account_id == account_id)
            .map(|a| a.value().clone())
            .collect();

        let mut raised = Vec::new();
        for adjustment in &adjustments {
            for rule in &rules {
                if self.has_open(adjustment.id, rule.id) {
                    continue;
                }
                let Some(suggestion) = evaluate_adjustment(adjustment, rule, now) else {
                    continue;
                };
                info!(
                    account_id,
                    target_id = %suggestion.target_id,
                    rule = %rule.name,
                    profit_difference_percent = suggestion.profit_difference_percent,
                    "Rollback suggested"
                );
                metrics::counter!("rollback.suggestions.raised").increment(1);
                deliver(
                    self.notifier.as_ref(),
                    Notification::new(
                        account_id,
                        NotificationKind::RollbackTriggered,
                        NotificationSeverity::Warning,
                        format!("Rollback suggested for {}", suggestion.target_id),
                        suggestion.reason.clone(),
                    )
                    .with_details(serde_json::json!({
                        "suggestion_id": suggestion.id,
                        "adjustment_id": suggestion.adjustment_id,
                        "rule_id": suggestion.rule_id,
                    })),
                );
                self.suggestions.insert(suggestion.id, suggestion.clone());
                raised.push(suggestion);
            }
        }
        raised
    }

    fn has_open(&self, adjustment_id: Uuid, rule_id: Uuid) -> bool {
        self.suggestions.iter().any(|s| {
            s.adjustment_id == adjustment_id && s.rule_id == rule_id && s.status.is_open()
        })
    }

    /// Close every other open suggestion for an adjustment that has just been
    /// reverted.
    fn supersede_open(&self, adjustment_id: Uuid, executed_id: Uuid, now: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for mut s in self.suggestions.iter_mut() {
            if s.id != executed_id && s.adjustment_id == adjustment_id && s.status.is_open() {
                s.status = RollbackStatus::Superseded;
                s.resolved_at = Some(now);
                closed += 1;
            }
        }
        closed
    }

    pub fn get(&self, id: &Uuid) -> Option<RollbackSuggestion> {
        self.suggestions.get(id).map(|s| s.clone())
    }

    pub fn pending(&self, account_id: &str) -> Vec<RollbackSuggestion> {
        let mut pending: Vec<_> = self
            .suggestions
            .iter()
            .filter(|s| s.account_id == account_id && s.status == RollbackStatus::Pending)
            .map(|s| s.value().clone())
            .collect();
        pending.sort_by_key(|s| s.created_at);
        pending
    }

    pub fn approve(&self, id: &Uuid, now: DateTime<Utc>) -> OptimizerResult<RollbackSuggestion> {
        self.transition(id, RollbackStatus::Approved, now)
    }

    pub fn reject(&self, id: &Uuid, now: DateTime<Utc>) -> OptimizerResult<RollbackSuggestion> {
        self.transition(id, RollbackStatus::Rejected, now)
    }

    fn transition(
        &self,
        id: &Uuid,
        next: RollbackStatus,
        now: DateTime<Utc>,
    ) -> OptimizerResult<RollbackSuggestion> {
        let mut suggestion = self
            .suggestions
            .get_mut(id)
            .ok_or_else(|| OptimizerError::NotFound(format!("rollback suggestion {id}")))?;
        if !suggestion.status.can_transition_to(next) {
            return Err(OptimizerError::InvalidTransition(format!(
                "{:?} -> {next:?} for rollback suggestion {id}",
                suggestion.status
            )));
        }
        suggestion.status = next;
        suggestion.resolved_at = Some(now);
        Ok(suggestion.clone())
    }

    /// Revert an approved suggestion's adjustment through the controller. A
    /// revert the controller does not apply leaves the suggestion approved.
    pub fn execute(&self, id: &Uuid, now: DateTime<Utc>) -> OptimizerResult<ExecutionResult> {
        let suggestion = self
            .get(id)
            .ok_or_else(|| OptimizerError::NotFound(format!("rollback suggestion {id}")))?;
        if suggestion.status != RollbackStatus::Approved {
            return Err(OptimizerError::InvalidTransition(format!(
                "{:?} rollback suggestion {id} cannot be executed",
                suggestion.status
            )));
        }

        let result = self.controller.revert(&suggestion.adjustment_id, now)?;
        if result.status == ExecutionStatus::Success {
            let mut stored = self.transition(id, RollbackStatus::Executed, now)?;
            stored.revert_result_id = Some(result.id);
            self.suggestions.insert(stored.id, stored);
            self.adjustments.remove(&suggestion.adjustment_id);
            let superseded = self.supersede_open(suggestion.adjustment_id, *id, now);
            info!(
                account_id = %suggestion.account_id,
                target_id = %suggestion.target_id,
                revert_result_id = %result.id,
                superseded,
                "Rollback executed"
            );
        }
        Ok(result)
    }

    /// Drop resolved suggestions older than the retention window. Pending ones
    /// are kept regardless of age.
    pub fn purge_resolved(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(self.config.retention_days);
        let before = self.suggestions.len();
        self.suggestions.retain(|_, s| {
            !(s.status.is_resolved() && s.resolved_at.is_some_and(|at| at < cutoff))
        });
        before - self.suggestions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidopt_core::config::AutomationDefaults;
    use bidopt_core::notify::{capture_notifier, CaptureNotifier};
    use bidopt_core::ports::RecordingAdPlatform;
    use crate::controller::ExecutionDecision;

    fn adjustment(estimated: f64, actual_7d: Option<f64>) -> AppliedAdjustment {
        AppliedAdjustment {
            id: Uuid::new_v4(),
            account_id: "acct-1".into(),
            target_id: "kw-1".into(),
            execution_type: ExecutionType::BidAdjustment,
            previous_value: 1.0,
            new_value: 1.2,
            estimated_profit_change: estimated,
            actual_profit_7d: actual_7d,
            actual_profit_14d: None,
            actual_profit_30d: None,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_underperforming_adjustment_triggers() {
        let rule = RollbackRule::new("acct-1", "profit check", 50.0, 7);
        let s = evaluate_adjustment(&adjustment(100.0, Some(20.0)), &rule, Utc::now()).unwrap();
        assert!((s.profit_difference_percent - 20.0).abs() < 1e-9);
        assert_eq!(s.tracking_days, 7);
        assert_eq!(s.status, RollbackStatus::Pending);
    }

    #[test]
    fn test_no_suggestion_cases() {
        let now = Utc::now();
        let rule = RollbackRule::new("acct-1", "profit check", 50.0, 7);
        // on track
        assert!(evaluate_adjustment(&adjustment(100.0, Some(60.0)), &rule, now).is_none());
        // not yet measured
        assert!(evaluate_adjustment(&adjustment(100.0, None), &rule, now).is_none());
        // disabled
        let mut disabled = rule.clone();
        disabled.enabled = false;
        assert!(evaluate_adjustment(&adjustment(100.0, Some(20.0)), &disabled, now).is_none());
        // direction filter excludes an increase
        let mut decreases = rule.clone();
        decreases.direction = AdjustmentDirection::DecreasesOnly;
        assert!(evaluate_adjustment(&adjustment(100.0, Some(20.0)), &decreases, now).is_none());
        // window shorter than the shallowest horizon
        let short = RollbackRule::new("acct-1", "too early", 50.0, 3);
        assert!(evaluate_adjustment(&adjustment(100.0, Some(20.0)), &short, now).is_none());
    }

    #[test]
    fn test_deepest_window_is_used() {
        let rule = RollbackRule::new("acct-1", "month", 50.0, 20);
        assert_eq!(rule.tracking_window(), Some(14));
        let mut adj = adjustment(100.0, Some(90.0));
        assert!(evaluate_adjustment(&adj, &rule, Utc::now()).is_none());
        adj.actual_profit_14d = Some(10.0);
        let s = evaluate_adjustment(&adj, &rule, Utc::now()).unwrap();
        assert_eq!(s.tracking_days, 14);
    }

    #[test]
    fn test_zero_and_negative_estimates() {
        assert_eq!(profit_difference(0.0, -5.0, 50.0), (-100.0, true));
        assert!(!profit_difference(0.0, 5.0, 50.0).1);
        // loss twice as deep as estimated
        assert_eq!(profit_difference(-50.0, -100.0, 50.0), (0.0, true));
        // loss exactly as estimated
        assert_eq!(profit_difference(-50.0, -50.0, 50.0), (100.0, false));
        // break-even or better never triggers
        assert!(!profit_difference(-50.0, 0.0, 500.0).1);
    }

    fn manager() -> (RollbackManager, Arc<ExecutionController>, Arc<CaptureNotifier>) {
        let notifier = capture_notifier();
        let controller = Arc::new(ExecutionController::new(
            AutomationDefaults::default(),
            Arc::new(RecordingAdPlatform::new()),
            notifier.clone(),
        ));
        let manager = RollbackManager::new(
            RollbackConfig::default(),
            controller.clone(),
            notifier.clone(),
        );
        (manager, controller, notifier)
    }

    #[test]
    fn test_pending_suggestions_are_deduplicated() {
        let (m, controller, notifier) = manager();
        let applied = controller.execute(&ExecutionDecision::new(
            "acct-1",
            "kw-1",
            ExecutionType::BidAdjustment,
            1.0,
            1.2,
            90.0,
        ));
        m.track(&applied, 100.0).unwrap();
        m.record_actual_profit(&applied.id, 7, 10.0).unwrap();
        m.add_rule(RollbackRule::new("acct-1", "profit check", 50.0, 7));

        let now = Utc::now();
        assert_eq!(m.evaluate_all("acct-1", now).len(), 1);
        assert!(m.evaluate_all("acct-1", now).is_empty());
        assert_eq!(notifier.count_kind(NotificationKind::RollbackTriggered), 1);

        let id = m.pending("acct-1")[0].id;
        m.reject(&id, now).unwrap();
        // a rejected suggestion no longer blocks re-evaluation
        assert_eq!(m.evaluate_all("acct-1", now).len(), 1);
    }

    #[test]
    fn test_approved_suggestion_blocks_duplicates_until_executed() {
        let (m, controller, _) = manager();
        let applied = controller.execute(&ExecutionDecision::new(
            "acct-1",
            "kw-1",
            ExecutionType::BidAdjustment,
            1.0,
            1.2,
            90.0,
        ));
        m.track(&applied, 100.0).unwrap();
        m.record_actual_profit(&applied.id, 7, 10.0).unwrap();
        m.add_rule(RollbackRule::new("acct-1", "profit check", 50.0, 7));

        let now = Utc::now();
        let id = m.evaluate_all("acct-1", now)[0].id;
        m.approve(&id, now).unwrap();
        assert!(m.evaluate_all("acct-1", now).is_empty());

        m.execute(&id, now).unwrap();
        assert!(m.pending("acct-1").is_empty());
        assert!(m.evaluate_all("acct-1", now).is_empty());
    }

    #[test]
    fn test_executing_one_rule_supersedes_the_others() {
        let (m, controller, _) = manager();
        let applied = controller.execute(&ExecutionDecision::new(
            "acct-1",
            "kw-1",
            ExecutionType::BidAdjustment,
            1.0,
            1.2,
            90.0,
        ));
        m.track(&applied, 100.0).unwrap();
        m.record_actual_profit(&applied.id, 7, 10.0).unwrap();
        m.add_rule(RollbackRule::new("acct-1", "strict", 50.0, 7));
        m.add_rule(RollbackRule::new("acct-1", "lenient", 20.0, 7));

        let now = Utc::now();
        let raised = m.evaluate_all("acct-1", now);
        assert_eq!(raised.len(), 2);
        m.approve(&raised[0].id, now).unwrap();
        m.execute(&raised[0].id, now).unwrap();

        let other = m.get(&raised[1].id).unwrap();
        assert_eq!(other.status, RollbackStatus::Superseded);
        assert_eq!(other.resolved_at, Some(now));
        assert!(m.pending("acct-1").is_empty());
        assert!(m.approve(&raised[1].id, now).is_err());
    }

    #[test]
    fn test_status_transitions() {
        let (m, controller, _) = manager();
        let applied = controller.execute(&ExecutionDecision::new(
            "acct-1",
            "kw-1",
            ExecutionType::BidAdjustment,
            1.0,
            1.2,
            90.0,
        ));
        m.track(&applied, 100.0).unwrap();
        m.record_actual_profit(&applied.id, 7, 10.0).unwrap();
        m.add_rule(RollbackRule::new("acct-1", "profit check", 50.0, 7));
        let now = Utc::now();
        let id = m.evaluate_all("acct-1", now)[0].id;

        assert!(matches!(
            m.execute(&id, now),
            Err(OptimizerError::InvalidTransition(_))
        ));
        m.approve(&id, now).unwrap();
        assert!(m.reject(&id, now).is_err());

        let revert = m.execute(&id, now).unwrap();
        assert_eq!(revert.status, ExecutionStatus::Success);
        let stored = m.get(&id).unwrap();
        assert_eq!(stored.status, RollbackStatus::Executed);
        assert_eq!(stored.revert_result_id, Some(revert.id));
        assert_eq!(
            controller.audit().get(&applied.id).unwrap().status,
            ExecutionStatus::RolledBack
        );
    }

    #[test]
    fn test_record_actual_profit_errors() {
        let (m, _, _) = manager();
        assert!(matches!(
            m.record_actual_profit(&Uuid::new_v4(), 7, 1.0),
            Err(OptimizerError::NotFound(_))
        ));
    }

    #[test]
    fn test_purge_keeps_pending() {
        let (m, _, _) = manager();
        let now = Utc::now();
        let old = now - Duration::days(45);
        let mut pending = evaluate_adjustment(
            &adjustment(100.0, Some(10.0)),
            &RollbackRule::new("acct-1", "a", 50.0, 7),
            old,
        )
        .unwrap();
        let mut rejected = pending.clone();
        rejected.id = Uuid::new_v4();
        rejected.status = RollbackStatus::Rejected;
        rejected.resolved_at = Some(old);
        pending.resolved_at = None;
        m.suggestions.insert(pending.id, pending.clone());
        m.suggestions.insert(rejected.id, rejected);

        assert_eq!(m.purge_resolved(now), 1);
        assert!(m.get(&pending.id).is_some());
    }
}
