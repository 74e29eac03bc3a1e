//! Append-only audit trail of execution results and batches.
//!
//! Records are sequenced on append. A result's status is written once; the only
//! later transition is `success -> rolled_back`.

use bidopt_core::error::{OptimizerError, OptimizerResult};
use bidopt_core::types::ExecutionType;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::controller::ExecutionTier;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
    Blocked,
    RolledBack,
}

impl ExecutionStatus {
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        matches!((self, next), (Self::Success, Self::RolledBack))
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Blocked => write!(f, "blocked"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub sequence: u64,
    pub batch_id: Option<Uuid>,
    pub decision_id: Uuid,
    pub suggestion_id: Option<Uuid>,
    pub account_id: String,
    pub target_id: String,
    pub execution_type: ExecutionType,
    pub previous_value: f64,
    pub new_value: f64,
    /// Decision confidence on a 0–100 scale.
    pub confidence: f64,
    pub tier: Option<ExecutionTier>,
    pub status: ExecutionStatus,
    pub reason: String,
    pub attempts: u32,
    pub executed_at: DateTime<Utc>,
    /// Result of the revert that rolled this one back.
    pub rolled_back_by: Option<Uuid>,
}

impl ExecutionResult {
    pub fn date(&self) -> NaiveDate {
        self.executed_at.date_naive()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
    pub blocked: u32,
    pub rolled_back: u32,
}

impl OutcomeCounts {
    pub fn add(&mut self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Success => self.success += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Skipped => self.skipped += 1,
            ExecutionStatus::Blocked => self.blocked += 1,
            ExecutionStatus::RolledBack => self.rolled_back += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.success + self.failed + self.skipped + self.blocked + self.rolled_back
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub id: Uuid,
    pub account_id: String,
    pub outcomes: OutcomeCounts,
    pub result_ids: Vec<Uuid>,
    pub emergency_stopped: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionBatch {
    pub fn total(&self) -> usize {
        self.result_ids.len()
    }
}

pub struct AuditLog {
    results: DashMap<Uuid, ExecutionResult>,
    batches: DashMap<Uuid, ExecutionBatch>,
    sequence: parking_lot::Mutex<u64>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            results: DashMap::new(),
            batches: DashMap::new(),
            sequence: parking_lot::Mutex::new(0),
        }
    }

    /// Append a result, assigning the next sequence number.
    pub fn record(&self, mut result: ExecutionResult) -> ExecutionResult {
        let mut seq = self.sequence.lock();
        *seq += 1;
        result.sequence = *seq;
        self.results.insert(result.id, result.clone());
        drop(seq);
        info!(
            result_id = %result.id,
            sequence = result.sequence,
            account_id = %result.account_id,
            target_id = %result.target_id,
            execution_type = %result.execution_type,
            status = %result.status,
            reason = %result.reason,
            "Execution recorded"
        );
        result
    }

    pub fn record_batch(&self, batch: ExecutionBatch) {
        self.batches.insert(batch.id, batch);
    }

    pub fn get(&self, id: &Uuid) -> Option<ExecutionResult> {
        self.results.get(id).map(|r| r.clone())
    }

    pub fn batch(&self, id: &Uuid) -> Option<ExecutionBatch> {
        self.batches.get(id).map(|b| b.clone())
    }

    /// All results for an account in append order.
    pub fn results_for(&self, account_id: &str) -> Vec<ExecutionResult> {
        let mut results: Vec<_> = self
            .results
            .iter()
            .filter(|r| r.account_id == account_id)
            .map(|r| r.value().clone())
            .collect();
        results.sort_by_key(|r| r.sequence);
        results
    }

    pub fn batches_for(&self, account_id: &str) -> Vec<ExecutionBatch> {
        let mut batches: Vec<_> = self
            .batches
            .iter()
            .filter(|b| b.account_id == account_id)
            .map(|b| b.value().clone())
            .collect();
        batches.sort_by_key(|b| b.started_at);
        batches
    }

    pub fn outcomes_on(&self, account_id: &str, date: NaiveDate) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for r in self.results.iter() {
            if r.account_id == account_id && r.date() == date {
                counts.add(r.status);
            }
        }
        counts
    }

    pub fn mark_rolled_back(&self, id: &Uuid, revert_id: Uuid) -> OptimizerResult<()> {
        let mut result = self
            .results
            .get_mut(id)
            .ok_or_else(|| OptimizerError::NotFound(format!("execution result {id}")))?;
        if !result.status.can_transition_to(ExecutionStatus::RolledBack) {
            return Err(OptimizerError::InvalidTransition(format!(
                "{} -> rolled_back for {id}",
                result.status
            )));
        }
        result.status = ExecutionStatus::RolledBack;
        result.rolled_back_by = Some(revert_id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(account: &str, status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            id: Uuid::new_v4(),
            sequence: 0,
            batch_id: None,
            decision_id: Uuid::new_v4(),
            suggestion_id: None,
            account_id: account.into(),
            target_id: "kw-1".into(),
            execution_type: ExecutionType::BidAdjustment,
            previous_value: 1.0,
            new_value: 1.2,
            confidence: 90.0,
            tier: Some(ExecutionTier::Auto),
            status,
            reason: "test".into(),
            attempts: 1,
            executed_at: Utc::now(),
            rolled_back_by: None,
        }
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let log = AuditLog::new();
        let a = log.record(result("acct-1", ExecutionStatus::Success));
        let b = log.record(result("acct-2", ExecutionStatus::Blocked));
        let c = log.record(result("acct-1", ExecutionStatus::Failed));
        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));

        let mine = log.results_for("acct-1");
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, a.id);
        assert_eq!(mine[1].id, c.id);
    }

    #[test]
    fn test_only_success_can_roll_back() {
        let log = AuditLog::new();
        let ok = log.record(result("acct-1", ExecutionStatus::Success));
        let blocked = log.record(result("acct-1", ExecutionStatus::Blocked));
        let revert = Uuid::new_v4();

        log.mark_rolled_back(&ok.id, revert).unwrap();
        let stored = log.get(&ok.id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::RolledBack);
        assert_eq!(stored.rolled_back_by, Some(revert));

        assert!(matches!(
            log.mark_rolled_back(&ok.id, revert),
            Err(OptimizerError::InvalidTransition(_))
        ));
        assert!(matches!(
            log.mark_rolled_back(&blocked.id, revert),
            Err(OptimizerError::InvalidTransition(_))
        ));
        assert!(matches!(
            log.mark_rolled_back(&Uuid::new_v4(), revert),
            Err(OptimizerError::NotFound(_))
        ));
    }

    #[test]
    fn test_outcome_counts() {
        let log = AuditLog::new();
        for status in [
            ExecutionStatus::Success,
            ExecutionStatus::Success,
            ExecutionStatus::Skipped,
            ExecutionStatus::Blocked,
        ] {
            log.record(result("acct-1", status));
        }
        let counts = log.outcomes_on("acct-1", Utc::now().date_naive());
        assert_eq!(counts.success, 2);
        assert_eq!(counts.total(), 4);
    }
}
