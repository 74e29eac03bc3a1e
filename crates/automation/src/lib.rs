//! Safety-gated execution of optimization suggestions: the execution
//! controller with its daily counters and audit trail, and the rollback
//! evaluator that watches applied adjustments afterwards.

pub mod audit;
pub mod controller;
pub mod rollback;

pub use audit::{AuditLog, ExecutionBatch, ExecutionResult, ExecutionStatus};
pub use controller::{ExecutionController, ExecutionDecision, ExecutionTier};
pub use rollback::{RollbackManager, RollbackRule, RollbackSuggestion};
