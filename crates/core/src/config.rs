use crate::types::ExecutionType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Root application configuration. Loaded from environment variables
/// with the prefix `BID_OPTIMIZER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub algorithms: AlgorithmParameters,
    #[serde(default)]
    pub automation: AutomationDefaults,
    #[serde(default)]
    pub rollback: RollbackConfig,
}

fn default_node_id() -> String {
    "optimizer-01".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            algorithms: AlgorithmParameters::default(),
            automation: AutomationDefaults::default(),
            rollback: RollbackConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("BID_OPTIMIZER")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

/// Tunables for every estimator. Nothing in the models hard-codes these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlgorithmParameters {
    #[serde(default)]
    pub curve: CurveConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub policy: PolicyThresholds,
}

// ─── Market Curve Config ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveConfig {
    #[serde(default = "default_min_bid")]
    pub min_bid: f64,
    #[serde(default = "default_max_bid_ceiling")]
    pub max_bid_ceiling: f64,
    #[serde(default = "default_grid_step")]
    pub grid_step: f64,
    #[serde(default = "default_golden_tolerance")]
    pub golden_tolerance: f64,
    #[serde(default = "default_golden_max_iterations")]
    pub golden_max_iterations: u32,
    #[serde(default = "default_profit_curve_points")]
    pub profit_curve_points: usize,
    /// Models below this confidence are not trusted by the engine.
    #[serde(default = "default_min_model_confidence")]
    pub min_model_confidence: f64,
    /// Largest bid change (percent) a curve-driven suggestion may imply.
    #[serde(default = "default_max_change_percent")]
    pub max_change_percent: f64,
}

fn default_min_bid() -> f64 {
    0.02
}
fn default_max_bid_ceiling() -> f64 {
    10.0
}
fn default_grid_step() -> f64 {
    0.05
}
fn default_golden_tolerance() -> f64 {
    0.001
}
fn default_golden_max_iterations() -> u32 {
    100
}
fn default_profit_curve_points() -> usize {
    50
}
fn default_min_model_confidence() -> f64 {
    0.7
}
fn default_max_change_percent() -> f64 {
    50.0
}

impl Default for CurveConfig {
    fn default() -> Self {
        Self {
            min_bid: default_min_bid(),
            max_bid_ceiling: default_max_bid_ceiling(),
            grid_step: default_grid_step(),
            golden_tolerance: default_golden_tolerance(),
            golden_max_iterations: default_golden_max_iterations(),
            profit_curve_points: default_profit_curve_points(),
            min_model_confidence: default_min_model_confidence(),
            max_change_percent: default_max_change_percent(),
        }
    }
}

// ─── Decision Tree Config ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
    #[serde(default = "default_min_variance")]
    pub min_variance: f64,
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,
    #[serde(default = "default_cr")]
    pub default_cr: f64,
    #[serde(default = "default_cv")]
    pub default_cv: f64,
}

fn default_max_depth() -> usize {
    6
}
fn default_min_samples_split() -> usize {
    10
}
fn default_min_samples_leaf() -> usize {
    5
}
fn default_min_variance() -> f64 {
    1e-4
}
fn default_min_training_samples() -> usize {
    20
}
fn default_cr() -> f64 {
    0.05
}
fn default_cv() -> f64 {
    30.0
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            min_samples_split: default_min_samples_split(),
            min_samples_leaf: default_min_samples_leaf(),
            min_variance: default_min_variance(),
            min_training_samples: default_min_training_samples(),
            default_cr: default_cr(),
            default_cv: default_cv(),
        }
    }
}

// ─── Bandit Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Below this many clicks a target is in the explore regime.
    #[serde(default = "default_explore_clicks")]
    pub explore_clicks: u64,
    /// At or above this many clicks a target is in the exploit regime.
    #[serde(default = "default_exploit_clicks")]
    pub exploit_clicks: u64,
    #[serde(default = "default_exploration_factor")]
    pub exploration_factor: f64,
    #[serde(default = "default_explore_confidence")]
    pub explore_confidence: f64,
    #[serde(default = "default_exploit_max_confidence")]
    pub exploit_max_confidence: f64,
    #[serde(default = "default_max_explore_increase")]
    pub max_explore_increase: f64,
    #[serde(default = "default_max_exploit_increase")]
    pub max_exploit_increase: f64,
    #[serde(default = "default_min_bid_factor")]
    pub min_bid_factor: f64,
    #[serde(default = "default_max_bid_factor")]
    pub max_bid_factor: f64,
}

fn default_explore_clicks() -> u64 {
    10
}
fn default_exploit_clicks() -> u64 {
    50
}
fn default_exploration_factor() -> f64 {
    std::f64::consts::SQRT_2
}
fn default_explore_confidence() -> f64 {
    0.3
}
fn default_exploit_max_confidence() -> f64 {
    0.95
}
fn default_max_explore_increase() -> f64 {
    0.10
}
fn default_max_exploit_increase() -> f64 {
    0.20
}
fn default_min_bid_factor() -> f64 {
    0.7
}
fn default_max_bid_factor() -> f64 {
    1.3
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            explore_clicks: default_explore_clicks(),
            exploit_clicks: default_exploit_clicks(),
            exploration_factor: default_exploration_factor(),
            explore_confidence: default_explore_confidence(),
            exploit_max_confidence: default_exploit_max_confidence(),
            max_explore_increase: default_max_explore_increase(),
            max_exploit_increase: default_max_exploit_increase(),
            min_bid_factor: default_min_bid_factor(),
            max_bid_factor: default_max_bid_factor(),
        }
    }
}

// ─── Policy Thresholds ──────────────────────────────────────────────────────

/// Cut points and step sizes for the hand-authored search-ad policy.
/// ACoS values are fractions (0.20 == 20%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyThresholds {
    #[serde(default = "default_min_clicks")]
    pub min_clicks: u64,
    #[serde(default = "default_pause_clicks")]
    pub pause_clicks: u64,
    #[serde(default = "default_low_acos")]
    pub low_acos: f64,
    #[serde(default = "default_target_acos")]
    pub target_acos: f64,
    #[serde(default = "default_high_acos")]
    pub high_acos: f64,
    #[serde(default = "default_increase_percent")]
    pub increase_percent: f64,
    #[serde(default = "default_no_order_decrease_percent")]
    pub no_order_decrease_percent: f64,
    #[serde(default = "default_decrease_percent")]
    pub decrease_percent: f64,
    #[serde(default = "default_critical_decrease_percent")]
    pub critical_decrease_percent: f64,
}

fn default_min_clicks() -> u64 {
    10
}
fn default_pause_clicks() -> u64 {
    30
}
fn default_low_acos() -> f64 {
    0.20
}
fn default_target_acos() -> f64 {
    0.35
}
fn default_high_acos() -> f64 {
    0.50
}
fn default_increase_percent() -> f64 {
    15.0
}
fn default_no_order_decrease_percent() -> f64 {
    20.0
}
fn default_decrease_percent() -> f64 {
    15.0
}
fn default_critical_decrease_percent() -> f64 {
    30.0
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            min_clicks: default_min_clicks(),
            pause_clicks: default_pause_clicks(),
            low_acos: default_low_acos(),
            target_acos: default_target_acos(),
            high_acos: default_high_acos(),
            increase_percent: default_increase_percent(),
            no_order_decrease_percent: default_no_order_decrease_percent(),
            decrease_percent: default_decrease_percent(),
            critical_decrease_percent: default_critical_decrease_percent(),
        }
    }
}

// ─── Safety Boundary / Automation Config ────────────────────────────────────

/// Per-account limits gating automatic execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyBoundary {
    pub max_bid_change_percent: f64,
    pub max_budget_change_percent: f64,
    pub max_placement_change_percent: f64,
    pub max_daily_bid_adjustments: u32,
    pub max_daily_budget_adjustments: u32,
    pub max_daily_placement_adjustments: u32,
    pub max_daily_negative_keywords: u32,
    pub max_daily_pauses: u32,
    pub min_bid: f64,
    pub max_bid: f64,
    pub emergency_stop: EmergencyStopTriggers,
}

impl SafetyBoundary {
    pub fn max_change_percent(&self, execution_type: ExecutionType) -> Option<f64> {
        match execution_type {
            ExecutionType::BidAdjustment => Some(self.max_bid_change_percent),
            ExecutionType::BudgetAdjustment => Some(self.max_budget_change_percent),
            ExecutionType::PlacementAdjustment => Some(self.max_placement_change_percent),
            ExecutionType::NegativeKeyword | ExecutionType::Pause => None,
        }
    }

    pub fn daily_limit(&self, execution_type: ExecutionType) -> u32 {
        match execution_type {
            ExecutionType::BidAdjustment => self.max_daily_bid_adjustments,
            ExecutionType::BudgetAdjustment => self.max_daily_budget_adjustments,
            ExecutionType::PlacementAdjustment => self.max_daily_placement_adjustments,
            ExecutionType::NegativeKeyword => self.max_daily_negative_keywords,
            ExecutionType::Pause => self.max_daily_pauses,
        }
    }
}

impl Default for SafetyBoundary {
    fn default() -> Self {
        Self {
            max_bid_change_percent: 50.0,
            max_budget_change_percent: 30.0,
            max_placement_change_percent: 50.0,
            max_daily_bid_adjustments: 100,
            max_daily_budget_adjustments: 10,
            max_daily_placement_adjustments: 20,
            max_daily_negative_keywords: 50,
            max_daily_pauses: 20,
            min_bid: 0.02,
            max_bid: 100.0,
            emergency_stop: EmergencyStopTriggers::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmergencyStopTriggers {
    /// A batch with at least this many failed items stops the account.
    pub max_batch_failures: u32,
    /// A batch whose failure ratio reaches this value stops the account.
    pub max_batch_failure_ratio: f64,
    /// The ratio trigger ignores batches smaller than this.
    pub min_batch_size_for_ratio: u32,
}

impl Default for EmergencyStopTriggers {
    fn default() -> Self {
        Self {
            max_batch_failures: 10,
            max_batch_failure_ratio: 0.5,
            min_batch_size_for_ratio: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    /// Low-confidence decisions are skipped.
    #[default]
    Automatic,
    /// Decisions were reviewed by an operator, so low-confidence ones proceed.
    Approval,
}

/// Per-account automation switchboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationConfig {
    pub enabled: bool,
    pub mode: AutomationMode,
    pub enabled_types: HashSet<ExecutionType>,
    /// Confidence (0–100) at or above which decisions run unattended.
    pub auto_execute_confidence: f64,
    /// Confidence (0–100) at or above which decisions run under supervision.
    pub supervised_confidence: f64,
    pub stop_reason: Option<String>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AutomationMode::Automatic,
            enabled_types: [
                ExecutionType::BidAdjustment,
                ExecutionType::NegativeKeyword,
                ExecutionType::Pause,
            ]
            .into_iter()
            .collect(),
            auto_execute_confidence: 80.0,
            supervised_confidence: 60.0,
            stop_reason: None,
        }
    }
}

/// Seed values applied lazily to accounts without stored configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationDefaults {
    #[serde(default)]
    pub boundary: SafetyBoundary,
    #[serde(default)]
    pub config: AutomationConfig,
    #[serde(default = "default_counter_retention_days")]
    pub counter_retention_days: i64,
    #[serde(default = "default_apply_attempts")]
    pub apply_attempts: u32,
}

fn default_counter_retention_days() -> i64 {
    7
}
fn default_apply_attempts() -> u32 {
    2
}

impl Default for AutomationDefaults {
    fn default() -> Self {
        Self {
            boundary: SafetyBoundary::default(),
            config: AutomationConfig::default(),
            counter_retention_days: default_counter_retention_days(),
            apply_attempts: default_apply_attempts(),
        }
    }
}

// ─── Rollback Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RollbackConfig {
    /// Resolved (approved/rejected) suggestions older than this are purged.
    #[serde(default = "default_rollback_retention_days")]
    pub retention_days: i64,
}

fn default_rollback_retention_days() -> i64 {
    30
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            retention_days: default_rollback_retention_days(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.algorithms.tree.max_depth, 6);
        assert_eq!(cfg.algorithms.curve.min_model_confidence, 0.7);
        assert_eq!(cfg.algorithms.bandit.explore_clicks, 10);
        assert_eq!(cfg.automation.config.auto_execute_confidence, 80.0);
        assert_eq!(cfg.automation.config.supervised_confidence, 60.0);
        assert_eq!(cfg.rollback.retention_days, 30);
    }

    #[test]
    fn test_boundary_lookup_per_type() {
        let boundary = SafetyBoundary::default();
        assert_eq!(
            boundary.max_change_percent(ExecutionType::BudgetAdjustment),
            Some(30.0)
        );
        assert_eq!(boundary.max_change_percent(ExecutionType::Pause), None);
        assert_eq!(boundary.daily_limit(ExecutionType::BidAdjustment), 100);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let cfg: TreeConfig = serde_json::from_str(r#"{"max_depth": 3}"#).unwrap();
        assert_eq!(cfg.max_depth, 3);
        assert_eq!(cfg.min_samples_leaf, 5);
    }
}
