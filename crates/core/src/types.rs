use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One day (or other reporting bucket) of performance for a bid object at a
/// given bid. Immutable input to curve fitting and tree training.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSample {
    pub bid: f64,
    pub effective_cpc: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
    pub ctr: f64,
    pub cvr: f64,
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

impl PerformanceSample {
    /// Build a sample from raw counters, deriving CPC, CTR and CVR.
    pub fn from_counts(
        bid: f64,
        impressions: u64,
        clicks: u64,
        spend: f64,
        sales: f64,
        orders: u64,
    ) -> Self {
        Self {
            bid,
            effective_cpc: ratio(spend, clicks as f64),
            impressions,
            clicks,
            spend,
            sales,
            orders,
            ctr: ratio(clicks as f64, impressions as f64),
            cvr: ratio(orders as f64, clicks as f64),
            date: None,
        }
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Keyword,
    ProductTarget,
    SearchTerm,
    Campaign,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keyword => write!(f, "keyword"),
            Self::ProductTarget => write!(f, "product_target"),
            Self::SearchTerm => write!(f, "search_term"),
            Self::Campaign => write!(f, "campaign"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Phrase,
    Broad,
    Auto,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Phrase => "phrase",
            Self::Broad => "broad",
            Self::Auto => "auto",
        }
    }
}

/// Aggregated current state of one bid object, as handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub account_id: String,
    pub campaign_id: String,
    pub target_id: String,
    pub target_type: TargetType,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub match_type: Option<MatchType>,
    pub current_bid: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub sales: f64,
    pub orders: u64,
}

impl TargetSnapshot {
    /// Advertising cost of sales as a fraction. `None` when there are no sales.
    pub fn acos(&self) -> Option<f64> {
        (self.sales > 0.0).then(|| self.spend / self.sales)
    }

    pub fn roas(&self) -> f64 {
        ratio(self.sales, self.spend)
    }

    pub fn cvr(&self) -> f64 {
        ratio(self.orders as f64, self.clicks as f64)
    }

    pub fn cpc(&self) -> f64 {
        ratio(self.spend, self.clicks as f64)
    }

    pub fn ctr(&self) -> f64 {
        ratio(self.clicks as f64, self.impressions as f64)
    }

    pub fn aov(&self) -> f64 {
        ratio(self.sales, self.orders as f64)
    }
}

/// Which estimator produced a suggestion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmSource {
    DecisionTree,
    MarketCurve,
    RuleBased,
    Bandit,
}

impl std::fmt::Display for AlgorithmSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecisionTree => write!(f, "decision_tree"),
            Self::MarketCurve => write!(f, "market_curve"),
            Self::RuleBased => write!(f, "rule_based"),
            Self::Bandit => write!(f, "bandit"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionType {
    Maintain,
    BidIncrease,
    BidDecrease,
    Pause,
    NegativeKeyword,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Projected effect of applying a suggestion over the sample period.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpectedImpact {
    pub spend_change: f64,
    pub sales_change: f64,
    pub profit_change: f64,
}

/// A single, ephemeral recommendation for one bid object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub id: Uuid,
    pub account_id: String,
    pub target_id: String,
    pub target_type: TargetType,
    pub suggestion_type: SuggestionType,
    pub current_value: f64,
    pub suggested_value: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub priority: Priority,
    pub reasoning: String,
    pub algorithm_source: AlgorithmSource,
    pub expected_impact: ExpectedImpact,
    pub created_at: DateTime<Utc>,
}

impl OptimizationSuggestion {
    /// Signed change relative to the current value, in percent.
    pub fn change_percent(&self) -> f64 {
        if self.current_value.abs() < f64::EPSILON {
            0.0
        } else {
            (self.suggested_value - self.current_value) / self.current_value * 100.0
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self.suggestion_type, SuggestionType::Maintain)
    }
}

/// Kinds of change the execution controller can apply to the ad platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    BidAdjustment,
    BudgetAdjustment,
    PlacementAdjustment,
    NegativeKeyword,
    Pause,
}

impl ExecutionType {
    pub const ALL: [ExecutionType; 5] = [
        ExecutionType::BidAdjustment,
        ExecutionType::BudgetAdjustment,
        ExecutionType::PlacementAdjustment,
        ExecutionType::NegativeKeyword,
        ExecutionType::Pause,
    ];

    /// Whether the safety boundary's percentage-change cap applies.
    pub fn is_magnitude_bounded(&self) -> bool {
        matches!(
            self,
            Self::BidAdjustment | Self::BudgetAdjustment | Self::PlacementAdjustment
        )
    }
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BidAdjustment => write!(f, "bid_adjustment"),
            Self::BudgetAdjustment => write!(f, "budget_adjustment"),
            Self::PlacementAdjustment => write!(f, "placement_adjustment"),
            Self::NegativeKeyword => write!(f, "negative_keyword"),
            Self::Pause => write!(f, "pause"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(spend: f64, sales: f64) -> TargetSnapshot {
        TargetSnapshot {
            account_id: "acct-1".into(),
            campaign_id: "camp-1".into(),
            target_id: "kw-1".into(),
            target_type: TargetType::Keyword,
            text: Some("running shoes".into()),
            match_type: Some(MatchType::Exact),
            current_bid: 1.0,
            impressions: 1000,
            clicks: 40,
            spend,
            sales,
            orders: 4,
        }
    }

    #[test]
    fn test_snapshot_ratios() {
        let s = snapshot(20.0, 100.0);
        assert!((s.acos().unwrap() - 0.2).abs() < 1e-9);
        assert!((s.roas() - 5.0).abs() < 1e-9);
        assert!((s.cvr() - 0.1).abs() < 1e-9);
        assert!((s.cpc() - 0.5).abs() < 1e-9);
        assert!((s.aov() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_acos_without_sales() {
        assert!(snapshot(20.0, 0.0).acos().is_none());
    }

    #[test]
    fn test_sample_from_counts() {
        let s = PerformanceSample::from_counts(1.0, 1000, 20, 18.0, 90.0, 2);
        assert!((s.ctr - 0.02).abs() < 1e-9);
        assert!((s.cvr - 0.1).abs() < 1e-9);
        assert!((s.effective_cpc - 0.9).abs() < 1e-9);

        let empty = PerformanceSample::from_counts(1.0, 0, 0, 0.0, 0.0, 0);
        assert_eq!(empty.ctr, 0.0);
        assert_eq!(empty.effective_cpc, 0.0);
    }

    #[test]
    fn test_execution_type_serde() {
        let json = serde_json::to_string(&ExecutionType::BidAdjustment).unwrap();
        assert_eq!(json, "\"bid_adjustment\"");
        assert!(ExecutionType::BudgetAdjustment.is_magnitude_bounded());
        assert!(!ExecutionType::NegativeKeyword.is_magnitude_bounded());
    }
}
