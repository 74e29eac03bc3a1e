//! Search-ad optimization engine.
//!
//! Each target is run through the policy tree. Rule leaves become suggestions
//! directly; deferred targets try the market curve first, then the account's
//! decision trees, then the bandit.

use std::sync::Arc;

use bidopt_core::config::AlgorithmParameters;
use bidopt_core::error::OptimizerResult;
use bidopt_core::ports::{DateRange, SampleStore, TargetKey};
use bidopt_core::types::{
    AlgorithmSource, ExpectedImpact, OptimizationSuggestion, Priority, SuggestionType,
    TargetSnapshot, TargetType,
};
use bidopt_models::bandits::{calculate_ucb_bid_suggestion, BanditInput};
use bidopt_models::decision_tree::{
    KeywordFeatures, PredictionSource, TrainingReport, TrainingSample,
};
use bidopt_models::market_curve::{calculate_clicks, calculate_profit};
use bidopt_models::{BidArmTracker, DecisionTreeRegistry, MarketCurveStore};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::policy::{PolicyAction, PolicyTree};

/// Clicks scale with the square root of the bid ratio.
const CLICK_ELASTICITY: f64 = 0.5;

/// Changes smaller than this (percent) are reported as `Maintain`.
const MIN_MEANINGFUL_CHANGE: f64 = 1.0;

/// Per-call inputs that do not belong to a single target.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext {
    /// Clicks across every analyzed target; the bandit's total trial count.
    pub total_clicks: u64,
    pub target_roas: f64,
    pub range: DateRange,
}

impl AnalysisContext {
    pub fn for_targets(targets: &[TargetSnapshot], params: &AlgorithmParameters) -> Self {
        Self {
            total_clicks: targets.iter().map(|t| t.clicks).sum(),
            target_roas: target_roas(params),
            range: DateRange::default(),
        }
    }
}

/// ROAS implied by the middle of the deferral ACoS band.
fn target_roas(params: &AlgorithmParameters) -> f64 {
    let acos = (params.policy.low_acos + params.policy.target_acos) / 2.0;
    if acos > 0.0 {
        1.0 / acos
    } else {
        1.0
    }
}

pub struct OptimizationEngine {
    params: AlgorithmParameters,
    policy: PolicyTree,
    curves: Arc<MarketCurveStore>,
    trees: Arc<DecisionTreeRegistry>,
    arms: Arc<BidArmTracker>,
    samples: Arc<dyn SampleStore>,
}

impl OptimizationEngine {
    pub fn new(params: AlgorithmParameters, samples: Arc<dyn SampleStore>) -> Self {
        Self {
            policy: PolicyTree::search_ads(&params.policy),
            curves: Arc::new(MarketCurveStore::new(params.curve.clone())),
            trees: Arc::new(DecisionTreeRegistry::new(params.tree.clone())),
            arms: Arc::new(BidArmTracker::new(params.bandit.exploration_factor)),
            params,
            samples,
        }
    }

    pub fn curves(&self) -> &Arc<MarketCurveStore> {
        &self.curves
    }

    pub fn trees(&self) -> &Arc<DecisionTreeRegistry> {
        &self.trees
    }

    /// Per-target bid arms; rewards recorded here feed the bandit's variance term.
    pub fn arms(&self) -> &Arc<BidArmTracker> {
        &self.arms
    }

    pub fn policy(&self) -> &PolicyTree {
        &self.policy
    }

    /// Train and activate CR/CV trees for an account from its target snapshots.
    pub fn train_account_models(
        &self,
        account_id: &str,
        targets: &[TargetSnapshot],
    ) -> OptimizerResult<TrainingReport> {
        let samples: Vec<TrainingSample> = targets
            .iter()
            .filter(|t| t.account_id == account_id)
            .map(TrainingSample::from_snapshot)
            .collect();
        self.trees.train(account_id, &samples)
    }

    /// Analyze every target and rank the suggestions by priority, then by the
    /// size of the projected profit change.
    pub fn analyze_targets(&self, targets: &[TargetSnapshot]) -> Vec<OptimizationSuggestion> {
        let ctx = AnalysisContext::for_targets(targets, &self.params);
        let mut suggestions: Vec<_> = targets
            .iter()
            .map(|t| self.analyze_target(t, &ctx))
            .collect();
        suggestions.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                b.expected_impact
                    .profit_change
                    .abs()
                    .total_cmp(&a.expected_impact.profit_change.abs())
            })
        });
        metrics::counter!("engine.suggestions.generated").increment(suggestions.len() as u64);
        info!(
            targets = targets.len(),
            actionable = suggestions.iter().filter(|s| s.is_actionable()).count(),
            "Targets analyzed"
        );
        suggestions
    }

    pub fn analyze_target(
        &self,
        target: &TargetSnapshot,
        ctx: &AnalysisContext,
    ) -> OptimizationSuggestion {
        if !target.current_bid.is_finite() || target.current_bid <= 0.0 {
            warn!(
                target_id = %target.target_id,
                current_bid = target.current_bid,
                "Unusable current bid, target left unchanged"
            );
            metrics::counter!("engine.targets.invalid_bid").increment(1);
            return maintain(
                target,
                0.0,
                format!("Current bid {} is not a positive amount", target.current_bid),
                AlgorithmSource::RuleBased,
            )
            .into_suggestion(target);
        }

        let decision = self.policy.evaluate(target);
        debug!(
            target_id = %target.target_id,
            path = ?decision.path,
            "Policy evaluated"
        );

        if target.target_type == TargetType::SearchTerm {
            return self.search_term_suggestion(target, decision.action, &decision.reason);
        }

        let suggestion = match decision.action {
            PolicyAction::Maintain { confidence } => {
                maintain(target, confidence, decision.reason, AlgorithmSource::RuleBased)
            }
            PolicyAction::Pause { confidence } => Draft {
                suggestion_type: SuggestionType::Pause,
                suggested_value: 0.0,
                confidence,
                priority: Priority::High,
                reasoning: decision.reason,
                source: AlgorithmSource::RuleBased,
                impact: pause_impact(target),
            },
            PolicyAction::AdjustBid {
                percent,
                priority,
                confidence,
            } => {
                let new_bid = self.bounded_bid(target.current_bid * (1.0 + percent / 100.0));
                Draft {
                    suggestion_type: direction(target.current_bid, new_bid),
                    suggested_value: new_bid,
                    confidence,
                    priority,
                    reasoning: format!("{} ({percent:+.0}%)", decision.reason),
                    source: AlgorithmSource::RuleBased,
                    impact: project_bid_change(target, new_bid),
                }
            }
            PolicyAction::DeferToModels => self
                .market_curve_draft(target, ctx)
                .or_else(|| self.decision_tree_draft(target))
                .unwrap_or_else(|| self.bandit_draft(target, ctx)),
        };
        suggestion.into_suggestion(target)
    }

    // ─── Deferred paths ─────────────────────────────────────────────────

    fn market_curve_draft(&self, target: &TargetSnapshot, ctx: &AnalysisContext) -> Option<Draft> {
        let key = TargetKey::new(&target.account_id, target.target_type, &target.target_id);
        let model = match self
            .curves
            .get_or_build(&key, self.samples.as_ref(), ctx.range, false)
        {
            Ok(model) => model,
            Err(e) => {
                warn!(target_id = %target.target_id, error = %e, "Sample fetch failed");
                return None;
            }
        };

        let config = self.curves.config();
        if model.confidence < config.min_model_confidence {
            debug!(
                target_id = %target.target_id,
                confidence = model.confidence,
                "Market curve not trusted"
            );
            return None;
        }

        let new_bid = self.capped_bid(target.current_bid, model.optimal_bid, config.max_change_percent);
        let change = percent_change(target.current_bid, new_bid);
        if change.abs() < MIN_MEANINGFUL_CHANGE {
            return Some(maintain(
                target,
                model.confidence,
                format!("Bid already near curve optimum {:.2}", model.optimal_bid),
                AlgorithmSource::MarketCurve,
            ));
        }

        let curves = &model.curves;
        let clicks_now = calculate_clicks(target.current_bid, curves);
        let clicks_new = calculate_clicks(new_bid, curves);
        let value_per_click = curves.conversion.break_even_cpc();
        let impact = ExpectedImpact {
            spend_change: clicks_new * new_bid - clicks_now * target.current_bid,
            sales_change: (clicks_new - clicks_now) * value_per_click,
            profit_change: calculate_profit(new_bid, curves)
                - calculate_profit(target.current_bid, curves),
        };

        Some(Draft {
            suggestion_type: direction(target.current_bid, new_bid),
            suggested_value: new_bid,
            confidence: model.confidence,
            priority: Priority::Medium,
            reasoning: format!(
                "Profit-optimal bid {:.2} (break-even CPC {:.2}, {} data points)",
                model.optimal_bid, model.break_even_cpc, model.data_points
            ),
            source: AlgorithmSource::MarketCurve,
            impact,
        })
    }

    fn decision_tree_draft(&self, target: &TargetSnapshot) -> Option<Draft> {
        let prediction = self
            .trees
            .predict(&target.account_id, &KeywordFeatures::from_snapshot(target));
        if prediction.source == PredictionSource::Default {
            return None;
        }

        let p = &self.params.policy;
        let aim_acos = (p.low_acos + p.target_acos) / 2.0;
        let target_cpc = prediction.predicted_cr * prediction.predicted_cv * aim_acos;
        if target_cpc <= 0.0 {
            return None;
        }

        // Bid moves by the same ratio as the CPC needs to.
        let ratio = if target.cpc() > 0.0 {
            target_cpc / target.cpc()
        } else {
            1.0
        };
        let new_bid = self.capped_bid(
            target.current_bid,
            target.current_bid * ratio,
            self.params.curve.max_change_percent,
        );
        let change = percent_change(target.current_bid, new_bid);
        let reasoning = format!(
            "Predicted CR {:.3} and order value {:.2} give a target CPC of {:.2}",
            prediction.predicted_cr, prediction.predicted_cv, target_cpc
        );
        if change.abs() < MIN_MEANINGFUL_CHANGE {
            return Some(maintain(
                target,
                prediction.confidence,
                reasoning,
                AlgorithmSource::DecisionTree,
            ));
        }

        Some(Draft {
            suggestion_type: direction(target.current_bid, new_bid),
            suggested_value: new_bid,
            confidence: prediction.confidence,
            priority: Priority::Medium,
            reasoning,
            source: AlgorithmSource::DecisionTree,
            impact: project_bid_change(target, new_bid),
        })
    }

    fn bandit_draft(&self, target: &TargetSnapshot, ctx: &AnalysisContext) -> Draft {
        let reward_variance = self
            .arms
            .stats(&target.target_id)
            .iter()
            .find(|arm| (arm.bid - target.current_bid).abs() < 0.005)
            .map(|arm| arm.reward_variance)
            .unwrap_or(0.0);
        let input = BanditInput {
            current_bid: target.current_bid,
            clicks: target.clicks,
            total_clicks: ctx.total_clicks.max(target.clicks),
            average_roas: target.roas(),
            target_roas: ctx.target_roas,
            reward_variance,
        };
        let bandit = calculate_ucb_bid_suggestion(&input, &self.params.bandit);
        debug!(
            target_id = %target.target_id,
            strategy = ?bandit.strategy,
            ucb_score = bandit.ucb_score,
            "Bandit scored"
        );
        let new_bid = self.bounded_bid(bandit.suggested_bid);
        if percent_change(target.current_bid, new_bid).abs() < MIN_MEANINGFUL_CHANGE {
            return maintain(target, bandit.confidence, bandit.reasoning, AlgorithmSource::Bandit);
        }
        Draft {
            suggestion_type: direction(target.current_bid, new_bid),
            suggested_value: new_bid,
            confidence: bandit.confidence,
            priority: Priority::Low,
            reasoning: bandit.reasoning,
            source: AlgorithmSource::Bandit,
            impact: project_bid_change(target, new_bid),
        }
    }

    // ─── Search terms ───────────────────────────────────────────────────

    /// Search terms carry no bid: a pause verdict becomes a negative keyword and
    /// everything else is left alone.
    fn search_term_suggestion(
        &self,
        target: &TargetSnapshot,
        action: PolicyAction,
        reason: &str,
    ) -> OptimizationSuggestion {
        let draft = match action {
            PolicyAction::Pause { .. } => Draft {
                suggestion_type: SuggestionType::NegativeKeyword,
                suggested_value: 0.0,
                confidence: 0.85,
                priority: Priority::High,
                reasoning: format!(
                    "Negate \"{}\": {reason}",
                    target.text.as_deref().unwrap_or(&target.target_id)
                ),
                source: AlgorithmSource::RuleBased,
                impact: pause_impact(target),
            },
            _ => maintain(
                target,
                0.5,
                "Search term is converting or still collecting data".to_string(),
                AlgorithmSource::RuleBased,
            ),
        };
        draft.into_suggestion(target)
    }

    // ─── Bid helpers ────────────────────────────────────────────────────

    fn bounded_bid(&self, bid: f64) -> f64 {
        let c = &self.params.curve;
        bid.clamp(c.min_bid, c.max_bid_ceiling)
    }

    /// Move from `current` toward `proposed`, at most `max_percent` either way.
    fn capped_bid(&self, current: f64, proposed: f64, max_percent: f64) -> f64 {
        let change = percent_change(current, proposed).clamp(-max_percent, max_percent);
        self.bounded_bid(current * (1.0 + change / 100.0))
    }
}

// ─── Suggestion assembly ────────────────────────────────────────────────────

struct Draft {
    suggestion_type: SuggestionType,
    suggested_value: f64,
    confidence: f64,
    priority: Priority,
    reasoning: String,
    source: AlgorithmSource,
    impact: ExpectedImpact,
}

impl Draft {
    fn into_suggestion(self, target: &TargetSnapshot) -> OptimizationSuggestion {
        OptimizationSuggestion {
            id: Uuid::new_v4(),
            account_id: target.account_id.clone(),
            target_id: target.target_id.clone(),
            target_type: target.target_type,
            suggestion_type: self.suggestion_type,
            current_value: target.current_bid,
            suggested_value: self.suggested_value,
            confidence: self.confidence.clamp(0.0, 1.0),
            priority: self.priority,
            reasoning: self.reasoning,
            algorithm_source: self.source,
            expected_impact: self.impact,
            created_at: Utc::now(),
        }
    }
}

fn maintain(
    target: &TargetSnapshot,
    confidence: f64,
    reasoning: String,
    source: AlgorithmSource,
) -> Draft {
    Draft {
        suggestion_type: SuggestionType::Maintain,
        suggested_value: target.current_bid,
        confidence,
        priority: Priority::Low,
        reasoning,
        source,
        impact: ExpectedImpact::default(),
    }
}

fn direction(current: f64, new: f64) -> SuggestionType {
    if new > current {
        SuggestionType::BidIncrease
    } else if new < current {
        SuggestionType::BidDecrease
    } else {
        SuggestionType::Maintain
    }
}

fn percent_change(current: f64, new: f64) -> f64 {
    if current > 0.0 {
        (new - current) / current * 100.0
    } else {
        0.0
    }
}

/// Project spend/sales over the snapshot period if the bid becomes `new_bid`:
/// CPC follows the bid, clicks follow its square root, conversion is unchanged.
pub fn project_bid_change(target: &TargetSnapshot, new_bid: f64) -> ExpectedImpact {
    if target.current_bid <= 0.0 {
        return ExpectedImpact::default();
    }
    let bid_ratio = new_bid / target.current_bid;
    let click_factor = bid_ratio.powf(CLICK_ELASTICITY);
    let new_spend = target.spend * click_factor * bid_ratio;
    let new_sales = target.sales * click_factor;
    let spend_change = new_spend - target.spend;
    let sales_change = new_sales - target.sales;
    ExpectedImpact {
        spend_change,
        sales_change,
        profit_change: sales_change - spend_change,
    }
}

fn pause_impact(target: &TargetSnapshot) -> ExpectedImpact {
    ExpectedImpact {
        spend_change: -target.spend,
        sales_change: -target.sales,
        profit_change: target.spend - target.sales,
    }
}
