//! UCB1-Tuned exploration scoring for bid decisions: pure scoring functions,
//! a click-regime bid suggester, and a per-target arm tracker over candidate
//! bid levels.

use bidopt_core::config::BanditConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Plain UCB1. Unplayed arms score `+inf` so they are always tried first.
pub fn calculate_ucb(
    average_reward: f64,
    total_trials: u64,
    arm_trials: u64,
    exploration_factor: f64,
) -> f64 {
    if arm_trials == 0 {
        return f64::INFINITY;
    }
    let log_total = (total_trials.max(1) as f64).ln();
    average_reward + exploration_factor * (log_total / arm_trials as f64).sqrt()
}

/// UCB1 with the exploration bonus widened by `1 + 0.5 * sqrt(variance)`.
pub fn calculate_ucb_tuned(
    average_reward: f64,
    total_trials: u64,
    arm_trials: u64,
    reward_variance: f64,
    exploration_factor: f64,
) -> f64 {
    if arm_trials == 0 {
        return f64::INFINITY;
    }
    let log_total = (total_trials.max(1) as f64).ln();
    let bonus = exploration_factor * (log_total / arm_trials as f64).sqrt();
    average_reward + bonus * (1.0 + 0.5 * reward_variance.max(0.0).sqrt())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BidStrategy {
    Explore,
    Balanced,
    Exploit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditInput {
    pub current_bid: f64,
    /// Clicks on this target.
    pub clicks: u64,
    /// Clicks across all targets competing for the same budget.
    pub total_clicks: u64,
    pub average_roas: f64,
    pub target_roas: f64,
    #[serde(default)]
    pub reward_variance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditBidSuggestion {
    pub suggested_bid: f64,
    pub strategy: BidStrategy,
    pub confidence: f64,
    pub ucb_score: f64,
    pub reasoning: String,
}

/// Pick a regime from the absolute click count and propose a bid. The result
/// is always within `[min_bid_factor, max_bid_factor] * current_bid`.
pub fn calculate_ucb_bid_suggestion(input: &BanditInput, config: &BanditConfig) -> BanditBidSuggestion {
    let current = input.current_bid;
    let roas_ratio = if input.target_roas > 0.0 {
        input.average_roas / input.target_roas
    } else {
        1.0
    };
    let ucb_score = calculate_ucb_tuned(
        roas_ratio,
        input.total_clicks.max(input.clicks),
        input.clicks,
        input.reward_variance,
        config.exploration_factor,
    );

    let explore_bid = |clicks: u64| {
        let remaining = config.explore_clicks.saturating_sub(clicks) as f64
            / config.explore_clicks.max(1) as f64;
        current * (1.0 + config.max_explore_increase * remaining)
    };
    let exploit_bid = current * roas_ratio.min(1.0 + config.max_exploit_increase);

    let (raw_bid, strategy, confidence, reasoning) = if input.clicks < config.explore_clicks {
        (
            explore_bid(input.clicks),
            BidStrategy::Explore,
            config.explore_confidence,
            format!(
                "Only {} clicks; raising bid to gather data",
                input.clicks
            ),
        )
    } else if input.clicks < config.exploit_clicks {
        let span = (config.exploit_clicks - config.explore_clicks).max(1) as f64;
        let weight = (input.clicks - config.explore_clicks) as f64 / span;
        let nudge = current * (1.0 + config.max_explore_increase * 0.5 * (1.0 - weight));
        (
            (1.0 - weight) * nudge + weight * exploit_bid,
            BidStrategy::Balanced,
            0.5 + 0.5 * weight,
            format!(
                "{} clicks; blending exploration with ROAS {:.2} vs target {:.2} (weight {:.2})",
                input.clicks, input.average_roas, input.target_roas, weight
            ),
        )
    } else {
        let excess = (input.clicks - config.exploit_clicks) as f64;
        let ceiling = config.exploit_max_confidence;
        (
            exploit_bid,
            BidStrategy::Exploit,
            ceiling - 0.25 * (-excess / 100.0).exp(),
            format!(
                "{} clicks; scaling bid by ROAS ratio {:.2}",
                input.clicks, roas_ratio
            ),
        )
    };

    BanditBidSuggestion {
        suggested_bid: clamp_bid(
            raw_bid,
            current * config.min_bid_factor,
            current * config.max_bid_factor,
        ),
        strategy,
        confidence: confidence.clamp(0.0, 1.0),
        ucb_score,
        reasoning,
    }
}

/// Clamp between two bounds in either order. Never panics on negative or NaN
/// bounds, unlike `f64::clamp`.
fn clamp_bid(bid: f64, a: f64, b: f64) -> f64 {
    bid.max(a.min(b)).min(a.max(b))
}

// ─── Arm tracker ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct ArmState {
    trials: u64,
    reward_sum: f64,
    reward_sq_sum: f64,
}

impl ArmState {
    fn mean(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.reward_sum / self.trials as f64
        }
    }

    fn variance(&self) -> f64 {
        if self.trials == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.reward_sq_sum / self.trials as f64 - mean * mean).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmStats {
    pub bid: f64,
    pub trials: u64,
    pub average_reward: f64,
    pub reward_variance: f64,
    pub ucb_score: f64,
}

/// Candidate bid levels per target, scored with UCB1-Tuned. Arms are keyed by
/// bid in cents.
pub struct BidArmTracker {
    exploration_factor: f64,
    arms: DashMap<String, Vec<u64>>,
    states: DashMap<(String, u64), ArmState>,
}

fn cents(bid: f64) -> u64 {
    (bid * 100.0).round().max(0.0) as u64
}

impl BidArmTracker {
    pub fn new(exploration_factor: f64) -> Self {
        Self {
            exploration_factor,
            arms: DashMap::new(),
            states: DashMap::new(),
        }
    }

    pub fn register_target(&self, target_id: &str, bids: &[f64]) {
        let mut arms: Vec<u64> = bids.iter().map(|b| cents(*b)).collect();
        arms.sort_unstable();
        arms.dedup();
        for arm in &arms {
            self.states
                .entry((target_id.to_string(), *arm))
                .or_default();
        }
        self.arms.insert(target_id.to_string(), arms);
    }

    pub fn record_reward(&self, target_id: &str, bid: f64, reward: f64) {
        if let Some(mut state) = self.states.get_mut(&(target_id.to_string(), cents(bid))) {
            state.trials += 1;
            state.reward_sum += reward;
            state.reward_sq_sum += reward * reward;
        }
    }

    pub fn stats(&self, target_id: &str) -> Vec<ArmStats> {
        let Some(arms) = self.arms.get(target_id) else {
            return Vec::new();
        };
        let states: Vec<(u64, ArmState)> = arms
            .iter()
            .map(|arm| {
                let state = self
                    .states
                    .get(&(target_id.to_string(), *arm))
                    .map(|s| s.clone())
                    .unwrap_or_default();
                (*arm, state)
            })
            .collect();
        let total: u64 = states.iter().map(|(_, s)| s.trials).sum();

        states
            .into_iter()
            .map(|(arm, s)| ArmStats {
                bid: arm as f64 / 100.0,
                trials: s.trials,
                average_reward: s.mean(),
                reward_variance: s.variance(),
                ucb_score: calculate_ucb_tuned(
                    s.mean(),
                    total,
                    s.trials,
                    s.variance(),
                    self.exploration_factor,
                ),
            })
            .collect()
    }

    /// The bid with the highest UCB1-Tuned score; unplayed arms win in
    /// ascending bid order.
    pub fn select_bid(&self, target_id: &str) -> Option<f64> {
        self.stats(target_id)
            .into_iter()
            .fold(None, |best: Option<ArmStats>, arm| match best {
                Some(b) if b.ucb_score >= arm.ucb_score => Some(b),
                _ => Some(arm),
            })
            .map(|a| a.bid)
    }
}

impl Default for BidArmTracker {
    fn default() -> Self {
        Self::new(BanditConfig::default().exploration_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_unplayed_arm_is_infinite() {
        assert_eq!(calculate_ucb(0.5, 100, 0, 2.0), f64::INFINITY);
        assert_eq!(calculate_ucb(-3.0, 0, 0, 0.0), f64::INFINITY);
        assert_eq!(calculate_ucb_tuned(0.5, 100, 0, 1.0, 2.0), f64::INFINITY);
    }

    #[test]
    fn test_ucb_values() {
        let score = calculate_ucb(0.2, 100, 10, 1.0);
        let expected = 0.2 + ((100f64).ln() / 10.0).sqrt();
        assert!((score - expected).abs() < 1e-12);
        // single trial total => no bonus
        assert_eq!(calculate_ucb(0.2, 1, 1, 2.0), 0.2);
    }

    #[test]
    fn test_tuned_monotonic_in_variance() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let avg = rng.gen_range(0.0..5.0);
            let total = rng.gen_range(1..10_000);
            let arm = rng.gen_range(1..=total);
            let v1 = rng.gen_range(0.0..4.0);
            let v2 = v1 + rng.gen_range(0.0..4.0);
            assert!(
                calculate_ucb_tuned(avg, total, arm, v2, 1.4)
                    >= calculate_ucb_tuned(avg, total, arm, v1, 1.4)
            );
        }
    }

    #[test]
    fn test_exploit_scenario() {
        let input = BanditInput {
            current_bid: 1.0,
            clicks: 200,
            total_clicks: 1000,
            average_roas: 4.0,
            target_roas: 3.0,
            reward_variance: 0.0,
        };
        let suggestion = calculate_ucb_bid_suggestion(&input, &BanditConfig::default());
        assert_eq!(suggestion.strategy, BidStrategy::Exploit);
        assert!(suggestion.confidence > 0.7);
        assert!(suggestion.confidence <= 0.95);
        assert!(suggestion.suggested_bid > 1.0 && suggestion.suggested_bid <= 1.3);
    }

    #[test]
    fn test_regimes_by_click_count() {
        let config = BanditConfig::default();
        let base = BanditInput {
            current_bid: 2.0,
            clicks: 0,
            total_clicks: 500,
            average_roas: 2.4,
            target_roas: 3.0,
            reward_variance: 0.5,
        };

        let explore = calculate_ucb_bid_suggestion(&base, &config);
        assert_eq!(explore.strategy, BidStrategy::Explore);
        assert_eq!(explore.confidence, 0.3);
        assert!((explore.suggested_bid - 2.2).abs() < 1e-9);
        assert_eq!(explore.ucb_score, f64::INFINITY);

        let balanced = calculate_ucb_bid_suggestion(&BanditInput { clicks: 30, ..base.clone() }, &config);
        assert_eq!(balanced.strategy, BidStrategy::Balanced);
        assert!((balanced.confidence - 0.75).abs() < 1e-9);

        let exploit = calculate_ucb_bid_suggestion(&BanditInput { clicks: 50, ..base.clone() }, &config);
        assert_eq!(exploit.strategy, BidStrategy::Exploit);
        // ROAS below target: bid follows the ratio down
        assert!((exploit.suggested_bid - 2.0 * (2.4 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_suggestion_always_within_clamp() {
        let config = BanditConfig::default();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..500 {
            let input = BanditInput {
                current_bid: rng.gen_range(0.05..20.0),
                clicks: rng.gen_range(0..500),
                total_clicks: rng.gen_range(0..5000),
                average_roas: rng.gen_range(0.0..20.0),
                target_roas: rng.gen_range(0.0..6.0),
                reward_variance: rng.gen_range(0.0..10.0),
            };
            let s = calculate_ucb_bid_suggestion(&input, &config);
            assert!(s.suggested_bid >= input.current_bid * 0.7 - 1e-12);
            assert!(s.suggested_bid <= input.current_bid * 1.3 + 1e-12);
            assert!((0.0..=1.0).contains(&s.confidence));
        }
    }

    #[test]
    fn test_non_positive_bid_does_not_panic() {
        let config = BanditConfig::default();
        let input = BanditInput {
            current_bid: -1.0,
            clicks: 30,
            total_clicks: 500,
            average_roas: 3.0,
            target_roas: 3.0,
            reward_variance: 0.0,
        };
        let s = calculate_ucb_bid_suggestion(&input, &config);
        assert!(s.suggested_bid >= -1.3 && s.suggested_bid <= -0.7);

        let nan = calculate_ucb_bid_suggestion(
            &BanditInput {
                current_bid: f64::NAN,
                ..input
            },
            &config,
        );
        assert_eq!(nan.strategy, BidStrategy::Balanced);
    }

    #[test]
    fn test_arm_tracker_explores_then_exploits() {
        let tracker = BidArmTracker::default();
        tracker.register_target("kw-1", &[0.5, 1.0, 1.5, 1.0]);
        assert_eq!(tracker.stats("kw-1").len(), 3);

        // every arm is tried once before any repeats
        assert_eq!(tracker.select_bid("kw-1"), Some(0.5));
        tracker.record_reward("kw-1", 0.5, 0.1);
        assert_eq!(tracker.select_bid("kw-1"), Some(1.0));
        tracker.record_reward("kw-1", 1.0, 0.9);
        assert_eq!(tracker.select_bid("kw-1"), Some(1.5));
        tracker.record_reward("kw-1", 1.5, 0.2);

        for _ in 0..50 {
            tracker.record_reward("kw-1", 1.0, 0.9);
            tracker.record_reward("kw-1", 0.5, 0.1);
            tracker.record_reward("kw-1", 1.5, 0.2);
        }
        assert_eq!(tracker.select_bid("kw-1"), Some(1.0));
        assert_eq!(tracker.select_bid("unknown"), None);
    }
}
