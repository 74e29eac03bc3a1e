//! The search-ad decision policy as data: condition nodes and action leaves,
//! built once from thresholds and walked by a small interpreter.

use bidopt_core::config::PolicyThresholds;
use bidopt_core::types::{Priority, TargetSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    ClicksBelow(u64),
    ClicksAtLeast(u64),
    NoOrders,
    /// ACoS strictly below the fraction. Targets without sales never match.
    AcosBelow(f64),
    AcosAtMost(f64),
}

impl Condition {
    pub fn matches(&self, target: &TargetSnapshot) -> bool {
        match *self {
            Self::ClicksBelow(n) => target.clicks < n,
            Self::ClicksAtLeast(n) => target.clicks >= n,
            Self::NoOrders => target.orders == 0,
            Self::AcosBelow(limit) => target.acos().is_some_and(|a| a < limit),
            Self::AcosAtMost(limit) => target.acos().is_some_and(|a| a <= limit),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::ClicksBelow(n) => format!("clicks < {n}"),
            Self::ClicksAtLeast(n) => format!("clicks >= {n}"),
            Self::NoOrders => "orders == 0".to_string(),
            Self::AcosBelow(limit) => format!("acos < {:.0}%", limit * 100.0),
            Self::AcosAtMost(limit) => format!("acos <= {:.0}%", limit * 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Maintain {
        confidence: f64,
    },
    Pause {
        confidence: f64,
    },
    AdjustBid {
        percent: f64,
        priority: Priority,
        confidence: f64,
    },
    /// Hand the target to the model-driven path.
    DeferToModels,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyNode {
    Branch {
        condition: Condition,
        then: Box<PolicyNode>,
        otherwise: Box<PolicyNode>,
    },
    Leaf {
        action: PolicyAction,
        reason: String,
    },
}

impl PolicyNode {
    fn leaf(action: PolicyAction, reason: impl Into<String>) -> Self {
        Self::Leaf {
            action,
            reason: reason.into(),
        }
    }

    fn branch(condition: Condition, then: PolicyNode, otherwise: PolicyNode) -> Self {
        Self::Branch {
            condition,
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason: String,
    /// Conditions evaluated on the way to the leaf, with their outcomes.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTree {
    root: PolicyNode,
}

impl PolicyTree {
    pub fn new(root: PolicyNode) -> Self {
        Self { root }
    }

    /// The standard search-ad policy.
    pub fn search_ads(t: &PolicyThresholds) -> Self {
        let acos_branch = PolicyNode::branch(
            Condition::AcosBelow(t.low_acos),
            PolicyNode::leaf(
                PolicyAction::AdjustBid {
                    percent: t.increase_percent,
                    priority: Priority::High,
                    confidence: 0.85,
                },
                format!(
                    "ACoS under {:.0}%: room to buy more traffic",
                    t.low_acos * 100.0
                ),
            ),
            PolicyNode::branch(
                Condition::AcosBelow(t.target_acos),
                PolicyNode::leaf(
                    PolicyAction::DeferToModels,
                    "ACoS within target band; fine-tune with models",
                ),
                PolicyNode::branch(
                    Condition::AcosAtMost(t.high_acos),
                    PolicyNode::leaf(
                        PolicyAction::AdjustBid {
                            percent: -t.decrease_percent,
                            priority: Priority::Medium,
                            confidence: 0.75,
                        },
                        format!(
                            "ACoS between {:.0}% and {:.0}%",
                            t.target_acos * 100.0,
                            t.high_acos * 100.0
                        ),
                    ),
                    PolicyNode::leaf(
                        PolicyAction::AdjustBid {
                            percent: -t.critical_decrease_percent,
                            priority: Priority::Critical,
                            confidence: 0.9,
                        },
                        format!("ACoS above {:.0}%", t.high_acos * 100.0),
                    ),
                ),
            ),
        );

        let no_orders_branch = PolicyNode::branch(
            Condition::ClicksAtLeast(t.pause_clicks),
            PolicyNode::leaf(
                PolicyAction::Pause { confidence: 0.8 },
                format!("{}+ clicks without an order", t.pause_clicks),
            ),
            PolicyNode::leaf(
                PolicyAction::AdjustBid {
                    percent: -t.no_order_decrease_percent,
                    priority: Priority::High,
                    confidence: 0.7,
                },
                "Clicks without orders",
            ),
        );

        Self::new(PolicyNode::branch(
            Condition::ClicksBelow(t.min_clicks),
            PolicyNode::leaf(
                PolicyAction::Maintain { confidence: 0.3 },
                format!("Fewer than {} clicks; not enough data", t.min_clicks),
            ),
            PolicyNode::branch(Condition::NoOrders, no_orders_branch, acos_branch),
        ))
    }

    pub fn root(&self) -> &PolicyNode {
        &self.root
    }

    pub fn evaluate(&self, target: &TargetSnapshot) -> PolicyDecision {
        let mut node = &self.root;
        let mut path = Vec::new();
        loop {
            match node {
                PolicyNode::Branch {
                    condition,
                    then,
                    otherwise,
                } => {
                    let hit = condition.matches(target);
                    path.push(format!("{} = {}", condition.describe(), hit));
                    node = if hit { then.as_ref() } else { otherwise.as_ref() };
                }
                PolicyNode::Leaf { action, reason } => {
                    return PolicyDecision {
                        action: *action,
                        reason: reason.clone(),
                        path,
                    };
                }
            }
        }
    }
}

impl Default for PolicyTree {
    fn default() -> Self {
        Self::search_ads(&PolicyThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidopt_core::types::TargetType;

    fn target(clicks: u64, orders: u64, spend: f64, sales: f64) -> TargetSnapshot {
        TargetSnapshot {
            account_id: "acct-1".into(),
            campaign_id: "camp-1".into(),
            target_id: "kw-1".into(),
            target_type: TargetType::Keyword,
            text: None,
            match_type: None,
            current_bid: 1.0,
            impressions: 5000,
            clicks,
            spend,
            sales,
            orders,
        }
    }

    fn action(t: &TargetSnapshot) -> PolicyAction {
        PolicyTree::default().evaluate(t).action
    }

    #[test]
    fn test_insufficient_clicks_maintain() {
        assert!(matches!(
            action(&target(9, 3, 5.0, 100.0)),
            PolicyAction::Maintain { .. }
        ));
    }

    #[test]
    fn test_no_orders_branch() {
        assert!(matches!(
            action(&target(30, 0, 30.0, 0.0)),
            PolicyAction::Pause { .. }
        ));
        match action(&target(12, 0, 12.0, 0.0)) {
            PolicyAction::AdjustBid { percent, .. } => assert_eq!(percent, -20.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_acos_bands() {
        match action(&target(40, 4, 15.0, 100.0)) {
            PolicyAction::AdjustBid {
                percent, priority, ..
            } => {
                assert_eq!(percent, 15.0);
                assert_eq!(priority, Priority::High);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            action(&target(40, 4, 25.0, 100.0)),
            PolicyAction::DeferToModels
        );
        match action(&target(40, 4, 45.0, 100.0)) {
            PolicyAction::AdjustBid { percent, .. } => assert_eq!(percent, -15.0),
            other => panic!("unexpected {other:?}"),
        }
        match action(&target(40, 4, 80.0, 100.0)) {
            PolicyAction::AdjustBid {
                percent, priority, ..
            } => {
                assert_eq!(percent, -30.0);
                assert_eq!(priority, Priority::Critical);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_band_edges() {
        // exactly 20% defers, exactly 50% is the -15% band
        assert_eq!(
            action(&target(40, 4, 20.0, 100.0)),
            PolicyAction::DeferToModels
        );
        match action(&target(40, 4, 50.0, 100.0)) {
            PolicyAction::AdjustBid { percent, .. } => assert_eq!(percent, -15.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_path_is_recorded() {
        let decision = PolicyTree::default().evaluate(&target(40, 4, 25.0, 100.0));
        assert_eq!(decision.path.len(), 4);
        assert_eq!(decision.path[0], "clicks < 10 = false");
        assert_eq!(decision.path[3], "acos < 35% = true");
    }

    #[test]
    fn test_custom_tree_is_interpreted() {
        let tree = PolicyTree::new(PolicyNode::branch(
            Condition::ClicksAtLeast(100),
            PolicyNode::leaf(PolicyAction::Pause { confidence: 1.0 }, "busy"),
            PolicyNode::leaf(PolicyAction::Maintain { confidence: 1.0 }, "quiet"),
        ));
        assert_eq!(tree.evaluate(&target(150, 1, 1.0, 1.0)).reason, "busy");
        assert_eq!(tree.evaluate(&target(10, 1, 1.0, 1.0)).reason, "quiet");
    }
}
