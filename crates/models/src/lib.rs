//! Estimators behind the bid optimizer: profit curves fitted from bid/performance
//! history, CART regression trees for conversion rate and value, and UCB1-Tuned
//! exploration scoring.

pub mod bandits;
pub mod decision_tree;
pub mod market_curve;

pub use bandits::BidArmTracker;
pub use decision_tree::DecisionTreeRegistry;
pub use market_curve::MarketCurveStore;
