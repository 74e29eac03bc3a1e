//! Search-ad optimization engine: a hand-authored policy tree routes each bid
//! object to a rule, the market curve, the decision tree or the bandit, and
//! emits one ranked suggestion per target.

pub mod optimizer;
pub mod policy;

pub use optimizer::{AnalysisContext, OptimizationEngine};
pub use policy::{PolicyAction, PolicyDecision, PolicyTree};
