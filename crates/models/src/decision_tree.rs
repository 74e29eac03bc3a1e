//! CART regression trees predicting conversion rate and conversion value from
//! keyword features, with a versioned per-account model registry.

use bidopt_core::config::TreeConfig;
use bidopt_core::error::{OptimizerError, OptimizerResult};
use bidopt_core::types::{MatchType, TargetSnapshot, TargetType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

const Z_95: f64 = 1.96;
/// Leaf sample count at which the sample-size term of confidence saturates.
const FULL_CONFIDENCE_SAMPLES: f64 = 100.0;

// ─── Features ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Bid,
    Cpc,
    Ctr,
    Impressions,
    Clicks,
    Spend,
    WordCount,
    MatchType,
    TargetType,
}

impl Feature {
    pub const NUMERIC: [Feature; 7] = [
        Feature::Bid,
        Feature::Cpc,
        Feature::Ctr,
        Feature::Impressions,
        Feature::Clicks,
        Feature::Spend,
        Feature::WordCount,
    ];

    pub const CATEGORICAL: [Feature; 2] = [Feature::MatchType, Feature::TargetType];
}

/// Engineered model input for one bid object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordFeatures {
    pub bid: f64,
    pub cpc: f64,
    pub ctr: f64,
    pub impressions: f64,
    pub clicks: f64,
    pub spend: f64,
    pub word_count: f64,
    pub match_type: Option<MatchType>,
    pub target_type: TargetType,
}

impl KeywordFeatures {
    pub fn from_snapshot(snapshot: &TargetSnapshot) -> Self {
        Self {
            bid: snapshot.current_bid,
            cpc: snapshot.cpc(),
            ctr: snapshot.ctr(),
            impressions: snapshot.impressions as f64,
            clicks: snapshot.clicks as f64,
            spend: snapshot.spend,
            word_count: snapshot
                .text
                .as_deref()
                .map(|t| t.split_whitespace().count() as f64)
                .unwrap_or(0.0),
            match_type: snapshot.match_type,
            target_type: snapshot.target_type,
        }
    }

    fn numeric(&self, feature: Feature) -> Option<f64> {
        match feature {
            Feature::Bid => Some(self.bid),
            Feature::Cpc => Some(self.cpc),
            Feature::Ctr => Some(self.ctr),
            Feature::Impressions => Some(self.impressions),
            Feature::Clicks => Some(self.clicks),
            Feature::Spend => Some(self.spend),
            Feature::WordCount => Some(self.word_count),
            Feature::MatchType | Feature::TargetType => None,
        }
    }

    fn category(&self, feature: Feature) -> Option<String> {
        match feature {
            Feature::MatchType => Some(
                self.match_type
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "none".to_string()),
            ),
            Feature::TargetType => Some(self.target_type.to_string()),
            _ => None,
        }
    }
}

/// One labelled row: features plus observed conversion rate and value.
/// `cv` is only known for rows that converted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSample {
    pub features: KeywordFeatures,
    pub cr: f64,
    pub cv: Option<f64>,
}

impl TrainingSample {
    pub fn from_snapshot(snapshot: &TargetSnapshot) -> Self {
        Self {
            features: KeywordFeatures::from_snapshot(snapshot),
            cr: snapshot.cvr(),
            cv: (snapshot.orders > 0).then(|| snapshot.aov()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    ConversionRate,
    ConversionValue,
}

impl ModelType {
    fn target(&self, sample: &TrainingSample) -> Option<f64> {
        match self {
            Self::ConversionRate => Some(sample.cr),
            Self::ConversionValue => sample.cv,
        }
    }
}

// ─── Tree ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SplitRule {
    /// Left when the feature value is `<= threshold`.
    Threshold { feature: Feature, threshold: f64 },
    /// Left when the feature's category is in `categories`.
    Category {
        feature: Feature,
        categories: BTreeSet<String>,
    },
}

impl SplitRule {
    pub fn feature(&self) -> Feature {
        match self {
            Self::Threshold { feature, .. } | Self::Category { feature, .. } => *feature,
        }
    }

    fn goes_left(&self, features: &KeywordFeatures) -> bool {
        match self {
            Self::Threshold { feature, threshold } => features
                .numeric(*feature)
                .map(|v| v <= *threshold)
                .unwrap_or(true),
            Self::Category {
                feature,
                categories,
            } => features
                .category(*feature)
                .map(|c| categories.contains(&c))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LeafStats {
    pub prediction: f64,
    pub sample_count: usize,
    pub variance: f64,
}

impl LeafStats {
    pub fn confidence(&self) -> f64 {
        (self.sample_count as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0)
            * (1.0 - self.variance.min(1.0))
    }

    pub fn interval(&self) -> (f64, f64) {
        let half_width = Z_95 * self.variance.max(0.0).sqrt();
        (
            (self.prediction - half_width).max(0.0),
            self.prediction + half_width,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        rule: SplitRule,
        samples: usize,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
    Leaf(LeafStats),
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(_) => 0,
            Self::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Split { left, right, .. } => left.leaf_count() + right.leaf_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub model_type: ModelType,
    pub root: TreeNode,
    pub training_samples: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    n: f64,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    fn add(&mut self, y: f64) {
        self.n += 1.0;
        self.sum += y;
        self.sum_sq += y * y;
    }

    fn minus(&self, other: &Moments) -> Moments {
        Moments {
            n: self.n - other.n,
            sum: self.sum - other.sum,
            sum_sq: self.sum_sq - other.sum_sq,
        }
    }

    fn variance(&self) -> f64 {
        if self.n == 0.0 {
            return 0.0;
        }
        let mean = self.sum / self.n;
        (self.sum_sq / self.n - mean * mean).max(0.0)
    }
}

type Row<'a> = (&'a KeywordFeatures, f64);

struct CandidateSplit {
    rule: SplitRule,
    reduction: f64,
}

impl DecisionTree {
    /// Train a tree for `model_type`. Only click-bearing samples qualify (and,
    /// for conversion value, only converting ones); fewer than
    /// `min_training_samples` of them is an error.
    pub fn train(
        samples: &[TrainingSample],
        model_type: ModelType,
        config: &TreeConfig,
    ) -> OptimizerResult<Self> {
        let rows: Vec<Row> = samples
            .iter()
            .filter(|s| s.features.clicks > 0.0)
            .filter_map(|s| model_type.target(s).map(|y| (&s.features, y)))
            .collect();

        if rows.len() < config.min_training_samples {
            return Err(OptimizerError::InsufficientData {
                required: config.min_training_samples,
                actual: rows.len(),
            });
        }

        let root = build_node(&rows, 0, config);
        Ok(Self {
            model_type,
            training_samples: rows.len(),
            root,
        })
    }

    pub fn predict(&self, features: &KeywordFeatures) -> LeafStats {
        let mut node = &self.root;
        loop {
            match node {
                TreeNode::Leaf(stats) => return *stats,
                TreeNode::Split {
                    rule, left, right, ..
                } => {
                    node = if rule.goes_left(features) {
                        left.as_ref()
                    } else {
                        right.as_ref()
                    };
                }
            }
        }
    }

    /// Share of training samples passing through splits on each feature.
    /// An approximation of attribution, not an exact decomposition.
    pub fn feature_importance(&self) -> Vec<(Feature, f64)> {
        let mut totals: BTreeMap<Feature, f64> = BTreeMap::new();
        let total = self.training_samples.max(1) as f64;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if let TreeNode::Split {
                rule,
                samples,
                left,
                right,
            } = node
            {
                *totals.entry(rule.feature()).or_insert(0.0) += *samples as f64 / total;
                stack.push(left);
                stack.push(right);
            }
        }
        let mut importance: Vec<(Feature, f64)> = totals.into_iter().collect();
        importance.sort_by(|a, b| b.1.total_cmp(&a.1));
        importance
    }
}

fn leaf(rows: &[Row]) -> TreeNode {
    let mut m = Moments::default();
    for (_, y) in rows {
        m.add(*y);
    }
    TreeNode::Leaf(LeafStats {
        prediction: if m.n > 0.0 { m.sum / m.n } else { 0.0 },
        sample_count: rows.len(),
        variance: m.variance(),
    })
}

fn build_node(rows: &[Row], depth: usize, config: &TreeConfig) -> TreeNode {
    let mut parent = Moments::default();
    for (_, y) in rows {
        parent.add(*y);
    }
    let parent_variance = parent.variance();

    if depth >= config.max_depth
        || rows.len() < config.min_samples_split
        || parent_variance < config.min_variance
    {
        return leaf(rows);
    }

    let Some(best) = find_best_split(rows, &parent, config.min_samples_leaf) else {
        return leaf(rows);
    };

    let (left_rows, right_rows): (Vec<Row>, Vec<Row>) =
        rows.iter().copied().partition(|(f, _)| best.rule.goes_left(f));

    debug!(
        depth,
        feature = ?best.rule.feature(),
        reduction = best.reduction,
        left = left_rows.len(),
        right = right_rows.len(),
        "Tree split"
    );

    TreeNode::Split {
        rule: best.rule,
        samples: rows.len(),
        left: Box::new(build_node(&left_rows, depth + 1, config)),
        right: Box::new(build_node(&right_rows, depth + 1, config)),
    }
}

fn weighted_reduction(parent: &Moments, left: &Moments) -> f64 {
    let right = parent.minus(left);
    parent.variance()
        - (left.n / parent.n) * left.variance()
        - (right.n / parent.n) * right.variance()
}

fn find_best_split(rows: &[Row], parent: &Moments, min_leaf: usize) -> Option<CandidateSplit> {
    let min_leaf = min_leaf.max(1) as f64;
    let mut best: Option<CandidateSplit> = None;
    let mut consider = |rule: SplitRule, reduction: f64| {
        if reduction > 1e-12 && best.as_ref().map_or(true, |b| reduction > b.reduction) {
            best = Some(CandidateSplit { rule, reduction });
        }
    };

    for feature in Feature::NUMERIC {
        let mut values: Vec<(f64, f64)> = rows
            .iter()
            .filter_map(|(f, y)| f.numeric(feature).map(|v| (v, *y)))
            .collect();
        values.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut left = Moments::default();
        for i in 0..values.len().saturating_sub(1) {
            left.add(values[i].1);
            if values[i].0 == values[i + 1].0 {
                continue;
            }
            if left.n < min_leaf || parent.n - left.n < min_leaf {
                continue;
            }
            let threshold = (values[i].0 + values[i + 1].0) / 2.0;
            consider(
                SplitRule::Threshold { feature, threshold },
                weighted_reduction(parent, &left),
            );
        }
    }

    for feature in Feature::CATEGORICAL {
        let mut by_category: BTreeMap<String, Moments> = BTreeMap::new();
        for (f, y) in rows {
            if let Some(c) = f.category(feature) {
                by_category.entry(c).or_default().add(*y);
            }
        }
        if by_category.len() < 2 {
            continue;
        }
        for (category, left) in &by_category {
            if left.n < min_leaf || parent.n - left.n < min_leaf {
                continue;
            }
            consider(
                SplitRule::Category {
                    feature,
                    categories: BTreeSet::from([category.clone()]),
                },
                weighted_reduction(parent, left),
            );
        }
    }

    best
}

// ─── Bayesian refinement ────────────────────────────────────────────────────

/// A normal estimate whose precision is expressed in pseudo-observations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GaussianEstimate {
    pub mean: f64,
    pub variance: f64,
    pub precision: f64,
}

impl From<LeafStats> for GaussianEstimate {
    fn from(leaf: LeafStats) -> Self {
        Self {
            mean: leaf.prediction,
            variance: leaf.variance,
            precision: leaf.sample_count as f64,
        }
    }
}

/// Conjugate-normal update: `posterior_precision = prior_precision + n`, the
/// mean is the precision-weighted average and the variance pools both sources
/// plus the spread between their means.
pub fn bayesian_update(prior: &GaussianEstimate, observations: &[f64]) -> GaussianEstimate {
    if observations.is_empty() {
        return *prior;
    }
    let n = observations.len() as f64;
    let obs_mean = observations.iter().sum::<f64>() / n;
    let obs_variance = observations
        .iter()
        .map(|x| (x - obs_mean).powi(2))
        .sum::<f64>()
        / n;

    let prior_precision = prior.precision.max(0.0);
    let posterior_precision = prior_precision + n;
    let mean = (prior_precision * prior.mean + n * obs_mean) / posterior_precision;
    let variance = (prior_precision * prior.variance
        + n * obs_variance
        + prior_precision * n / posterior_precision * (obs_mean - prior.mean).powi(2))
        / posterior_precision;

    GaussianEstimate {
        mean,
        variance,
        precision: posterior_precision,
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTree {
    pub version: u32,
    pub active: bool,
    pub tree: DecisionTree,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersionInfo {
    pub version: u32,
    pub active: bool,
    pub training_samples: usize,
    pub depth: usize,
    pub leaves: usize,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Model,
    /// One of the two models is active; the other component is a default.
    Partial,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_cr: f64,
    pub predicted_cv: f64,
    pub cr_interval: (f64, f64),
    pub cv_interval: (f64, f64),
    pub confidence: f64,
    pub sample_count: usize,
    pub source: PredictionSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub account_id: String,
    pub cr_version: u32,
    pub cv_version: u32,
    pub training_samples: usize,
}

/// Versioned trees per (account, model type). Exactly one version is active;
/// older versions are deactivated and kept.
pub struct DecisionTreeRegistry {
    config: TreeConfig,
    models: DashMap<(String, ModelType), Vec<StoredTree>>,
}

impl DecisionTreeRegistry {
    pub fn new(config: TreeConfig) -> Self {
        Self {
            config,
            models: DashMap::new(),
        }
    }

    /// Train and activate both the CR and CV trees for an account.
    pub fn train(&self, account_id: &str, samples: &[TrainingSample]) -> OptimizerResult<TrainingReport> {
        let cr_tree = DecisionTree::train(samples, ModelType::ConversionRate, &self.config)?;
        let cv_tree = DecisionTree::train(samples, ModelType::ConversionValue, &self.config)?;
        let training_samples = cr_tree.training_samples;
        let cr_version = self.store(account_id, cr_tree);
        let cv_version = self.store(account_id, cv_tree);
        Ok(TrainingReport {
            account_id: account_id.to_string(),
            cr_version,
            cv_version,
            training_samples,
        })
    }

    pub fn train_model(
        &self,
        account_id: &str,
        model_type: ModelType,
        samples: &[TrainingSample],
    ) -> OptimizerResult<u32> {
        let tree = DecisionTree::train(samples, model_type, &self.config)?;
        Ok(self.store(account_id, tree))
    }

    fn store(&self, account_id: &str, tree: DecisionTree) -> u32 {
        let model_type = tree.model_type;
        let mut versions = self
            .models
            .entry((account_id.to_string(), model_type))
            .or_default();
        for v in versions.iter_mut() {
            v.active = false;
        }
        let version = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        info!(
            account_id,
            model_type = ?model_type,
            version,
            samples = tree.training_samples,
            depth = tree.root.depth(),
            leaves = tree.root.leaf_count(),
            "Decision tree trained"
        );
        metrics::counter!("models.decision_tree.trainings").increment(1);
        versions.push(StoredTree {
            version,
            active: true,
            tree,
            trained_at: Utc::now(),
        });
        version
    }

    pub fn active(&self, account_id: &str, model_type: ModelType) -> Option<DecisionTree> {
        self.models
            .get(&(account_id.to_string(), model_type))
            .and_then(|v| v.iter().find(|t| t.active).map(|t| t.tree.clone()))
    }

    /// Reactivate an older version, deactivating the current one.
    pub fn activate_version(
        &self,
        account_id: &str,
        model_type: ModelType,
        version: u32,
    ) -> OptimizerResult<()> {
        let mut versions = self
            .models
            .get_mut(&(account_id.to_string(), model_type))
            .ok_or_else(|| {
                OptimizerError::ModelNotFound(format!("{account_id}/{model_type:?}"))
            })?;
        if !versions.iter().any(|v| v.version == version) {
            return Err(OptimizerError::ModelNotFound(format!(
                "{account_id}/{model_type:?} v{version}"
            )));
        }
        for v in versions.iter_mut() {
            v.active = v.version == version;
        }
        info!(account_id, model_type = ?model_type, version, "Decision tree version activated");
        Ok(())
    }

    pub fn list_versions(&self, account_id: &str, model_type: ModelType) -> Vec<ModelVersionInfo> {
        self.models
            .get(&(account_id.to_string(), model_type))
            .map(|versions| {
                versions
                    .iter()
                    .map(|v| ModelVersionInfo {
                        version: v.version,
                        active: v.active,
                        training_samples: v.tree.training_samples,
                        depth: v.tree.root.depth(),
                        leaves: v.tree.root.leaf_count(),
                        trained_at: v.trained_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Predict CR and CV, falling back to configured defaults for any model
    /// that has no active version.
    pub fn predict(&self, account_id: &str, features: &KeywordFeatures) -> PredictionResult {
        let cr = self
            .active(account_id, ModelType::ConversionRate)
            .map(|t| t.predict(features));
        let cv = self
            .active(account_id, ModelType::ConversionValue)
            .map(|t| t.predict(features));

        let source = match (&cr, &cv) {
            (Some(_), Some(_)) => PredictionSource::Model,
            (None, None) => PredictionSource::Default,
            _ => PredictionSource::Partial,
        };

        let default_leaf = |prediction: f64| LeafStats {
            prediction,
            sample_count: 0,
            variance: 0.0,
        };
        let cr_leaf = cr.unwrap_or_else(|| default_leaf(self.config.default_cr));
        let cv_leaf = cv.unwrap_or_else(|| default_leaf(self.config.default_cv));

        PredictionResult {
            predicted_cr: cr_leaf.prediction,
            predicted_cv: cv_leaf.prediction,
            cr_interval: cr_leaf.interval(),
            cv_interval: cv_leaf.interval(),
            confidence: cr_leaf.confidence(),
            sample_count: cr_leaf.sample_count,
            source,
        }
    }
}
