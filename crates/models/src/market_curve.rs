//! Market curve model: fits impression, CTR and conversion curves from bid
//! history and searches for the profit-maximizing bid.

use bidopt_core::config::CurveConfig;
use bidopt_core::ports::{DateRange, SampleStore, TargetKey};
use bidopt_core::types::PerformanceSample;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const MIN_IMPRESSION_SAMPLES: usize = 5;
const MIN_CTR_SAMPLES: usize = 3;
const MIN_CONVERSION_SAMPLES: usize = 3;
const DEFAULT_CVR: f64 = 0.05;
const DEFAULT_AOV: f64 = 30.0;
const DEFAULT_DELAY_DAYS: u32 = 7;
/// Data points at which the sample-size term of confidence saturates.
const FULL_CONFIDENCE_POINTS: f64 = 30.0;

/// `impressions = a * ln(bid + b) + c`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ImpressionCurve {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub r2: f64,
}

impl Default for ImpressionCurve {
    fn default() -> Self {
        Self {
            a: 1000.0,
            b: 0.1,
            c: 100.0,
            r2: 0.0,
        }
    }
}

/// CTR as a function of bid. Bids at or below `pivot_bid` ramp linearly from
/// `base_ctr * (1 - position_bonus / 2)` up to `base_ctr * (1 + position_bonus / 2)`;
/// bids beyond `1.5 * pivot_bid` additionally earn `top_bonus`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CtrCurve {
    pub base_ctr: f64,
    pub position_bonus: f64,
    pub top_bonus: f64,
    pub pivot_bid: f64,
}

impl Default for CtrCurve {
    fn default() -> Self {
        Self {
            base_ctr: 0.01,
            position_bonus: 0.2,
            top_bonus: 0.1,
            pivot_bid: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConversionParams {
    pub cvr: f64,
    pub aov: f64,
    pub delay_days: u32,
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self {
            cvr: DEFAULT_CVR,
            aov: DEFAULT_AOV,
            delay_days: DEFAULT_DELAY_DAYS,
        }
    }
}

impl ConversionParams {
    /// Click cost at which a click's expected revenue equals its cost.
    pub fn break_even_cpc(&self) -> f64 {
        self.cvr * self.aov
    }
}

/// The three fitted curves that together define profit as a function of bid.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MarketCurves {
    pub impression: ImpressionCurve,
    pub ctr: CtrCurve,
    pub conversion: ConversionParams,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProfitPoint {
    pub bid: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimalBid {
    pub optimal_bid: f64,
    pub max_profit: f64,
    pub profit_margin: f64,
    pub break_even_cpc: f64,
    pub profit_curve: Vec<ProfitPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCurveModel {
    pub curves: MarketCurves,
    pub optimal_bid: f64,
    pub max_profit: f64,
    pub break_even_cpc: f64,
    /// In `[0, 1]`; values below 0.3 should not drive decisions.
    pub confidence: f64,
    pub data_points: usize,
    pub built_at: DateTime<Utc>,
}

// ─── Fitting ────────────────────────────────────────────────────────────────

/// Least-squares fit of impressions against `ln(bid)`. Fitted curves carry
/// `b = 0` so evaluation matches the regression.
pub fn build_impression_curve(samples: &[PerformanceSample]) -> ImpressionCurve {
    let points: Vec<(f64, f64)> = samples
        .iter()
        .filter(|s| s.bid > 0.0 && s.impressions > 0)
        .map(|s| (s.bid.ln(), s.impressions as f64))
        .collect();

    if points.len() < MIN_IMPRESSION_SAMPLES {
        debug!(
            usable = points.len(),
            "Too few samples for impression curve, using defaults"
        );
        return ImpressionCurve::default();
    }

    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let mean_y = sum_y / n;

    let denom = n * sum_xx - sum_x * sum_x;
    let (a, c) = if denom.abs() < 1e-12 {
        (0.0, mean_y)
    } else {
        let a = (n * sum_xy - sum_x * sum_y) / denom;
        (a, (sum_y - a * sum_x) / n)
    };

    let ss_tot: f64 = points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = points.iter().map(|(x, y)| (y - (a * x + c)).powi(2)).sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    ImpressionCurve { a, b: 0.0, c, r2 }
}

fn group_ctr(samples: &[&PerformanceSample]) -> f64 {
    let impressions: u64 = samples.iter().map(|s| s.impressions).sum();
    let clicks: u64 = samples.iter().map(|s| s.clicks).sum();
    if impressions == 0 {
        0.0
    } else {
        clicks as f64 / impressions as f64
    }
}

pub fn build_ctr_curve(samples: &[PerformanceSample]) -> CtrCurve {
    let mut usable: Vec<&PerformanceSample> =
        samples.iter().filter(|s| s.impressions > 0).collect();
    if usable.len() < MIN_CTR_SAMPLES {
        return CtrCurve::default();
    }
    usable.sort_by(|a, b| a.bid.total_cmp(&b.bid));

    let base_ctr = group_ctr(&usable);
    let half = usable.len() / 2;
    let (bottom, top) = usable.split_at(half);
    let bottom_ctr = group_ctr(bottom);
    let top_ctr = group_ctr(top);

    let position_bonus = if bottom_ctr > 0.0 {
        (top_ctr / bottom_ctr - 1.0).clamp(0.0, 2.0)
    } else if top_ctr > 0.0 {
        2.0
    } else {
        0.0
    };

    let quartile = (usable.len() / 4).max(1);
    let top_quartile_ctr = group_ctr(&usable[usable.len() - quartile..]);
    let top_bonus = if top_ctr > 0.0 {
        (top_quartile_ctr / top_ctr - 1.0).clamp(0.0, 1.0)
    } else {
        0.0
    };

    CtrCurve {
        base_ctr,
        position_bonus,
        top_bonus,
        pivot_bid: top[0].bid,
    }
}

pub fn build_conversion_params(samples: &[PerformanceSample]) -> ConversionParams {
    let usable: Vec<&PerformanceSample> = samples.iter().filter(|s| s.clicks > 0).collect();
    if usable.len() < MIN_CONVERSION_SAMPLES {
        return ConversionParams::default();
    }
    let clicks: u64 = usable.iter().map(|s| s.clicks).sum();
    let orders: u64 = usable.iter().map(|s| s.orders).sum();
    let sales: f64 = usable.iter().map(|s| s.sales).sum();

    ConversionParams {
        cvr: orders as f64 / clicks as f64,
        aov: if orders > 0 {
            sales / orders as f64
        } else {
            DEFAULT_AOV
        },
        delay_days: DEFAULT_DELAY_DAYS,
    }
}

pub fn build_market_curves(samples: &[PerformanceSample]) -> MarketCurves {
    MarketCurves {
        impression: build_impression_curve(samples),
        ctr: build_ctr_curve(samples),
        conversion: build_conversion_params(samples),
    }
}

// ─── Evaluation ─────────────────────────────────────────────────────────────

/// Expected impressions at `bid`; never negative.
pub fn calculate_impressions(bid: f64, curve: &ImpressionCurve) -> f64 {
    let x = bid + curve.b;
    if x <= 0.0 {
        return 0.0;
    }
    (curve.a * x.ln() + curve.c).max(0.0)
}

pub fn calculate_ctr(bid: f64, curve: &CtrCurve) -> f64 {
    let ramp = if curve.pivot_bid > 0.0 {
        (bid / curve.pivot_bid).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let mut ctr = curve.base_ctr * (1.0 + curve.position_bonus * (ramp - 0.5));
    if curve.pivot_bid > 0.0 && bid >= 1.5 * curve.pivot_bid {
        ctr *= 1.0 + curve.top_bonus;
    }
    ctr.max(0.0)
}

pub fn calculate_clicks(bid: f64, curves: &MarketCurves) -> f64 {
    (calculate_impressions(bid, &curves.impression) * calculate_ctr(bid, &curves.ctr)).max(0.0)
}

/// Expected profit at `bid`, paying the bid for every click.
pub fn calculate_profit(bid: f64, curves: &MarketCurves) -> f64 {
    let value_per_click = curves.conversion.break_even_cpc();
    calculate_clicks(bid, curves) * (value_per_click - bid)
}

/// Grid search over `[min_bid, min(1.5 * break_even, ceiling)]` followed by a
/// golden-section refinement around the best grid point.
pub fn calculate_optimal_bid(curves: &MarketCurves, config: &CurveConfig) -> OptimalBid {
    let break_even = curves.conversion.break_even_cpc();
    let lower = config.min_bid;
    let upper = (1.5 * break_even).min(config.max_bid_ceiling);
    let profit = |bid: f64| calculate_profit(bid, curves);

    if upper <= lower {
        return OptimalBid {
            optimal_bid: lower,
            max_profit: profit(lower),
            profit_margin: 0.0,
            break_even_cpc: break_even,
            profit_curve: vec![ProfitPoint {
                bid: lower,
                profit: profit(lower),
            }],
        };
    }

    let step = config.grid_step.max(1e-4);
    let mut best_bid = lower;
    let mut best_profit = profit(lower);
    let mut bid = lower + step;
    while bid <= upper + 1e-9 {
        let p = profit(bid);
        if p > best_profit {
            best_profit = p;
            best_bid = bid;
        }
        bid += step;
    }

    let (refined_bid, refined_profit) = golden_section_max(
        &profit,
        (best_bid - step).max(lower),
        (best_bid + step).min(upper),
        config.golden_tolerance,
        config.golden_max_iterations,
    );
    if refined_profit > best_profit {
        best_bid = refined_bid;
        best_profit = refined_profit;
    }

    let optimal_bid = best_bid.min(break_even).max(lower);
    let max_profit = profit(optimal_bid);
    let profit_margin = if break_even > 0.0 {
        (break_even - optimal_bid) / break_even
    } else {
        0.0
    };

    OptimalBid {
        optimal_bid,
        max_profit,
        profit_margin,
        break_even_cpc: break_even,
        profit_curve: sample_profit_curve(curves, lower, upper, config.profit_curve_points),
    }
}

fn golden_section_max(
    f: &dyn Fn(f64) -> f64,
    mut lo: f64,
    mut hi: f64,
    tolerance: f64,
    max_iterations: u32,
) -> (f64, f64) {
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = hi - ratio * (hi - lo);
    let mut d = lo + ratio * (hi - lo);
    let mut fc = f(c);
    let mut fd = f(d);

    for _ in 0..max_iterations {
        if (hi - lo).abs() < tolerance {
            break;
        }
        if fc > fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - ratio * (hi - lo);
            fc = f(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + ratio * (hi - lo);
            fd = f(d);
        }
    }

    let x = (lo + hi) / 2.0;
    (x, f(x))
}

fn sample_profit_curve(curves: &MarketCurves, lower: f64, upper: f64, points: usize) -> Vec<ProfitPoint> {
    let points = points.max(2);
    let step = (upper - lower) / (points - 1) as f64;
    (0..points)
        .map(|i| {
            let bid = lower + step * i as f64;
            ProfitPoint {
                bid,
                profit: calculate_profit(bid, curves),
            }
        })
        .collect()
}

/// `0.4 * data + 0.3 * fit + 0.3 * click stability`, each term in `[0, 1]`.
pub fn calculate_confidence(samples: &[PerformanceSample], impression: &ImpressionCurve) -> f64 {
    let data_term = (samples.len() as f64 / FULL_CONFIDENCE_POINTS).min(1.0);
    let fit_term = impression.r2.clamp(0.0, 1.0);

    let stability_term = if samples.is_empty() {
        0.0
    } else {
        let n = samples.len() as f64;
        let mean = samples.iter().map(|s| s.clicks as f64).sum::<f64>() / n;
        if mean > 0.0 {
            let variance = samples
                .iter()
                .map(|s| (s.clicks as f64 - mean).powi(2))
                .sum::<f64>()
                / n;
            (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
        } else {
            0.0
        }
    };

    0.4 * data_term + 0.3 * fit_term + 0.3 * stability_term
}

pub fn build_market_curve_model(samples: &[PerformanceSample], config: &CurveConfig) -> MarketCurveModel {
    let curves = build_market_curves(samples);
    let optimal = calculate_optimal_bid(&curves, config);
    MarketCurveModel {
        curves,
        optimal_bid: optimal.optimal_bid,
        max_profit: optimal.max_profit,
        break_even_cpc: optimal.break_even_cpc,
        confidence: calculate_confidence(samples, &curves.impression),
        data_points: samples.len(),
        built_at: Utc::now(),
    }
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// Latest model per bid object. Rebuilt on demand and overwritten, never versioned.
pub struct MarketCurveStore {
    config: CurveConfig,
    models: DashMap<TargetKey, MarketCurveModel>,
}

impl MarketCurveStore {
    pub fn new(config: CurveConfig) -> Self {
        Self {
            config,
            models: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CurveConfig {
        &self.config
    }

    pub fn get(&self, key: &TargetKey) -> Option<MarketCurveModel> {
        self.models.get(key).map(|m| m.clone())
    }

    pub fn rebuild(&self, key: &TargetKey, samples: &[PerformanceSample]) -> MarketCurveModel {
        let model = build_market_curve_model(samples, &self.config);
        info!(
            account_id = %key.account_id,
            target_id = %key.target_id,
            data_points = model.data_points,
            optimal_bid = model.optimal_bid,
            confidence = model.confidence,
            "Market curve model built"
        );
        metrics::counter!("models.market_curve.builds").increment(1);
        self.models.insert(key.clone(), model.clone());
        model
    }

    /// Return the cached model, building it from the sample store when absent
    /// or when `force` is set.
    pub fn get_or_build(
        &self,
        key: &TargetKey,
        store: &dyn SampleStore,
        range: DateRange,
        force: bool,
    ) -> anyhow::Result<MarketCurveModel> {
        if !force {
            if let Some(model) = self.get(key) {
                return Ok(model);
            }
        }
        let samples = store.samples(key, range)?;
        Ok(self.rebuild(key, &samples))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
