//! Collaborator traits for the persistence layer and the advertising platform,
//! with in-memory implementations used by tests and the local binary.

use crate::types::{ExecutionType, PerformanceSample, TargetType};
use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Key identifying one bid object within an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub account_id: String,
    pub target_type: TargetType,
    pub target_id: String,
}

impl TargetKey {
    pub fn new(
        account_id: impl Into<String>,
        target_type: TargetType,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            target_type,
            target_id: target_id.into(),
        }
    }
}

/// Inclusive date window for sample queries. `None` bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: Option<NaiveDate>) -> bool {
        let Some(date) = date else {
            return self.start.is_none() && self.end.is_none();
        };
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Source of historical performance samples.
pub trait SampleStore: Send + Sync {
    fn samples(&self, key: &TargetKey, range: DateRange) -> anyhow::Result<Vec<PerformanceSample>>;
}

#[derive(Default)]
pub struct InMemorySampleStore {
    samples: DashMap<TargetKey, Vec<PerformanceSample>>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: TargetKey, samples: Vec<PerformanceSample>) {
        self.samples.entry(key).or_default().extend(samples);
    }
}

impl SampleStore for InMemorySampleStore {
    fn samples(&self, key: &TargetKey, range: DateRange) -> anyhow::Result<Vec<PerformanceSample>> {
        Ok(self
            .samples
            .get(key)
            .map(|s| {
                s.iter()
                    .filter(|sample| range.contains(sample.date))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// A change to push to the advertising platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformChange {
    pub account_id: String,
    pub target_id: String,
    pub execution_type: ExecutionType,
    pub new_value: f64,
    /// Keyword text for negative-keyword additions.
    pub text: Option<String>,
}

/// The advertising platform's write API.
pub trait AdPlatform: Send + Sync {
    fn apply(&self, change: &PlatformChange) -> anyhow::Result<()>;
}

/// Records every applied change; targets listed in `fail_targets` error out.
#[derive(Default)]
pub struct RecordingAdPlatform {
    applied: Mutex<Vec<PlatformChange>>,
    fail_targets: DashSet<String>,
    attempts: DashMap<String, u32>,
}

impl RecordingAdPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, target_id: impl Into<String>) {
        self.fail_targets.insert(target_id.into());
    }

    pub fn applied(&self) -> Vec<PlatformChange> {
        self.applied.lock().clone()
    }

    pub fn attempts(&self, target_id: &str) -> u32 {
        self.attempts.get(target_id).map(|a| *a).unwrap_or(0)
    }
}

impl AdPlatform for RecordingAdPlatform {
    fn apply(&self, change: &PlatformChange) -> anyhow::Result<()> {
        *self.attempts.entry(change.target_id.clone()).or_insert(0) += 1;
        if self.fail_targets.contains(&change.target_id) {
            anyhow::bail!("platform rejected change for {}", change.target_id);
        }
        debug!(
            account_id = %change.account_id,
            target_id = %change.target_id,
            execution_type = %change.execution_type,
            new_value = change.new_value,
            "Change applied"
        );
        self.applied.lock().push(change.clone());
        Ok(())
    }
}
