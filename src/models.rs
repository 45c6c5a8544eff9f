//! Shared data model
//!
//! Raw responses live in the cache, adapters emit normalized records, and the
//! consolidation engine folds them into one row per state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Entity key used for nation-level records (World Bank context metrics).
pub const NATIONAL_ENTITY: &str = "US";

/// Canonical metric names shared by adapters, consolidation and modeling.
pub mod metric_names {
    pub const MEDIAN_HOUSEHOLD_INCOME: &str = "median_household_income";
    pub const POVERTY_RATE: &str = "poverty_rate";
    pub const PER_PUPIL_SPENDING: &str = "per_pupil_spending";
    pub const PUPIL_TEACHER_RATIO: &str = "pupil_teacher_ratio";
    pub const NAEP_SCORE: &str = "naep_score";
    pub const GDP_PER_CAPITA: &str = "gdp_per_capita";
    pub const EDUCATION_SPENDING_PCT_GDP: &str = "education_spending_pct_gdp";
}

/// A raw source response as stored in the cache.
///
/// `payload` is the response body exactly as received so that a cache
/// round-trip is byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResponse {
    pub source_id: String,
    pub query_key: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: String,
    pub ttl_secs: u64,
}

impl RawResponse {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Age of the response relative to `now` (zero if `fetched_at` is in the future).
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or_default()
    }
}

/// Measurement unit attached to a normalized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Usd,
    Percent,
    Ratio,
    ScaleScore,
}

/// One metric value for one entity, as produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub entity_key: String,
    pub source_id: String,
    pub metric_name: String,
    pub value: f64,
    pub unit: Unit,
    /// Reference year of the observation.
    pub period: i32,
}

impl NormalizedRecord {
    pub fn new(
        entity_key: impl Into<String>,
        source_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        unit: Unit,
        period: i32,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            source_id: source_id.into(),
            metric_name: metric_name.into(),
            value,
            unit,
            period,
        }
    }

    pub fn is_national(&self) -> bool {
        self.entity_key == NATIONAL_ENTITY
    }
}

/// Where the records of a logical dataset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Provenance {
    Live,
    Cached { stale: bool },
    Synthetic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Live => "live",
            Provenance::Cached { .. } => "cached",
            Provenance::Synthetic => "synthetic",
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Provenance::Synthetic)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Provenance::Cached { stale: true })
    }

    /// Combine the provenance of two partial fetches, keeping the weaker one.
    pub fn degrade(self, other: Provenance) -> Provenance {
        fn rank(p: &Provenance) -> u8 {
            match p {
                Provenance::Live => 0,
                Provenance::Cached { stale: false } => 1,
                Provenance::Cached { stale: true } => 2,
                Provenance::Synthetic => 3,
            }
        }
        if rank(&other) > rank(&self) {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Cached { stale: true } => write!(f, "cached(stale)"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Data quality markers attached to a consolidated row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "flag")]
pub enum QualityFlag {
    Imputed { metric: String },
    Outlier { metric: String, robust_z: f64 },
    MissingOutcome,
    SyntheticSource { dataset: String },
    StaleSource { dataset: String },
    RejectedValue { metric: String, value: f64 },
}

/// A single feature cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub value: f64,
    #[serde(default)]
    pub imputed: bool,
    #[serde(default)]
    pub outlier: bool,
}

impl FeatureValue {
    pub fn observed(value: f64) -> Self {
        Self {
            value,
            imputed: false,
            outlier: false,
        }
    }

    pub fn imputed(value: f64) -> Self {
        Self {
            value,
            imputed: true,
            outlier: false,
        }
    }
}

/// One row per entity after consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRow {
    pub entity_key: String,
    pub features: BTreeMap<String, FeatureValue>,
    pub outcome: Option<f64>,
    pub flags: Vec<QualityFlag>,
}

impl ConsolidatedRow {
    pub fn new(entity_key: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            features: BTreeMap::new(),
            outcome: None,
            flags: Vec::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features
            .insert(name.into(), FeatureValue::observed(value));
        self
    }

    pub fn with_outcome(mut self, outcome: f64) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).map(|f| f.value)
    }

    pub fn is_imputed(&self, name: &str) -> bool {
        self.features.get(name).map(|f| f.imputed).unwrap_or(false)
    }

    pub fn has_flag(&self, predicate: impl Fn(&QualityFlag) -> bool) -> bool {
        self.flags.iter().any(predicate)
    }

    pub fn is_trainable(&self) -> bool {
        self.outcome.map(f64::is_finite).unwrap_or(false)
    }
}

/// The joined, validated per-entity table used for training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedDataset {
    pub rows: Vec<ConsolidatedRow>,
    pub required_features: Vec<String>,
    pub outcome_metric: String,
    pub provenance: BTreeMap<String, Provenance>,
    /// Nation-level context metrics (not used as per-row features).
    pub context: BTreeMap<String, f64>,
}

impl ConsolidatedDataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, entity_key: &str) -> Option<&ConsolidatedRow> {
        self.rows.iter().find(|r| r.entity_key == entity_key)
    }

    /// Rows eligible for training (outcome present).
    pub fn training_rows(&self) -> impl Iterator<Item = &ConsolidatedRow> {
        self.rows.iter().filter(|r| r.is_trainable())
    }

    pub fn is_fully_synthetic(&self) -> bool {
        !self.provenance.is_empty() && self.provenance.values().all(Provenance::is_synthetic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_degrade_keeps_weakest() {
        let p = Provenance::Live.degrade(Provenance::Cached { stale: true });
        assert_eq!(p, Provenance::Cached { stale: true });
        assert_eq!(
            Provenance::Cached { stale: false }.degrade(Provenance::Live),
            Provenance::Cached { stale: false }
        );
        assert_eq!(Provenance::Live.to_string(), "live");
        assert_eq!(Provenance::Cached { stale: true }.to_string(), "cached(stale)");
    }

    #[test]
    fn test_raw_response_age() {
        let now = Utc::now();
        let resp = RawResponse {
            source_id: "census".into(),
            query_key: "q".into(),
            fetched_at: now - chrono::Duration::seconds(30),
            payload: "[]".into(),
            ttl_secs: 60,
        };
        assert_eq!(resp.age_at(now), Duration::from_secs(30));
        assert_eq!(resp.ttl(), Duration::from_secs(60));
    }
}
