//! Built-in synthetic dataset
//!
//! Last-resort records for every logical dataset. Generated once from a fixed
//! seed so every run (and every test) sees the same table. Outcomes follow a
//! documented linear relationship so a model trained on the fallback still
//! has something real to find:
//!
//! ```text
//! naep_score = 262 + 0.0011·spending + 0.00012·income − 0.55·poverty − 0.35·ptr + ε,  ε ~ N(0, 1.5)
//! ```

use super::{states, FetchOutcome, SourceAdapter, SourceError, SourceQuery};
use crate::cache::CacheStore;
use crate::models::{metric_names, NormalizedRecord, Provenance, Unit, NATIONAL_ENTITY};
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use std::collections::{BTreeMap, BTreeSet};

pub const SYNTHETIC_SOURCE_ID: &str = "synthetic";
pub const SYNTHETIC_SEED: u64 = 0x0ED5_C0DE;
pub const SYNTHETIC_PERIOD: i32 = 2022;

pub const BASE_SCORE: f64 = 262.0;
pub const SPENDING_EFFECT: f64 = 0.0011;
pub const INCOME_EFFECT: f64 = 0.00012;
pub const POVERTY_EFFECT: f64 = -0.55;
pub const PUPIL_TEACHER_EFFECT: f64 = -0.35;
pub const NOISE_SD: f64 = 1.5;

/// Metrics every synthetic state row carries.
pub const STATE_METRICS: [&str; 5] = [
    metric_names::MEDIAN_HOUSEHOLD_INCOME,
    metric_names::POVERTY_RATE,
    metric_names::PER_PUPIL_SPENDING,
    metric_names::PUPIL_TEACHER_RATIO,
    metric_names::NAEP_SCORE,
];

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    records: Vec<NormalizedRecord>,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            records: generate(SYNTHETIC_SEED),
        }
    }

    /// Substitute a custom static table.
    pub fn from_records(records: Vec<NormalizedRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    /// Records for the metrics a query asks for.
    pub fn records_for(&self, query: &SourceQuery) -> Vec<NormalizedRecord> {
        query.retain(self.records.clone())
    }

    /// Check that the table can stand in for any logical dataset: every state
    /// carries every state metric with a finite value.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for r in &self.records {
            if !r.value.is_finite() {
                return Err(format!(
                    "non-finite {} for {}",
                    r.metric_name, r.entity_key
                ));
            }
            seen.entry(r.entity_key.as_str())
                .or_default()
                .insert(r.metric_name.as_str());
        }
        for state in states::postal_codes() {
            let metrics = seen
                .get(state)
                .ok_or_else(|| format!("no synthetic records for {}", state))?;
            if let Some(missing) = STATE_METRICS.iter().find(|m| !metrics.contains(*m)) {
                return Err(format!("synthetic {} lacks {}", state, missing));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for SyntheticSource {
    fn source_id(&self) -> &str {
        SYNTHETIC_SOURCE_ID
    }

    async fn fetch(
        &self,
        query: &SourceQuery,
        _cache: &CacheStore,
    ) -> Result<FetchOutcome, SourceError> {
        Ok(FetchOutcome {
            records: self.records_for(query),
            provenance: Provenance::Synthetic,
        })
    }
}

/// Expected (noise-free) score for a feature combination.
pub fn expected_score(spending: f64, income: f64, poverty: f64, pupil_teacher_ratio: f64) -> f64 {
    BASE_SCORE
        + SPENDING_EFFECT * spending
        + INCOME_EFFECT * income
        + POVERTY_EFFECT * poverty
        + PUPIL_TEACHER_EFFECT * pupil_teacher_ratio
}

fn generate(seed: u64) -> Vec<NormalizedRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut draw = |mean: f64, sd: f64| -> f64 {
        match Normal::new(mean, sd) {
            Ok(dist) => rng.sample(dist),
            Err(_) => mean,
        }
    };

    let mut records = Vec::with_capacity(states::JURISDICTIONS.len() * STATE_METRICS.len() + 2);
    let push = |records: &mut Vec<NormalizedRecord>,
                state: &str,
                metric: &str,
                value: f64,
                unit: Unit| {
        records.push(NormalizedRecord::new(
            state,
            SYNTHETIC_SOURCE_ID,
            metric,
            value,
            unit,
            SYNTHETIC_PERIOD,
        ));
    };

    for state in states::postal_codes() {
        let income = draw(70_000.0, 12_000.0).clamp(40_000.0, 120_000.0);
        let poverty = (27.0 - income / 6_500.0 + draw(0.0, 2.0)).clamp(5.0, 25.0);
        let spending = draw(13_500.0, 3_000.0).clamp(8_000.0, 26_000.0);
        let ptr = draw(15.5, 2.2).clamp(10.0, 24.0);
        let score = expected_score(spending, income, poverty, ptr) + draw(0.0, NOISE_SD);

        push(&mut records, state, metric_names::MEDIAN_HOUSEHOLD_INCOME, income.round(), Unit::Usd);
        push(&mut records, state, metric_names::POVERTY_RATE, poverty, Unit::Percent);
        push(&mut records, state, metric_names::PER_PUPIL_SPENDING, spending.round(), Unit::Usd);
        push(&mut records, state, metric_names::PUPIL_TEACHER_RATIO, ptr, Unit::Ratio);
        push(&mut records, state, metric_names::NAEP_SCORE, score, Unit::ScaleScore);
    }

    push(&mut records, NATIONAL_ENTITY, metric_names::GDP_PER_CAPITA, 76_329.58, Unit::Usd);
    push(
        &mut records,
        NATIONAL_ENTITY,
        metric_names::EDUCATION_SPENDING_PCT_GDP,
        4.9,
        Unit::Percent,
    );

    records
}
