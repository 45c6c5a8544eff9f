//! Consolidation Engine
//!
//! Folds resolved datasets into one validated row per state:
//! 1. pivot records to entity -> metric, keeping the latest period
//! 2. outer-join on entity key (national records become context)
//! 3. flag robust-z outliers per metric, outcome included
//! 4. impute missing features with the cohort median

pub mod robust;

use crate::config::ConsolidationConfig;
use crate::fallback::ResolvedDataset;
use crate::models::{ConsolidatedDataset, ConsolidatedRow, FeatureValue, Provenance, QualityFlag};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationError {
    Validation(String),
    /// A required feature has no observed value for any retained entity.
    ImputationFailure { metric: String },
}

impl std::fmt::Display for ConsolidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "consolidation validation failed: {}", msg),
            Self::ImputationFailure { metric } => {
                write!(f, "cannot impute {}: no observed values", metric)
            }
        }
    }
}

impl std::error::Error for ConsolidationError {}

/// A pivoted cell: value plus where it came from.
#[derive(Debug, Clone, Copy)]
struct Cell {
    value: f64,
    period: i32,
    dataset: usize,
}

pub struct ConsolidationEngine {
    config: ConsolidationConfig,
}

impl ConsolidationEngine {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn consolidate(
        &self,
        datasets: &[ResolvedDataset],
    ) -> Result<ConsolidatedDataset, ConsolidationError> {
        self.validate_config()?;
        if datasets.is_empty() {
            return Err(ConsolidationError::Validation("no datasets to consolidate".into()));
        }

        // 1. pivot
        let mut cells: BTreeMap<String, BTreeMap<String, Cell>> = BTreeMap::new();
        let mut national: BTreeMap<String, (i32, f64)> = BTreeMap::new();
        let mut rejected: BTreeMap<String, Vec<QualityFlag>> = BTreeMap::new();
        let mut observed_in: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();

        for (idx, dataset) in datasets.iter().enumerate() {
            for record in &dataset.records {
                if record.is_national() {
                    let slot = national
                        .entry(record.metric_name.clone())
                        .or_insert((record.period, record.value));
                    if record.value.is_finite() && (record.period > slot.0 || !slot.1.is_finite()) {
                        *slot = (record.period, record.value);
                    }
                    continue;
                }

                observed_in
                    .entry(idx)
                    .or_default()
                    .insert(record.entity_key.clone());

                if !record.value.is_finite() || record.value < 0.0 {
                    debug!(
                        entity = %record.entity_key,
                        metric = %record.metric_name,
                        value = record.value,
                        "rejecting value"
                    );
                    rejected
                        .entry(record.entity_key.clone())
                        .or_default()
                        .push(QualityFlag::RejectedValue {
                            metric: record.metric_name.clone(),
                            value: record.value,
                        });
                    continue;
                }

                let cell = Cell {
                    value: record.value,
                    period: record.period,
                    dataset: idx,
                };
                cells
                    .entry(record.entity_key.clone())
                    .or_default()
                    .entry(record.metric_name.clone())
                    .and_modify(|existing| {
                        if cell.period > existing.period {
                            *existing = cell;
                        }
                    })
                    .or_insert(cell);
            }
        }

        // 2. join
        // Entities backed by real data; synthetic-only states are dropped
        // unless no real dataset has state-level records at all.
        let mut retained: BTreeSet<String> = observed_in
            .iter()
            .filter(|(idx, _)| !datasets[**idx].provenance.is_synthetic())
            .flat_map(|(_, entities)| entities.iter().cloned())
            .collect();
        if retained.is_empty() {
            retained = observed_in.values().flatten().cloned().collect();
        }

        if retained.is_empty() {
            return Err(ConsolidationError::Validation(
                "no state-level records in any dataset".into(),
            ));
        }

        let empty = BTreeMap::new();
        let mut rows: Vec<ConsolidatedRow> = retained
            .iter()
            .map(|entity| {
                let entity_cells = cells.get(entity).unwrap_or(&empty);
                let mut row = ConsolidatedRow::new(entity.clone());

                for feature in &self.config.required_features {
                    if let Some(cell) = entity_cells.get(feature) {
                        row.features
                            .insert(feature.clone(), FeatureValue::observed(cell.value));
                    }
                }
                row.outcome = entity_cells
                    .get(&self.config.outcome_metric)
                    .map(|c| c.value);

                if let Some(flags) = rejected.get(entity) {
                    row.flags.extend(flags.iter().cloned());
                }
                let contributing: BTreeSet<usize> =
                    entity_cells.values().map(|c| c.dataset).collect();
                for idx in contributing {
                    let dataset = &datasets[idx];
                    if dataset.provenance.is_synthetic() {
                        row.flags.push(QualityFlag::SyntheticSource {
                            dataset: dataset.name.clone(),
                        });
                    } else if dataset.provenance.is_stale() {
                        row.flags.push(QualityFlag::StaleSource {
                            dataset: dataset.name.clone(),
                        });
                    }
                }
                if row.outcome.is_none() {
                    row.flags.push(QualityFlag::MissingOutcome);
                }
                row
            })
            .collect();

        // 3 + 4, per feature; the outcome is only flagged
        let mut outliers = 0usize;
        let mut imputed = 0usize;
        for feature in &self.config.required_features {
            outliers += self.flag_outliers(&mut rows, feature);
            imputed += impute_median(&mut rows, feature)?;
        }
        outliers += self.flag_outcome_outliers(&mut rows);

        let context: BTreeMap<String, f64> = national
            .into_iter()
            .filter(|(_, (_, v))| v.is_finite())
            .map(|(metric, (_, v))| (metric, v))
            .collect();
        let provenance: BTreeMap<String, Provenance> = datasets
            .iter()
            .map(|d| (d.name.clone(), d.provenance))
            .collect();

        let dataset = ConsolidatedDataset {
            rows,
            required_features: self.config.required_features.clone(),
            outcome_metric: self.config.outcome_metric.clone(),
            provenance,
            context,
        };

        let missing_outcome = dataset.rows.iter().filter(|r| !r.is_trainable()).count();
        info!(
            entities = dataset.len(),
            trainable = dataset.len() - missing_outcome,
            missing_outcome,
            outliers,
            imputed,
            rejected = rejected.values().map(Vec::len).sum::<usize>(),
            fully_synthetic = dataset.is_fully_synthetic(),
            "consolidation complete"
        );
        Ok(dataset)
    }

    fn validate_config(&self) -> Result<(), ConsolidationError> {
        if self.config.required_features.is_empty() {
            return Err(ConsolidationError::Validation("no required features".into()));
        }
        if self
            .config
            .required_features
            .contains(&self.config.outcome_metric)
        {
            return Err(ConsolidationError::Validation(format!(
                "outcome {} is also a feature",
                self.config.outcome_metric
            )));
        }
        if !(self.config.outlier_threshold.is_finite() && self.config.outlier_threshold > 0.0) {
            return Err(ConsolidationError::Validation(format!(
                "outlier threshold must be positive, got {}",
                self.config.outlier_threshold
            )));
        }
        Ok(())
    }

    /// (row index, robust z) for every value beyond the threshold.
    fn outliers_among(&self, metric: &str, observed: &[(usize, f64)]) -> Vec<(usize, f64)> {
        let values: Vec<f64> = observed.iter().map(|(_, v)| *v).collect();
        let Some(scores) = robust::robust_z_scores(&values) else {
            debug!(metric, "zero MAD, outlier check skipped");
            return Vec::new();
        };
        observed
            .iter()
            .zip(scores)
            .filter(|(_, z)| z.abs() > self.config.outlier_threshold)
            .map(|((i, _), z)| (*i, z))
            .collect()
    }

    /// Flag observed values of `feature` whose |robust z| exceeds the threshold.
    fn flag_outliers(&self, rows: &mut [ConsolidatedRow], feature: &str) -> usize {
        let observed: Vec<(usize, f64)> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.feature(feature).map(|v| (i, v)))
            .collect();

        let flagged = self.outliers_among(feature, &observed);
        for &(i, z) in &flagged {
            let row = &mut rows[i];
            if let Some(cell) = row.features.get_mut(feature) {
                cell.outlier = true;
            }
            row.flags.push(QualityFlag::Outlier {
                metric: feature.to_string(),
                robust_z: z,
            });
        }
        flagged.len()
    }

    /// Same check over the outcome column. Outcomes are flagged, never replaced.
    fn flag_outcome_outliers(&self, rows: &mut [ConsolidatedRow]) -> usize {
        let observed: Vec<(usize, f64)> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.outcome.map(|v| (i, v)))
            .collect();

        let flagged = self.outliers_among(&self.config.outcome_metric, &observed);
        for &(i, z) in &flagged {
            rows[i].flags.push(QualityFlag::Outlier {
                metric: self.config.outcome_metric.clone(),
                robust_z: z,
            });
        }
        flagged.len()
    }
}

/// Fill absent cells of `feature` with the median of the observed ones.
fn impute_median(rows: &mut [ConsolidatedRow], feature: &str) -> Result<usize, ConsolidationError> {
    let missing = rows.iter().filter(|r| r.feature(feature).is_none()).count();
    if missing == 0 {
        return Ok(0);
    }

    let values: Vec<f64> = rows.iter().filter_map(|r| r.feature(feature)).collect();
    let fill = robust::median(&values).ok_or_else(|| {
        warn!(feature, "feature has no observed values");
        ConsolidationError::ImputationFailure {
            metric: feature.to_string(),
        }
    })?;

    for row in rows.iter_mut().filter(|r| r.feature(feature).is_none()) {
        row.features
            .insert(feature.to_string(), FeatureValue::imputed(fill));
        row.flags.push(QualityFlag::Imputed {
            metric: feature.to_string(),
        });
    }
    Ok(missing)
}
