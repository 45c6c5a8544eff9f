//! Policy Simulator
//!
//! Applies named perturbations to a copy of a feature vector and reports the
//! selected model's predicted outcome change. All perturbations land on the
//! same vector before one prediction, so interaction effects are captured.

use crate::config::SimulationConfig;
use crate::consolidation::robust;
use crate::models::{ConsolidatedDataset, ConsolidatedRow, FeatureValue};
use crate::modeling::{ModelError, SelectedModel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Adjustment {
    /// Relative change in percent: `20.0` means +20%.
    Percent(f64),
    /// Additive change in the feature's own unit (percentage points for rates).
    Delta(f64),
    /// Replace the value outright.
    Set(f64),
}

impl Adjustment {
    pub fn apply(&self, current: f64) -> f64 {
        match *self {
            Adjustment::Percent(pct) => current * (1.0 + pct / 100.0),
            Adjustment::Delta(delta) => current + delta,
            Adjustment::Set(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perturbation {
    pub feature: String,
    pub adjustment: Adjustment,
}

impl Perturbation {
    pub fn percent(feature: impl Into<String>, pct: f64) -> Self {
        Self {
            feature: feature.into(),
            adjustment: Adjustment::Percent(pct),
        }
    }

    pub fn delta(feature: impl Into<String>, delta: f64) -> Self {
        Self {
            feature: feature.into(),
            adjustment: Adjustment::Delta(delta),
        }
    }

    pub fn set(feature: impl Into<String>, value: f64) -> Self {
        Self {
            feature: feature.into(),
            adjustment: Adjustment::Set(value),
        }
    }
}

impl fmt::Display for Perturbation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.adjustment {
            Adjustment::Percent(p) => write!(f, "{}{:+}%", self.feature, p),
            Adjustment::Delta(d) => write!(f, "{}{:+}", self.feature, d),
            Adjustment::Set(v) => write!(f, "{}={}", self.feature, v),
        }
    }
}

/// Parses `spending+20%`, `poverty_rate-5`, or `pupil_teacher_ratio=14`.
impl FromStr for Perturbation {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ScenarioError::InvalidScenario {
            feature: s.trim().to_string(),
            reason: reason.to_string(),
        };
        let s = s.trim();

        if let Some((feature, value)) = s.split_once('=') {
            let value: f64 = value.trim().parse().map_err(|_| invalid("bad value"))?;
            return Ok(Perturbation::set(feature.trim(), value));
        }

        let at = s
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '+' || *c == '-')
            .map(|(i, _)| i)
            .ok_or_else(|| invalid("expected feature+N%, feature-N, or feature=N"))?;
        let (feature, change) = s.split_at(at);
        let feature = feature.trim();
        if feature.is_empty() {
            return Err(invalid("missing feature name"));
        }

        match change.strip_suffix('%') {
            Some(pct) => {
                let pct: f64 = pct.trim().parse().map_err(|_| invalid("bad percent"))?;
                Ok(Perturbation::percent(feature, pct))
            }
            None => {
                let delta: f64 = change.trim().parse().map_err(|_| invalid("bad delta"))?;
                Ok(Perturbation::delta(feature, delta))
            }
        }
    }
}

/// A scenario request: base row plus ordered perturbations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub base_row: ConsolidatedRow,
    pub perturbations: Vec<Perturbation>,
}

impl Scenario {
    pub fn new(base_row: ConsolidatedRow) -> Self {
        Self {
            base_row,
            perturbations: Vec::new(),
        }
    }

    pub fn with(mut self, perturbation: Perturbation) -> Self {
        self.perturbations.push(perturbation);
        self
    }
}

/// Result of one simulation; not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationScenario {
    pub base_row: ConsolidatedRow,
    pub perturbations: Vec<Perturbation>,
    pub perturbed_features: Vec<(String, f64)>,
    pub baseline_outcome: f64,
    pub predicted_outcome: f64,
    pub delta_outcome: f64,
}

/// Mean effect of a scenario applied to every training row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationEffect {
    pub perturbations: Vec<Perturbation>,
    pub rows: usize,
    pub mean_delta: f64,
    pub min_delta: f64,
    pub max_delta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioError {
    InvalidScenario { feature: String, reason: String },
    /// The model refused the feature vector.
    Model(ModelError),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidScenario { feature, reason } => {
                write!(f, "invalid scenario for {}: {}", feature, reason)
            }
            Self::Model(e) => write!(f, "prediction failed: {}", e),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Model(e) => Some(e),
            Self::InvalidScenario { .. } => None,
        }
    }
}

impl From<ModelError> for ScenarioError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

pub struct PolicySimulator {
    config: SimulationConfig,
}

impl PolicySimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub fn simulate(
        &self,
        model: &SelectedModel,
        scenario: &Scenario,
    ) -> Result<SimulationScenario, ScenarioError> {
        let names = model.feature_names();
        let base = names
            .iter()
            .map(|name| {
                scenario
                    .base_row
                    .feature(name)
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| ScenarioError::InvalidScenario {
                        feature: name.clone(),
                        reason: format!(
                            "base row {} has no value",
                            scenario.base_row.entity_key
                        ),
                    })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let perturbed = self.apply(names, &base, &scenario.perturbations)?;
        let baseline_outcome = model.predict(&base)?;
        let predicted_outcome = model.predict(&perturbed)?;

        debug!(
            entity = %scenario.base_row.entity_key,
            perturbations = scenario.perturbations.len(),
            baseline_outcome,
            predicted_outcome,
            "scenario simulated"
        );

        Ok(SimulationScenario {
            base_row: scenario.base_row.clone(),
            perturbations: scenario.perturbations.clone(),
            perturbed_features: names.iter().cloned().zip(perturbed).collect(),
            baseline_outcome,
            predicted_outcome,
            delta_outcome: predicted_outcome - baseline_outcome,
        })
    }

    /// Feature-wise median over the training rows.
    pub fn population_baseline(
        &self,
        model: &SelectedModel,
        dataset: &ConsolidatedDataset,
    ) -> Result<ConsolidatedRow, ScenarioError> {
        let mut row = ConsolidatedRow::new("population");
        for name in model.feature_names() {
            let values: Vec<f64> = dataset
                .training_rows()
                .filter_map(|r| r.feature(name))
                .collect();
            let median = robust::median(&values).ok_or_else(|| ScenarioError::InvalidScenario {
                feature: name.clone(),
                reason: "no training values".into(),
            })?;
            row.features
                .insert(name.clone(), FeatureValue::observed(median));
        }
        Ok(row)
    }

    /// Apply the perturbations to every training row and summarize the deltas.
    /// Any row pushed out of range rejects the whole scenario.
    pub fn simulate_population(
        &self,
        model: &SelectedModel,
        dataset: &ConsolidatedDataset,
        perturbations: &[Perturbation],
    ) -> Result<PopulationEffect, ScenarioError> {
        let mut deltas = Vec::new();
        for row in dataset.training_rows() {
            let scenario = Scenario {
                base_row: row.clone(),
                perturbations: perturbations.to_vec(),
            };
            deltas.push(self.simulate(model, &scenario)?.delta_outcome);
        }
        if deltas.is_empty() {
            return Err(ScenarioError::InvalidScenario {
                feature: "*".into(),
                reason: "dataset has no training rows".into(),
            });
        }

        Ok(PopulationEffect {
            perturbations: perturbations.to_vec(),
            rows: deltas.len(),
            mean_delta: deltas.iter().sum::<f64>() / deltas.len() as f64,
            min_delta: deltas.iter().copied().fold(f64::INFINITY, f64::min),
            max_delta: deltas.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    fn apply(
        &self,
        names: &[String],
        base: &[f64],
        perturbations: &[Perturbation],
    ) -> Result<Vec<f64>, ScenarioError> {
        let mut values = base.to_vec();
        for p in perturbations {
            let invalid = |reason: String| ScenarioError::InvalidScenario {
                feature: p.feature.clone(),
                reason,
            };
            let j = names
                .iter()
                .position(|n| *n == p.feature)
                .ok_or_else(|| invalid("not a model feature".into()))?;
            let range = self
                .config
                .ranges
                .get(&p.feature)
                .ok_or_else(|| invalid("no valid range configured".into()))?;

            let next = p.adjustment.apply(values[j]);
            if !range.contains(next) {
                return Err(invalid(format!(
                    "{} outside [{}, {}]",
                    next, range.min, range.max
                )));
            }
            values[j] = next;
        }
        Ok(values)
    }
}
