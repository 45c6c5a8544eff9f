//! Model Trainer
//!
//! Fits every kind in the roster on one shared stratified split, tunes each
//! by k-fold CV on the training side, and selects the best held-out R².
//! Kinds train in parallel; all randomness comes from `ChaCha8Rng` seeded by
//! the configured seed (and the kind), so a fixed dataset and seed always
//! select the same model with the same metrics.

pub mod linear;
pub mod metrics;
pub mod scaler;
pub mod split;
pub mod tree;

use crate::config::{HyperparameterGrid, TrainingConfig};
use crate::models::{ConsolidatedDataset, ConsolidatedRow};
use linear::LinearModel;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use scaler::Standardizer;
use serde::{Deserialize, Serialize};
use serde_json::json;
use split::Split;
use std::fmt;
use tracing::{debug, info, warn};
use tree::{GradientBoosting, RandomForest, TreeParams};

/// Held-out R² differences at or below this are ties.
pub const TIE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Linear,
    Lasso,
    Ridge,
    RandomForest,
    GradientBoosting,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Linear,
        ModelKind::Lasso,
        ModelKind::Ridge,
        ModelKind::RandomForest,
        ModelKind::GradientBoosting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::Lasso => "lasso",
            ModelKind::Ridge => "ridge",
            ModelKind::RandomForest => "random_forest",
            ModelKind::GradientBoosting => "gradient_boosting",
        }
    }

    fn seed_offset(&self) -> u64 {
        match self {
            ModelKind::Linear => 0x11,
            ModelKind::Lasso => 0x22,
            ModelKind::Ridge => 0x33,
            ModelKind::RandomForest => 0x44,
            ModelKind::GradientBoosting => 0x55,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trained parameters chosen by the grid search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Hyperparameters {
    Linear,
    Lasso {
        alpha: f64,
    },
    Ridge {
        alpha: f64,
    },
    RandomForest {
        trees: usize,
        max_depth: usize,
        min_samples_leaf: usize,
    },
    GradientBoosting {
        rounds: usize,
        learning_rate: f64,
        max_depth: usize,
        min_samples_leaf: usize,
    },
}

impl Hyperparameters {
    /// Every grid point for `kind`.
    pub fn grid(kind: ModelKind, grid: &HyperparameterGrid) -> Vec<Hyperparameters> {
        let leaf = grid.min_samples_leaf;
        match kind {
            ModelKind::Linear => vec![Hyperparameters::Linear],
            ModelKind::Lasso => grid
                .lasso_alpha
                .iter()
                .map(|&alpha| Hyperparameters::Lasso { alpha })
                .collect(),
            ModelKind::Ridge => grid
                .ridge_alpha
                .iter()
                .map(|&alpha| Hyperparameters::Ridge { alpha })
                .collect(),
            ModelKind::RandomForest => grid
                .forest_trees
                .iter()
                .flat_map(|&trees| {
                    grid.forest_max_depth
                        .iter()
                        .map(move |&max_depth| Hyperparameters::RandomForest {
                            trees,
                            max_depth,
                            min_samples_leaf: leaf,
                        })
                })
                .collect(),
            ModelKind::GradientBoosting => {
                let mut points = Vec::new();
                for &rounds in &grid.boosting_rounds {
                    for &learning_rate in &grid.boosting_learning_rate {
                        for &max_depth in &grid.boosting_max_depth {
                            points.push(Hyperparameters::GradientBoosting {
                                rounds,
                                learning_rate,
                                max_depth,
                                min_samples_leaf: leaf,
                            });
                        }
                    }
                }
                points
            }
        }
    }
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hyperparameters::Linear => write!(f, "-"),
            Hyperparameters::Lasso { alpha } | Hyperparameters::Ridge { alpha } => {
                write!(f, "alpha={}", alpha)
            }
            Hyperparameters::RandomForest {
                trees,
                max_depth,
                min_samples_leaf,
            } => write!(f, "trees={} depth={} leaf={}", trees, max_depth, min_samples_leaf),
            Hyperparameters::GradientBoosting {
                rounds,
                learning_rate,
                max_depth,
                min_samples_leaf,
            } => write!(
                f,
                "rounds={} lr={} depth={} leaf={}",
                rounds, learning_rate, max_depth, min_samples_leaf
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// One kind could not be fit; it is excluded from selection.
    ConvergenceFailure { kind: ModelKind, reason: String },
    NoConvergedModels { failures: Vec<(ModelKind, String)> },
    InsufficientData { rows: usize, needed: usize },
    MissingFeature { entity: String, feature: String },
    /// Feature vector length differs from the model's feature list.
    DimensionMismatch { expected: usize, got: usize },
    InvalidConfig(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConvergenceFailure { kind, reason } => {
                write!(f, "{} failed to converge: {}", kind, reason)
            }
            Self::NoConvergedModels { failures } => {
                write!(f, "no model kind converged")?;
                for (kind, reason) in failures {
                    write!(f, "; {}: {}", kind, reason)?;
                }
                Ok(())
            }
            Self::InsufficientData { rows, needed } => write!(
                f,
                "insufficient training data: {} rows, need at least {}",
                rows, needed
            ),
            Self::MissingFeature { entity, feature } => {
                write!(f, "row {} lacks feature {}", entity, feature)
            }
            Self::DimensionMismatch { expected, got } => {
                write!(f, "expected {} features, got {}", expected, got)
            }
            Self::InvalidConfig(msg) => write!(f, "invalid training config: {}", msg),
        }
    }
}

impl std::error::Error for ModelError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Estimator {
    Linear(LinearModel),
    Forest(RandomForest),
    Boosting(GradientBoosting),
}

impl Estimator {
    fn predict_one(&self, z: &[f64]) -> f64 {
        match self {
            Estimator::Linear(m) => m.predict_one(z),
            Estimator::Forest(m) => m.predict_one(z),
            Estimator::Boosting(m) => m.predict_one(z),
        }
    }
}

/// A fitted estimator together with the scaler it was trained behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FittedModel {
    scaler: Standardizer,
    estimator: Estimator,
}

impl FittedModel {
    fn fit(
        params: Hyperparameters,
        x: &[Vec<f64>],
        y: &[f64],
        rng: &mut ChaCha8Rng,
    ) -> Result<Self, String> {
        let scaler = Standardizer::fit(x);
        let z = scaler.transform(x);
        let width = scaler.width();

        let estimator = match params {
            Hyperparameters::Linear => Estimator::Linear(linear::fit_ols(&z, y)?),
            Hyperparameters::Lasso { alpha } => Estimator::Linear(linear::fit_lasso(&z, y, alpha)?),
            Hyperparameters::Ridge { alpha } => Estimator::Linear(linear::fit_ridge(&z, y, alpha)?),
            Hyperparameters::RandomForest {
                trees,
                max_depth,
                min_samples_leaf,
            } => Estimator::Forest(RandomForest::fit(
                &z,
                y,
                trees,
                TreeParams {
                    max_depth,
                    min_samples_leaf,
                    max_features: Some(((width as f64).sqrt().ceil() as usize).max(1)),
                },
                rng,
            )),
            Hyperparameters::GradientBoosting {
                rounds,
                learning_rate,
                max_depth,
                min_samples_leaf,
            } => Estimator::Boosting(GradientBoosting::fit(
                &z,
                y,
                rounds,
                learning_rate,
                TreeParams {
                    max_depth,
                    min_samples_leaf,
                    max_features: None,
                },
                rng,
            )),
        };

        Ok(Self { scaler, estimator })
    }

    fn predict_one(&self, x: &[f64]) -> f64 {
        self.estimator.predict_one(&self.scaler.transform_one(x))
    }

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, String> {
        let out: Vec<f64> = x.iter().map(|r| self.predict_one(r)).collect();
        if out.iter().any(|p| !p.is_finite()) {
            return Err("non-finite prediction".into());
        }
        Ok(out)
    }

    /// Opaque JSON view of what was learned. Linear coefficients are on the
    /// standardized scale.
    fn summary(&self, feature_names: &[String]) -> serde_json::Value {
        match &self.estimator {
            Estimator::Linear(m) => {
                let coefficients: serde_json::Map<String, serde_json::Value> = feature_names
                    .iter()
                    .zip(&m.coefficients)
                    .map(|(name, b)| (name.clone(), json!(b)))
                    .collect();
                json!({
                    "intercept": m.intercept,
                    "standardized_coefficients": coefficients,
                })
            }
            Estimator::Forest(m) => json!({
                "trees": m.tree_count(),
                "max_depth": m.max_depth(),
            }),
            Estimator::Boosting(m) => json!({
                "base": m.base(),
                "learning_rate": m.learning_rate(),
                "rounds": m.tree_count(),
                "max_depth": m.max_depth(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ModelStatus {
    Converged,
    Failed { reason: String },
}

/// Outcome of one roster kind. Failed kinds carry NaN metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub kind: ModelKind,
    pub status: ModelStatus,
    /// Grid point chosen by CV; `None` if no grid point could be scored.
    pub hyperparameters: Option<Hyperparameters>,
    pub trained_params: serde_json::Value,
    pub train_r2: f64,
    pub test_r2: f64,
    pub mae: f64,
    pub cv_mean: f64,
    pub cv_std: f64,
    pub selected: bool,
}

impl ModelResult {
    fn failed(kind: ModelKind, hyperparameters: Option<Hyperparameters>, reason: String) -> Self {
        Self {
            kind,
            status: ModelStatus::Failed { reason },
            hyperparameters,
            trained_params: serde_json::Value::Null,
            train_r2: f64::NAN,
            test_r2: f64::NAN,
            mae: f64::NAN,
            cv_mean: f64::NAN,
            cv_std: f64::NAN,
            selected: false,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.status == ModelStatus::Converged
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            ModelStatus::Failed { reason } => Some(reason),
            ModelStatus::Converged => None,
        }
    }

    /// Strictly better than `other` under the selection order:
    /// held-out R², then CV std, then MAE. Equal on all three is not better.
    fn outranks(&self, other: &ModelResult) -> bool {
        if (self.test_r2 - other.test_r2).abs() > TIE_TOLERANCE {
            return self.test_r2 > other.test_r2;
        }
        if (self.cv_std - other.cv_std).abs() > TIE_TOLERANCE {
            return self.cv_std < other.cv_std;
        }
        if (self.mae - other.mae).abs() > TIE_TOLERANCE {
            return self.mae < other.mae;
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EffectKind {
    /// Change in outcome per raw unit of the feature.
    Coefficient,
    /// Share of total split gain.
    Importance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEffects {
    pub kind: EffectKind,
    pub values: Vec<(String, f64)>,
}

impl FeatureEffects {
    pub fn get(&self, feature: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == feature)
            .map(|(_, v)| *v)
    }
}

/// The model chosen for simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedModel {
    result: ModelResult,
    feature_names: Vec<String>,
    fitted: FittedModel,
}

impl SelectedModel {
    pub fn kind(&self) -> ModelKind {
        self.result.kind
    }

    pub fn result(&self) -> &ModelResult {
        &self.result
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Predict from raw features ordered as `feature_names()`.
    pub fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        if features.len() != self.feature_names.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.feature_names.len(),
                got: features.len(),
            });
        }
        Ok(self.fitted.predict_one(features))
    }

    pub fn predict_row(&self, row: &ConsolidatedRow) -> Result<f64, ModelError> {
        let features = feature_vector(row, &self.feature_names)?;
        self.predict(&features)
    }

    pub fn feature_effects(&self) -> FeatureEffects {
        match &self.fitted.estimator {
            Estimator::Linear(m) => FeatureEffects {
                kind: EffectKind::Coefficient,
                values: self
                    .feature_names
                    .iter()
                    .zip(m.coefficients.iter().zip(self.fitted.scaler.scales()))
                    .map(|(name, (b, s))| (name.clone(), b / s))
                    .collect(),
            },
            Estimator::Forest(m) => importances(&self.feature_names, m.gains()),
            Estimator::Boosting(m) => importances(&self.feature_names, m.gains()),
        }
    }
}

fn importances(names: &[String], gains: Vec<f64>) -> FeatureEffects {
    let total: f64 = gains.iter().sum();
    FeatureEffects {
        kind: EffectKind::Importance,
        values: names
            .iter()
            .zip(gains)
            .map(|(name, g)| (name.clone(), if total > 0.0 { g / total } else { 0.0 }))
            .collect(),
    }
}

/// Output of one training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub selected: SelectedModel,
    /// Every roster kind in roster order; exactly one has `selected` set.
    pub results: Vec<ModelResult>,
    pub train_rows: usize,
    pub test_rows: usize,
}

impl TrainingReport {
    pub fn failures(&self) -> impl Iterator<Item = (ModelKind, &str)> {
        self.results
            .iter()
            .filter_map(|r| r.failure_reason().map(|reason| (r.kind, reason)))
    }
}

fn feature_vector(row: &ConsolidatedRow, names: &[String]) -> Result<Vec<f64>, ModelError> {
    names
        .iter()
        .map(|name| {
            row.feature(name)
                .filter(|v| v.is_finite())
                .ok_or_else(|| ModelError::MissingFeature {
                    entity: row.entity_key.clone(),
                    feature: name.clone(),
                })
        })
        .collect()
}

fn pick(rows: &[Vec<f64>], idx: &[usize]) -> Vec<Vec<f64>> {
    idx.iter().map(|&i| rows[i].clone()).collect()
}

fn pick_y(y: &[f64], idx: &[usize]) -> Vec<f64> {
    idx.iter().map(|&i| y[i]).collect()
}

pub struct ModelTrainer {
    config: TrainingConfig,
}

impl ModelTrainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn check_config(&self) -> Result<(), ModelError> {
        let c = &self.config;
        if c.cv_folds < 2 {
            return Err(ModelError::InvalidConfig(format!(
                "cv_folds must be at least 2, got {}",
                c.cv_folds
            )));
        }
        if !(c.test_ratio > 0.0 && c.test_ratio < 1.0) {
            return Err(ModelError::InvalidConfig(format!(
                "test_ratio must be in (0, 1), got {}",
                c.test_ratio
            )));
        }
        if c.roster.is_empty() {
            return Err(ModelError::InvalidConfig("empty roster".into()));
        }
        Ok(())
    }

    pub fn train_and_select(
        &self,
        dataset: &ConsolidatedDataset,
    ) -> Result<TrainingReport, ModelError> {
        self.check_config()?;
        let feature_names = dataset.required_features.clone();
        let rows: Vec<&ConsolidatedRow> = dataset.training_rows().collect();

        let needed = 2 * self.config.cv_folds;
        if rows.len() < needed {
            return Err(ModelError::InsufficientData {
                rows: rows.len(),
                needed,
            });
        }

        let x: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| feature_vector(r, &feature_names))
            .collect::<Result<_, _>>()?;
        let y: Vec<f64> = rows.iter().filter_map(|r| r.outcome).collect();

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let holdout = split::stratified_split(&y, self.config.test_ratio, &mut rng);
        if holdout.train.len() < self.config.cv_folds {
            return Err(ModelError::InsufficientData {
                rows: rows.len(),
                needed,
            });
        }
        let folds = split::k_fold(holdout.train.len(), self.config.cv_folds, &mut rng);

        info!(
            rows = rows.len(),
            train = holdout.train.len(),
            test = holdout.test.len(),
            folds = folds.len(),
            kinds = self.config.roster.len(),
            "training model roster"
        );

        let data = TrainingData {
            feature_names,
            x_train: pick(&x, &holdout.train),
            y_train: pick_y(&y, &holdout.train),
            x_test: pick(&x, &holdout.test),
            y_test: pick_y(&y, &holdout.test),
            folds,
        };

        let (mut results, mut fitted): (Vec<ModelResult>, Vec<Option<FittedModel>>) = self
            .config
            .roster
            .par_iter()
            .map(|&kind| self.train_kind(kind, &data))
            .unzip();

        for r in &results {
            if let Some(reason) = r.failure_reason() {
                let err = ModelError::ConvergenceFailure {
                    kind: r.kind,
                    reason: reason.to_string(),
                };
                warn!(kind = %r.kind, error = %err, "model kind excluded");
            }
        }

        let mut best: Option<usize> = None;
        for (i, result) in results.iter().enumerate() {
            if !result.is_converged() {
                continue;
            }
            if best.map_or(true, |b| result.outranks(&results[b])) {
                best = Some(i);
            }
        }
        let Some((best, model)) = best.and_then(|b| fitted[b].take().map(|m| (b, m))) else {
            return Err(ModelError::NoConvergedModels {
                failures: results
                    .iter()
                    .filter_map(|r| r.failure_reason().map(|reason| (r.kind, reason.to_string())))
                    .collect(),
            });
        };
        results[best].selected = true;

        let selected = SelectedModel {
            result: results[best].clone(),
            feature_names: data.feature_names.clone(),
            fitted: model,
        };

        for r in results.iter().filter(|r| r.is_converged()) {
            info!(
                kind = %r.kind,
                params = %r.hyperparameters.map(|p| p.to_string()).unwrap_or_default(),
                train_r2 = %format!("{:.4}", r.train_r2),
                test_r2 = %format!("{:.4}", r.test_r2),
                mae = %format!("{:.3}", r.mae),
                cv_mean = %format!("{:.4}", r.cv_mean),
                cv_std = %format!("{:.4}", r.cv_std),
                selected = r.selected,
                "model result"
            );
        }
        if selected.result.test_r2 < self.config.min_test_r2 {
            warn!(
                kind = %selected.kind(),
                test_r2 = selected.result.test_r2,
                threshold = self.config.min_test_r2,
                "selected model below held-out R² threshold"
            );
        }

        Ok(TrainingReport {
            selected,
            results,
            train_rows: data.y_train.len(),
            test_rows: data.y_test.len(),
        })
    }

    /// Grid search by CV, refit the winner on the full training side, score it.
    fn train_kind(
        &self,
        kind: ModelKind,
        data: &TrainingData,
    ) -> (ModelResult, Option<FittedModel>) {
        let seed = self.config.seed ^ kind.seed_offset();
        let (params, cv_mean, cv_std) = match self.tune(kind, data, seed) {
            Ok(tuned) => tuned,
            Err(reason) => return (ModelResult::failed(kind, None, reason), None),
        };

        match refit(params, data, seed) {
            Ok((model, train_pred, test_pred)) => {
                let result = ModelResult {
                    kind,
                    status: ModelStatus::Converged,
                    hyperparameters: Some(params),
                    trained_params: model.summary(&data.feature_names),
                    train_r2: metrics::r2(&data.y_train, &train_pred),
                    test_r2: metrics::r2(&data.y_test, &test_pred),
                    mae: metrics::mae(&data.y_test, &test_pred),
                    cv_mean,
                    cv_std,
                    selected: false,
                };
                (result, Some(model))
            }
            Err(reason) => (ModelResult::failed(kind, Some(params), reason), None),
        }
    }

    /// Best grid point by CV mean R², with its (mean, std).
    fn tune(
        &self,
        kind: ModelKind,
        data: &TrainingData,
        seed: u64,
    ) -> Result<(Hyperparameters, f64, f64), String> {
        let grid = Hyperparameters::grid(kind, &self.config.grid);
        if grid.is_empty() {
            return Err("empty hyperparameter grid".into());
        }

        let mut best: Option<(Hyperparameters, f64, f64)> = None;
        let mut last_error = None;
        for params in grid {
            match cross_validate(params, data, seed) {
                Ok((mean, std)) => {
                    debug!(kind = %kind, params = %params, cv_mean = mean, "grid point");
                    if best.map_or(true, |(_, m, _)| mean > m) {
                        best = Some((params, mean, std));
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }
        best.ok_or_else(|| last_error.unwrap_or_else(|| "no grid point could be scored".into()))
    }
}

/// Fit on the whole training side and predict both sides.
fn refit(
    params: Hyperparameters,
    data: &TrainingData,
    seed: u64,
) -> Result<(FittedModel, Vec<f64>, Vec<f64>), String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let model = FittedModel::fit(params, &data.x_train, &data.y_train, &mut rng)?;
    let train_pred = model.predict(&data.x_train)?;
    let test_pred = model.predict(&data.x_test)?;
    Ok((model, train_pred, test_pred))
}

struct TrainingData {
    feature_names: Vec<String>,
    x_train: Vec<Vec<f64>>,
    y_train: Vec<f64>,
    x_test: Vec<Vec<f64>>,
    y_test: Vec<f64>,
    /// Index splits into the training side.
    folds: Vec<Split>,
}

fn cross_validate(
    params: Hyperparameters,
    data: &TrainingData,
    seed: u64,
) -> Result<(f64, f64), String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut scores = Vec::with_capacity(data.folds.len());
    for fold in &data.folds {
        let x_fit = pick(&data.x_train, &fold.train);
        let y_fit = pick_y(&data.y_train, &fold.train);
        let model = FittedModel::fit(params, &x_fit, &y_fit, &mut rng)?;
        let pred = model.predict(&pick(&data.x_train, &fold.test))?;
        scores.push(metrics::r2(&pick_y(&data.y_train, &fold.test), &pred));
    }
    Ok(metrics::mean_std(&scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metric_names;
    use std::collections::BTreeMap;

    fn features() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    /// y = 100 + 3a - 2b with a little deterministic wobble.
    fn dataset(n: usize) -> ConsolidatedDataset {
        let rows = (0..n)
            .map(|i| {
                let a = (i as f64 * 0.37).sin() * 10.0 + 20.0;
                let b = ((i * 13) % 17) as f64;
                let wobble = ((i * 7) % 5) as f64 * 0.05;
                ConsolidatedRow::new(format!("E{:02}", i))
                    .with_feature("a", a)
                    .with_feature("b", b)
                    .with_outcome(100.0 + 3.0 * a - 2.0 * b + wobble)
            })
            .collect();
        ConsolidatedDataset {
            rows,
            required_features: features(),
            outcome_metric: metric_names::NAEP_SCORE.to_string(),
            provenance: BTreeMap::new(),
            context: BTreeMap::new(),
        }
    }

    fn small_grid() -> HyperparameterGrid {
        HyperparameterGrid {
            forest_trees: vec![15],
            boosting_rounds: vec![40],
            ..HyperparameterGrid::default()
        }
    }

    fn config(roster: Vec<ModelKind>) -> TrainingConfig {
        TrainingConfig {
            roster,
            grid: small_grid(),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_linear_relationship_is_learned() {
        let report = ModelTrainer::new(config(ModelKind::ALL.to_vec()))
            .train_and_select(&dataset(51))
            .unwrap();

        assert_eq!(report.results.len(), 5);
        assert_eq!(report.results.iter().filter(|r| r.selected).count(), 1);
        assert!(report.selected.result().test_r2 > 0.9);
        assert_eq!(report.train_rows + report.test_rows, 51);
        assert_eq!(report.test_rows, 10);

        let kinds: Vec<_> = report.results.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, ModelKind::ALL.to_vec());
    }

    #[test]
    fn test_training_is_deterministic() {
        let trainer = ModelTrainer::new(config(ModelKind::ALL.to_vec()));
        let data = dataset(40);
        let a = trainer.train_and_select(&data).unwrap();
        let b = trainer.train_and_select(&data).unwrap();

        assert!(a.results.iter().all(ModelResult::is_converged));
        assert_eq!(a.selected.kind(), b.selected.kind());
        assert_eq!(a.results, b.results);
    }

    #[test]
    fn test_linear_effects_are_in_raw_units() {
        let report = ModelTrainer::new(config(vec![ModelKind::Linear]))
            .train_and_select(&dataset(51))
            .unwrap();
        let effects = report.selected.feature_effects();
        assert_eq!(effects.kind, EffectKind::Coefficient);
        assert!((effects.get("a").unwrap() - 3.0).abs() < 0.05);
        assert!((effects.get("b").unwrap() + 2.0).abs() < 0.05);
    }

    #[test]
    fn test_tree_importances_are_normalized() {
        let report = ModelTrainer::new(config(vec![ModelKind::GradientBoosting]))
            .train_and_select(&dataset(51))
            .unwrap();
        let effects = report.selected.feature_effects();
        assert_eq!(effects.kind, EffectKind::Importance);
        let total: f64 = effects.values.iter().map(|(_, v)| v).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_rows() {
        let err = ModelTrainer::new(config(vec![ModelKind::Linear]))
            .train_and_select(&dataset(9))
            .unwrap_err();
        assert_eq!(err, ModelError::InsufficientData { rows: 9, needed: 10 });
    }

    #[test]
    fn test_singular_linear_is_excluded_not_fatal() {
        let mut data = dataset(40);
        for row in &mut data.rows {
            let a = row.feature("a").unwrap_or_default();
            row.features.insert("b".into(), crate::models::FeatureValue::observed(2.0 * a));
        }
        let report = ModelTrainer::new(config(vec![ModelKind::Linear, ModelKind::Ridge]))
            .train_and_select(&data)
            .unwrap();
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ModelKind::Linear);
        assert_eq!(report.selected.kind(), ModelKind::Ridge);

        // the failed kind stays in the results table, unselected
        assert_eq!(report.results.len(), 2);
        let linear = &report.results[0];
        assert_eq!(linear.kind, ModelKind::Linear);
        assert!(matches!(
            linear.status,
            ModelStatus::Failed { ref reason } if reason.contains("singular")
        ));
        assert!(!linear.selected);
        assert!(linear.test_r2.is_nan());
        assert_eq!(linear.trained_params, serde_json::Value::Null);
        assert_eq!(report.results[1].status, ModelStatus::Converged);
        assert!(report.results[1].selected);
    }

    #[test]
    fn test_all_kinds_failing_is_fatal() {
        let mut data = dataset(40);
        for row in &mut data.rows {
            let a = row.feature("a").unwrap_or_default();
            row.features.insert("b".into(), crate::models::FeatureValue::observed(2.0 * a));
        }
        let err = ModelTrainer::new(config(vec![ModelKind::Linear]))
            .train_and_select(&data)
            .unwrap_err();
        match err {
            ModelError::NoConvergedModels { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].1.contains("singular"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_tie_breaks_on_cv_std_then_mae() {
        let base = ModelResult {
            kind: ModelKind::Linear,
            status: ModelStatus::Converged,
            hyperparameters: Some(Hyperparameters::Linear),
            trained_params: serde_json::Value::Null,
            train_r2: 0.9,
            test_r2: 0.8,
            mae: 1.0,
            cv_mean: 0.7,
            cv_std: 0.05,
            selected: false,
        };
        let steadier = ModelResult {
            test_r2: 0.8 + 1e-12,
            cv_std: 0.01,
            ..base.clone()
        };
        assert!(steadier.outranks(&base));
        assert!(!base.outranks(&steadier));

        let lower_mae = ModelResult { mae: 0.5, ..base.clone() };
        assert!(lower_mae.outranks(&base));
        assert!(!base.outranks(&base.clone()));

        let clearly_better = ModelResult { test_r2: 0.81, cv_std: 0.5, ..base.clone() };
        assert!(clearly_better.outranks(&steadier));
    }

    #[test]
    fn test_trained_params_summarize_the_fit() {
        let report = ModelTrainer::new(config(vec![ModelKind::Ridge, ModelKind::RandomForest]))
            .train_and_select(&dataset(51))
            .unwrap();
        let ridge = &report.results[0].trained_params;
        assert!(ridge["intercept"].as_f64().is_some());
        assert!(ridge["standardized_coefficients"]["a"].as_f64().unwrap() > 0.0);
        assert!(ridge["standardized_coefficients"]["b"].as_f64().unwrap() < 0.0);

        let forest = &report.results[1].trained_params;
        assert_eq!(forest["trees"].as_u64(), Some(15));
        assert!(forest["max_depth"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn test_predict_rejects_wrong_feature_count() {
        for kind in [ModelKind::Linear, ModelKind::RandomForest] {
            let report = ModelTrainer::new(config(vec![kind]))
                .train_and_select(&dataset(40))
                .unwrap();
            let model = &report.selected;

            assert_eq!(
                model.predict(&[10_000.0]),
                Err(ModelError::DimensionMismatch { expected: 2, got: 1 })
            );
            assert_eq!(
                model.predict(&[1.0, 2.0, 3.0]),
                Err(ModelError::DimensionMismatch { expected: 2, got: 3 })
            );
            assert!(model.predict(&[20.0, 8.0]).unwrap().is_finite());
        }
    }

    #[test]
    fn test_invalid_training_config_is_rejected() {
        let trainer = ModelTrainer::new(TrainingConfig {
            cv_folds: 0,
            ..config(vec![ModelKind::Linear])
        });
        assert!(matches!(
            trainer.train_and_select(&dataset(51)),
            Err(ModelError::InvalidConfig(_))
        ));

        let trainer = ModelTrainer::new(TrainingConfig {
            test_ratio: 1.5,
            ..config(vec![ModelKind::Linear])
        });
        assert!(matches!(
            trainer.train_and_select(&dataset(51)),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_grid_expansion() {
        let grid = HyperparameterGrid::default();
        assert_eq!(Hyperparameters::grid(ModelKind::Linear, &grid).len(), 1);
        assert_eq!(Hyperparameters::grid(ModelKind::Lasso, &grid).len(), 3);
        assert_eq!(Hyperparameters::grid(ModelKind::RandomForest, &grid).len(), 2);
        assert_eq!(Hyperparameters::grid(ModelKind::GradientBoosting, &grid).len(), 4);
    }

    #[test]
    fn test_missing_feature_is_reported() {
        let mut data = dataset(20);
        data.rows[3].features.remove("b");
        let err = ModelTrainer::new(config(vec![ModelKind::Linear]))
            .train_and_select(&data)
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::MissingFeature {
                entity: "E03".into(),
                feature: "b".into()
            }
        );
    }
}
