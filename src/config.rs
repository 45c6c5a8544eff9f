//! Pipeline configuration
//!
//! Loaded from a TOML file (`EDUSCORE_CONFIG_PATH`, default `eduscore.toml`),
//! falling back to defaults, then overridden by environment variables for
//! credentials and paths.

use crate::models::metric_names;
use crate::modeling::ModelKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration consumed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// SQLite file for the response cache
    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub consolidation: ConsolidationConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_cache_path() -> String {
    "eduscore_cache.db".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            sources: SourcesConfig::default(),
            consolidation: ConsolidationConfig::default(),
            training: TrainingConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from the configured path (or defaults), then apply env overrides.
    pub fn from_env() -> Self {
        let path = std::env::var("EDUSCORE_CONFIG_PATH")
            .unwrap_or_else(|_| "eduscore.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default pipeline config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env();
        config
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("EDUSCORE_CACHE_PATH") {
            if !v.trim().is_empty() {
                self.cache_path = v;
            }
        }
        if let Ok(key) = std::env::var("CENSUS_API_KEY") {
            self.sources.census.source.api_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        if let Ok(key) = std::env::var("DATAGOV_API_KEY") {
            self.sources.data_gov.source.api_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        if let Ok(v) = std::env::var("EDUSCORE_SEED") {
            if let Ok(seed) = v.parse() {
                self.training.seed = seed;
            }
        }
        if let Ok(v) = std::env::var("EDUSCORE_OFFLINE") {
            if matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON") {
                self.sources.census.source.enabled = false;
                self.sources.world_bank.source.enabled = false;
                self.sources.data_gov.source.enabled = false;
                self.sources.naep.source.enabled = false;
            }
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.training;
        if !(t.test_ratio > 0.0 && t.test_ratio < 1.0) {
            anyhow::bail!("training.test_ratio must be in (0, 1), got {}", t.test_ratio);
        }
        if t.cv_folds < 2 {
            anyhow::bail!("training.cv_folds must be at least 2, got {}", t.cv_folds);
        }
        if t.roster.is_empty() {
            anyhow::bail!("training.roster must name at least one model kind");
        }
        let c = &self.consolidation;
        if c.required_features.is_empty() {
            anyhow::bail!("consolidation.required_features must not be empty");
        }
        if c.required_features.contains(&c.outcome_metric) {
            anyhow::bail!(
                "outcome metric {} cannot also be a required feature",
                c.outcome_metric
            );
        }
        if !(c.outlier_threshold > 0.0) {
            anyhow::bail!("consolidation.outlier_threshold must be positive");
        }
        for (feature, range) in &self.simulation.ranges {
            if !(range.min <= range.max) {
                anyhow::bail!("simulation range for {} has min > max", feature);
            }
        }
        Ok(())
    }
}

/// Settings shared by every HTTP-backed source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Minimum spacing between requests to this source
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Cache lifetime of a raw response
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Per-request timeout; expiry counts as a network error
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts for transient network failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}
fn default_min_interval_ms() -> u64 {
    500
}
fn default_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    2
}

impl SourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            base_url: base_url.into(),
            api_key: None,
            min_interval_ms: default_min_interval_ms(),
            ttl_secs: default_ttl_secs(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub census: CensusConfig,
    #[serde(default)]
    pub world_bank: WorldBankConfig,
    #[serde(default)]
    pub data_gov: DataGovConfig,
    #[serde(default)]
    pub naep: NaepConfig,
}

/// Census ACS 5-year estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CensusConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// ACS vintages in priority order; later entries are fallbacks
    pub years: Vec<i32>,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::new("https://api.census.gov/data"),
            years: vec![2022, 2021],
        }
    }
}

/// World Bank indicators API (national context).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldBankConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    pub country: String,
    /// Indicator code → metric name
    pub indicators: BTreeMap<String, String>,
    pub year_from: i32,
    pub year_to: i32,
}

impl Default for WorldBankConfig {
    fn default() -> Self {
        let mut indicators = BTreeMap::new();
        indicators.insert(
            "NY.GDP.PCAP.CD".to_string(),
            metric_names::GDP_PER_CAPITA.to_string(),
        );
        indicators.insert(
            "SE.XPD.TOTL.GD.ZS".to_string(),
            metric_names::EDUCATION_SPENDING_PCT_GDP.to_string(),
        );
        Self {
            source: SourceConfig::new("https://api.worldbank.org/v2"),
            country: "US".to_string(),
            indicators,
            year_from: 2015,
            year_to: 2022,
        }
    }
}

/// data.gov / NCES school finance extract (Socrata or CKAN JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataGovConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Column holding the state (postal code, FIPS, or name)
    pub state_field: String,
    /// Column holding the year or school year ("2019-20")
    pub period_field: String,
    /// Metric name → column name
    pub metric_fields: BTreeMap<String, String>,
    #[serde(default = "default_row_limit")]
    pub row_limit: u32,
}

fn default_row_limit() -> u32 {
    5000
}

impl Default for DataGovConfig {
    fn default() -> Self {
        let mut metric_fields = BTreeMap::new();
        metric_fields.insert(
            metric_names::PER_PUPIL_SPENDING.to_string(),
            "per_pupil_expenditure".to_string(),
        );
        metric_fields.insert(
            metric_names::PUPIL_TEACHER_RATIO.to_string(),
            "pupil_teacher_ratio".to_string(),
        );
        Self {
            source: SourceConfig::new("https://data.ed.gov/api/views/school-finance/rows.json"),
            state_field: "state".to_string(),
            period_field: "school_year".to_string(),
            metric_fields,
            row_limit: default_row_limit(),
        }
    }
}

/// NAEP Data Service (outcome variable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaepConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    pub subject: String,
    pub grade: u8,
    pub subscale: String,
    /// Assessment years in priority order
    pub years: Vec<i32>,
}

impl Default for NaepConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::new(
                "https://www.nationsreportcard.gov/DataService/GetAdhocData.aspx",
            ),
            subject: "mathematics".to_string(),
            grade: 8,
            subscale: "MRPCM".to_string(),
            years: vec![2022, 2019],
        }
    }
}

/// Consolidation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    pub required_features: Vec<String>,
    pub outcome_metric: String,
    /// Robust z-score above which a value is flagged as an outlier
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,
}

fn default_outlier_threshold() -> f64 {
    3.5
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            required_features: default_features(),
            outcome_metric: metric_names::NAEP_SCORE.to_string(),
            outlier_threshold: default_outlier_threshold(),
        }
    }
}

fn default_features() -> Vec<String> {
    vec![
        metric_names::PER_PUPIL_SPENDING.to_string(),
        metric_names::POVERTY_RATE.to_string(),
        metric_names::MEDIAN_HOUSEHOLD_INCOME.to_string(),
        metric_names::PUPIL_TEACHER_RATIO.to_string(),
    ]
}

/// Model roster, grids, and split parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub roster: Vec<ModelKind>,
    #[serde(default)]
    pub grid: HyperparameterGrid,
    #[serde(default = "default_test_ratio")]
    pub test_ratio: f64,
    #[serde(default = "default_cv_folds")]
    pub cv_folds: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Held-out R² below which the run is logged as a regression
    #[serde(default = "default_min_test_r2")]
    pub min_test_r2: f64,
}

fn default_test_ratio() -> f64 {
    0.2
}
fn default_cv_folds() -> usize {
    5
}
fn default_seed() -> u64 {
    42
}
fn default_min_test_r2() -> f64 {
    0.5
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            roster: ModelKind::ALL.to_vec(),
            grid: HyperparameterGrid::default(),
            test_ratio: default_test_ratio(),
            cv_folds: default_cv_folds(),
            seed: default_seed(),
            min_test_r2: default_min_test_r2(),
        }
    }
}

/// Candidate hyperparameters searched per model kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperparameterGrid {
    pub lasso_alpha: Vec<f64>,
    pub ridge_alpha: Vec<f64>,
    pub forest_trees: Vec<usize>,
    pub forest_max_depth: Vec<usize>,
    pub boosting_rounds: Vec<usize>,
    pub boosting_learning_rate: Vec<f64>,
    pub boosting_max_depth: Vec<usize>,
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
}

fn default_min_samples_leaf() -> usize {
    2
}

impl Default for HyperparameterGrid {
    fn default() -> Self {
        Self {
            lasso_alpha: vec![0.01, 0.1, 0.5],
            ridge_alpha: vec![0.1, 1.0, 10.0],
            forest_trees: vec![60],
            forest_max_depth: vec![4, 6],
            boosting_rounds: vec![100],
            boosting_learning_rate: vec![0.05, 0.1],
            boosting_max_depth: vec![2, 3],
            min_samples_leaf: default_min_samples_leaf(),
        }
    }
}

/// Inclusive valid range of a feature for scenario validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRange {
    pub min: f64,
    pub max: f64,
}

impl FeatureRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub ranges: BTreeMap<String, FeatureRange>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert(
            metric_names::PER_PUPIL_SPENDING.to_string(),
            FeatureRange::new(3_000.0, 40_000.0),
        );
        ranges.insert(
            metric_names::POVERTY_RATE.to_string(),
            FeatureRange::new(0.0, 60.0),
        );
        ranges.insert(
            metric_names::MEDIAN_HOUSEHOLD_INCOME.to_string(),
            FeatureRange::new(15_000.0, 200_000.0),
        );
        ranges.insert(
            metric_names::PUPIL_TEACHER_RATIO.to_string(),
            FeatureRange::new(5.0, 40.0),
        );
        Self { ranges }
    }
}
