//! Pipeline wiring: sources -> fallback -> consolidation -> training -> simulation

use crate::cache::{CacheError, CacheStore};
use crate::config::{PipelineConfig, SourceConfig};
use crate::consolidation::{ConsolidationEngine, ConsolidationError};
use crate::fallback::{
    FallbackError, FallbackResolver, LogicalDataset, ResolvedDataset, SourceAttempt,
};
use crate::models::{metric_names, ConsolidatedDataset, Provenance};
use crate::modeling::{ModelError, ModelTrainer, SelectedModel, TrainingReport};
use crate::simulation::{
    Perturbation, PolicySimulator, PopulationEffect, Scenario, ScenarioError, SimulationScenario,
};
use crate::sources::{
    CensusAdapter, DataGovAdapter, NaepAdapter, SourceAdapter, SourceHttpClient, SourceQuery,
    SyntheticSource, WorldBankAdapter,
};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEMOGRAPHICS: &str = "demographics";
pub const SPENDING: &str = "spending";
pub const ACHIEVEMENT: &str = "achievement";
pub const NATIONAL_CONTEXT: &str = "national_context";

#[derive(Debug)]
pub enum PipelineError {
    /// Rejected by `PipelineConfig::validate`.
    Config(String),
    /// The built-in fallback table cannot stand in for a dataset.
    SyntheticUnusable { dataset: String, reason: String },
    Cache(CacheError),
    Consolidation(ConsolidationError),
    Model(ModelError),
    Scenario(ScenarioError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SyntheticUnusable { dataset, reason } => write!(
                f,
                "synthetic fallback unusable for dataset {}: {}",
                dataset, reason
            ),
            Self::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Cache(e) => write!(f, "cache error: {}", e),
            Self::Consolidation(e) => write!(f, "{}", e),
            Self::Model(e) => write!(f, "{}", e),
            Self::Scenario(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            Self::Consolidation(e) => Some(e),
            Self::Model(e) => Some(e),
            Self::Scenario(e) => Some(e),
            Self::SyntheticUnusable { .. } | Self::Config(_) => None,
        }
    }
}

impl From<FallbackError> for PipelineError {
    fn from(e: FallbackError) -> Self {
        match e {
            FallbackError::SyntheticUnusable { dataset, reason } => {
                Self::SyntheticUnusable { dataset, reason }
            }
        }
    }
}

impl From<CacheError> for PipelineError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<ConsolidationError> for PipelineError {
    fn from(e: ConsolidationError) -> Self {
        Self::Consolidation(e)
    }
}

impl From<ModelError> for PipelineError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

impl From<ScenarioError> for PipelineError {
    fn from(e: ScenarioError) -> Self {
        Self::Scenario(e)
    }
}

/// Output of the data stages of one run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub dataset: ConsolidatedDataset,
    pub resolved: Vec<ResolvedDataset>,
}

impl PipelineRun {
    /// (dataset, provenance, attempts) per logical dataset, in declaration order.
    pub fn provenance_report(&self) -> Vec<(&str, Provenance, &[SourceAttempt])> {
        self.resolved
            .iter()
            .map(|r| (r.name.as_str(), r.provenance, r.attempts.as_slice()))
            .collect()
    }
}

pub struct Pipeline {
    cache: CacheStore,
    datasets: Vec<LogicalDataset>,
    resolver: FallbackResolver,
    consolidation: ConsolidationEngine,
    trainer: ModelTrainer,
    simulator: PolicySimulator,
}

impl Pipeline {
    /// Open the on-disk cache and build the standard logical datasets from
    /// the enabled sources.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let cache = CacheStore::open(&config.cache_path)?;
        let datasets = standard_datasets(&config);
        Self::with_datasets(config, cache, datasets)
    }

    /// Build with caller-supplied datasets and cache.
    pub fn with_datasets(
        config: PipelineConfig,
        cache: CacheStore,
        datasets: Vec<LogicalDataset>,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let resolver = FallbackResolver::new(cache.clone(), SyntheticSource::new())?;
        Ok(Self {
            cache,
            datasets,
            resolver,
            consolidation: ConsolidationEngine::new(config.consolidation),
            trainer: ModelTrainer::new(config.training),
            simulator: PolicySimulator::new(config.simulation),
        })
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn datasets(&self) -> &[LogicalDataset] {
        &self.datasets
    }

    pub fn simulator(&self) -> &PolicySimulator {
        &self.simulator
    }

    pub async fn run_pipeline(&self) -> Result<PipelineRun, PipelineError> {
        let resolved = self.resolver.resolve_all(&self.datasets).await?;
        for r in &resolved {
            info!(
                dataset = %r.name,
                provenance = %r.provenance,
                records = r.records.len(),
                failed_candidates = r.failures().count(),
                "dataset provenance"
            );
        }

        let dataset = self.consolidation.consolidate(&resolved)?;
        if dataset.is_fully_synthetic() {
            warn!("every dataset fell back to synthetic data");
        }
        Ok(PipelineRun { dataset, resolved })
    }

    pub fn train_and_select(
        &self,
        dataset: &ConsolidatedDataset,
    ) -> Result<TrainingReport, PipelineError> {
        Ok(self.trainer.train_and_select(dataset)?)
    }

    pub fn simulate(
        &self,
        model: &SelectedModel,
        scenario: &Scenario,
    ) -> Result<SimulationScenario, PipelineError> {
        Ok(self.simulator.simulate(model, scenario)?)
    }

    pub fn simulate_population(
        &self,
        model: &SelectedModel,
        dataset: &ConsolidatedDataset,
        perturbations: &[Perturbation],
    ) -> Result<PopulationEffect, PipelineError> {
        Ok(self
            .simulator
            .simulate_population(model, dataset, perturbations)?)
    }
}

fn http_client(source_id: &str, config: &SourceConfig) -> Option<Arc<SourceHttpClient>> {
    if !config.enabled {
        info!(source = source_id, "source disabled");
        return None;
    }
    match SourceHttpClient::new(source_id, config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(source = source_id, error = %e, "cannot build http client, source skipped");
            None
        }
    }
}

/// The four logical datasets with their candidates in priority order.
/// Disabled sources contribute no candidates; the synthetic fallback covers them.
pub fn standard_datasets(config: &PipelineConfig) -> Vec<LogicalDataset> {
    let sources = &config.sources;

    let mut demographics = LogicalDataset::new(
        DEMOGRAPHICS,
        SourceQuery::new([
            metric_names::MEDIAN_HOUSEHOLD_INCOME,
            metric_names::POVERTY_RATE,
        ]),
    );
    if let Some(http) = http_client("census", &sources.census.source) {
        for &year in &sources.census.years {
            let adapter: Arc<dyn SourceAdapter> = Arc::new(CensusAdapter::new(
                http.clone(),
                sources.census.source.clone(),
                year,
            ));
            demographics = demographics.with_candidate(adapter);
        }
    }

    let mut spending = LogicalDataset::new(
        SPENDING,
        SourceQuery::new([
            metric_names::PER_PUPIL_SPENDING,
            metric_names::PUPIL_TEACHER_RATIO,
        ]),
    );
    if let Some(http) = http_client("data_gov", &sources.data_gov.source) {
        spending = spending.with_candidate(Arc::new(DataGovAdapter::new(
            http,
            sources.data_gov.clone(),
        )));
    }

    let mut achievement =
        LogicalDataset::new(ACHIEVEMENT, SourceQuery::new([metric_names::NAEP_SCORE]));
    if let Some(http) = http_client("naep", &sources.naep.source) {
        for &year in &sources.naep.years {
            let adapter: Arc<dyn SourceAdapter> =
                Arc::new(NaepAdapter::new(http.clone(), sources.naep.clone(), year));
            achievement = achievement.with_candidate(adapter);
        }
    }

    let mut national = LogicalDataset::new(
        NATIONAL_CONTEXT,
        SourceQuery::new(sources.world_bank.indicators.values().cloned()),
    );
    if let Some(http) = http_client("world_bank", &sources.world_bank.source) {
        national = national.with_candidate(Arc::new(WorldBankAdapter::new(
            http,
            sources.world_bank.clone(),
        )));
    }

    vec![demographics, spending, achievement, national]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.sources.census.source.enabled = false;
        config.sources.world_bank.source.enabled = false;
        config.sources.data_gov.source.enabled = false;
        config.sources.naep.source.enabled = false;
        config
    }

    #[test]
    fn test_standard_datasets_follow_config() {
        let datasets = standard_datasets(&PipelineConfig::default());
        let names: Vec<_> = datasets.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![DEMOGRAPHICS, SPENDING, ACHIEVEMENT, NATIONAL_CONTEXT]);

        let demographics: Vec<_> = datasets[0].candidates.iter().map(|c| c.source_id()).collect();
        assert_eq!(demographics, vec!["census_acs5_2022", "census_acs5_2021"]);
        assert_eq!(datasets[2].candidates.len(), 2);

        let offline = standard_datasets(&offline_config());
        assert!(offline.iter().all(|d| d.candidates.is_empty()));
    }

    #[tokio::test]
    async fn test_offline_run_is_fully_synthetic() {
        let config = offline_config();
        let pipeline = Pipeline::with_datasets(
            config.clone(),
            CacheStore::open_in_memory().unwrap(),
            standard_datasets(&config),
        )
        .unwrap();

        let run = pipeline.run_pipeline().await.unwrap();
        assert!(run.dataset.is_fully_synthetic());
        assert_eq!(run.dataset.len(), 51);
        assert_eq!(run.dataset.context.len(), 2);
        assert_eq!(run.provenance_report().len(), 4);
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut config = offline_config();
        config.training.cv_folds = 0;
        let datasets = standard_datasets(&config);
        let err = Pipeline::with_datasets(config, CacheStore::open_in_memory().unwrap(), datasets)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Config(ref msg) if msg.contains("cv_folds")));
    }
}
