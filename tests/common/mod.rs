//! Adapters with scripted behavior for pipeline-level tests.

#![allow(dead_code)]

use async_trait::async_trait;
use eduscore_backend::cache::CacheStore;
use eduscore_backend::config::PipelineConfig;
use eduscore_backend::fallback::LogicalDataset;
use eduscore_backend::models::Provenance;
use eduscore_backend::pipeline::standard_datasets;
use eduscore_backend::sources::{
    FetchOutcome, SourceAdapter, SourceError, SourceQuery, SyntheticSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Always fails with the given error.
pub struct FailingAdapter {
    id: String,
    error: SourceError,
    pub calls: AtomicUsize,
}

impl FailingAdapter {
    pub fn new(id: &str, error: SourceError) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            error,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SourceAdapter for FailingAdapter {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        _query: &SourceQuery,
        _cache: &CacheStore,
    ) -> Result<FetchOutcome, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Serves the built-in table as if it were a live source.
pub struct LiveStandIn {
    id: String,
}

impl LiveStandIn {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self { id: id.to_string() })
    }
}

#[async_trait]
impl SourceAdapter for LiveStandIn {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        query: &SourceQuery,
        _cache: &CacheStore,
    ) -> Result<FetchOutcome, SourceError> {
        let mut records = SyntheticSource::new().records_for(query);
        for r in &mut records {
            r.source_id = self.id.clone();
        }
        Ok(FetchOutcome {
            records,
            provenance: Provenance::Live,
        })
    }
}

pub fn failure_kinds() -> Vec<SourceError> {
    vec![
        SourceError::Network("connection reset".into()),
        SourceError::Auth("403 invalid key".into()),
        SourceError::RateLimited("429".into()),
        SourceError::SchemaMismatch("unexpected payload".into()),
    ]
}

/// The standard datasets with every real candidate replaced by failing ones.
pub fn failing_datasets(config: &PipelineConfig) -> Vec<LogicalDataset> {
    let kinds = failure_kinds();
    standard_datasets(config)
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            let mut dataset = LogicalDataset::new(d.name.clone(), d.query.clone());
            for (j, kind) in kinds.iter().enumerate().skip(i % 2).take(2) {
                let adapter: Arc<dyn SourceAdapter> =
                    FailingAdapter::new(&format!("{}_{}", d.name, j), kind.clone());
                dataset = dataset.with_candidate(adapter);
            }
            dataset
        })
        .collect()
}
