//! Ordered-candidate fallback per logical dataset
//!
//! Candidates are tried strictly in priority order. Any failure kind, or an
//! outcome with no records, moves on to the next candidate. When every
//! candidate is exhausted the built-in synthetic table is substituted, so a
//! resolved dataset is never empty.

use crate::cache::CacheStore;
use crate::models::{NormalizedRecord, Provenance};
use crate::sources::{FetchOutcome, SourceAdapter, SourceError, SourceQuery, SyntheticSource};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(90);

/// A dataset the pipeline needs, with its candidate adapters in priority order.
#[derive(Clone)]
pub struct LogicalDataset {
    pub name: String,
    pub query: SourceQuery,
    pub candidates: Vec<Arc<dyn SourceAdapter>>,
}

impl LogicalDataset {
    pub fn new(name: impl Into<String>, query: SourceQuery) -> Self {
        Self {
            name: name.into(),
            query,
            candidates: Vec::new(),
        }
    }

    pub fn with_candidate(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.candidates.push(adapter);
        self
    }
}

impl std::fmt::Debug for LogicalDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalDataset")
            .field("name", &self.name)
            .field("query", &self.query)
            .field(
                "candidates",
                &self.candidates.iter().map(|c| c.source_id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// What happened when one candidate was tried.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Accepted(Provenance),
    Empty,
    Failed(SourceError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttempt {
    pub source_id: String,
    pub outcome: AttemptOutcome,
}

/// Records for one logical dataset, tagged with where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDataset {
    pub name: String,
    pub records: Vec<NormalizedRecord>,
    pub provenance: Provenance,
    pub attempts: Vec<SourceAttempt>,
}

impl ResolvedDataset {
    /// Source ids whose attempt failed, with the failure.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &SourceError)> {
        self.attempts.iter().filter_map(|a| match &a.outcome {
            AttemptOutcome::Failed(e) => Some((a.source_id.as_str(), e)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackError {
    /// The built-in table cannot stand in for a dataset; unrecoverable.
    SyntheticUnusable { dataset: String, reason: String },
}

impl std::fmt::Display for FallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SyntheticUnusable { dataset, reason } => write!(
                f,
                "synthetic fallback unusable for dataset {}: {}",
                dataset, reason
            ),
        }
    }
}

impl std::error::Error for FallbackError {}

pub struct FallbackResolver {
    cache: CacheStore,
    synthetic: SyntheticSource,
    candidate_timeout: Duration,
}

impl FallbackResolver {
    /// Validates the synthetic table up front; an unusable table is fatal.
    pub fn new(cache: CacheStore, synthetic: SyntheticSource) -> Result<Self, FallbackError> {
        synthetic
            .validate()
            .map_err(|reason| FallbackError::SyntheticUnusable {
                dataset: "*".to_string(),
                reason,
            })?;
        Ok(Self {
            cache,
            synthetic,
            candidate_timeout: DEFAULT_CANDIDATE_TIMEOUT,
        })
    }

    /// Upper bound on one candidate's fetch, retries included.
    pub fn with_candidate_timeout(mut self, candidate_timeout: Duration) -> Self {
        self.candidate_timeout = candidate_timeout;
        self
    }

    pub async fn resolve(
        &self,
        dataset: &LogicalDataset,
    ) -> Result<ResolvedDataset, FallbackError> {
        let mut attempts = Vec::with_capacity(dataset.candidates.len() + 1);

        for adapter in &dataset.candidates {
            let source_id = adapter.source_id().to_string();
            let result = match timeout(
                self.candidate_timeout,
                adapter.fetch(&dataset.query, &self.cache),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::Network(format!(
                    "{} exceeded {:?}",
                    source_id, self.candidate_timeout
                ))),
            };

            match result.map(|outcome| FetchOutcome {
                records: dataset.query.retain(outcome.records),
                provenance: outcome.provenance,
            }) {
                Ok(outcome) if !outcome.records.is_empty() => {
                    info!(
                        dataset = %dataset.name,
                        source = %source_id,
                        provenance = %outcome.provenance,
                        records = outcome.records.len(),
                        "dataset resolved"
                    );
                    attempts.push(SourceAttempt {
                        source_id,
                        outcome: AttemptOutcome::Accepted(outcome.provenance),
                    });
                    return Ok(ResolvedDataset {
                        name: dataset.name.clone(),
                        records: outcome.records,
                        provenance: outcome.provenance,
                        attempts,
                    });
                }
                Ok(_) => {
                    warn!(
                        dataset = %dataset.name,
                        source = %source_id,
                        "candidate returned no records"
                    );
                    attempts.push(SourceAttempt {
                        source_id,
                        outcome: AttemptOutcome::Empty,
                    });
                }
                Err(e) => {
                    warn!(
                        dataset = %dataset.name,
                        source = %source_id,
                        kind = e.kind(),
                        error = %e,
                        "candidate failed, trying next"
                    );
                    attempts.push(SourceAttempt {
                        source_id,
                        outcome: AttemptOutcome::Failed(e),
                    });
                }
            }
        }

        let records = self.synthetic.records_for(&dataset.query);
        if let Some(missing) = dataset
            .query
            .metrics
            .iter()
            .find(|m| !records.iter().any(|r| &r.metric_name == *m))
        {
            return Err(FallbackError::SyntheticUnusable {
                dataset: dataset.name.clone(),
                reason: format!("no synthetic records for metric {}", missing),
            });
        }

        warn!(
            dataset = %dataset.name,
            tried = attempts.len(),
            records = records.len(),
            "all candidates failed, substituting synthetic dataset"
        );
        attempts.push(SourceAttempt {
            source_id: crate::sources::synthetic::SYNTHETIC_SOURCE_ID.to_string(),
            outcome: AttemptOutcome::Accepted(Provenance::Synthetic),
        });
        Ok(ResolvedDataset {
            name: dataset.name.clone(),
            records,
            provenance: Provenance::Synthetic,
            attempts,
        })
    }

    /// Resolve independent datasets concurrently; output follows input order.
    pub async fn resolve_all(
        &self,
        datasets: &[LogicalDataset],
    ) -> Result<Vec<ResolvedDataset>, FallbackError> {
        join_all(datasets.iter().map(|d| self.resolve(d)))
            .await
            .into_iter()
            .collect()
    }
}
