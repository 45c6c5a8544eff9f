//! Source adapters
//!
//! Every external source implements [`SourceAdapter`]: look in the cache,
//! otherwise hit the API through a rate-limited client, normalize the
//! source-specific payload into [`NormalizedRecord`]s, and write the raw body
//! back to the cache only once it normalized cleanly.

pub mod census;
pub mod data_gov;
pub mod http;
pub mod naep;
pub mod states;
pub mod synthetic;
pub mod world_bank;

use crate::cache::{CacheStore, Freshness};
use crate::models::{NormalizedRecord, Provenance};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use census::CensusAdapter;
pub use data_gov::DataGovAdapter;
pub use http::SourceHttpClient;
pub use naep::NaepAdapter;
pub use synthetic::SyntheticSource;
pub use world_bank::WorldBankAdapter;

/// Failure kinds at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Connection failure, timeout, or unexpected HTTP status
    Network(String),
    /// Credential rejected (401/403)
    Auth(String),
    /// Source asked us to back off (429)
    RateLimited(String),
    /// Payload did not match the expected schema
    SchemaMismatch(String),
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Auth(_) => "auth",
            Self::RateLimited(_) => "rate_limited",
            Self::SchemaMismatch(_) => "schema_mismatch",
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(m) => write!(f, "network error: {}", m),
            Self::Auth(m) => write!(f, "auth error: {}", m),
            Self::RateLimited(m) => write!(f, "rate limited: {}", m),
            Self::SchemaMismatch(m) => write!(f, "schema mismatch: {}", m),
        }
    }
}

impl std::error::Error for SourceError {}

/// Which metrics a logical dataset wants from an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceQuery {
    pub metrics: Vec<String>,
}

impl SourceQuery {
    pub fn new<I, S>(metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metrics: metrics.into_iter().map(Into::into).collect(),
        }
    }

    pub fn wants(&self, metric: &str) -> bool {
        self.metrics.iter().any(|m| m == metric)
    }

    /// Keep only the records for requested metrics.
    pub fn retain(&self, mut records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
        records.retain(|r| self.wants(&r.metric_name));
        records
    }
}

/// Records returned by one adapter call, with where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<NormalizedRecord>,
    pub provenance: Provenance,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier, also the cache namespace.
    fn source_id(&self) -> &str;

    /// Fetch and normalize. An empty record set is a valid outcome.
    async fn fetch(
        &self,
        query: &SourceQuery,
        cache: &CacheStore,
    ) -> Result<FetchOutcome, SourceError>;
}

/// Read-through/write-through fetch shared by the HTTP adapters.
///
/// A fresh cache hit short-circuits the live request. On live failure a stale
/// entry is normalized and returned tagged `Cached { stale: true }`.
pub(crate) async fn fetch_through_cache<L, Fut, N>(
    cache: &CacheStore,
    source_id: &str,
    query_key: &str,
    ttl: Duration,
    live: L,
    normalize: N,
) -> Result<FetchOutcome, SourceError>
where
    L: FnOnce() -> Fut,
    Fut: Future<Output = Result<String, SourceError>>,
    N: Fn(&str) -> Result<Vec<NormalizedRecord>, SourceError>,
{
    let mut stale = None;
    match cache.get(source_id, query_key) {
        Ok(Some(hit)) if hit.freshness == Freshness::Fresh => {
            match normalize(&hit.response.payload) {
                Ok(records) => {
                    debug!(
                        source = source_id,
                        query = query_key,
                        records = records.len(),
                        "fresh cache hit"
                    );
                    return Ok(FetchOutcome {
                        records,
                        provenance: Provenance::Cached { stale: false },
                    });
                }
                Err(e) => {
                    warn!(
                        source = source_id,
                        query = query_key,
                        error = %e,
                        "cached payload no longer normalizes, refetching"
                    );
                }
            }
        }
        Ok(Some(hit)) => stale = Some(hit.response),
        Ok(None) => {}
        Err(e) => {
            warn!(
                source = source_id,
                query = query_key,
                error = %e,
                "cache read failed, going live"
            );
        }
    }

    let live_result = match live().await {
        Ok(body) => normalize(&body).map(|records| (body, records)),
        Err(e) => Err(e),
    };

    match live_result {
        Ok((body, records)) => {
            if let Err(e) = cache.put(source_id, query_key, &body, ttl) {
                warn!(
                    source = source_id,
                    query = query_key,
                    error = %e,
                    "cache write failed"
                );
            }
            info!(
                source = source_id,
                query = query_key,
                records = records.len(),
                "live fetch succeeded"
            );
            Ok(FetchOutcome {
                records,
                provenance: Provenance::Live,
            })
        }
        Err(live_err) => {
            let Some(entry) = stale else {
                return Err(live_err);
            };
            match normalize(&entry.payload) {
                Ok(records) => {
                    warn!(
                        source = source_id,
                        query = query_key,
                        error = %live_err,
                        fetched_at = %entry.fetched_at,
                        "live fetch failed, serving stale cache entry"
                    );
                    Ok(FetchOutcome {
                        records,
                        provenance: Provenance::Cached { stale: true },
                    })
                }
                Err(_) => Err(live_err),
            }
        }
    }
}

/// Parse a JSON number or a numeric string ("12,345", "$9,870.5").
pub(crate) fn parse_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, ',' | '$' | '%' | ' '))
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Leading four-digit year of "2021", "2019-20", or "2019-2020".
pub(crate) fn parse_year(value: &serde_json::Value) -> Option<i32> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        serde_json::Value::String(s) => s.trim().get(..4).and_then(|y| y.parse().ok()),
        _ => None,
    }
}
