//! World Bank indicators adapter (national context)
//!
//! Payload shape: `[{page metadata}, [{indicator, country, date, value}, ...]]`.
//! Errors come back as `[{"message":[{"id":"120","key":"Invalid value",...}]}]`.
//! Every record is keyed to the national entity.

use super::{
    fetch_through_cache, parse_number, parse_year, FetchOutcome, SourceAdapter, SourceError,
    SourceHttpClient, SourceQuery,
};
use crate::cache::CacheStore;
use crate::config::WorldBankConfig;
use crate::models::{metric_names, NormalizedRecord, Provenance, Unit, NATIONAL_ENTITY};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub struct WorldBankAdapter {
    source_id: String,
    http: Arc<SourceHttpClient>,
    config: WorldBankConfig,
}

impl WorldBankAdapter {
    pub fn new(http: Arc<SourceHttpClient>, config: WorldBankConfig) -> Self {
        Self {
            source_id: "world_bank".to_string(),
            http,
            config,
        }
    }

    async fn fetch_indicator(&self, indicator: &str) -> Result<String, SourceError> {
        let url = format!(
            "{}/country/{}/indicator/{}",
            self.config.source.base_url.trim_end_matches('/'),
            self.config.country,
            indicator
        );
        let params = [
            ("format".to_string(), "json".to_string()),
            (
                "date".to_string(),
                format!("{}:{}", self.config.year_from, self.config.year_to),
            ),
            ("per_page".to_string(), "100".to_string()),
        ];
        self.http.get_text(&url, &params, &[]).await
    }
}

#[async_trait]
impl SourceAdapter for WorldBankAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    /// One request per indicator; partial success returns what was fetched.
    async fn fetch(
        &self,
        query: &SourceQuery,
        cache: &CacheStore,
    ) -> Result<FetchOutcome, SourceError> {
        let mut records = Vec::new();
        let mut provenance: Option<Provenance> = None;
        let mut first_error = None;

        for (indicator, metric) in &self.config.indicators {
            if !query.wants(metric) {
                continue;
            }
            let query_key = format!(
                "{}:{}:{}-{}",
                self.config.country, indicator, self.config.year_from, self.config.year_to
            );
            let result = fetch_through_cache(
                cache,
                &self.source_id,
                &query_key,
                self.config.source.ttl(),
                || self.fetch_indicator(indicator),
                |body| normalize(body, &self.source_id, metric),
            )
            .await;

            match result {
                Ok(outcome) => {
                    records.extend(outcome.records);
                    provenance = Some(match provenance {
                        Some(p) => p.degrade(outcome.provenance),
                        None => outcome.provenance,
                    });
                }
                Err(e) => {
                    warn!(
                        source = %self.source_id,
                        indicator = %indicator,
                        error = %e,
                        "indicator fetch failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match (provenance, first_error) {
            (Some(provenance), _) => Ok(FetchOutcome {
                records,
                provenance,
            }),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(FetchOutcome {
                records,
                provenance: Provenance::Live,
            }),
        }
    }
}

fn unit_for(metric: &str) -> Unit {
    match metric {
        metric_names::EDUCATION_SPENDING_PCT_GDP => Unit::Percent,
        _ => Unit::Usd,
    }
}

/// Parse one indicator payload into national records for `metric`.
pub fn normalize(
    body: &str,
    source_id: &str,
    metric: &str,
) -> Result<Vec<NormalizedRecord>, SourceError> {
    let payload: Value = serde_json::from_str(body)
        .map_err(|e| SourceError::SchemaMismatch(format!("world bank payload: {}", e)))?;

    let parts = payload
        .as_array()
        .ok_or_else(|| SourceError::SchemaMismatch("world bank payload is not an array".into()))?;

    if let Some(message) = parts
        .first()
        .and_then(|meta| meta.get("message"))
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
    {
        let text = message
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(SourceError::SchemaMismatch(format!("world bank error: {}", text)));
    }

    let observations = match parts.get(1) {
        Some(Value::Array(obs)) => obs.as_slice(),
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => {
            return Err(SourceError::SchemaMismatch(
                "world bank observations are not an array".into(),
            ))
        }
    };

    let unit = unit_for(metric);
    Ok(observations
        .iter()
        .filter_map(|obs| {
            let value = obs.get("value").and_then(parse_number)?;
            let year = obs.get("date").and_then(parse_year)?;
            Some(NormalizedRecord::new(
                NATIONAL_ENTITY,
                source_id,
                metric,
                value,
                unit,
                year,
            ))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::sources::http::test_server::{serve, serve_routes};
    use chrono::Utc;
    use std::time::Duration;

    const GDP: &str = "NY.GDP.PCAP.CD";
    const EDU: &str = "SE.XPD.TOTL.GD.ZS";

    const EDU_PAYLOAD: &str = r#"[
        {"page":1,"pages":1,"per_page":100,"total":1},
        [{"indicator":{"id":"SE.XPD.TOTL.GD.ZS"},"country":{"id":"US"},"date":"2020","value":6.05}]
    ]"#;

    fn adapter(base_url: &str) -> WorldBankAdapter {
        let mut config = WorldBankConfig::default();
        config.source = SourceConfig::new(base_url);
        config.source.min_interval_ms = 0;
        config.source.max_retries = 0;
        let http = Arc::new(SourceHttpClient::new("world_bank", &config.source).unwrap());
        WorldBankAdapter::new(http, config)
    }

    fn both_metrics() -> SourceQuery {
        SourceQuery::new([
            metric_names::GDP_PER_CAPITA,
            metric_names::EDUCATION_SPENDING_PCT_GDP,
        ])
    }

    fn count(records: &[NormalizedRecord], metric: &str) -> usize {
        records.iter().filter(|r| r.metric_name == metric).count()
    }

    const PAYLOAD: &str = r#"[
        {"page":1,"pages":1,"per_page":100,"total":3},
        [
            {"indicator":{"id":"NY.GDP.PCAP.CD","value":"GDP per capita (current US$)"},"country":{"id":"US","value":"United States"},"date":"2022","value":76329.58},
            {"indicator":{"id":"NY.GDP.PCAP.CD","value":"GDP per capita (current US$)"},"country":{"id":"US","value":"United States"},"date":"2021","value":70219.47},
            {"indicator":{"id":"NY.GDP.PCAP.CD","value":"GDP per capita (current US$)"},"country":{"id":"US","value":"United States"},"date":"2020","value":null}
        ]
    ]"#;

    #[test]
    fn test_normalize_indicator_series() {
        let records = normalize(PAYLOAD, "world_bank", metric_names::GDP_PER_CAPITA).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_national()));
        assert_eq!(records[0].period, 2022);
        assert_eq!(records[0].unit, Unit::Usd);
    }

    #[test]
    fn test_error_message_is_schema_mismatch() {
        let body = r#"[{"message":[{"id":"120","key":"Invalid value","value":"The provided parameter value is not valid"}]}]"#;
        let err = normalize(body, "world_bank", metric_names::GDP_PER_CAPITA).unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[test]
    fn test_null_observations_are_empty() {
        let body = r#"[{"page":1,"pages":0,"per_page":100,"total":0},null]"#;
        assert!(normalize(body, "world_bank", metric_names::GDP_PER_CAPITA)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_fetch_every_indicator_then_cached() {
        let server = serve_routes(vec![
            (GDP, "200 OK", PAYLOAD.to_string()),
            (EDU, "200 OK", EDU_PAYLOAD.to_string()),
        ])
        .await;
        let adapter = adapter(&server.base_url);
        let cache = CacheStore::open_in_memory().unwrap();

        let first = adapter.fetch(&both_metrics(), &cache).await.unwrap();
        assert_eq!(first.provenance, Provenance::Live);
        assert_eq!(count(&first.records, metric_names::GDP_PER_CAPITA), 2);
        assert_eq!(count(&first.records, metric_names::EDUCATION_SPENDING_PCT_GDP), 1);
        assert_eq!(server.hits(), 2);

        let second = adapter.fetch(&both_metrics(), &cache).await.unwrap();
        assert_eq!(second.provenance, Provenance::Cached { stale: false });
        assert_eq!(second.records, first.records);
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_fetched_indicators() {
        // only the GDP route exists; the education indicator gets a 404
        let server = serve_routes(vec![(GDP, "200 OK", PAYLOAD.to_string())]).await;
        let adapter = adapter(&server.base_url);
        let cache = CacheStore::open_in_memory().unwrap();

        let out = adapter.fetch(&both_metrics(), &cache).await.unwrap();
        assert_eq!(out.provenance, Provenance::Live);
        assert_eq!(count(&out.records, metric_names::GDP_PER_CAPITA), 2);
        assert_eq!(count(&out.records, metric_names::EDUCATION_SPENDING_PCT_GDP), 0);
    }

    #[tokio::test]
    async fn test_stale_indicator_degrades_provenance() {
        let server = serve_routes(vec![(GDP, "200 OK", PAYLOAD.to_string())]).await;
        let adapter = adapter(&server.base_url);
        let cache = CacheStore::open_in_memory().unwrap();
        cache
            .put_at(
                "world_bank",
                &format!("US:{}:2015-2022", EDU),
                EDU_PAYLOAD,
                Duration::from_secs(60),
                Utc::now() - chrono::Duration::hours(3),
            )
            .unwrap();

        let out = adapter.fetch(&both_metrics(), &cache).await.unwrap();
        assert_eq!(out.provenance, Provenance::Cached { stale: true });
        assert_eq!(count(&out.records, metric_names::GDP_PER_CAPITA), 2);
        assert_eq!(count(&out.records, metric_names::EDUCATION_SPENDING_PCT_GDP), 1);
    }

    #[tokio::test]
    async fn test_every_indicator_failing_surfaces_error() {
        let server = serve("503 Service Unavailable", String::new()).await;
        let adapter = adapter(&server.base_url);
        let cache = CacheStore::open_in_memory().unwrap();

        let err = adapter.fetch(&both_metrics(), &cache).await.unwrap_err();
        assert_eq!(err.kind(), "network");
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_unrequested_indicators_are_skipped() {
        let server = serve("200 OK", PAYLOAD.to_string()).await;
        let adapter = adapter(&server.base_url);
        let cache = CacheStore::open_in_memory().unwrap();

        let out = adapter
            .fetch(&SourceQuery::new([metric_names::GDP_PER_CAPITA]), &cache)
            .await
            .unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(server.hits(), 1);
    }
}
