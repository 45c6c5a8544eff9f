//! NAEP Data Service adapter (outcome variable)
//!
//! `GetAdhocData.aspx?type=data&...` answers
//! `{"status":200,"result":[{"jurisdiction":"AL","year":2019,"value":268.69,...}]}`.
//! National and district jurisdictions (NP, NT, district codes) are dropped.

use super::{
    fetch_through_cache, parse_number, states, FetchOutcome, SourceAdapter, SourceError,
    SourceHttpClient, SourceQuery,
};
use crate::cache::CacheStore;
use crate::config::NaepConfig;
use crate::models::{metric_names, NormalizedRecord, Unit};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

pub struct NaepAdapter {
    source_id: String,
    http: Arc<SourceHttpClient>,
    config: NaepConfig,
    year: i32,
}

#[derive(Debug, Deserialize)]
struct NaepResponse {
    #[serde(default)]
    status: Option<i64>,
    result: Vec<NaepRow>,
}

#[derive(Debug, Deserialize)]
struct NaepRow {
    jurisdiction: String,
    year: i32,
    value: serde_json::Value,
    #[serde(default, rename = "isStatDisplayable")]
    is_stat_displayable: Option<i64>,
}

impl NaepAdapter {
    pub fn new(http: Arc<SourceHttpClient>, config: NaepConfig, year: i32) -> Self {
        Self {
            source_id: format!("naep_{}", year),
            http,
            config,
            year,
        }
    }

    fn query_key(&self) -> String {
        format!(
            "{}:g{}:{}:{}",
            self.config.subject, self.config.grade, self.config.subscale, self.year
        )
    }

    async fn fetch_live(&self) -> Result<String, SourceError> {
        let jurisdictions = states::postal_codes().collect::<Vec<_>>().join(",");
        let params = [
            ("type".to_string(), "data".to_string()),
            ("subject".to_string(), self.config.subject.clone()),
            ("grade".to_string(), self.config.grade.to_string()),
            ("subscale".to_string(), self.config.subscale.clone()),
            ("variable".to_string(), "TOTAL".to_string()),
            ("jurisdiction".to_string(), jurisdictions),
            ("stattype".to_string(), "MN:MN".to_string()),
            ("Year".to_string(), self.year.to_string()),
        ];
        self.http
            .get_text(&self.config.source.base_url, &params, &[])
            .await
    }
}

#[async_trait]
impl SourceAdapter for NaepAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        query: &SourceQuery,
        cache: &CacheStore,
    ) -> Result<FetchOutcome, SourceError> {
        let outcome = fetch_through_cache(
            cache,
            &self.source_id,
            &self.query_key(),
            self.config.source.ttl(),
            || self.fetch_live(),
            |body| normalize(body, &self.source_id),
        )
        .await?;
        Ok(FetchOutcome {
            records: query.retain(outcome.records),
            provenance: outcome.provenance,
        })
    }
}

pub fn normalize(body: &str, source_id: &str) -> Result<Vec<NormalizedRecord>, SourceError> {
    let response: NaepResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::SchemaMismatch(format!("naep payload: {}", e)))?;

    if let Some(status) = response.status {
        if status != 200 {
            return Err(SourceError::SchemaMismatch(format!(
                "naep service reported status {}",
                status
            )));
        }
    }

    Ok(response
        .result
        .iter()
        .filter(|row| row.is_stat_displayable.unwrap_or(1) != 0)
        .filter_map(|row| {
            let state = states::resolve(&row.jurisdiction)?;
            let value = parse_number(&row.value)?;
            Some(NormalizedRecord::new(
                state,
                source_id,
                metric_names::NAEP_SCORE,
                value,
                Unit::ScaleScore,
                row.year,
            ))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::models::Provenance;
    use crate::sources::http::test_server::serve;
    use chrono::Utc;

    fn adapter(base_url: &str, year: i32) -> NaepAdapter {
        let mut config = NaepConfig::default();
        config.source = SourceConfig::new(base_url);
        config.source.min_interval_ms = 0;
        config.source.max_retries = 0;
        let http = Arc::new(SourceHttpClient::new("naep", &config.source).unwrap());
        NaepAdapter::new(http, config, year)
    }

    const BODY: &str = r#"{"status":200,"result":[
        {"year":2022,"jurisdiction":"AL","value":258.97,"isStatDisplayable":1},
        {"year":2022,"jurisdiction":"NJ","value":281.56,"isStatDisplayable":1}
    ]}"#;

    #[test]
    fn test_normalize_state_means() {
        let body = r#"{"status":200,"result":[
            {"year":2019,"sample":"R3","jurisdiction":"AL","jurisLabel":"Alabama","value":268.69,"isStatDisplayable":1,"errorFlag":0},
            {"year":2019,"sample":"R3","jurisdiction":"NP","jurisLabel":"National public","value":281.3,"isStatDisplayable":1},
            {"year":2019,"sample":"R3","jurisdiction":"MA","jurisLabel":"Massachusetts","value":294.0,"isStatDisplayable":0},
            {"year":2019,"sample":"R3","jurisdiction":"MN","jurisLabel":"Minnesota","value":290.9}
        ]}"#;
        let records = normalize(body, "naep_2019").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entity_key, "AL");
        assert_eq!(records[0].unit, Unit::ScaleScore);
        assert_eq!(records[1].entity_key, "MN");
        assert_eq!(records[1].period, 2019);
    }

    #[test]
    fn test_error_status_is_schema_mismatch() {
        let err = normalize(r#"{"status":400,"result":[]}"#, "naep").unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[test]
    fn test_html_error_page_is_schema_mismatch() {
        let err = normalize("<html><body>Service Unavailable</body></html>", "naep").unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[tokio::test]
    async fn test_fetch_live_then_cached() {
        let server = serve("200 OK", BODY.to_string()).await;
        let adapter = adapter(&server.base_url, 2022);
        assert_eq!(adapter.source_id(), "naep_2022");
        let cache = CacheStore::open_in_memory().unwrap();
        let query = SourceQuery::new([metric_names::NAEP_SCORE]);

        let first = adapter.fetch(&query, &cache).await.unwrap();
        assert_eq!(first.provenance, Provenance::Live);
        assert_eq!(first.records.len(), 2);

        let second = adapter.fetch(&query, &cache).await.unwrap();
        assert_eq!(second.provenance, Provenance::Cached { stale: false });
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_fetch_serves_stale_entry_when_service_fails() {
        let server = serve("500 Internal Server Error", String::new()).await;
        let adapter = adapter(&server.base_url, 2022);
        let cache = CacheStore::open_in_memory().unwrap();
        let query = SourceQuery::new([metric_names::NAEP_SCORE]);

        let err = adapter.fetch(&query, &cache).await.unwrap_err();
        assert_eq!(err.kind(), "network");

        cache
            .put_at(
                "naep_2022",
                &adapter.query_key(),
                BODY,
                std::time::Duration::from_secs(60),
                Utc::now() - chrono::Duration::hours(1),
            )
            .unwrap();
        let stale = adapter.fetch(&query, &cache).await.unwrap();
        assert_eq!(stale.provenance, Provenance::Cached { stale: true });
        assert_eq!(stale.records.len(), 2);
    }

    #[tokio::test]
    async fn test_service_error_status_is_not_cached() {
        let server = serve("200 OK", r#"{"status":400,"result":[]}"#.to_string()).await;
        let adapter = adapter(&server.base_url, 2019);
        let cache = CacheStore::open_in_memory().unwrap();
        let err = adapter
            .fetch(&SourceQuery::new([metric_names::NAEP_SCORE]), &cache)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
        assert_eq!(cache.stats().unwrap().entries, 0);
    }
}
