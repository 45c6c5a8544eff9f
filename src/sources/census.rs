//! Census ACS 5-year adapter
//!
//! The API answers with an array of string arrays, header row first:
//! `[["NAME","B19013_001E","B17001_001E","B17001_002E","state"],["Alabama","59609",...,"01"]]`.
//! Negative values are Census sentinels for "not available" and are skipped.

use super::{
    fetch_through_cache, states, FetchOutcome, SourceAdapter, SourceError, SourceHttpClient,
    SourceQuery,
};
use crate::cache::CacheStore;
use crate::config::SourceConfig;
use crate::models::{metric_names, NormalizedRecord, Unit};
use async_trait::async_trait;
use std::sync::Arc;

const MEDIAN_INCOME_VAR: &str = "B19013_001E";
const POVERTY_UNIVERSE_VAR: &str = "B17001_001E";
const POVERTY_COUNT_VAR: &str = "B17001_002E";

pub struct CensusAdapter {
    source_id: String,
    http: Arc<SourceHttpClient>,
    config: SourceConfig,
    year: i32,
}

impl CensusAdapter {
    pub fn new(http: Arc<SourceHttpClient>, config: SourceConfig, year: i32) -> Self {
        Self {
            source_id: format!("census_acs5_{}", year),
            http,
            config,
            year,
        }
    }

    fn query_key(&self) -> String {
        format!(
            "acs5:{}:{},{},{}",
            self.year, MEDIAN_INCOME_VAR, POVERTY_UNIVERSE_VAR, POVERTY_COUNT_VAR
        )
    }

    async fn fetch_live(&self) -> Result<String, SourceError> {
        let url = format!("{}/{}/acs/acs5", self.config.base_url.trim_end_matches('/'), self.year);
        let mut params = vec![
            (
                "get".to_string(),
                format!(
                    "NAME,{},{},{}",
                    MEDIAN_INCOME_VAR, POVERTY_UNIVERSE_VAR, POVERTY_COUNT_VAR
                ),
            ),
            ("for".to_string(), "state:*".to_string()),
        ];
        if let Some(key) = &self.config.api_key {
            params.push(("key".to_string(), key.clone()));
        }
        self.http.get_text(&url, &params, &[]).await
    }
}

#[async_trait]
impl SourceAdapter for CensusAdapter {
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
            self.config.ttl(),
            || self.fetch_live(),
            |body| normalize(body, &self.source_id, self.year),
        )
        .await?;
        Ok(FetchOutcome {
            records: query.retain(outcome.records),
            provenance: outcome.provenance,
        })
    }
}

/// Parse an ACS array-of-arrays payload.
pub fn normalize(
    body: &str,
    source_id: &str,
    year: i32,
) -> Result<Vec<NormalizedRecord>, SourceError> {
    let rows: Vec<Vec<Option<String>>> = serde_json::from_str(body)
        .map_err(|e| SourceError::SchemaMismatch(format!("census payload is not a table: {}", e)))?;

    let Some((header, data)) = rows.split_first() else {
        return Ok(Vec::new());
    };

    let column = |name: &str| {
        header
            .iter()
            .position(|h| h.as_deref() == Some(name))
            .ok_or_else(|| SourceError::SchemaMismatch(format!("census header missing {}", name)))
    };
    let state_col = column("state")?;
    let income_col = column(MEDIAN_INCOME_VAR)?;
    let universe_col = column(POVERTY_UNIVERSE_VAR)?;
    let poverty_col = column(POVERTY_COUNT_VAR)?;

    let cell = |row: &[Option<String>], idx: usize| -> Option<f64> {
        row.get(idx)
            .and_then(|v| v.as_deref())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };

    let mut records = Vec::with_capacity(data.len() * 2);
    for row in data {
        let Some(state) = row
            .get(state_col)
            .and_then(|v| v.as_deref())
            .and_then(states::from_fips)
        else {
            continue; // Puerto Rico and other non-state geographies
        };

        if let Some(income) = cell(row, income_col) {
            records.push(NormalizedRecord::new(
                state,
                source_id,
                metric_names::MEDIAN_HOUSEHOLD_INCOME,
                income,
                Unit::Usd,
                year,
            ));
        }
        if let (Some(universe), Some(poor)) = (cell(row, universe_col), cell(row, poverty_col)) {
            if universe > 0.0 {
                records.push(NormalizedRecord::new(
                    state,
                    source_id,
                    metric_names::POVERTY_RATE,
                    poor / universe * 100.0,
                    Unit::Percent,
                    year,
                ));
            }
        }
    }

    Ok(records)
}
