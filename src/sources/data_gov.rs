//! data.gov / NCES finance extract adapter
//!
//! Accepts the shapes these portals return: a bare array of row objects
//! (Socrata `resource/<id>.json`), Socrata's `rows.json` view export
//! `{"meta": {"view": {"columns": [...]}}, "data": [[...]]}`,
//! `{"results": [...]}`, or CKAN's `{"result": {"records": [...]}}`.
//! Column names come from config.

use super::{
    fetch_through_cache, parse_number, parse_year, states, FetchOutcome, SourceAdapter,
    SourceError, SourceHttpClient, SourceQuery,
};
use crate::cache::CacheStore;
use crate::config::DataGovConfig;
use crate::models::{metric_names, NormalizedRecord, Unit};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::Arc;

pub struct DataGovAdapter {
    source_id: String,
    http: Arc<SourceHttpClient>,
    config: DataGovConfig,
}

impl DataGovAdapter {
    pub fn new(http: Arc<SourceHttpClient>, config: DataGovConfig) -> Self {
        Self {
            source_id: "data_gov".to_string(),
            http,
            config,
        }
    }

    fn query_key(&self) -> String {
        format!("{}?$limit={}", self.config.source.base_url, self.config.row_limit)
    }

    async fn fetch_live(&self) -> Result<String, SourceError> {
        let params = [("$limit".to_string(), self.config.row_limit.to_string())];
        let headers: Vec<(&str, String)> = self
            .config
            .source
            .api_key
            .iter()
            .map(|key| ("X-Api-Key", key.clone()))
            .collect();
        self.http
            .get_text(&self.config.source.base_url, &params, &headers)
            .await
    }
}

#[async_trait]
impl SourceAdapter for DataGovAdapter {
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
            |body| normalize(body, &self.source_id, &self.config),
        )
        .await?;
        Ok(FetchOutcome {
            records: query.retain(outcome.records),
            provenance: outcome.provenance,
        })
    }
}

fn unit_for(metric: &str) -> Unit {
    match metric {
        metric_names::PER_PUPIL_SPENDING | metric_names::MEDIAN_HOUSEHOLD_INCOME => Unit::Usd,
        metric_names::POVERTY_RATE => Unit::Percent,
        _ => Unit::Ratio,
    }
}

fn rows_of(payload: &Value) -> Option<Cow<'_, [Value]>> {
    payload
        .as_array()
        .or_else(|| payload.get("results").and_then(Value::as_array))
        .or_else(|| {
            payload
                .get("result")
                .and_then(|r| r.get("records"))
                .and_then(Value::as_array)
        })
        .map(|rows| Cow::Borrowed(rows.as_slice()))
        .or_else(|| view_export_rows(payload).map(Cow::Owned))
}

/// Rebuild row objects from a `rows.json` export: positional `data` cells
/// named by `meta.view.columns[].fieldName`.
fn view_export_rows(payload: &Value) -> Option<Vec<Value>> {
    let columns: Vec<&str> = payload
        .get("meta")?
        .get("view")?
        .get("columns")?
        .as_array()?
        .iter()
        .map(|c| c.get("fieldName").and_then(Value::as_str).unwrap_or_default())
        .collect();
    let data = payload.get("data")?.as_array()?;

    Some(
        data.iter()
            .filter_map(Value::as_array)
            .map(|cells| {
                let row: Map<String, Value> = columns
                    .iter()
                    .zip(cells)
                    .filter(|(name, _)| !name.is_empty())
                    .map(|(name, cell)| (name.to_string(), cell.clone()))
                    .collect();
                Value::Object(row)
            })
            .collect(),
    )
}

pub fn normalize(
    body: &str,
    source_id: &str,
    config: &DataGovConfig,
) -> Result<Vec<NormalizedRecord>, SourceError> {
    let payload: Value = serde_json::from_str(body)
        .map_err(|e| SourceError::SchemaMismatch(format!("data.gov payload: {}", e)))?;
    let rows = rows_of(&payload)
        .ok_or_else(|| SourceError::SchemaMismatch("data.gov payload has no row array".into()))?;

    if let Some(first) = rows.first() {
        if first.get(&config.state_field).is_none() {
            return Err(SourceError::SchemaMismatch(format!(
                "data.gov rows lack state column {}",
                config.state_field
            )));
        }
    }

    let mut records = Vec::new();
    for row in rows.iter() {
        let Some(state) = row
            .get(&config.state_field)
            .and_then(|v| match v {
                Value::String(s) => states::resolve(s),
                Value::Number(n) => n.as_u64().and_then(|f| states::from_fips(&f.to_string())),
                _ => None,
            })
        else {
            continue;
        };
        let Some(period) = row.get(&config.period_field).and_then(parse_year) else {
            continue;
        };

        for (metric, field) in &config.metric_fields {
            if let Some(value) = row.get(field).and_then(parse_number) {
                records.push(NormalizedRecord::new(
                    state,
                    source_id,
                    metric.as_str(),
                    value,
                    unit_for(metric),
                    period,
                ));
            }
        }
    }

    Ok(records)
}
