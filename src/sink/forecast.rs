#![forbid(unsafe_code)]

use crate::error::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Read side of the external time-series store.
#[async_trait]
pub trait ForecastReader: Send + Sync {
    async fn latest(&self, series_name: &str) -> Result<Option<f64>>;
}

/// Instant queries against a Prometheus HTTP API.
pub struct PrometheusForecastReader {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusForecastReader {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build forecast HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
struct QuerySample {
    /// `[unix_ts, "value"]`
    value: (f64, String),
}

/// Only an unambiguous single sample counts as the latest value.
fn extract_single_value(response: QueryResponse) -> Option<f64> {
    if response.status != "success" {
        return None;
    }
    let samples = response.data?.result;
    match samples.as_slice() {
        [sample] => sample.value.1.parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

#[async_trait]
impl ForecastReader for PrometheusForecastReader {
    async fn latest(&self, series_name: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", series_name)])
            .send()
            .await
            .with_context(|| format!("forecast query for `{series_name}` failed"))?
            .error_for_status()
            .with_context(|| format!("forecast query for `{series_name}` rejected"))?;

        let body: QueryResponse = response
            .json()
            .await
            .with_context(|| format!("forecast response for `{series_name}` is malformed"))?;

        let value = extract_single_value(body);
        if value.is_some() {
            tracing::debug!(target: "vtn::sink", series = series_name, "found flex forecast value");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> QueryResponse {
        serde_json::from_str(raw).expect("query response parses")
    }

    #[test]
    fn single_sample_is_extracted() {
        let response = parse(
            r#"{"status":"success","data":{"resultType":"vector","result":[
                {"metric":{"__name__":"VTN:FLEX:A:R1"},"value":[1700000000.0,"7.3"]}
            ]}}"#,
        );
        assert_eq!(extract_single_value(response), Some(7.3));
    }

    #[test]
    fn ambiguous_or_empty_results_are_ignored() {
        let empty = parse(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#);
        assert_eq!(extract_single_value(empty), None);

        let many = parse(
            r#"{"status":"success","data":{"result":[
                {"value":[1.0,"1"]},{"value":[1.0,"2"]}
            ]}}"#,
        );
        assert_eq!(extract_single_value(many), None);

        let failed = parse(r#"{"status":"error"}"#);
        assert_eq!(extract_single_value(failed), None);
    }
}
