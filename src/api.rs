use std::cmp::Reverse;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Settings;
use crate::record::SiteRecord;

/// Response code the scoped query returns when nothing matches.
pub const NO_DATA_CODE: &str = "OD-0102-S";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("years enumeration not found in API docs")]
    MissingYears,
    #[error("no data for {year} {county} {town}")]
    NoData {
        year: String,
        county: String,
        town: String,
    },
}

/// One page of the full-year dataset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetPage {
    #[serde(rename = "totalPage", default = "one", deserialize_with = "lenient_page_count")]
    pub total_page: u32,
    #[serde(rename = "responseData", default)]
    pub records: Vec<SiteRecord>,
}

#[derive(Debug, Deserialize)]
struct ScopedResponse {
    #[serde(rename = "responseCode", default)]
    response_code: Option<String>,
    #[serde(rename = "responseData", default)]
    records: Vec<SiteRecord>,
}

/// A year + county + town query against the remote dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedQuery {
    pub year: String,
    pub county: String,
    pub town: String,
}

#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Valid dataset years, most recent first.
    async fn fetch_years(&self) -> Result<Vec<String>, FetchError>;
    /// 1-based page of the whole dataset for `year`.
    async fn fetch_page(&self, year: &str, page: u32) -> Result<DatasetPage, FetchError>;
    async fn fetch_scoped(&self, query: &ScopedQuery) -> Result<Vec<SiteRecord>, FetchError>;
}

pub struct RisClient {
    http: reqwest::Client,
    base_url: String,
    docs_url: String,
    dataset: String,
}

impl RisClient {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            docs_url: settings.docs_url.clone(),
            dataset: settings.dataset.clone(),
        })
    }

    fn dataset_url(&self, year: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.dataset, year)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let resp = self.http.get(url).query(query).send().await?;
        check_status(url, resp.status())?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl DatasetSource for RisClient {
    async fn fetch_years(&self) -> Result<Vec<String>, FetchError> {
        info!("Fetching dataset years: {}", self.docs_url);
        let docs: Value = self.get_json(&self.docs_url, &[]).await?;
        parse_years(&docs, &self.dataset)
    }

    async fn fetch_page(&self, year: &str, page: u32) -> Result<DatasetPage, FetchError> {
        let url = self.dataset_url(year);
        let page_data: DatasetPage = self.get_json(&url, &page_query(page)).await?;
        debug!(
            "Page {}/{} of {}: {} rows",
            page,
            page_data.total_page,
            year,
            page_data.records.len()
        );
        Ok(page_data)
    }

    async fn fetch_scoped(&self, query: &ScopedQuery) -> Result<Vec<SiteRecord>, FetchError> {
        let url = self.dataset_url(&query.year);
        let resp: ScopedResponse = self.get_json(&url, &scoped_params(query)).await?;
        scoped_records(resp, query)
    }
}

/// Page 1 goes out bare, like the web client does.
fn page_query(page: u32) -> Vec<(&'static str, String)> {
    if page > 1 {
        vec![("PAGE", page.to_string())]
    } else {
        Vec::new()
    }
}

fn scoped_params(query: &ScopedQuery) -> [(&'static str, String); 2] {
    [
        ("COUNTY", query.county.clone()),
        ("TOWN", query.town.clone()),
    ]
}

fn check_status(url: &str, status: reqwest::StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    Err(FetchError::Status {
        url: url.to_string(),
        status: status.as_u16(),
    })
}

fn scoped_records(resp: ScopedResponse, query: &ScopedQuery) -> Result<Vec<SiteRecord>, FetchError> {
    if resp.response_code.as_deref() == Some(NO_DATA_CODE) {
        return Err(FetchError::NoData {
            year: query.year.clone(),
            county: query.county.clone(),
            town: query.town.clone(),
        });
    }
    Ok(resp.records)
}

/// Pull the year enum for `/{dataset}/{yyy}` out of the API docs document.
pub fn parse_years(docs: &Value, dataset: &str) -> Result<Vec<String>, FetchError> {
    let path = format!("/{}/{{yyy}}", dataset);
    let values = docs
        .get("paths")
        .and_then(|p| p.get(&path))
        .and_then(|p| p.pointer("/get/parameters/0/enum"))
        .and_then(Value::as_array)
        .ok_or(FetchError::MissingYears)?;

    let years: Vec<String> = values
        .iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect();

    Ok(most_recent_first(years))
}

/// Numeric years descending, anything else after them in reverse source order.
pub fn most_recent_first(years: Vec<String>) -> Vec<String> {
    let (mut numeric, other): (Vec<_>, Vec<_>) = years
        .into_iter()
        .map(|y| (y.parse::<u32>().ok(), y))
        .partition(|(n, _)| n.is_some());
    numeric.sort_by_key(|(n, _)| Reverse(*n));
    numeric
        .into_iter()
        .chain(other.into_iter().rev())
        .map(|(_, y)| y)
        .collect()
}

fn one() -> u32 {
    1
}

fn lenient_page_count<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(1),
        Value::String(s) => s.trim().parse().unwrap_or(1),
        _ => 1,
    })
}
