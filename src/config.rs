use anyhow::{Context, Result};
use ::config::{Config, ConfigBuilder, Environment};
use serde::Deserialize;

use crate::coordinator::HierarchyScope;
use crate::hierarchy::DEFAULT_UNIT_MARKERS;

const ENV_PREFIX: &str = "HOUSEHOLD";

const DEFAULT_BASE_URL: &str = "https://www.ris.gov.tw/rs-opendata/api/v1/datastore";
const DEFAULT_DOCS_URL: &str = "https://www.ris.gov.tw/rs-opendata/api/Main/docs/v1";
const DEFAULT_DATASET: &str = "ODRP019";
const DEFAULT_YEAR: &str = "110";
const DEFAULT_CONCURRENCY: i64 = 10;
const DEFAULT_TIMEOUT_SECS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub base_url: String,
    pub docs_url: String,
    pub dataset: String,
    /// Year whose full dataset seeds the county/town choices.
    pub default_year: String,
    /// Max trailing pages in flight at once.
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub unit_markers: Vec<String>,
    pub hierarchy_scope: HierarchyScope,
}

impl Settings {
    /// Defaults overlaid with `HOUSEHOLD_*` environment variables,
    /// e.g. `HOUSEHOLD_CONCURRENCY=4` or `HOUSEHOLD_UNIT_MARKERS=縣,市`.
    pub fn load() -> Result<Self> {
        Self::builder()?
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("unit_markers"),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn builder() -> Result<ConfigBuilder<::config::builder::DefaultState>> {
        let markers: Vec<String> = DEFAULT_UNIT_MARKERS.iter().map(|m| m.to_string()).collect();
        Ok(Config::builder()
            .set_default("base_url", DEFAULT_BASE_URL)?
            .set_default("docs_url", DEFAULT_DOCS_URL)?
            .set_default("dataset", DEFAULT_DATASET)?
            .set_default("default_year", DEFAULT_YEAR)?
            .set_default("concurrency", DEFAULT_CONCURRENCY)?
            .set_default("request_timeout_secs", DEFAULT_TIMEOUT_SECS)?
            .set_default("unit_markers", markers)?
            .set_default("hierarchy_scope", "default_year")?)
    }
}
