use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, AggregatedCounts};
use crate::api::{DatasetSource, FetchError, ScopedQuery};
use crate::fetcher::{fetch_all_streaming, FetchStats};
use crate::hierarchy::{extract_hierarchy, CountySplitter, Hierarchy, MarkerSplitter};
use crate::record::SiteRecord;

/// Notice shown when a submit produced nothing to chart.
pub const NO_DATA_NOTICE: &str = "查無資料";

/// Which year's dataset the county/town choices come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyScope {
    /// Built once from the default year and reused for every year.
    #[default]
    DefaultYear,
    /// Rebuilt from whichever year is selected.
    SelectedYear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    YearChosen,
    CountyChosen,
    TownChosen,
    Submitting,
    Ready,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("year {0} is not offered by the dataset")]
    UnknownYear(String),
    #[error("choose a year first")]
    NoYear,
    #[error("county {0} is not in the current county list")]
    UnknownCounty(String),
    #[error("choose a county first")]
    NoCounty,
    #[error("town {town} is not in {county}")]
    UnknownTown { county: String, town: String },
    #[error("year, county and town are all required")]
    Incomplete,
    #[error("a query is already in flight")]
    AlreadySubmitting,
}

/// Year/county/town picked so far. Every `with_*` clears the levels below it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    year: Option<String>,
    county: Option<String>,
    town: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Selection {
    pub fn year(&self) -> Option<&str> {
        self.year.as_deref()
    }

    pub fn county(&self) -> Option<&str> {
        self.county.as_deref()
    }

    pub fn town(&self) -> Option<&str> {
        self.town.as_deref()
    }

    pub fn with_year(&self, year: &str) -> Self {
        Self {
            year: non_empty(year),
            county: None,
            town: None,
        }
    }

    pub fn with_county(&self, county: &str) -> Self {
        Self {
            year: self.year.clone(),
            county: non_empty(county),
            town: None,
        }
    }

    pub fn with_town(&self, town: &str) -> Self {
        Self {
            year: self.year.clone(),
            county: self.county.clone(),
            town: non_empty(town),
        }
    }

    /// The scoped query for a complete selection.
    pub fn scoped_query(&self) -> Option<ScopedQuery> {
        Some(ScopedQuery {
            year: self.year.clone()?,
            county: self.county.clone()?,
            town: self.town.clone()?,
        })
    }

    fn chosen_phase(&self) -> Phase {
        match (&self.year, &self.county, &self.town) {
            (Some(_), Some(_), Some(_)) => Phase::TownChosen,
            (Some(_), Some(_), None) => Phase::CountyChosen,
            (Some(_), None, _) => Phase::YearChosen,
            (None, _, _) => Phase::Idle,
        }
    }
}

/// Correlates a scoped query with the selection it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitTicket {
    generation: u64,
    pub query: ScopedQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Applied,
    /// The selection moved on while the query was in flight; the result was dropped.
    Stale,
}

/// Sole owner of the record set, hierarchy and selection state.
pub struct Coordinator {
    scope: HierarchyScope,
    default_year: String,
    splitter: Box<dyn CountySplitter + Send + Sync>,
    years: Vec<String>,
    records: Vec<SiteRecord>,
    records_year: Option<String>,
    hierarchy_complete: bool,
    hierarchy: Hierarchy,
    selection: Selection,
    phase: Phase,
    counts: Option<AggregatedCounts>,
    notice: Option<&'static str>,
    generation: u64,
}

impl Coordinator {
    pub fn new(scope: HierarchyScope, default_year: &str) -> Self {
        Self::with_splitter(scope, default_year, Box::new(MarkerSplitter::default()))
    }

    pub fn with_splitter(
        scope: HierarchyScope,
        default_year: &str,
        splitter: Box<dyn CountySplitter + Send + Sync>,
    ) -> Self {
        Self {
            scope,
            default_year: default_year.to_string(),
            splitter,
            years: Vec::new(),
            records: Vec::new(),
            records_year: None,
            hierarchy_complete: false,
            hierarchy: Hierarchy::default(),
            selection: Selection::default(),
            phase: Phase::Idle,
            counts: None,
            notice: None,
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Aggregates of the last successful submit, None until then.
    pub fn counts(&self) -> Option<AggregatedCounts> {
        self.counts
    }

    pub fn notice(&self) -> Option<&'static str> {
        self.notice
    }

    pub fn years(&self) -> &[String] {
        &self.years
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn records(&self) -> &[SiteRecord] {
        &self.records
    }

    pub fn town_options(&self) -> Vec<&str> {
        self.selection
            .county()
            .and_then(|c| self.hierarchy.towns_of(c))
            .unwrap_or_default()
    }

    pub fn set_years(&mut self, years: Vec<String>) {
        self.years = years;
    }

    /// Year whose dataset should back the county/town choices right now.
    pub fn hierarchy_year(&self) -> &str {
        match self.scope {
            HierarchyScope::DefaultYear => self.default_year.as_str(),
            HierarchyScope::SelectedYear => self.selection.year().unwrap_or(&self.default_year),
        }
    }

    pub fn needs_hierarchy(&self) -> bool {
        !self.hierarchy_complete || self.records_year.as_deref() != Some(self.hierarchy_year())
    }

    /// Start a fresh record set for `year`, discarding whatever was there.
    pub fn begin_hierarchy_load(&mut self, year: &str) {
        self.records.clear();
        self.hierarchy = Hierarchy::default();
        self.records_year = Some(year.to_string());
        self.hierarchy_complete = false;
    }

    /// Append one page of `year` and rebuild the hierarchy. Pages for any
    /// other year are ignored; returns whether the page was applied.
    pub fn apply_page(&mut self, year: &str, records: Vec<SiteRecord>) -> bool {
        if self.records_year.as_deref() != Some(year) {
            debug!("Dropping page for {} (loading {:?})", year, self.records_year);
            return false;
        }
        self.records.extend(records);
        self.hierarchy = extract_hierarchy(
            self.records.iter().map(|r| r.site_id.as_str()),
            &*self.splitter,
        );
        true
    }

    pub fn finish_hierarchy_load(&mut self, year: &str) {
        if self.records_year.as_deref() == Some(year) {
            self.hierarchy_complete = true;
        }
    }

    pub async fn load_years(&mut self, source: &dyn DatasetSource) -> Result<(), FetchError> {
        match source.fetch_years().await {
            Ok(years) => {
                info!("{} dataset years available", years.len());
                self.set_years(years);
                Ok(())
            }
            Err(e) => {
                warn!("Could not load years: {}", e);
                self.years.clear();
                Err(e)
            }
        }
    }

    /// Fetch the full dataset for `hierarchy_year()`, rebuilding the
    /// hierarchy as each page arrives.
    pub async fn load_hierarchy(
        &mut self,
        source: Arc<dyn DatasetSource>,
        concurrency: usize,
    ) -> Result<FetchStats, FetchError> {
        let year = self.hierarchy_year().to_string();
        self.begin_hierarchy_load(&year);
        let stats = fetch_all_streaming(source, &year, concurrency, |batch| {
            debug!("Applying page {} ({} rows)", batch.page, batch.records.len());
            self.apply_page(&year, batch.records);
        })
        .await?;
        self.finish_hierarchy_load(&year);
        info!(
            "Hierarchy for {}: {} counties from {} rows",
            year,
            self.hierarchy.entries().len(),
            self.records.len()
        );
        Ok(stats)
    }

    fn reset_results(&mut self, selection: Selection) {
        self.selection = selection;
        self.counts = None;
        self.notice = None;
        // Anything still in flight now belongs to an older selection.
        self.generation += 1;
        self.phase = self.selection.chosen_phase();
    }

    pub fn select_year(&mut self, year: &str) -> Result<(), SelectionError> {
        let next = self.selection.with_year(year);
        if let Some(y) = next.year() {
            if !self.years.is_empty() && !self.years.iter().any(|known| known == y) {
                return Err(SelectionError::UnknownYear(y.to_string()));
            }
        }
        self.reset_results(next);
        if self.scope == HierarchyScope::SelectedYear && self.needs_hierarchy() {
            self.records.clear();
            self.hierarchy = Hierarchy::default();
            self.records_year = None;
            self.hierarchy_complete = false;
        }
        Ok(())
    }

    pub fn select_county(&mut self, county: &str) -> Result<(), SelectionError> {
        if self.selection.year().is_none() {
            return Err(SelectionError::NoYear);
        }
        let next = self.selection.with_county(county);
        if let Some(c) = next.county() {
            if !self.hierarchy.has_county(c) {
                return Err(SelectionError::UnknownCounty(c.to_string()));
            }
        }
        self.reset_results(next);
        Ok(())
    }

    pub fn select_town(&mut self, town: &str) -> Result<(), SelectionError> {
        let Some(county) = self.selection.county().map(str::to_string) else {
            return Err(SelectionError::NoCounty);
        };
        let next = self.selection.with_town(town);
        if let Some(t) = next.town() {
            if !self.hierarchy.contains(&county, t) {
                return Err(SelectionError::UnknownTown {
                    county,
                    town: t.to_string(),
                });
            }
        }
        self.reset_results(next);
        Ok(())
    }

    pub fn begin_submit(&mut self) -> Result<SubmitTicket, SelectionError> {
        if self.phase == Phase::Submitting {
            return Err(SelectionError::AlreadySubmitting);
        }
        let query = self
            .selection
            .scoped_query()
            .ok_or(SelectionError::Incomplete)?;
        self.counts = None;
        self.notice = None;
        self.generation += 1;
        self.phase = Phase::Submitting;
        Ok(SubmitTicket {
            generation: self.generation,
            query,
        })
    }

    pub fn complete_submit(
        &mut self,
        ticket: SubmitTicket,
        result: Result<Vec<SiteRecord>, FetchError>,
    ) -> SubmitOutcome {
        let current = self.selection.scoped_query();
        if ticket.generation != self.generation
            || current.as_ref() != Some(&ticket.query)
            || self.phase != Phase::Submitting
        {
            debug!("Discarding stale response for {:?}", ticket.query);
            return SubmitOutcome::Stale;
        }

        match result {
            Ok(rows) => {
                let counts = aggregate(&rows);
                info!(
                    "{} {} {}: {} rows aggregated",
                    ticket.query.year,
                    ticket.query.county,
                    ticket.query.town,
                    rows.len()
                );
                self.counts = Some(counts);
                self.phase = Phase::Ready;
            }
            Err(e) => {
                warn!("Query failed: {}", e);
                self.counts = None;
                self.notice = Some(NO_DATA_NOTICE);
                self.phase = Phase::Failed;
            }
        }
        SubmitOutcome::Applied
    }

    /// Issue the scoped query for the current selection and apply the result.
    pub async fn submit(
        &mut self,
        source: &dyn DatasetSource,
    ) -> Result<SubmitOutcome, SelectionError> {
        let ticket = self.begin_submit()?;
        let result = source.fetch_scoped(&ticket.query).await;
        Ok(self.complete_submit(ticket, result))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::fetcher::testing::{site, FakeSource};

    fn fake() -> FakeSource {
        let mut pages = HashMap::new();
        pages.insert(
            "110".to_string(),
            vec![
                vec![
                    site("臺北市中正區", ["1", "1", "1", "1"]),
                    site("臺北市大安區", ["1", "1", "1", "1"]),
                ],
                vec![site("新北市板橋區", ["1", "1", "1", "1"])],
            ],
        );
        pages.insert(
            "111".to_string(),
            vec![vec![site("桃園市桃園區", ["1", "1", "1", "1"])]],
        );
        let mut scoped = HashMap::new();
        scoped.insert(
            ("110".to_string(), "臺北市".to_string(), "中正區".to_string()),
            vec![
                site("臺北市中正區", ["10", "20", "3", "4"]),
                site("臺北市中正區", ["5", "n/a", "1", "1"]),
            ],
        );
        scoped.insert(
            ("111".to_string(), "臺北市".to_string(), "大安區".to_string()),
            vec![],
        );
        FakeSource {
            years: vec!["111".into(), "110".into()],
            pages,
            scoped,
            ..Default::default()
        }
    }

    async fn loaded(scope: HierarchyScope) -> (Coordinator, Arc<FakeSource>) {
        let source = Arc::new(fake());
        let mut c = Coordinator::new(scope, "110");
        c.load_years(&*source).await.unwrap();
        c.load_hierarchy(source.clone(), 2).await.unwrap();
        (c, source)
    }

    async fn ready(c: &mut Coordinator, source: &FakeSource) {
        c.select_year("110").unwrap();
        c.select_county("臺北市").unwrap();
        c.select_town("中正區").unwrap();
        assert_eq!(c.submit(source).await.unwrap(), SubmitOutcome::Applied);
    }

    #[test]
    fn selection_resets_lower_levels() {
        let s = Selection::default()
            .with_year("110")
            .with_county("臺北市")
            .with_town("中正區");
        assert!(s.scoped_query().is_some());

        let s2 = s.with_county("新北市");
        assert_eq!(s2.year(), Some("110"));
        assert_eq!(s2.town(), None);

        let s3 = s.with_year("111");
        assert_eq!((s3.county(), s3.town()), (None, None));
        assert_eq!(s.with_town("").scoped_query(), None);
    }

    #[tokio::test]
    async fn full_flow_reaches_ready() {
        let (mut c, source) = loaded(HierarchyScope::DefaultYear).await;
        assert_eq!(c.years(), &["111", "110"]);
        assert_eq!(c.hierarchy().counties().collect::<Vec<_>>(), vec!["臺北市", "新北市"]);

        ready(&mut c, &source).await;
        assert_eq!(c.phase(), Phase::Ready);
        assert_eq!(
            c.counts(),
            Some(AggregatedCounts {
                ordinary_male: 15,
                ordinary_female: 20,
                single_male: 4,
                single_female: 5,
            })
        );
        assert_eq!(c.notice(), None);
    }

    #[tokio::test]
    async fn new_year_while_ready_clears_everything() {
        let (mut c, source) = loaded(HierarchyScope::DefaultYear).await;
        ready(&mut c, &source).await;

        c.select_year("111").unwrap();
        assert_eq!(c.phase(), Phase::YearChosen);
        assert_eq!(c.selection().county(), None);
        assert_eq!(c.selection().town(), None);
        assert_eq!(c.counts(), None);
        // Year-invariant county list survives the year change.
        assert!(!c.needs_hierarchy());
        assert!(c.select_county("臺北市").is_ok());
    }

    #[tokio::test]
    async fn reselecting_county_clears_town_and_counts() {
        let (mut c, source) = loaded(HierarchyScope::DefaultYear).await;
        ready(&mut c, &source).await;

        c.select_county("臺北市").unwrap();
        assert_eq!(c.phase(), Phase::CountyChosen);
        assert_eq!(c.selection().town(), None);
        assert_eq!(c.counts(), None);
        assert_eq!(c.town_options(), &["中正區", "大安區"]);

        c.select_town("大安區").unwrap();
        assert_eq!(c.phase(), Phase::TownChosen);
    }

    #[tokio::test]
    async fn no_data_leaves_counts_unset() {
        let (mut c, source) = loaded(HierarchyScope::DefaultYear).await;
        c.select_year("110").unwrap();
        c.select_county("新北市").unwrap();
        c.select_town("板橋區").unwrap();

        assert_eq!(c.submit(&*source).await.unwrap(), SubmitOutcome::Applied);
        assert_eq!(c.phase(), Phase::Failed);
        assert_eq!(c.counts(), None);
        assert_eq!(c.notice(), Some(NO_DATA_NOTICE));

        // Picking again leaves Failed and drops the notice.
        c.select_town("板橋區").unwrap();
        assert_eq!(c.phase(), Phase::TownChosen);
        assert_eq!(c.notice(), None);
    }

    #[tokio::test]
    async fn empty_rows_are_zero_not_unset() {
        let (mut c, source) = loaded(HierarchyScope::DefaultYear).await;
        c.select_year("111").unwrap();
        c.select_county("臺北市").unwrap();
        c.select_town("大安區").unwrap();
        c.submit(&*source).await.unwrap();
        assert_eq!(c.phase(), Phase::Ready);
        assert_eq!(c.counts(), Some(AggregatedCounts::default()));
    }

    #[tokio::test]
    async fn late_response_for_old_selection_is_dropped() {
        let (mut c, source) = loaded(HierarchyScope::DefaultYear).await;
        c.select_year("110").unwrap();
        c.select_county("臺北市").unwrap();
        c.select_town("中正區").unwrap();

        let ticket = c.begin_submit().unwrap();
        assert_eq!(c.phase(), Phase::Submitting);
        c.select_town("大安區").unwrap();

        let late = source.fetch_scoped(&ticket.query).await;
        assert_eq!(c.complete_submit(ticket, late), SubmitOutcome::Stale);
        assert_eq!(c.phase(), Phase::TownChosen);
        assert_eq!(c.counts(), None);
        assert_eq!(c.selection().town(), Some("大安區"));
    }

    #[tokio::test]
    async fn same_selection_resubmitted_drops_first_ticket() {
        let (mut c, source) = loaded(HierarchyScope::DefaultYear).await;
        c.select_year("110").unwrap();
        c.select_county("臺北市").unwrap();
        c.select_town("中正區").unwrap();

        let first = c.begin_submit().unwrap();
        c.select_town("中正區").unwrap();
        let second = c.begin_submit().unwrap();

        let r1 = source.fetch_scoped(&first.query).await;
        assert_eq!(c.complete_submit(first, r1), SubmitOutcome::Stale);
        let r2 = source.fetch_scoped(&second.query).await;
        assert_eq!(c.complete_submit(second, r2), SubmitOutcome::Applied);
        assert_eq!(c.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let (mut c, _source) = loaded(HierarchyScope::DefaultYear).await;
        assert_eq!(c.select_county("臺北市"), Err(SelectionError::NoYear));
        assert_eq!(c.select_town("中正區"), Err(SelectionError::NoCounty));
        assert_eq!(c.begin_submit(), Err(SelectionError::Incomplete));
        assert_eq!(
            c.select_year("99"),
            Err(SelectionError::UnknownYear("99".into()))
        );

        c.select_year("110").unwrap();
        assert_eq!(
            c.select_county("花蓮縣"),
            Err(SelectionError::UnknownCounty("花蓮縣".into()))
        );
        c.select_county("新北市").unwrap();
        assert!(matches!(
            c.select_town("中正區"),
            Err(SelectionError::UnknownTown { .. })
        ));

        c.select_town("板橋區").unwrap();
        c.begin_submit().unwrap();
        assert_eq!(c.begin_submit(), Err(SelectionError::AlreadySubmitting));
    }

    #[tokio::test]
    async fn selected_year_scope_reloads_hierarchy() {
        let (mut c, source) = loaded(HierarchyScope::SelectedYear).await;
        assert_eq!(c.hierarchy_year(), "110");

        c.select_year("111").unwrap();
        assert!(c.needs_hierarchy());
        assert!(c.hierarchy().is_empty());
        assert_eq!(
            c.select_county("臺北市"),
            Err(SelectionError::UnknownCounty("臺北市".into()))
        );

        c.load_hierarchy(source.clone(), 2).await.unwrap();
        assert_eq!(c.hierarchy().counties().collect::<Vec<_>>(), vec!["桃園市"]);
        c.select_county("桃園市").unwrap();
    }

    #[test]
    fn pages_for_another_year_are_ignored() {
        let mut c = Coordinator::new(HierarchyScope::DefaultYear, "110");
        c.begin_hierarchy_load("110");
        assert!(c.apply_page("110", vec![site("臺北市中正區", ["1", "1", "1", "1"])]));
        assert_eq!(c.hierarchy().counties().collect::<Vec<_>>(), vec!["臺北市"]);

        assert!(!c.apply_page("109", vec![site("基隆市仁愛區", ["1", "1", "1", "1"])]));
        assert_eq!(c.records().len(), 1);

        assert!(c.apply_page("110", vec![site("臺北市大安區", ["1", "1", "1", "1"])]));
        assert_eq!(c.hierarchy().towns_of("臺北市").unwrap(), &["中正區", "大安區"]);
        assert!(c.needs_hierarchy());
        c.finish_hierarchy_load("110");
        assert!(!c.needs_hierarchy());
    }

    #[tokio::test]
    async fn missing_year_list_accepts_any_year() {
        let source = FakeSource {
            years: vec![],
            ..fake()
        };
        let mut c = Coordinator::new(HierarchyScope::DefaultYear, "110");
        c.set_years(vec!["110".into()]);

        let err = c.load_years(&source).await.unwrap_err();
        assert!(matches!(err, FetchError::MissingYears));
        assert!(c.years().is_empty());
        assert!(c.select_year("999").is_ok());
        assert_eq!(c.selection().year(), Some("999"));
    }

    #[tokio::test]
    async fn first_page_failure_leaves_no_counties() {
        let mut source = fake();
        source.failing_pages = vec![1];
        let source = Arc::new(source);
        let mut c = Coordinator::new(HierarchyScope::DefaultYear, "110");
        c.load_years(&*source).await.unwrap();

        assert!(c.load_hierarchy(source.clone(), 2).await.is_err());
        assert!(c.hierarchy().is_empty());
        assert!(c.records().is_empty());
        assert!(c.needs_hierarchy());

        c.select_year("110").unwrap();
        assert!(matches!(
            c.select_county("臺北市"),
            Err(SelectionError::UnknownCounty(ref county)) if county == "臺北市"
        ));
        assert_eq!(c.phase(), Phase::YearChosen);
    }

    #[tokio::test]
    async fn trailing_page_failure_keeps_arrived_pages() {
        let mut source = fake();
        source.failing_pages = vec![2];
        let source = Arc::new(source);
        let mut c = Coordinator::new(HierarchyScope::DefaultYear, "110");

        let err = c.load_hierarchy(source.clone(), 2).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert_eq!(c.hierarchy().counties().collect::<Vec<_>>(), vec!["臺北市"]);
        assert!(c.hierarchy().contains("臺北市", "大安區"));
        assert!(!c.hierarchy().has_county("新北市"));
        assert!(c.needs_hierarchy());

        // The partial list is still usable.
        c.select_year("110").unwrap();
        c.select_county("臺北市").unwrap();
        assert!(c.select_county("新北市").is_err());

        // A clean retry completes it.
        let retry = Arc::new(fake());
        c.load_hierarchy(retry, 2).await.unwrap();
        assert!(!c.needs_hierarchy());
        assert!(c.hierarchy().has_county("新北市"));
    }

    #[test]
    fn town_from_repeated_county_entry_is_selectable() {
        let mut c = Coordinator::new(HierarchyScope::DefaultYear, "110");
        c.begin_hierarchy_load("110");
        c.apply_page(
            "110",
            vec![
                site("臺北市中正區", ["1", "1", "1", "1"]),
                site("新北市板橋區", ["1", "1", "1", "1"]),
                site("臺北市大安區", ["1", "1", "1", "1"]),
            ],
        );
        c.finish_hierarchy_load("110");

        c.select_year("110").unwrap();
        c.select_county("臺北市").unwrap();
        assert_eq!(c.town_options(), &["中正區", "大安區"]);
        c.select_town("大安區").unwrap();
        assert_eq!(c.phase(), Phase::TownChosen);
    }
}
