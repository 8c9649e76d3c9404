use std::collections::HashSet;

use serde::Serialize;

pub const DEFAULT_UNIT_MARKERS: &[&str] = &["縣", "市"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountyEntry {
    pub county: String,
    pub towns: Vec<String>,
}

/// County → towns, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Hierarchy(pub Vec<CountyEntry>);

impl Hierarchy {
    pub fn entries(&self) -> &[CountyEntry] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn counties(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.county.as_str())
    }

    pub fn has_county(&self, county: &str) -> bool {
        self.0.iter().any(|e| e.county == county)
    }

    /// Towns of `county`, merged across every entry that carries the name.
    ///
    /// Unclustered input can split one county into several entries; the
    /// merged list keeps first-seen order and lists each town once.
    pub fn towns_of(&self, county: &str) -> Option<Vec<&str>> {
        let mut entries = self.0.iter().filter(|e| e.county == county).peekable();
        entries.peek()?;
        let mut seen = HashSet::new();
        Some(
            entries
                .flat_map(|e| e.towns.iter().map(String::as_str))
                .filter(|t| seen.insert(*t))
                .collect(),
        )
    }

    /// True when `town` is one of [`Hierarchy::towns_of`] for `county`.
    pub fn contains(&self, county: &str, town: &str) -> bool {
        self.towns_of(county)
            .is_some_and(|towns| towns.contains(&town))
    }
}

/// Splits a site identifier into (county, town).
pub trait CountySplitter {
    fn split<'a>(&self, site_id: &'a str) -> Option<(&'a str, &'a str)>;
}

/// Cuts after the first occurrence of the first marker that appears at all.
/// Marker order is priority order, not position order.
#[derive(Debug, Clone)]
pub struct MarkerSplitter {
    markers: Vec<String>,
}

impl MarkerSplitter {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for MarkerSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_UNIT_MARKERS.iter().copied())
    }
}

impl CountySplitter for MarkerSplitter {
    fn split<'a>(&self, site_id: &'a str) -> Option<(&'a str, &'a str)> {
        self.markers
            .iter()
            .filter(|m| !m.is_empty())
            .find_map(|m| site_id.find(m.as_str()).map(|idx| site_id.split_at(idx + m.len())))
    }
}

/// Group site identifiers into a county → towns hierarchy.
///
/// Counties are coalesced only when consecutive, so an input that is not
/// clustered by county yields repeated county entries. Identifiers the
/// splitter rejects are skipped.
pub fn extract_hierarchy<'a, I>(site_ids: I, splitter: &dyn CountySplitter) -> Hierarchy
where
    I: IntoIterator<Item = &'a str>,
{
    let mut entries: Vec<CountyEntry> = Vec::new();
    let mut seen_towns: HashSet<&'a str> = HashSet::new();

    for site_id in site_ids {
        let Some((county, town)) = splitter.split(site_id) else {
            continue;
        };

        let same_county = entries.last().is_some_and(|e| e.county == county);
        if !same_county {
            entries.push(CountyEntry {
                county: county.to_string(),
                towns: Vec::new(),
            });
            seen_towns.clear();
        }

        if seen_towns.insert(town) {
            if let Some(entry) = entries.last_mut() {
                entry.towns.push(town.to_string());
            }
        }
    }

    Hierarchy(entries)
}

pub fn extract_with_markers<'a, I, S>(site_ids: I, markers: &[S]) -> Hierarchy
where
    I: IntoIterator<Item = &'a str>,
    S: AsRef<str>,
{
    let splitter = MarkerSplitter::new(markers.iter().map(|m| m.as_ref().to_string()));
    extract_hierarchy(site_ids, &splitter)
}
