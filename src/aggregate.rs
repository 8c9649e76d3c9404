use std::ops::{Add, AddAssign};

use serde::Serialize;

use crate::record::{HouseholdField, SiteRecord};

/// The four household totals the charts are drawn from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedCounts {
    pub ordinary_male: u64,
    pub ordinary_female: u64,
    pub single_male: u64,
    pub single_female: u64,
}

impl AggregatedCounts {
    pub fn ordinary_total(&self) -> u64 {
        self.ordinary_male + self.ordinary_female
    }

    pub fn single_total(&self) -> u64 {
        self.single_male + self.single_female
    }

    pub fn total(&self) -> u64 {
        self.ordinary_total() + self.single_total()
    }

    /// Column chart series for men: [ordinary, single].
    pub fn male_series(&self) -> [u64; 2] {
        [self.ordinary_male, self.single_male]
    }

    /// Column chart series for women: [ordinary, single].
    pub fn female_series(&self) -> [u64; 2] {
        [self.ordinary_female, self.single_female]
    }

    /// Pie chart slices as percentages (ordinary, single). None when there
    /// are no households at all.
    pub fn living_shares(&self) -> Option<(f64, f64)> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let ordinary = self.ordinary_total() as f64 * 100.0 / total as f64;
        Some((ordinary, 100.0 - ordinary))
    }
}

impl Add for AggregatedCounts {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for AggregatedCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.ordinary_male += rhs.ordinary_male;
        self.ordinary_female += rhs.ordinary_female;
        self.single_male += rhs.single_male;
        self.single_female += rhs.single_female;
    }
}

impl From<&SiteRecord> for AggregatedCounts {
    fn from(r: &SiteRecord) -> Self {
        Self {
            ordinary_male: r.count(HouseholdField::OrdinaryMale),
            ordinary_female: r.count(HouseholdField::OrdinaryFemale),
            single_male: r.count(HouseholdField::SingleMale),
            single_female: r.count(HouseholdField::SingleFemale),
        }
    }
}

/// Sum household counts over rows already scoped to one county and town.
pub fn aggregate(records: &[SiteRecord]) -> AggregatedCounts {
    records
        .iter()
        .map(AggregatedCounts::from)
        .fold(AggregatedCounts::default(), |acc, c| acc + c)
}
