use serde::Deserialize;
use serde_json::Value;

/// One row of the household dataset: a single town in a single year.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SiteRecord {
    /// County name immediately followed by town name, e.g. "臺北市中正區".
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub household_ordinary_m: Option<Value>,
    #[serde(default)]
    pub household_ordinary_f: Option<Value>,
    #[serde(default)]
    pub household_single_m: Option<Value>,
    #[serde(default)]
    pub household_single_f: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HouseholdField {
    OrdinaryMale,
    OrdinaryFemale,
    SingleMale,
    SingleFemale,
}

impl SiteRecord {
    fn raw(&self, field: HouseholdField) -> Option<&Value> {
        match field {
            HouseholdField::OrdinaryMale => self.household_ordinary_m.as_ref(),
            HouseholdField::OrdinaryFemale => self.household_ordinary_f.as_ref(),
            HouseholdField::SingleMale => self.household_single_m.as_ref(),
            HouseholdField::SingleFemale => self.household_single_f.as_ref(),
        }
    }

    /// Household count for `field`, with absent or malformed values read as 0.
    pub fn count(&self, field: HouseholdField) -> u64 {
        self.raw(field).map(coerce_count).unwrap_or(0)
    }
}

/// Lenient numeric coercion for count cells. Anything that is not a
/// non-negative whole number becomes 0.
pub fn coerce_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().and_then(whole_non_negative))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return 0;
            }
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole_non_negative))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

fn whole_non_negative(f: f64) -> Option<u64> {
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}
