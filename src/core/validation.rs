//! Comparison of derived snow labels against in-situ ground truth

use crate::types::{class, CoordinateSystem, ScaError, ScaResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Binary snow presence observations of one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub station: String,
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: Option<f64>,
    #[serde(default)]
    pub crs: CoordinateSystem,
    /// `date -> 1 (snow) / 0 (no snow)`; `None` is a missing reading
    pub observations: BTreeMap<NaiveDate, Option<u8>>,
}

impl GroundTruth {
    pub fn valid_count(&self) -> usize {
        self.observations.values().filter(|o| o.is_some()).count()
    }
}

/// Label of a representative median from the snow map: nearest class with ties
/// going up (0.5 is snow). Cloud (>= 1.5), negative values and NaN are missing.
pub fn derived_label(value: f64) -> Option<u8> {
    if value.is_nan() || value < 0.0 || value >= 1.5 {
        return None;
    }
    if value >= 0.5 {
        Some(class::SNOW)
    } else {
        Some(class::NO_SNOW)
    }
}

/// Ground-truth label given as a number: exactly 0 or 1, anything else is missing
pub fn truth_label(value: f64) -> Option<u8> {
    if value == 0.0 {
        Some(class::NO_SNOW)
    } else if value == 1.0 {
        Some(class::SNOW)
    } else {
        None
    }
}

/// Confusion matrix of aligned numeric truth labels and derived medians, with the
/// number of pairs skipped because either side is missing
pub fn confusion_from_values(truth: &[Option<f64>], derived: &[Option<f64>]) -> (ConfusionMatrix, usize) {
    let mut matrix = ConfusionMatrix::default();
    let mut missing = 0;
    for (t, d) in truth.iter().zip(derived) {
        match (t.and_then(truth_label), d.and_then(derived_label)) {
            (Some(t), Some(d)) => matrix.add(t, d),
            _ => missing += 1,
        }
    }
    (matrix, missing)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_snow: u64,
    pub false_snow: u64,
    pub true_no_snow: u64,
    pub false_no_snow: u64,
}

impl ConfusionMatrix {
    pub fn add(&mut self, truth: u8, derived: u8) {
        match (truth == class::SNOW, derived == class::SNOW) {
            (true, true) => self.true_snow += 1,
            (false, true) => self.false_snow += 1,
            (false, false) => self.true_no_snow += 1,
            (true, false) => self.false_no_snow += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_snow + self.false_snow + self.true_no_snow + self.false_no_snow
    }

    /// Fraction of correct labels; `None` when nothing was compared
    pub fn accuracy(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            None
        } else {
            Some((self.true_snow + self.true_no_snow) as f64 / total as f64)
        }
    }

    /// `[[tn, fp], [fn, tp]]`, rows are the true label
    pub fn as_array(&self) -> [[u64; 2]; 2] {
        [
            [self.true_no_snow, self.false_snow],
            [self.false_no_snow, self.true_snow],
        ]
    }

    pub fn merge(&self, other: &ConfusionMatrix) -> ConfusionMatrix {
        ConfusionMatrix {
            true_snow: self.true_snow + other.true_snow,
            false_snow: self.false_snow + other.false_snow,
            true_no_snow: self.true_no_snow + other.true_no_snow,
            false_no_snow: self.false_no_snow + other.false_no_snow,
        }
    }
}

/// Per-station comparison result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationValidation {
    pub station: String,
    pub confusion: ConfusionMatrix,
    /// `None` when no date had both labels
    pub accuracy: Option<f64>,
    /// Dates present on both sides
    pub common_dates: usize,
    /// Common dates skipped because either label was missing
    pub missing_pairs: usize,
}

impl std::fmt::Display for StationValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.accuracy {
            Some(acc) => write!(
                f,
                "{}: accuracy {:.3} over {} compared dates ({} missing)",
                self.station,
                acc,
                self.confusion.total(),
                self.missing_pairs
            ),
            None => write!(f, "{}: accuracy undefined ({} common dates, none comparable)", self.station, self.common_dates),
        }
    }
}

/// Inner join of ground truth and derived labels on date
pub fn compare(truth: &GroundTruth, derived: &BTreeMap<NaiveDate, Option<u8>>) -> StationValidation {
    let mut confusion = ConfusionMatrix::default();
    let mut common_dates = 0;
    let mut missing_pairs = 0;

    for (date, observed) in &truth.observations {
        let Some(predicted) = derived.get(date) else {
            continue;
        };
        common_dates += 1;
        match (observed, predicted) {
            (Some(o), Some(p)) => confusion.add(*o, *p),
            _ => missing_pairs += 1,
        }
    }

    let accuracy = confusion.accuracy();
    if accuracy.is_none() {
        log::warn!(
            "Station '{}' has no comparable dates ({} common, {} missing); accuracy undefined",
            truth.station,
            common_dates,
            missing_pairs
        );
    } else {
        log::debug!("Station '{}': {:?}", truth.station, confusion);
    }

    StationValidation {
        station: truth.station.clone(),
        confusion,
        accuracy,
        common_dates,
        missing_pairs,
    }
}

/// Validate every station with derived labels; stations without derived labels
/// are compared against an empty series and end up undefined.
///
/// Derived labels are keyed by station name, so names must be unique.
pub fn validate_stations(
    truths: &[GroundTruth],
    derived: &BTreeMap<String, BTreeMap<NaiveDate, Option<u8>>>,
) -> ScaResult<Vec<StationValidation>> {
    log::info!("Validating {} station(s)", truths.len());
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = truths.iter().find(|t| !seen.insert(t.station.as_str())) {
        return Err(ScaError::Processing(format!("Station '{}' appears more than once", dup.station)));
    }
    let empty = BTreeMap::new();
    let results: Vec<StationValidation> = truths
        .iter()
        .map(|t| compare(t, derived.get(&t.station).unwrap_or(&empty)))
        .collect();

    let overall = results.iter().fold(ConfusionMatrix::default(), |acc, r| acc.merge(&r.confusion));
    match overall.accuracy() {
        Some(acc) => log::info!("Overall accuracy {:.3} over {} comparisons", acc, overall.total()),
        None => log::warn!("No station produced a comparable date"),
    }
    Ok(results)
}
