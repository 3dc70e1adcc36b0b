//! Aggregate export interchange format
//!
//! ```json
//! { "2018-02-03T00:00:00Z": [[112, 7, 40], [88, 0, 12]], ... }
//! ```
//!
//! Every timestamp maps to one array per region (in declared region order), each
//! holding one value per schema key (in declared key order). `null` is a missing
//! value.

use crate::core::timeseries::TimeSeries;
use crate::types::{parse_timestamp, ScaError, ScaResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Ordered output keys agreed when the producing pipeline is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSchema {
    keys: Vec<String>,
}

impl ExportSchema {
    pub fn new<S: Into<String>>(keys: impl IntoIterator<Item = S>) -> ScaResult<Self> {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(ScaError::Schema("Export schema needs at least one key".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = keys.iter().find(|k| !seen.insert(k.as_str())) {
            return Err(ScaError::Schema(format!("Duplicate export key '{}'", dup)));
        }
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Per-region time series decoded from, or encodable to, the aggregate export format
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExport {
    schema: ExportSchema,
    regions: Vec<String>,
    series: Vec<TimeSeries>,
}

impl AggregateExport {
    /// Assemble from one series per region. Each series must carry every schema key.
    pub fn from_series(schema: ExportSchema, regions: Vec<String>, series: Vec<TimeSeries>) -> ScaResult<Self> {
        if regions.len() != series.len() {
            return Err(ScaError::Schema(format!(
                "{} regions declared but {} series given",
                regions.len(),
                series.len()
            )));
        }
        for (region, s) in regions.iter().zip(series.iter()) {
            if let Some(missing) = schema.keys().iter().find(|k| !s.columns().contains(k)) {
                return Err(ScaError::Schema(format!(
                    "Series for region '{}' lacks export key '{}'",
                    region, missing
                )));
            }
        }
        Ok(Self { schema, regions, series })
    }

    /// Decode an export document against `schema` and the declared `regions`.
    ///
    /// Array lengths must match the declared regions and keys exactly.
    pub fn parse(json: &str, schema: &ExportSchema, regions: &[String]) -> ScaResult<Self> {
        let document: Value = serde_json::from_str(json)?;
        let entries = document
            .as_object()
            .ok_or_else(|| ScaError::Schema("Aggregate export must be a JSON object".to_string()))?;

        log::info!(
            "Parsing aggregate export: {} timestamps, {} regions, keys {:?}",
            entries.len(),
            regions.len(),
            schema.keys()
        );

        let mut per_region: Vec<Vec<(DateTime<Utc>, Vec<f64>)>> = vec![Vec::with_capacity(entries.len()); regions.len()];
        let mut seen_times = BTreeSet::new();

        for (stamp, value) in entries {
            let time = parse_timestamp(stamp)
                .map_err(|e| ScaError::Schema(format!("Bad timestamp key '{}': {}", stamp, e)))?;
            if !seen_times.insert(time) {
                return Err(ScaError::Schema(format!("Timestamp {} appears more than once", time)));
            }

            let region_values = value
                .as_array()
                .ok_or_else(|| ScaError::Schema(format!("Entry '{}' is not an array of regions", stamp)))?;
            if region_values.len() != regions.len() {
                return Err(ScaError::Schema(format!(
                    "Entry '{}' has {} regions, expected {}",
                    stamp,
                    region_values.len(),
                    regions.len()
                )));
            }

            for (r, region_value) in region_values.iter().enumerate() {
                let values = region_value.as_array().ok_or_else(|| {
                    ScaError::Schema(format!("Entry '{}' region {} is not an array", stamp, r))
                })?;
                if values.len() != schema.len() {
                    return Err(ScaError::Schema(format!(
                        "Entry '{}' region {} has {} values, expected {} ({:?})",
                        stamp,
                        r,
                        values.len(),
                        schema.len(),
                        schema.keys()
                    )));
                }
                let row = values
                    .iter()
                    .map(|v| match v {
                        Value::Null => Ok(f64::NAN),
                        Value::Number(n) => n.as_f64().ok_or_else(|| {
                            ScaError::Schema(format!("Entry '{}' holds a non-finite number", stamp))
                        }),
                        other => Err(ScaError::Schema(format!(
                            "Entry '{}' holds a non-numeric value {}",
                            stamp, other
                        ))),
                    })
                    .collect::<ScaResult<Vec<f64>>>()?;
                per_region[r].push((time, row));
            }
        }

        let series = per_region
            .into_iter()
            .map(|rows| TimeSeries::new(schema.keys().to_vec(), rows))
            .collect::<ScaResult<Vec<_>>>()?;

        Ok(Self { schema: schema.clone(), regions: regions.to_vec(), series })
    }

    pub fn from_file<P: AsRef<Path>>(path: P, schema: &ExportSchema, regions: &[String]) -> ScaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, schema, regions)
    }

    pub fn schema(&self) -> &ExportSchema {
        &self.schema
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    pub fn series(&self, region: &str) -> Option<&TimeSeries> {
        self.regions.iter().position(|r| r == region).map(|i| &self.series[i])
    }

    /// Encode as the export document. Timestamps missing for a region are `null`s.
    pub fn to_json(&self) -> ScaResult<Value> {
        let mut by_time: BTreeMap<DateTime<Utc>, Vec<Value>> = BTreeMap::new();
        let all_times: BTreeSet<DateTime<Utc>> =
            self.series.iter().flat_map(|s| s.times().iter().copied()).collect();

        for time in all_times {
            let mut regions = Vec::with_capacity(self.series.len());
            for s in &self.series {
                let mut values = Vec::with_capacity(self.schema.len());
                for key in self.schema.keys() {
                    let v = s.value_at(time, key)?;
                    values.push(match v {
                        Some(v) if v.is_finite() => serde_json::json!(v),
                        _ => Value::Null,
                    });
                }
                regions.push(Value::Array(values));
            }
            by_time.insert(time, regions);
        }

        let mut document = Map::new();
        for (time, regions) in by_time {
            document.insert(time.to_rfc3339_opts(SecondsFormat::Secs, true), Value::Array(regions));
        }
        Ok(Value::Object(document))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ScaResult<()> {
        let json = serde_json::to_string_pretty(&self.to_json()?)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ExportSchema {
        ExportSchema::new(["n_catchment", "n_cloud", "n_snow"]).unwrap()
    }

    #[test]
    fn test_parse_single_region() {
        let json = r#"{
            "2018-02-08T00:00:00Z": [[100, 80, 5]],
            "2018-02-03": [[100, 10, 40]],
            "2018-02-05T00:00:00": [[100, null, 20]]
        }"#;
        let export = AggregateExport::parse(json, &schema(), &["catchment".to_string()]).unwrap();
        let series = export.series("catchment").unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(series.column("n_snow").unwrap(), vec![40.0, 20.0, 5.0]);
        assert!(series.column("n_cloud").unwrap()[1].is_nan());
    }

    #[test]
    fn test_value_count_mismatch() {
        let json = r#"{ "2018-02-03": [[100, 10]] }"#;
        let result = AggregateExport::parse(json, &schema(), &["catchment".to_string()]);
        assert!(matches!(result, Err(ScaError::Schema(_))));
    }

    #[test]
    fn test_region_count_mismatch() {
        let json = r#"{ "2018-02-03": [[100, 10, 40]] }"#;
        let regions = vec!["a".to_string(), "b".to_string()];
        assert!(matches!(AggregateExport::parse(json, &schema(), &regions), Err(ScaError::Schema(_))));
    }

    #[test]
    fn test_duplicate_after_normalisation() {
        let json = r#"{ "2018-02-03": [[1, 1, 1]], "2018-02-03T00:00:00Z": [[2, 2, 2]] }"#;
        let result = AggregateExport::parse(json, &schema(), &["catchment".to_string()]);
        assert!(matches!(result, Err(ScaError::Schema(_))));
    }

    #[test]
    fn test_non_numeric_rejected() {
        let json = r#"{ "2018-02-03": [[100, "ten", 40]] }"#;
        assert!(AggregateExport::parse(json, &schema(), &["catchment".to_string()]).is_err());
    }

    #[test]
    fn test_encode_then_decode() {
        let json = r#"{ "2018-02-03": [[100, 10, 40]], "2018-02-05": [[100, null, 20]] }"#;
        let regions = vec!["catchment".to_string()];
        let export = AggregateExport::parse(json, &schema(), &regions).unwrap();

        let encoded = export.to_json().unwrap().to_string();
        let decoded = AggregateExport::parse(&encoded, &schema(), &regions).unwrap();
        let a = export.series("catchment").unwrap();
        let b = decoded.series("catchment").unwrap();
        assert_eq!(a.times(), b.times());
        assert_eq!(a.column("n_snow").unwrap(), b.column("n_snow").unwrap());
    }
}
