use crate::types::{Comparison, ScaError, ScaResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;

/// Ordered rows `(time, values)` over named columns.
///
/// Times are unique and sorted ascending. Missing values are NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    columns: Vec<String>,
    times: Vec<DateTime<Utc>>,
    rows: Vec<Vec<f64>>,
}

impl TimeSeries {
    /// Build a series from unordered rows; rows are sorted by time
    pub fn new(columns: Vec<String>, mut rows: Vec<(DateTime<Utc>, Vec<f64>)>) -> ScaResult<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(ScaError::Schema(format!("Duplicate column '{}'", column)));
            }
        }
        for (time, values) in &rows {
            if values.len() != columns.len() {
                return Err(ScaError::Schema(format!(
                    "Row at {} has {} values, expected {}",
                    time,
                    values.len(),
                    columns.len()
                )));
            }
        }

        rows.sort_by_key(|(time, _)| *time);
        if let Some(pair) = rows.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(ScaError::Schema(format!("Duplicate timestamp {}", pair[0].0)));
        }

        let (times, rows) = rows.into_iter().unzip();
        Ok(Self { columns, times, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<(DateTime<Utc>, &[f64])> {
        Some((*self.times.get(index)?, self.rows.get(index)?.as_slice()))
    }

    fn column_index(&self, name: &str) -> ScaResult<usize> {
        self.columns.iter().position(|c| c == name).ok_or_else(|| {
            ScaError::Processing(format!("Column '{}' not found (available: {:?})", name, self.columns))
        })
    }

    pub fn column(&self, name: &str) -> ScaResult<Vec<f64>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[idx]).collect())
    }

    /// Value of `column` at `time`, if that timestep exists
    pub fn value_at(&self, time: DateTime<Utc>, column: &str) -> ScaResult<Option<f64>> {
        let idx = self.column_index(column)?;
        Ok(self.times.binary_search(&time).ok().map(|row| self.rows[row][idx]))
    }

    /// Append `name = numerator / denominator * 100`; NaN where the denominator is 0 or NaN
    pub fn with_percentage(&self, numerator: &str, denominator: &str, name: &str) -> ScaResult<Self> {
        if self.columns.iter().any(|c| c == name) {
            return Err(ScaError::Schema(format!("Column '{}' already exists", name)));
        }
        let num = self.column_index(numerator)?;
        let den = self.column_index(denominator)?;

        let mut columns = self.columns.clone();
        columns.push(name.to_string());
        let rows = self
            .rows
            .iter()
            .map(|r| {
                let pct = if r[den] == 0.0 || r[den].is_nan() {
                    f64::NAN
                } else {
                    r[num] / r[den] * 100.0
                };
                let mut row = r.clone();
                row.push(pct);
                row
            })
            .collect();

        Ok(Self { columns, times: self.times.clone(), rows })
    }

    /// Keep whole timesteps whose `column` value satisfies `comparison` against
    /// `threshold`. NaN values never satisfy it.
    pub fn filter(&self, column: &str, comparison: Comparison, threshold: f64) -> ScaResult<Self> {
        let idx = self.column_index(column)?;
        let (times, rows): (Vec<_>, Vec<_>) = self
            .times
            .iter()
            .zip(self.rows.iter())
            .filter(|(_, r)| comparison.evaluate(r[idx], threshold))
            .map(|(t, r)| (*t, r.clone()))
            .unzip();

        let dropped = self.len() - times.len();
        if dropped > 0 {
            log::warn!(
                "Dropped {} of {} timesteps failing {} {} {}",
                dropped,
                self.len(),
                column,
                comparison,
                threshold
            );
        }

        Ok(Self { columns: self.columns.clone(), times, rows })
    }

    /// Write as CSV: a `time` column (RFC 3339) then one column per metric.
    /// NaN is written as an empty field.
    pub fn write_csv<W: Write>(&self, writer: W) -> ScaResult<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        let mut header = vec!["time".to_string()];
        header.extend(self.columns.iter().cloned());
        csv_writer.write_record(&header)?;

        for (time, row) in self.times.iter().zip(self.rows.iter()) {
            let mut record = vec![time.to_rfc3339_opts(SecondsFormat::Secs, true)];
            record.extend(row.iter().map(|v| if v.is_nan() { String::new() } else { v.to_string() }));
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 2, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn counts() -> TimeSeries {
        TimeSeries::new(
            vec!["n_total".into(), "n_cloud".into()],
            vec![(t(2), vec![100.0, 50.0]), (t(0), vec![100.0, 10.0]), (t(1), vec![0.0, 0.0])],
        )
        .unwrap()
    }

    #[test]
    fn test_rows_sorted_by_time() {
        let series = counts();
        assert_eq!(series.times(), &[t(0), t(1), t(2)]);
        assert_eq!(series.column("n_cloud").unwrap(), vec![10.0, 0.0, 50.0]);
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let result = TimeSeries::new(vec!["a".into()], vec![(t(0), vec![1.0]), (t(0), vec![2.0])]);
        assert!(matches!(result, Err(ScaError::Schema(_))));
    }

    #[test]
    fn test_percentage_with_zero_denominator() {
        let series = counts().with_percentage("n_cloud", "n_total", "perc_cloud").unwrap();
        let pct = series.column("perc_cloud").unwrap();
        assert_eq!(pct[0], 10.0);
        assert!(pct[1].is_nan());
        assert_eq!(pct[2], 50.0);
    }

    #[test]
    fn test_filter_drops_nan() {
        let series = counts().with_percentage("n_cloud", "n_total", "perc_cloud").unwrap();
        let filtered = series.filter("perc_cloud", Comparison::Lt, 25.0).unwrap();
        assert_eq!(filtered.times(), &[t(0)]);
        assert_eq!(filtered.value_at(t(0), "n_cloud").unwrap(), Some(10.0));
        assert_eq!(filtered.value_at(t(2), "n_cloud").unwrap(), None);
    }

    #[test]
    fn test_write_csv_empty_for_nan() {
        let series = counts().with_percentage("n_cloud", "n_total", "perc_cloud").unwrap();
        let mut buffer = Vec::new();
        series.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,n_total,n_cloud,perc_cloud");
        assert_eq!(lines[1], "2018-02-01T00:00:00Z,100,10,10");
        assert_eq!(lines[2], "2018-02-02T00:00:00Z,0,0,");
    }
}
