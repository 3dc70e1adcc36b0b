use crate::core::geometry::Region;
use crate::core::timeseries::TimeSeries;
use crate::io::aggregate_json::{AggregateExport, ExportSchema};
use crate::types::{class, ClassRaster, ScaError, ScaResult};
use chrono::{DateTime, Utc};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Spatial reducer applied to the valid cells of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reducer {
    /// Per-class cell counts
    Count,
    /// Sum of class codes
    Sum,
    /// Median class code (average of the middle pair for even counts)
    Median,
    /// Mean class code
    Mean,
}

/// Per-region statistic of one timestep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statistic {
    Counts(BTreeMap<u8, u64>),
    Value(f64),
}

impl Statistic {
    /// Number of valid cells behind a count statistic
    pub fn total(&self) -> Option<u64> {
        match self {
            Statistic::Counts(counts) => Some(counts.values().sum()),
            Statistic::Value(_) => None,
        }
    }

    pub fn count(&self, code: u8) -> Option<u64> {
        match self {
            Statistic::Counts(counts) => Some(counts.get(&code).copied().unwrap_or(0)),
            Statistic::Value(_) => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Statistic::Value(v) => Some(*v),
            Statistic::Counts(_) => None,
        }
    }
}

/// One `(time, region) -> statistic` entry. `None` means the region had no valid cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub time: DateTime<Utc>,
    pub region: String,
    pub statistic: Option<Statistic>,
}

/// Column naming for count statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountLegend {
    /// Name of the valid-cell total, written as `n_<total>`
    pub total: String,
    /// `(code, name)` pairs, written as `n_<name>` in this order
    pub classes: Vec<(u8, String)>,
}

impl CountLegend {
    pub fn column_names(&self) -> Vec<String> {
        std::iter::once(format!("n_{}", self.total))
            .chain(self.classes.iter().map(|(_, name)| format!("n_{}", name)))
            .collect()
    }

    pub fn export_schema(&self) -> ScaResult<ExportSchema> {
        ExportSchema::new(self.column_names())
    }
}

impl Default for CountLegend {
    fn default() -> Self {
        Self {
            total: "catchment".to_string(),
            classes: vec![(class::CLOUD, "cloud".to_string()), (class::SNOW, "snow".to_string())],
        }
    }
}

/// Median of `values`, averaging the middle pair for even lengths. NaNs are ignored.
pub fn median<T: Float>(values: &mut Vec<T>) -> Option<T> {
    values.retain(|v| !v.is_nan());
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        let two = T::one() + T::one();
        Some((values[n / 2 - 1] + values[n / 2]) / two)
    }
}

/// Reduces class rasters over region geometries
#[derive(Debug, Clone)]
pub struct SpatialAggregator {
    reducer: Reducer,
    /// Classes always reported by the count reducer, even with zero cells
    classes: Vec<u8>,
}

impl SpatialAggregator {
    pub fn new(reducer: Reducer) -> Self {
        Self {
            reducer,
            classes: vec![class::NO_SNOW, class::SNOW, class::CLOUD],
        }
    }

    pub fn with_classes(mut self, classes: Vec<u8>) -> Self {
        self.classes = classes;
        self
    }

    pub fn reducer(&self) -> Reducer {
        self.reducer
    }

    fn reduce(&self, codes: &[u8]) -> Option<Statistic> {
        if codes.is_empty() {
            return None;
        }
        Some(match self.reducer {
            Reducer::Count => {
                let mut counts: BTreeMap<u8, u64> = self.classes.iter().map(|&c| (c, 0)).collect();
                for &code in codes {
                    *counts.entry(code).or_insert(0) += 1;
                }
                Statistic::Counts(counts)
            }
            Reducer::Sum => Statistic::Value(codes.iter().map(|&c| c as f64).sum()),
            Reducer::Mean => Statistic::Value(codes.iter().map(|&c| c as f64).sum::<f64>() / codes.len() as f64),
            Reducer::Median => {
                let mut values: Vec<f64> = codes.iter().map(|&c| c as f64).collect();
                Statistic::Value(median(&mut values)?)
            }
        })
    }

    /// Evaluate every region at every timestep.
    ///
    /// Regions are rasterized once; only alphabet classes count as valid, so
    /// no-data and outside cells never contribute.
    pub fn aggregate(&self, raster: &ClassRaster, regions: &[Region]) -> ScaResult<AggregateTable> {
        let (nt, ny, nx) = raster.dim();
        log::info!(
            "Aggregating {}x{}x{} class raster over {} region(s) with {:?}",
            nt,
            ny,
            nx,
            regions.len(),
            self.reducer
        );

        let footprints = regions
            .iter()
            .map(|r| r.cells_on(raster.y(), raster.x(), raster.crs()))
            .collect::<ScaResult<Vec<_>>>()?;
        for (region, cells) in regions.iter().zip(footprints.iter()) {
            log::debug!("Region '{}' covers {} cells", region.id, cells.len());
            if cells.is_empty() {
                log::warn!("Region '{}' does not intersect the raster grid", region.id);
            }
        }

        let data = raster.data();
        let evaluate = |t: usize| -> Vec<Option<Statistic>> {
            footprints
                .iter()
                .map(|cells| {
                    let codes: Vec<u8> = cells
                        .iter()
                        .map(|&(row, col)| data[[t, row, col]])
                        .filter(|&c| class::is_valid(c))
                        .collect();
                    self.reduce(&codes)
                })
                .collect()
        };

        #[cfg(feature = "parallel")]
        let values: Vec<Vec<Option<Statistic>>> = (0..nt).into_par_iter().map(evaluate).collect();
        #[cfg(not(feature = "parallel"))]
        let values: Vec<Vec<Option<Statistic>>> = (0..nt).map(evaluate).collect();

        let empty = values.iter().flatten().filter(|s| s.is_none()).count();
        if empty > 0 {
            log::debug!("{} (time, region) pairs had no valid cells", empty);
        }

        Ok(AggregateTable {
            reducer: self.reducer,
            times: raster.times().to_vec(),
            regions: regions.iter().map(|r| r.id.clone()).collect(),
            values,
        })
    }
}

/// Result of a spatial aggregation, indexed by timestep then region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTable {
    reducer: Reducer,
    times: Vec<DateTime<Utc>>,
    regions: Vec<String>,
    values: Vec<Vec<Option<Statistic>>>,
}

impl AggregateTable {
    pub fn reducer(&self) -> Reducer {
        self.reducer
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    fn region_index(&self, region: &str) -> ScaResult<usize> {
        self.regions
            .iter()
            .position(|r| r == region)
            .ok_or_else(|| ScaError::Processing(format!("Unknown region '{}'", region)))
    }

    pub fn get(&self, time_index: usize, region: &str) -> ScaResult<Option<&Statistic>> {
        let r = self.region_index(region)?;
        let row = self
            .values
            .get(time_index)
            .ok_or_else(|| ScaError::Processing(format!("Time index {} out of range", time_index)))?;
        Ok(row[r].as_ref())
    }

    pub fn records(&self) -> Vec<AggregateRecord> {
        self.times
            .iter()
            .zip(self.values.iter())
            .flat_map(|(time, row)| {
                self.regions.iter().zip(row.iter()).map(move |(region, statistic)| AggregateRecord {
                    time: *time,
                    region: region.clone(),
                    statistic: statistic.clone(),
                })
            })
            .collect()
    }

    /// Count statistics of one region as a time series with `legend` columns.
    /// Timesteps without valid cells have NaN values.
    pub fn count_series(&self, region: &str, legend: &CountLegend) -> ScaResult<TimeSeries> {
        if self.reducer != Reducer::Count {
            return Err(ScaError::Processing(format!(
                "Count series requested from a {:?} aggregation",
                self.reducer
            )));
        }
        let r = self.region_index(region)?;
        let rows = self
            .times
            .iter()
            .zip(self.values.iter())
            .map(|(time, row)| {
                let values = match &row[r] {
                    Some(stat) => std::iter::once(stat.total())
                        .chain(legend.classes.iter().map(|(code, _)| stat.count(*code)))
                        .map(|v| v.map(|n| n as f64).unwrap_or(f64::NAN))
                        .collect(),
                    None => vec![f64::NAN; legend.classes.len() + 1],
                };
                (*time, values)
            })
            .collect();
        TimeSeries::new(legend.column_names(), rows)
    }

    /// Representative values of one region as a single-column series named `column`
    pub fn value_series(&self, region: &str, column: &str) -> ScaResult<TimeSeries> {
        if self.reducer == Reducer::Count {
            return Err(ScaError::Processing("Value series requested from a count aggregation".to_string()));
        }
        let r = self.region_index(region)?;
        let rows = self
            .times
            .iter()
            .zip(self.values.iter())
            .map(|(time, row)| {
                let v = row[r].as_ref().and_then(Statistic::value).unwrap_or(f64::NAN);
                (*time, vec![v])
            })
            .collect();
        TimeSeries::new(vec![column.to_string()], rows)
    }

    /// Count statistics of every region in the aggregate export format
    pub fn to_export(&self, legend: &CountLegend) -> ScaResult<AggregateExport> {
        let series = self
            .regions
            .iter()
            .map(|region| self.count_series(region, legend))
            .collect::<ScaResult<Vec<_>>>()?;
        AggregateExport::from_series(legend.export_schema()?, self.regions.clone(), series)
    }
}
