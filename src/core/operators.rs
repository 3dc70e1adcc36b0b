use crate::core::aggregate::median;
use crate::core::timeseries::TimeSeries;
use crate::types::{BoundingBox, CubeValue, DataCube, ScaError, ScaResult, TemporalExtent};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use ndarray::{Array4, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Reducer over a set of cell values; NaNs are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Mean,
    Median,
    Min,
    Max,
}

impl ReduceOp {
    /// NaN when every value is NaN
    pub fn reduce(&self, values: &mut Vec<CubeValue>) -> CubeValue {
        values.retain(|v| !v.is_nan());
        if values.is_empty() {
            return CubeValue::NAN;
        }
        match self {
            ReduceOp::Mean => values.iter().sum::<CubeValue>() / values.len() as CubeValue,
            ReduceOp::Median => median(values).unwrap_or(CubeValue::NAN),
            ReduceOp::Min => values.iter().copied().fold(CubeValue::INFINITY, CubeValue::min),
            ReduceOp::Max => values.iter().copied().fold(CubeValue::NEG_INFINITY, CubeValue::max),
        }
    }
}

/// Calendar period for temporal aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Month,
    Year,
}

impl Period {
    /// Start of the period containing `t`
    pub fn start_of(&self, t: DateTime<Utc>) -> ScaResult<DateTime<Utc>> {
        let (year, month, day) = match self {
            Period::Day => (t.year(), t.month(), t.day()),
            Period::Month => (t.year(), t.month(), 1),
            Period::Year => (t.year(), 1, 1),
        };
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
            .single()
            .ok_or_else(|| ScaError::Processing(format!("Cannot derive {:?} start of {}", self, t)))
    }
}

fn rebuild(
    cube: &DataCube,
    data: Array4<CubeValue>,
    times: Vec<DateTime<Utc>>,
    bands: Vec<String>,
    y: Vec<f64>,
    x: Vec<f64>,
) -> ScaResult<DataCube> {
    if data.is_empty() {
        return Err(ScaError::Processing(format!("Operation produced an empty cube {:?}", data.dim())));
    }
    DataCube::new(data, times, bands, y, x, cube.crs())
}

/// Keep timesteps inside `[start, end)`
pub fn filter_temporal(cube: &DataCube, extent: &TemporalExtent) -> ScaResult<DataCube> {
    let keep: Vec<usize> = (0..cube.times().len()).filter(|&i| extent.contains(cube.times()[i])).collect();
    log::info!(
        "Temporal filter {} .. {}: keeping {} of {} timesteps",
        extent.start,
        extent.end,
        keep.len(),
        cube.times().len()
    );
    let data = cube.data().select(Axis(0), &keep);
    let times = keep.iter().map(|&i| cube.times()[i]).collect();
    rebuild(cube, data, times, cube.bands().to_vec(), cube.y().to_vec(), cube.x().to_vec())
}

/// Keep cells whose centre lies in `bbox`
pub fn filter_bbox(cube: &DataCube, bbox: &BoundingBox) -> ScaResult<DataCube> {
    let rows: Vec<usize> = (0..cube.y().len()).filter(|&i| cube.y()[i] >= bbox.south && cube.y()[i] <= bbox.north).collect();
    let cols: Vec<usize> = (0..cube.x().len()).filter(|&i| cube.x()[i] >= bbox.west && cube.x()[i] <= bbox.east).collect();
    log::info!("Spatial filter {:?}: {} rows x {} cols", bbox, rows.len(), cols.len());

    let data = cube.data().select(Axis(2), &rows).select(Axis(3), &cols);
    let y = rows.iter().map(|&i| cube.y()[i]).collect();
    let x = cols.iter().map(|&i| cube.x()[i]).collect();
    rebuild(cube, data, cube.times().to_vec(), cube.bands().to_vec(), y, x)
}

/// Keep `bands` in the requested order
pub fn filter_bands(cube: &DataCube, bands: &[&str]) -> ScaResult<DataCube> {
    let indices = bands.iter().map(|b| cube.band_index(b)).collect::<ScaResult<Vec<_>>>()?;
    log::debug!("Band filter {:?}", bands);
    let data = cube.data().select(Axis(1), &indices);
    let labels = bands.iter().map(|b| b.to_string()).collect();
    rebuild(cube, data, cube.times().to_vec(), labels, cube.y().to_vec(), cube.x().to_vec())
}

/// Pixel-wise unary transform
pub fn apply<F>(cube: &DataCube, f: F) -> ScaResult<DataCube>
where
    F: Fn(CubeValue) -> CubeValue + Sync + Send,
{
    #[cfg(feature = "parallel")]
    let data = Zip::from(cube.data()).par_map_collect(|&v| f(v));
    #[cfg(not(feature = "parallel"))]
    let data = Zip::from(cube.data()).map_collect(|&v| f(v));

    rebuild(cube, data, cube.times().to_vec(), cube.bands().to_vec(), cube.y().to_vec(), cube.x().to_vec())
}

/// Clamp values to `[min, max]`; NaN stays NaN
pub fn clip(cube: &DataCube, min: CubeValue, max: CubeValue) -> ScaResult<DataCube> {
    if min > max {
        return Err(ScaError::Processing(format!("Clip bounds inverted: {} > {}", min, max)));
    }
    apply(cube, move |v| if v.is_nan() { v } else { v.clamp(min, max) })
}

/// Map `[input_min, input_max]` linearly onto `[output_min, output_max]`
pub fn linear_scale_range(
    cube: &DataCube,
    input_min: CubeValue,
    input_max: CubeValue,
    output_min: CubeValue,
    output_max: CubeValue,
) -> ScaResult<DataCube> {
    let span = input_max - input_min;
    if span == 0.0 || !span.is_finite() {
        return Err(ScaError::Processing(format!(
            "Degenerate input range [{}, {}]",
            input_min, input_max
        )));
    }
    let scale = (output_max - output_min) / span;
    apply(cube, move |v| (v - input_min) * scale + output_min)
}

/// Reduce each group of timesteps to one layer; `groups` pairs the output label
/// with the input time indices.
fn reduce_time_groups(
    cube: &DataCube,
    groups: &[(DateTime<Utc>, Vec<usize>)],
    op: ReduceOp,
) -> ScaResult<DataCube> {
    let (_, nb, ny, nx) = cube.dim();
    let data = cube.data();
    let mut out = Array4::<CubeValue>::zeros((groups.len(), nb, ny, nx));

    for (g, (_, members)) in groups.iter().enumerate() {
        let reduce_cell = |(b, y, x): (usize, usize, usize), cell: &mut CubeValue| {
            let mut values: Vec<CubeValue> = members.iter().map(|&t| data[[t, b, y, x]]).collect();
            *cell = op.reduce(&mut values);
        };
        #[cfg(feature = "parallel")]
        Zip::indexed(out.index_axis_mut(Axis(0), g)).par_for_each(reduce_cell);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(out.index_axis_mut(Axis(0), g)).for_each(reduce_cell);
    }

    let times = groups.iter().map(|(t, _)| *t).collect();
    rebuild(cube, out, times, cube.bands().to_vec(), cube.y().to_vec(), cube.x().to_vec())
}

/// Collapse the time axis; the result is labelled with the first timestamp
pub fn reduce_time(cube: &DataCube, op: ReduceOp) -> ScaResult<DataCube> {
    let first = *cube
        .times()
        .first()
        .ok_or_else(|| ScaError::Processing("Cannot reduce an empty time axis".to_string()))?;
    log::info!("Reducing {} timesteps with {:?}", cube.times().len(), op);
    reduce_time_groups(cube, &[(first, (0..cube.times().len()).collect())], op)
}

/// Collapse the band axis into a single band labelled `label`
pub fn reduce_bands(cube: &DataCube, op: ReduceOp, label: &str) -> ScaResult<DataCube> {
    let (nt, nb, ny, nx) = cube.dim();
    log::info!("Reducing {} bands with {:?} into '{}'", nb, op, label);
    let data = cube.data();
    let mut out = Array4::<CubeValue>::zeros((nt, 1, ny, nx));
    Zip::indexed(out.index_axis_mut(Axis(1), 0)).for_each(|(t, y, x), cell| {
        let mut values: Vec<CubeValue> = (0..nb).map(|b| data[[t, b, y, x]]).collect();
        *cell = op.reduce(&mut values);
    });
    rebuild(cube, out, cube.times().to_vec(), vec![label.to_string()], cube.y().to_vec(), cube.x().to_vec())
}

/// Reduce timesteps falling into the same calendar period; output times are the
/// period starts
pub fn aggregate_temporal_period(cube: &DataCube, period: Period, op: ReduceOp) -> ScaResult<DataCube> {
    let mut groups: Vec<(DateTime<Utc>, Vec<usize>)> = Vec::new();
    for (i, &t) in cube.times().iter().enumerate() {
        let start = period.start_of(t)?;
        match groups.last_mut() {
            Some((label, members)) if *label == start => members.push(i),
            _ => groups.push((start, vec![i])),
        }
    }
    log::info!(
        "Aggregating {} timesteps into {} {:?} period(s) with {:?}",
        cube.times().len(),
        groups.len(),
        period,
        op
    );
    reduce_time_groups(cube, &groups, op)
}

/// Downsample by an integer factor with a NaN-ignoring block mean.
/// Incomplete edge blocks are dropped.
pub fn resample_spatial(cube: &DataCube, factor: usize) -> ScaResult<DataCube> {
    if factor == 0 {
        return Err(ScaError::Processing("Resampling factor must be positive".to_string()));
    }
    let (nt, nb, ny, nx) = cube.dim();
    let (oy, ox) = (ny / factor, nx / factor);
    if ny % factor != 0 || nx % factor != 0 {
        log::warn!(
            "Grid {}x{} is not a multiple of {}; dropping incomplete edge blocks",
            ny,
            nx,
            factor
        );
    }
    log::info!("Resampling {}x{} grid by factor {} to {}x{}", ny, nx, factor, oy, ox);

    let data = cube.data();
    let mut out = Array4::<CubeValue>::zeros((nt, nb, oy, ox));
    Zip::indexed(&mut out).for_each(|(t, b, r, c), cell| {
        let mut values = Vec::with_capacity(factor * factor);
        for y in r * factor..(r + 1) * factor {
            for x in c * factor..(c + 1) * factor {
                values.push(data[[t, b, y, x]]);
            }
        }
        *cell = ReduceOp::Mean.reduce(&mut values);
    });

    let block_centre = |coords: &[f64], i: usize| coords[i * factor..(i + 1) * factor].iter().sum::<f64>() / factor as f64;
    let y = (0..oy).map(|i| block_centre(cube.y(), i)).collect();
    let x = (0..ox).map(|i| block_centre(cube.x(), i)).collect();
    rebuild(cube, out, cube.times().to_vec(), cube.bands().to_vec(), y, x)
}

/// Collapse the spatial axes; one column per band, one row per timestep
pub fn reduce_spatial(cube: &DataCube, op: ReduceOp) -> ScaResult<TimeSeries> {
    let (nt, nb, ny, nx) = cube.dim();
    if ny == 0 || nx == 0 {
        return Err(ScaError::Processing("Cannot reduce an empty grid".to_string()));
    }
    log::info!("Reducing {}x{} grid of {} timesteps with {:?}", ny, nx, nt, op);

    let data = cube.data();
    let rows = (0..nt)
        .map(|t| {
            let values = (0..nb)
                .map(|b| {
                    let mut cells: Vec<CubeValue> = data.index_axis(Axis(0), t).index_axis(Axis(0), b).iter().copied().collect();
                    op.reduce(&mut cells) as f64
                })
                .collect();
            (cube.times()[t], values)
        })
        .collect();
    TimeSeries::new(cube.bands().to_vec(), rows)
}

fn axis_step(coords: &[f64]) -> Option<f64> {
    match coords {
        [a, b, ..] => Some((b - a).abs()),
        _ => None,
    }
}

/// Source indices falling into each target cell of width `step`
fn target_members(source: &[f64], target: &[f64], step: f64) -> Vec<Vec<usize>> {
    let mut members = vec![Vec::new(); target.len()];
    for (i, &s) in source.iter().enumerate() {
        let nearest = target
            .iter()
            .enumerate()
            .map(|(j, &t)| (j, (t - s).abs()))
            .filter(|&(_, d)| d <= step / 2.0)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((j, _)) = nearest {
            members[j].push(i);
        }
    }
    members
}

/// Resample onto the grid of `target`. Each source cell goes to the target cell
/// containing its centre and target cells reduce their sources with `op`.
/// Target cells without sources are NaN. Times and bands of `cube` are kept.
pub fn resample_cube_spatial(cube: &DataCube, target: &DataCube, op: ReduceOp) -> ScaResult<DataCube> {
    if cube.crs() != target.crs() {
        return Err(ScaError::Processing(format!(
            "Cannot resample EPSG:{} onto a grid in EPSG:{}",
            cube.crs().epsg(),
            target.crs().epsg()
        )));
    }
    let (ty, tx) = (target.y(), target.x());
    let step_y = axis_step(ty).or_else(|| axis_step(tx)).or_else(|| axis_step(cube.y())).unwrap_or(0.0);
    let step_x = axis_step(tx).or_else(|| axis_step(ty)).or_else(|| axis_step(cube.x())).unwrap_or(0.0);
    let rows = target_members(cube.y(), ty, step_y);
    let cols = target_members(cube.x(), tx, step_x);
    log::info!(
        "Resampling {}x{} grid onto {}x{} target with {:?}",
        cube.y().len(),
        cube.x().len(),
        ty.len(),
        tx.len(),
        op
    );

    let (nt, nb, _, _) = cube.dim();
    let data = cube.data();
    let mut out = Array4::<CubeValue>::zeros((nt, nb, ty.len(), tx.len()));
    let reduce_cell = |(t, b, r, c): (usize, usize, usize, usize), cell: &mut CubeValue| {
        let mut values: Vec<CubeValue> = rows[r]
            .iter()
            .flat_map(|&y| cols[c].iter().map(move |&x| (y, x)))
            .map(|(y, x)| data[[t, b, y, x]])
            .collect();
        *cell = op.reduce(&mut values);
    };
    #[cfg(feature = "parallel")]
    Zip::indexed(&mut out).par_for_each(reduce_cell);
    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut out).for_each(reduce_cell);

    rebuild(cube, out, cube.times().to_vec(), cube.bands().to_vec(), ty.to_vec(), tx.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoordinateSystem;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use ndarray::Array3;

    fn cube() -> DataCube {
        // 4 timesteps (Feb 1, Feb 20, Mar 5, Mar 25), bands B03/B11, 2x2 grid
        let t0 = Utc.with_ymd_and_hms(2018, 2, 1, 0, 0, 0).unwrap();
        let times = vec![t0, t0 + Duration::days(19), t0 + Duration::days(32), t0 + Duration::days(52)];
        let b03 = Array3::from_shape_fn((4, 2, 2), |(t, y, x)| (t * 100 + y * 10 + x) as f32);
        let b11 = Array3::from_shape_fn((4, 2, 2), |(t, _, _)| if t == 1 { f32::NAN } else { t as f32 });
        DataCube::from_bands(
            times,
            vec![46.6, 46.5],
            vec![11.0, 11.1],
            CoordinateSystem::Geographic,
            vec![("B03".to_string(), b03), ("B11".to_string(), b11)],
        )
        .unwrap()
    }

    #[test]
    fn test_filter_temporal_half_open() {
        let c = cube();
        let extent = TemporalExtent::parse("2018-02-01", "2018-03-05").unwrap();
        let filtered = filter_temporal(&c, &extent).unwrap();
        assert_eq!(filtered.times().len(), 2);

        let none = TemporalExtent::parse("2019-01-01", "2019-02-01").unwrap();
        assert!(filter_temporal(&c, &none).is_err());
    }

    #[test]
    fn test_filter_bbox_and_bands() {
        let c = cube();
        let bbox = BoundingBox::new(11.05, 46.55, 11.2, 46.7).unwrap();
        let sub = filter_bbox(&c, &bbox).unwrap();
        assert_eq!(sub.dim(), (4, 2, 1, 1));
        assert_eq!(sub.band("B03").unwrap()[[2, 0, 0]], 201.0);

        let swapped = filter_bands(&c, &["B11", "B03"]).unwrap();
        assert_eq!(swapped.bands(), &["B11".to_string(), "B03".to_string()]);
        assert!(filter_bands(&c, &["B04"]).is_err());
    }

    #[test]
    fn test_clip_and_scale() {
        let c = cube();
        let clipped = clip(&c, 0.0, 150.0).unwrap();
        assert_eq!(clipped.band("B03").unwrap()[[3, 1, 1]], 150.0);
        assert!(clipped.band("B11").unwrap()[[1, 0, 0]].is_nan());

        let scaled = linear_scale_range(&clipped, 0.0, 150.0, 0.0, 1.0).unwrap();
        assert_relative_eq!(scaled.band("B03").unwrap()[[1, 0, 0]], 100.0 / 150.0, epsilon = 1e-6);
        assert!(linear_scale_range(&c, 1.0, 1.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_reduce_time_ignores_nan() {
        let reduced = reduce_time(&cube(), ReduceOp::Mean).unwrap();
        assert_eq!(reduced.times().len(), 1);
        // B11 values 0, NaN, 2, 3
        assert_relative_eq!(reduced.band("B11").unwrap()[[0, 0, 0]], 5.0 / 3.0, epsilon = 1e-6);

        let median = reduce_time(&cube(), ReduceOp::Median).unwrap();
        assert_eq!(median.band("B11").unwrap()[[0, 0, 0]], 2.0);
    }

    #[test]
    fn test_reduce_bands() {
        let reduced = reduce_bands(&cube(), ReduceOp::Max, "max").unwrap();
        assert_eq!(reduced.bands(), &["max".to_string()]);
        assert_eq!(reduced.data()[[1, 0, 0, 0]], 100.0);
    }

    #[test]
    fn test_aggregate_month_min() {
        let monthly = aggregate_temporal_period(&cube(), Period::Month, ReduceOp::Min).unwrap();
        assert_eq!(monthly.times().len(), 2);
        assert_eq!(monthly.times()[1], Utc.with_ymd_and_hms(2018, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(monthly.band("B11").unwrap()[[0, 0, 0]], 0.0);
        assert_eq!(monthly.band("B11").unwrap()[[1, 0, 0]], 2.0);
    }

    #[test]
    fn test_resample_block_mean() {
        let resampled = resample_spatial(&cube(), 2).unwrap();
        assert_eq!(resampled.dim(), (4, 2, 1, 1));
        // (0 + 1 + 10 + 11) / 4
        assert_relative_eq!(resampled.band("B03").unwrap()[[0, 0, 0]], 5.5);
        assert_relative_eq!(resampled.x()[0], 11.05, epsilon = 1e-9);
        assert!(resample_spatial(&cube(), 3).is_err());
    }

    #[test]
    fn test_reduce_spatial_per_band() {
        let series = reduce_spatial(&cube(), ReduceOp::Mean).unwrap();
        assert_eq!(series.columns(), &["B03".to_string(), "B11".to_string()]);
        assert_eq!(series.len(), 4);
        // (0 + 1 + 10 + 11) / 4 at t0; B11 all NaN at t1
        let b03 = series.column("B03").unwrap();
        assert_relative_eq!(b03[0], 5.5);
        assert_relative_eq!(b03[2], 205.5);
        assert!(series.column("B11").unwrap()[1].is_nan());

        let max = reduce_spatial(&cube(), ReduceOp::Max).unwrap();
        assert_eq!(max.column("B03").unwrap()[3], 311.0);
    }

    #[test]
    fn test_resample_cube_onto_coarser_grid() {
        let t0 = Utc.with_ymd_and_hms(2018, 2, 1, 0, 0, 0).unwrap();
        let fine = DataCube::from_bands(
            vec![t0],
            vec![3.5, 2.5, 1.5, 0.5],
            vec![0.5, 1.5, 2.5, 3.5],
            CoordinateSystem::Geographic,
            vec![("NDSI".to_string(), Array3::from_shape_fn((1, 4, 4), |(_, y, x)| (y * 4 + x) as f32))],
        )
        .unwrap();
        // 2x2 grid of 2-unit cells plus an extra column with no sources
        let target = DataCube::from_bands(
            vec![t0],
            vec![3.0, 1.0],
            vec![1.0, 3.0, 5.0],
            CoordinateSystem::Geographic,
            vec![("any".to_string(), Array3::zeros((1, 2, 3)))],
        )
        .unwrap();

        let coarse = resample_cube_spatial(&fine, &target, ReduceOp::Mean).unwrap();
        assert_eq!(coarse.dim(), (1, 1, 2, 3));
        assert_eq!(coarse.bands(), &["NDSI".to_string()]);
        assert_eq!(coarse.x(), target.x());
        let ndsi = coarse.band("NDSI").unwrap();
        // top-left block holds 0, 1, 4, 5
        assert_relative_eq!(ndsi[[0, 0, 0]], 2.5);
        assert_relative_eq!(ndsi[[0, 1, 1]], 12.5);
        assert!(ndsi[[0, 0, 2]].is_nan());

        let utm = DataCube::from_bands(
            vec![t0],
            vec![3.0, 1.0],
            vec![1.0, 3.0],
            CoordinateSystem::Projected { epsg: 32632 },
            vec![("any".to_string(), Array3::zeros((1, 2, 2)))],
        )
        .unwrap();
        assert!(resample_cube_spatial(&fine, &utm, ReduceOp::Mean).is_err());
    }
}
