use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ndarray::{Array3, Array4, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reflectance or index value of a single cube cell
pub type CubeValue = f32;

/// 4D cube data (time x band x y x x)
pub type CubeArray = Array4<CubeValue>;

/// 3D class data (time x y x x)
pub type ClassArray = Array3<u8>;

/// Class codes of a snow map.
///
/// `CLOUD` doubles as the generic "unknown/obscured" class. `NO_DATA` marks cells
/// whose index was undefined, `OUTSIDE` marks cells outside the region of interest.
pub mod class {
    pub const NO_SNOW: u8 = 0;
    pub const SNOW: u8 = 1;
    pub const CLOUD: u8 = 2;
    pub const NO_DATA: u8 = 254;
    pub const OUTSIDE: u8 = 255;

    /// True for codes that take part in aggregation
    pub fn is_valid(code: u8) -> bool {
        code != NO_DATA && code != OUTSIDE
    }
}

/// Coordinate reference system of a cube or geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateSystem {
    /// Geographic coordinates (longitude, latitude), EPSG:4326
    Geographic,
    /// Projected coordinates (e.g., UTM)
    Projected { epsg: u32 },
}

impl CoordinateSystem {
    pub fn from_epsg(epsg: u32) -> Self {
        if epsg == 4326 {
            CoordinateSystem::Geographic
        } else {
            CoordinateSystem::Projected { epsg }
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            CoordinateSystem::Geographic => 4326,
            CoordinateSystem::Projected { epsg } => *epsg,
        }
    }
}

impl Default for CoordinateSystem {
    fn default() -> Self {
        CoordinateSystem::Geographic
    }
}

/// Spatial bounding box in the units of its coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> ScaResult<Self> {
        let b = Self { west, south, east, north };
        if !(west.is_finite() && east.is_finite() && south.is_finite() && north.is_finite()) {
            return Err(ScaError::InvalidFormat(format!("Non-finite bounding box: {:?}", b)));
        }
        if west > east || south > north {
            return Err(ScaError::InvalidFormat(format!("Inverted bounding box: {:?}", b)));
        }
        Ok(b)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.west && x <= self.east && y >= self.south && y <= self.north
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    /// `[west, south, east, north]`, the GeoJSON/STAC ordering
    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Derive the transform from regularly spaced cell-centre coordinates.
    pub fn from_axes(y: &[f64], x: &[f64]) -> ScaResult<Self> {
        let dx = regular_spacing("x", x)?;
        let dy = regular_spacing("y", y)?;
        Ok(Self {
            top_left_x: x[0] - dx / 2.0,
            pixel_width: dx,
            rotation_x: 0.0,
            top_left_y: y[0] - dy / 2.0,
            rotation_y: 0.0,
            pixel_height: dy,
        })
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

fn regular_spacing(name: &str, coords: &[f64]) -> ScaResult<f64> {
    if coords.len() < 2 {
        return Err(ScaError::Metadata(format!(
            "Axis '{}' needs at least two labels to derive a pixel size", name
        )));
    }
    let step = coords[1] - coords[0];
    let tolerance = step.abs() * 1e-6;
    for pair in coords.windows(2) {
        if ((pair[1] - pair[0]) - step).abs() > tolerance {
            return Err(ScaError::Metadata(format!("Axis '{}' is not regularly spaced", name)));
        }
    }
    Ok(step)
}

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalExtent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TemporalExtent {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> ScaResult<Self> {
        if end <= start {
            return Err(ScaError::InvalidFormat(format!(
                "Temporal extent ends ({}) before it starts ({})", end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `["2018-02-01", "2018-06-30"]` style bounds
    pub fn parse(start: &str, end: &str) -> ScaResult<Self> {
        Self::new(parse_timestamp(start)?, parse_timestamp(end)?)
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// Parse an ISO-8601 timestamp: RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS`, or a bare date.
/// Naive values are taken as UTC.
pub fn parse_timestamp(s: &str) -> ScaResult<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(ScaError::InvalidFormat(format!("Unrecognised timestamp '{}'", s)))
}

/// Scalar comparison used by property filters and time-series filters.
/// NaN never satisfies a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

impl Comparison {
    pub fn evaluate(&self, lhs: f64, rhs: f64) -> bool {
        if lhs.is_nan() || rhs.is_nan() {
            return false;
        }
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Lte => lhs <= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Gte => lhs >= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Neq => lhs != rhs,
        }
    }
}

impl std::fmt::Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparison::Lt => write!(f, "<"),
            Comparison::Lte => write!(f, "<="),
            Comparison::Gt => write!(f, ">"),
            Comparison::Gte => write!(f, ">="),
            Comparison::Eq => write!(f, "=="),
            Comparison::Neq => write!(f, "!="),
        }
    }
}

/// Shared flag used to abort materialization and job polling
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(ScaError::Canceled)` once [`cancel`](Self::cancel) was called
    pub fn check(&self) -> ScaResult<()> {
        if self.is_canceled() {
            Err(ScaError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Multi-band, multi-temporal raster with labelled axes.
///
/// Data is indexed `(time, band, y, x)`. Bands are addressed by label only.
#[derive(Debug, Clone)]
pub struct DataCube {
    data: CubeArray,
    times: Vec<DateTime<Utc>>,
    bands: Vec<String>,
    y: Vec<f64>,
    x: Vec<f64>,
    crs: CoordinateSystem,
}

impl DataCube {
    pub fn new(
        data: CubeArray,
        times: Vec<DateTime<Utc>>,
        bands: Vec<String>,
        y: Vec<f64>,
        x: Vec<f64>,
        crs: CoordinateSystem,
    ) -> ScaResult<Self> {
        let expected = (times.len(), bands.len(), y.len(), x.len());
        if data.dim() != expected {
            return Err(ScaError::InvalidFormat(format!(
                "Cube data shape {:?} does not match axis labels {:?}",
                data.dim(),
                expected
            )));
        }
        check_times(&times)?;
        check_bands(&bands)?;
        check_spatial_axis("x", &x, false)?;
        check_spatial_axis("y", &y, true)?;

        Ok(Self { data, times, bands, y, x, crs })
    }

    /// Build a cube from per-band `(time, y, x)` arrays
    pub fn from_bands(
        times: Vec<DateTime<Utc>>,
        y: Vec<f64>,
        x: Vec<f64>,
        crs: CoordinateSystem,
        bands: Vec<(String, Array3<CubeValue>)>,
    ) -> ScaResult<Self> {
        if bands.is_empty() {
            return Err(ScaError::InvalidFormat("A cube needs at least one band".to_string()));
        }
        let shape = (times.len(), y.len(), x.len());
        let mut labels = Vec::with_capacity(bands.len());
        let mut data = Array4::<CubeValue>::zeros((shape.0, bands.len(), shape.1, shape.2));

        for (i, (label, values)) in bands.into_iter().enumerate() {
            if values.dim() != shape {
                return Err(ScaError::InvalidFormat(format!(
                    "Band '{}' has shape {:?}, expected {:?}",
                    label,
                    values.dim(),
                    shape
                )));
            }
            data.index_axis_mut(Axis(1), i).assign(&values);
            labels.push(label);
        }

        Self::new(data, times, labels, y, x, crs)
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &CubeArray {
        &self.data
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn crs(&self) -> CoordinateSystem {
        self.crs
    }

    pub fn band_index(&self, label: &str) -> ScaResult<usize> {
        self.bands.iter().position(|b| b == label).ok_or_else(|| {
            ScaError::Processing(format!(
                "Band '{}' not found in cube (available: {:?})",
                label, self.bands
            ))
        })
    }

    /// `(time, y, x)` view of one band
    pub fn band(&self, label: &str) -> ScaResult<ArrayView3<'_, CubeValue>> {
        let idx = self.band_index(label)?;
        Ok(self.data.index_axis(Axis(1), idx))
    }

    pub fn geo_transform(&self) -> ScaResult<GeoTransform> {
        GeoTransform::from_axes(&self.y, &self.x)
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let (x0, x1) = axis_bounds(&self.x);
        let (y0, y1) = axis_bounds(&self.y);
        BoundingBox { west: x0, south: y0, east: x1, north: y1 }
    }
}

/// Classified raster restricted to a small label alphabet, indexed `(time, y, x)`
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRaster {
    data: ClassArray,
    times: Vec<DateTime<Utc>>,
    y: Vec<f64>,
    x: Vec<f64>,
    crs: CoordinateSystem,
}

impl ClassRaster {
    pub fn new(
        data: ClassArray,
        times: Vec<DateTime<Utc>>,
        y: Vec<f64>,
        x: Vec<f64>,
        crs: CoordinateSystem,
    ) -> ScaResult<Self> {
        let expected = (times.len(), y.len(), x.len());
        if data.dim() != expected {
            return Err(ScaError::InvalidFormat(format!(
                "Class raster shape {:?} does not match axis labels {:?}",
                data.dim(),
                expected
            )));
        }
        check_times(&times)?;
        check_spatial_axis("x", &x, false)?;
        check_spatial_axis("y", &y, true)?;
        Ok(Self { data, times, y, x, crs })
    }

    /// New raster on the grid of `self` with different class data
    pub fn with_data(&self, data: ClassArray) -> ScaResult<Self> {
        Self::new(data, self.times.clone(), self.y.clone(), self.x.clone(), self.crs)
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn data(&self) -> &ClassArray {
        &self.data
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn crs(&self) -> CoordinateSystem {
        self.crs
    }

    pub fn layer(&self, time_index: usize) -> ArrayView2<'_, u8> {
        self.data.index_axis(Axis(0), time_index)
    }

    pub fn count(&self, code: u8) -> usize {
        self.data.iter().filter(|&&c| c == code).count()
    }

    /// Class codes as floats; no-data and outside cells become NaN
    pub fn as_values(&self) -> Array3<CubeValue> {
        self.data.mapv(|c| if class::is_valid(c) { c as CubeValue } else { CubeValue::NAN })
    }

    pub fn geo_transform(&self) -> ScaResult<GeoTransform> {
        GeoTransform::from_axes(&self.y, &self.x)
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let (x0, x1) = axis_bounds(&self.x);
        let (y0, y1) = axis_bounds(&self.y);
        BoundingBox { west: x0, south: y0, east: x1, north: y1 }
    }
}

fn axis_bounds(coords: &[f64]) -> (f64, f64) {
    coords.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &c| (lo.min(c), hi.max(c)))
}

fn check_times(times: &[DateTime<Utc>]) -> ScaResult<()> {
    if times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(ScaError::InvalidFormat(
            "Time labels must be unique and strictly increasing".to_string(),
        ));
    }
    Ok(())
}

fn check_bands(bands: &[String]) -> ScaResult<()> {
    let mut seen = HashSet::new();
    for band in bands {
        if !seen.insert(band.as_str()) {
            return Err(ScaError::InvalidFormat(format!("Duplicate band label '{}'", band)));
        }
    }
    Ok(())
}

fn check_spatial_axis(name: &str, coords: &[f64], allow_descending: bool) -> ScaResult<()> {
    if coords.iter().any(|c| !c.is_finite()) {
        return Err(ScaError::InvalidFormat(format!("Axis '{}' has non-finite labels", name)));
    }
    let ascending = coords.windows(2).all(|w| w[1] > w[0]);
    let descending = coords.windows(2).all(|w| w[1] < w[0]);
    if ascending || (allow_descending && descending) {
        Ok(())
    } else {
        Err(ScaError::InvalidFormat(format!(
            "Axis '{}' labels must be unique and monotonic",
            name
        )))
    }
}

/// Error types for snow cover processing
#[derive(Debug, thiserror::Error)]
pub enum ScaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Formula error: {0}")]
    Formula(String),

    #[error("Schema mismatch: {0}")]
    Schema(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Batch job {job_id} ended with status '{status}': {message}")]
    JobFailed {
        job_id: String,
        status: String,
        message: String,
    },

    #[error("Batch job {job_id} did not finish within {waited:?}")]
    JobTimeout {
        job_id: String,
        waited: std::time::Duration,
    },

    #[error("Operation canceled")]
    Canceled,

    #[cfg(feature = "geotiff")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for snow cover operations
pub type ScaResult<T> = Result<T, ScaError>;
