//! In-situ snow station readers
//!
//! Two CSV tables are read: station metadata (one row per station with its
//! location) and daily snow-depth observations (one row per station and day).

use crate::core::geometry::{Geometry, Point, Region};
use crate::core::reproject::{metres_to_crs_units, reproject_point};
use crate::core::validation::GroundTruth;
use crate::types::{parse_timestamp, CoordinateSystem, ScaError, ScaResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Column names and presence threshold for station CSV files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationCsvConfig {
    pub name_column: String,
    pub date_column: String,
    pub depth_column: String,
    pub longitude_column: String,
    pub latitude_column: String,
    /// Optional in the metadata file
    pub elevation_column: String,
    pub date_format: String,
    /// Snow depth (m) above which a station reports snow
    pub snow_depth_threshold: f64,
    /// Coordinate system of the longitude/latitude columns
    #[serde(default)]
    pub crs: CoordinateSystem,
}

impl Default for StationCsvConfig {
    fn default() -> Self {
        Self {
            name_column: "Name".to_string(),
            date_column: "Date".to_string(),
            depth_column: "HS_after_gapfill".to_string(),
            longitude_column: "Longitude".to_string(),
            latitude_column: "Latitude".to_string(),
            elevation_column: "Elevation".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            snow_depth_threshold: 0.4,
            crs: CoordinateSystem::Geographic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationMeta {
    pub name: String,
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: Option<f64>,
    #[serde(default)]
    pub crs: CoordinateSystem,
}

impl StationMeta {
    pub fn location(&self) -> Point {
        Point::new(self.longitude, self.latitude)
    }

    /// Footprint of `radius_m` metres around the station, expressed in `grid_crs`
    pub fn buffer_region(&self, radius_m: f64, grid_crs: CoordinateSystem) -> ScaResult<Region> {
        let centre = reproject_point(self.location(), self.crs, grid_crs)?;
        let geometry = Geometry::buffer(centre, metres_to_crs_units(radius_m, grid_crs))?;
        Ok(Region::new(self.name.clone(), geometry, grid_crs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthObservation {
    pub station: String,
    pub date: NaiveDate,
    /// `None` for empty, `NA` or `NaN` readings
    pub depth: Option<f64>,
}

fn column(headers: &csv::StringRecord, name: &str) -> ScaResult<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| ScaError::InvalidFormat(format!("CSV column '{}' not found in {:?}", name, headers)))
}

fn field<'a>(record: &'a csv::StringRecord, idx: usize, line: u64) -> ScaResult<&'a str> {
    record
        .get(idx)
        .map(str::trim)
        .ok_or_else(|| ScaError::InvalidFormat(format!("CSV record {} is missing column {}", line, idx)))
}

fn parse_optional_number(raw: &str, what: &str) -> ScaResult<Option<f64>> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("na") || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let value = raw
        .parse::<f64>()
        .map_err(|_| ScaError::InvalidFormat(format!("Invalid {} '{}'", what, raw)))?;
    Ok(if value.is_nan() { None } else { Some(value) })
}

fn parse_number(raw: &str, what: &str) -> ScaResult<f64> {
    parse_optional_number(raw, what)?.ok_or_else(|| ScaError::InvalidFormat(format!("Missing {}", what)))
}

/// Reader for station metadata and observation tables
#[derive(Debug, Clone, Default)]
pub struct StationReader {
    config: StationCsvConfig,
}

impl StationReader {
    pub fn new(config: StationCsvConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StationCsvConfig {
        &self.config
    }

    fn parse_date(&self, raw: &str) -> ScaResult<NaiveDate> {
        if let Ok(date) = NaiveDate::parse_from_str(raw, &self.config.date_format) {
            return Ok(date);
        }
        parse_timestamp(raw).map(|t| t.date_naive())
    }

    pub fn read_meta<R: Read>(&self, reader: R) -> ScaResult<Vec<StationMeta>> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        let name = column(&headers, &self.config.name_column)?;
        let lon = column(&headers, &self.config.longitude_column)?;
        let lat = column(&headers, &self.config.latitude_column)?;
        let elevation = column(&headers, &self.config.elevation_column).ok();

        let mut stations = Vec::new();
        for (i, record) in csv_reader.records().enumerate() {
            let record = record?;
            let line = i as u64 + 2;
            stations.push(StationMeta {
                name: field(&record, name, line)?.to_string(),
                longitude: parse_number(field(&record, lon, line)?, "longitude")?,
                latitude: parse_number(field(&record, lat, line)?, "latitude")?,
                elevation: match elevation {
                    Some(idx) => parse_optional_number(field(&record, idx, line)?, "elevation")?,
                    None => None,
                },
                crs: self.config.crs,
            });
        }
        log::info!("Read metadata for {} station(s)", stations.len());
        Ok(stations)
    }

    pub fn read_meta_file<P: AsRef<Path>>(&self, path: P) -> ScaResult<Vec<StationMeta>> {
        log::debug!("Reading station metadata from {}", path.as_ref().display());
        self.read_meta(File::open(path)?)
    }

    pub fn read_observations<R: Read>(&self, reader: R) -> ScaResult<Vec<DepthObservation>> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        let name = column(&headers, &self.config.name_column)?;
        let date = column(&headers, &self.config.date_column)?;
        let depth = column(&headers, &self.config.depth_column)?;

        let mut observations = Vec::new();
        for (i, record) in csv_reader.records().enumerate() {
            let record = record?;
            let line = i as u64 + 2;
            observations.push(DepthObservation {
                station: field(&record, name, line)?.to_string(),
                date: self.parse_date(field(&record, date, line)?)?,
                depth: parse_optional_number(field(&record, depth, line)?, "snow depth")?,
            });
        }
        log::info!(
            "Read {} observation(s), {} missing",
            observations.len(),
            observations.iter().filter(|o| o.depth.is_none()).count()
        );
        Ok(observations)
    }

    pub fn read_observations_file<P: AsRef<Path>>(&self, path: P) -> ScaResult<Vec<DepthObservation>> {
        log::debug!("Reading station observations from {}", path.as_ref().display());
        self.read_observations(File::open(path)?)
    }

    /// Binarize observations and attach them to their station metadata.
    /// Observations of stations without metadata are dropped.
    pub fn ground_truth(&self, meta: &[StationMeta], observations: &[DepthObservation]) -> Vec<GroundTruth> {
        assemble_ground_truth(meta, observations, self.config.snow_depth_threshold)
    }
}

/// Observations with `start <= date <= end`
pub fn temporal_filter(observations: &[DepthObservation], start: NaiveDate, end: NaiveDate) -> Vec<DepthObservation> {
    observations
        .iter()
        .filter(|o| o.date >= start && o.date <= end)
        .cloned()
        .collect()
}

/// Stations located inside `area`, reprojected into the area's coordinate system
pub fn spatial_filter(stations: &[StationMeta], area: &Region) -> ScaResult<Vec<StationMeta>> {
    let mut inside = Vec::new();
    for s in stations {
        if area.geometry.contains(&reproject_point(s.location(), s.crs, area.crs)?) {
            inside.push(s.clone());
        }
    }
    log::info!("{} of {} station(s) inside the area of interest", inside.len(), stations.len());
    Ok(inside)
}

/// `depth > threshold` is snow (1), otherwise no snow (0); missing stays missing
pub fn binarize(depth: Option<f64>, threshold: f64) -> Option<u8> {
    depth.map(|d| u8::from(d > threshold))
}

pub fn assemble_ground_truth(
    meta: &[StationMeta],
    observations: &[DepthObservation],
    threshold: f64,
) -> Vec<GroundTruth> {
    let mut by_station: HashMap<&str, BTreeMap<NaiveDate, Option<u8>>> = HashMap::new();
    for o in observations {
        by_station
            .entry(o.station.as_str())
            .or_default()
            .insert(o.date, binarize(o.depth, threshold));
    }

    let known: std::collections::HashSet<&str> = meta.iter().map(|m| m.name.as_str()).collect();
    let orphans = by_station.keys().filter(|k| !known.contains(*k)).count();
    if orphans > 0 {
        log::debug!("Ignoring observations of {} station(s) without metadata", orphans);
    }

    meta.iter()
        .map(|m| GroundTruth {
            station: m.name.clone(),
            longitude: m.longitude,
            latitude: m.latitude,
            elevation: m.elevation,
            crs: m.crs,
            observations: by_station.remove(m.name.as_str()).unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::polygon;

    const META: &str = "Name,Longitude,Latitude,Elevation\n\
                        Plata_Osservatore,11.18,46.82,1140\n\
                        Rifiano_Beobachter,11.18,46.70,\n\
                        Far_Away,12.50,47.50,900\n";

    const DAILY: &str = "Name,Date,HS_after_gapfill\n\
                         Plata_Osservatore,2018-02-03,0.55\n\
                         Plata_Osservatore,2018-02-08,0.40\n\
                         Plata_Osservatore,2018-07-02,0.0\n\
                         Rifiano_Beobachter,2018-02-03,NA\n\
                         Rifiano_Beobachter,2018-02-08,\n\
                         Unknown,2018-02-03,1.0\n";

    #[test]
    fn test_read_meta_with_optional_elevation() {
        let stations = StationReader::default().read_meta(META.as_bytes()).unwrap();
        assert_eq!(stations.len(), 3);
        assert_eq!(stations[0].elevation, Some(1140.0));
        assert_eq!(stations[1].elevation, None);
    }

    #[test]
    fn test_read_observations_missing_values() {
        let obs = StationReader::default().read_observations(DAILY.as_bytes()).unwrap();
        assert_eq!(obs.len(), 6);
        assert_eq!(obs[0].depth, Some(0.55));
        assert_eq!(obs[3].depth, None);
        assert_eq!(obs[4].depth, None);
    }

    #[test]
    fn test_missing_column() {
        let config = StationCsvConfig { depth_column: "HS".to_string(), ..Default::default() };
        assert!(StationReader::new(config).read_observations(DAILY.as_bytes()).is_err());
    }

    #[test]
    fn test_binarize_is_strict() {
        assert_eq!(binarize(Some(0.55), 0.4), Some(1));
        assert_eq!(binarize(Some(0.4), 0.4), Some(0));
        assert_eq!(binarize(None, 0.4), None);
    }

    #[test]
    fn test_filters_and_assembly() {
        let reader = StationReader::default();
        let meta = reader.read_meta(META.as_bytes()).unwrap();
        let obs = reader.read_observations(DAILY.as_bytes()).unwrap();

        let start = NaiveDate::from_ymd_opt(2018, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2018, 6, 30).unwrap();
        let obs = temporal_filter(&obs, start, end);
        assert_eq!(obs.len(), 5);

        let catchment = Region::new(
            "passiria",
            Geometry::Polygon(polygon(vec![(11.0, 46.6), (11.4, 46.6), (11.4, 47.0), (11.0, 47.0)], vec![]).unwrap()),
            CoordinateSystem::Geographic,
        );
        let meta = spatial_filter(&meta, &catchment).unwrap();
        assert_eq!(meta.len(), 2);

        let truths = reader.ground_truth(&meta, &obs);
        assert_eq!(truths.len(), 2);
        let plata = &truths[0];
        assert_eq!(plata.observations.len(), 2);
        assert_eq!(plata.observations[&start.succ_opt().unwrap().succ_opt().unwrap()], Some(1));
        assert_eq!(truths[1].valid_count(), 0);
    }

    #[test]
    fn test_buffer_region_follows_grid_crs() {
        let station = StationMeta {
            name: "Plata_Osservatore".to_string(),
            longitude: 11.18,
            latitude: 46.82,
            elevation: None,
            crs: CoordinateSystem::Geographic,
        };

        let utm = CoordinateSystem::Projected { epsg: 32632 };
        let region = station.buffer_region(80.0, utm).unwrap();
        assert_eq!(region.crs, utm);
        match region.geometry {
            Geometry::Buffer { centre, radius } => {
                assert_eq!(radius, 80.0);
                assert!(centre.x() > 600_000.0 && centre.x() < 700_000.0);
                assert!(centre.y() > 5_100_000.0 && centre.y() < 5_200_000.0);
            }
            other => panic!("expected a buffer, got {:?}", other),
        }

        let geographic = station.buffer_region(80.0, CoordinateSystem::Geographic).unwrap();
        assert_eq!(geographic.geometry, Geometry::buffer(Point::new(11.18, 46.82), 80.0 / 111_320.0).unwrap());

        assert!(station.buffer_region(80.0, CoordinateSystem::Projected { epsg: 3857 }).is_err());
    }

    #[test]
    fn test_station_crs_from_config() {
        let utm_meta = "Name,Longitude,Latitude\nPlata,663000.0,5187000.0\n";
        let config = StationCsvConfig { crs: CoordinateSystem::Projected { epsg: 32632 }, ..Default::default() };
        let stations = StationReader::new(config).read_meta(utm_meta.as_bytes()).unwrap();
        assert_eq!(stations[0].crs, CoordinateSystem::Projected { epsg: 32632 });

        let catchment = Region::new(
            "passiria",
            Geometry::Polygon(polygon(vec![(11.0, 46.6), (11.4, 46.6), (11.4, 47.0), (11.0, 47.0)], vec![]).unwrap()),
            CoordinateSystem::Geographic,
        );
        assert_eq!(spatial_filter(&stations, &catchment).unwrap().len(), 1);
    }
}
