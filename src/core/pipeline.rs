use crate::core::aggregate::{AggregateTable, CountLegend, Reducer, SpatialAggregator};
use crate::core::band_math;
use crate::core::classify::ThresholdClassifier;
use crate::core::geometry::Region;
use crate::core::masking::{scl_cloud_mask, MaskCompositor};
use crate::core::timeseries::TimeSeries;
use crate::core::validation::{derived_label, validate_stations, GroundTruth, StationValidation};
use crate::io::source::{LoadRequest, PropertyFilter};
use crate::io::stations::StationMeta;
use crate::types::{class, BoundingBox, ClassRaster, Comparison, DataCube, ScaResult, TemporalExtent};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Snow cover area processing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaConfig {
    pub collection: String,
    pub green_band: String,
    pub swir_band: String,
    /// Scene classification band used for the cloud mask
    pub scl_band: String,
    pub ndsi_threshold: f64,
    pub cloud_classes: Vec<u8>,
    /// Timesteps with at least this cloud percentage are dropped
    pub cloud_threshold: f64,
    /// Upper bound on the scene-level `eo:cloud_cover` when loading
    pub max_scene_cloud_cover: f64,
    /// Station buffer radius in metres
    pub station_buffer_m: f64,
}

impl Default for ScaConfig {
    fn default() -> Self {
        Self {
            collection: "SENTINEL2_L2A".to_string(),
            green_band: "B03".to_string(),
            swir_band: "B11".to_string(),
            scl_band: "SCL".to_string(),
            ndsi_threshold: 0.4,
            cloud_classes: vec![3, 8, 9], // cloud shadow, medium and high probability cloud
            cloud_threshold: 25.0,
            max_scene_cloud_cover: 90.0,
            station_buffer_m: 80.0,
        }
    }
}

impl ScaConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ScaResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: ScaConfig = serde_json::from_str(&text)?;
        log::debug!("Loaded configuration from {}: {:?}", path.as_ref().display(), config);
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ScaResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Snow cover area workflow: NDSI, threshold, cloud mask, catchment statistics
/// and station validation
#[derive(Debug, Clone)]
pub struct ScaPipeline {
    config: ScaConfig,
    classifier: ThresholdClassifier,
    legend: CountLegend,
}

impl ScaPipeline {
    pub fn new(config: ScaConfig) -> ScaResult<Self> {
        let classifier = ThresholdClassifier::binary(config.ndsi_threshold)?;
        Ok(Self { config, classifier, legend: CountLegend::default() })
    }

    pub fn config(&self) -> &ScaConfig {
        &self.config
    }

    /// Column naming of catchment statistics and of the aggregate export
    pub fn legend(&self) -> &CountLegend {
        &self.legend
    }

    /// Load request for the bands this pipeline needs, skipping very cloudy scenes
    pub fn load_request(&self, bbox: BoundingBox, extent: TemporalExtent) -> LoadRequest {
        LoadRequest::new(self.config.collection.clone())
            .with_spatial_extent(bbox)
            .with_temporal_extent(extent)
            .with_bands([&self.config.green_band, &self.config.swir_band, &self.config.scl_band])
            .with_property(PropertyFilter::new(
                "eo:cloud_cover",
                Comparison::Lte,
                self.config.max_scene_cloud_cover,
            ))
    }

    /// Binary snow map with clouds: 0 no snow, 1 snow, 2 cloud
    pub fn snow_map(&self, cube: &DataCube) -> ScaResult<ClassRaster> {
        log::info!("Computing snow map for cube {:?}", cube.dim());
        let ndsi = band_math::ndsi(cube, &self.config.green_band, &self.config.swir_band)?;
        let snow = self.classifier.classify(&ndsi, "NDSI")?;
        let cloud = scl_cloud_mask(cube, &self.config.scl_band, &self.config.cloud_classes)?;
        MaskCompositor::new().with_layer(cloud, class::CLOUD).compose(&snow)
    }

    /// Snow map with everything outside `region` marked as outside
    pub fn catchment_snow_map(&self, cube: &DataCube, region: &Region) -> ScaResult<ClassRaster> {
        let snow = self.snow_map(cube)?;
        MaskCompositor::new().with_region(region, &snow)?.compose(&snow)
    }

    /// Per-timestep counts and percentages over `region`:
    /// `n_catchment, n_cloud, n_snow, perc_cloud, perc_snow`
    pub fn catchment_statistics(&self, cube: &DataCube, region: &Region) -> ScaResult<TimeSeries> {
        let snow = self.catchment_snow_map(cube, region)?;
        let table = SpatialAggregator::new(Reducer::Count).aggregate(&snow, std::slice::from_ref(region))?;
        self.percentages(table.count_series(&region.id, &self.legend)?)
    }

    /// Add `perc_<class>` columns relative to the valid-cell total
    pub fn percentages(&self, counts: TimeSeries) -> ScaResult<TimeSeries> {
        let total = format!("n_{}", self.legend.total);
        self.legend.classes.iter().try_fold(counts, |series, (_, name)| {
            series.with_percentage(&format!("n_{}", name), &total, &format!("perc_{}", name))
        })
    }

    /// Keep timesteps with `perc_cloud` below the configured threshold
    pub fn filtered_statistics(&self, statistics: &TimeSeries) -> ScaResult<TimeSeries> {
        let filtered = statistics.filter("perc_cloud", Comparison::Lt, self.config.cloud_threshold)?;
        log::info!(
            "Kept {} of {} timesteps below {}% cloud",
            filtered.len(),
            statistics.len(),
            self.config.cloud_threshold
        );
        Ok(filtered)
    }

    /// Median snow map value inside each buffered station. Stations are
    /// reprojected onto the grid of the snow map.
    pub fn station_values(&self, snow_map: &ClassRaster, stations: &[StationMeta]) -> ScaResult<AggregateTable> {
        let regions = stations
            .iter()
            .map(|s| s.buffer_region(self.config.station_buffer_m, snow_map.crs()))
            .collect::<ScaResult<Vec<_>>>()?;
        SpatialAggregator::new(Reducer::Median).aggregate(snow_map, &regions)
    }

    /// Station medians turned into daily snow labels.
    ///
    /// Several acquisitions on one day collapse to the earliest defined label;
    /// a day stays missing only when every acquisition is missing.
    pub fn derived_labels(&self, values: &AggregateTable) -> ScaResult<BTreeMap<String, BTreeMap<NaiveDate, Option<u8>>>> {
        let mut labels = BTreeMap::new();
        for station in values.regions() {
            let series = values.value_series(station, "median")?;
            let medians = series.column("median")?;
            let mut by_date: BTreeMap<NaiveDate, Option<u8>> = BTreeMap::new();
            for (t, v) in series.times().iter().zip(medians) {
                let label = derived_label(v);
                match by_date.get(&t.date_naive()).copied() {
                    None | Some(None) => {
                        by_date.insert(t.date_naive(), label);
                    }
                    Some(Some(kept)) => {
                        if label.is_some_and(|l| l != kept) {
                            log::warn!(
                                "Station '{}' has conflicting labels on {}; keeping {}",
                                station,
                                t.date_naive(),
                                kept
                            );
                        }
                    }
                }
            }
            labels.insert(station.clone(), by_date);
        }
        Ok(labels)
    }

    /// Compare the snow map against station ground truth
    pub fn validate(&self, snow_map: &ClassRaster, truths: &[GroundTruth]) -> ScaResult<Vec<StationValidation>> {
        let stations: Vec<StationMeta> = truths
            .iter()
            .map(|t| StationMeta {
                name: t.station.clone(),
                longitude: t.longitude,
                latitude: t.latitude,
                elevation: t.elevation,
                crs: t.crs,
            })
            .collect();
        let values = self.station_values(snow_map, &stations)?;
        validate_stations(truths, &self.derived_labels(&values)?)
    }
}
