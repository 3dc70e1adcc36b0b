//! Cube sources and deferred loading
//!
//! A [`LoadRequest`] describes what to load (collection, extents, bands and item
//! property filters). A [`CubeSource`] answers it in two steps: `describe` returns
//! the labels and shape without touching pixels, `load` reads them. [`LazyCube`]
//! wraps both so a pipeline can inspect a cube before paying for the load.

use crate::types::{
    BoundingBox, CancelToken, Comparison, CoordinateSystem, CubeValue, DataCube, ScaError, ScaResult, TemporalExtent,
};
use chrono::{DateTime, Utc};
use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Filter on a numeric item property, e.g. `eo:cloud_cover <= 90`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub property: String,
    pub comparison: Comparison,
    pub value: f64,
}

impl PropertyFilter {
    pub fn new(property: impl Into<String>, comparison: Comparison, value: f64) -> Self {
        Self { property: property.into(), comparison, value }
    }

    /// Items lacking the property never match
    pub fn matches(&self, properties: &BTreeMap<String, f64>) -> bool {
        properties
            .get(&self.property)
            .map(|&v| self.comparison.evaluate(v, self.value))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spatial_extent: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_extent: Option<TemporalExtent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PropertyFilter>,
}

impl LoadRequest {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            spatial_extent: None,
            temporal_extent: None,
            bands: None,
            properties: Vec::new(),
        }
    }

    pub fn with_spatial_extent(mut self, bbox: BoundingBox) -> Self {
        self.spatial_extent = Some(bbox);
        self
    }

    pub fn with_temporal_extent(mut self, extent: TemporalExtent) -> Self {
        self.temporal_extent = Some(extent);
        self
    }

    pub fn with_bands<S: Into<String>>(mut self, bands: impl IntoIterator<Item = S>) -> Self {
        self.bands = Some(bands.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_property(mut self, filter: PropertyFilter) -> Self {
        self.properties.push(filter);
        self
    }
}

/// Labels and shape of a cube, known before loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeMetadata {
    pub times: Vec<DateTime<Utc>>,
    pub bands: Vec<String>,
    pub y: Vec<f64>,
    pub x: Vec<f64>,
    pub crs: CoordinateSystem,
}

impl CubeMetadata {
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.times.len(), self.bands.len(), self.y.len(), self.x.len())
    }
}

pub trait CubeSource: Send + Sync {
    /// Resolve `request` to cube labels without reading pixels
    fn describe(&self, request: &LoadRequest) -> ScaResult<CubeMetadata>;

    /// Read the pixels of `request`; implementations check `cancel` between scenes
    fn load(&self, request: &LoadRequest, cancel: &CancelToken) -> ScaResult<DataCube>;
}

/// One acquisition of a [`MemorySource`]
#[derive(Debug, Clone)]
pub struct Scene {
    pub time: DateTime<Utc>,
    pub properties: BTreeMap<String, f64>,
    /// `(band, y, x)` in the band order of the source
    pub data: Array3<CubeValue>,
}

/// In-memory collection of scenes on a shared grid
#[derive(Debug, Clone)]
pub struct MemorySource {
    collection: String,
    bands: Vec<String>,
    y: Vec<f64>,
    x: Vec<f64>,
    crs: CoordinateSystem,
    scenes: Vec<Scene>,
}

/// Scene, band, row and column indices selected by a request
struct Selection {
    scenes: Vec<usize>,
    bands: Vec<usize>,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl MemorySource {
    pub fn new(
        collection: impl Into<String>,
        bands: Vec<String>,
        y: Vec<f64>,
        x: Vec<f64>,
        crs: CoordinateSystem,
    ) -> Self {
        Self { collection: collection.into(), bands, y, x, crs, scenes: Vec::new() }
    }

    pub fn add_scene(&mut self, scene: Scene) -> ScaResult<()> {
        let expected = (self.bands.len(), self.y.len(), self.x.len());
        if scene.data.dim() != expected {
            return Err(ScaError::InvalidFormat(format!(
                "Scene at {} has shape {:?}, expected {:?}",
                scene.time,
                scene.data.dim(),
                expected
            )));
        }
        if self.scenes.iter().any(|s| s.time == scene.time) {
            return Err(ScaError::InvalidFormat(format!("Duplicate scene time {}", scene.time)));
        }
        self.scenes.push(scene);
        self.scenes.sort_by_key(|s| s.time);
        Ok(())
    }

    fn select(&self, request: &LoadRequest) -> ScaResult<Selection> {
        if request.collection != self.collection {
            return Err(ScaError::Processing(format!(
                "Unknown collection '{}' (source serves '{}')",
                request.collection, self.collection
            )));
        }

        let scenes: Vec<usize> = self
            .scenes
            .iter()
            .enumerate()
            .filter(|(_, s)| request.temporal_extent.map_or(true, |e| e.contains(s.time)))
            .filter(|(_, s)| request.properties.iter().all(|f| f.matches(&s.properties)))
            .map(|(i, _)| i)
            .collect();

        let bands = match &request.bands {
            Some(wanted) => wanted
                .iter()
                .map(|b| {
                    self.bands
                        .iter()
                        .position(|have| have == b)
                        .ok_or_else(|| ScaError::Processing(format!("Band '{}' not in collection", b)))
                })
                .collect::<ScaResult<Vec<_>>>()?,
            None => (0..self.bands.len()).collect(),
        };

        let (rows, cols): (Vec<usize>, Vec<usize>) = match &request.spatial_extent {
            Some(bbox) => (
                (0..self.y.len()).filter(|&i| self.y[i] >= bbox.south && self.y[i] <= bbox.north).collect(),
                (0..self.x.len()).filter(|&i| self.x[i] >= bbox.west && self.x[i] <= bbox.east).collect(),
            ),
            None => ((0..self.y.len()).collect(), (0..self.x.len()).collect()),
        };

        if scenes.is_empty() || rows.is_empty() || cols.is_empty() {
            return Err(ScaError::Processing(format!(
                "Request selects nothing: {} scenes, {} rows, {} cols",
                scenes.len(),
                rows.len(),
                cols.len()
            )));
        }
        Ok(Selection { scenes, bands, rows, cols })
    }
}

impl CubeSource for MemorySource {
    fn describe(&self, request: &LoadRequest) -> ScaResult<CubeMetadata> {
        let sel = self.select(request)?;
        Ok(CubeMetadata {
            times: sel.scenes.iter().map(|&i| self.scenes[i].time).collect(),
            bands: sel.bands.iter().map(|&i| self.bands[i].clone()).collect(),
            y: sel.rows.iter().map(|&i| self.y[i]).collect(),
            x: sel.cols.iter().map(|&i| self.x[i]).collect(),
            crs: self.crs,
        })
    }

    fn load(&self, request: &LoadRequest, cancel: &CancelToken) -> ScaResult<DataCube> {
        let sel = self.select(request)?;
        log::info!(
            "Loading {} scene(s) of '{}' ({} bands, {}x{} cells)",
            sel.scenes.len(),
            self.collection,
            sel.bands.len(),
            sel.rows.len(),
            sel.cols.len()
        );

        let mut data = Array4::<CubeValue>::zeros((sel.scenes.len(), sel.bands.len(), sel.rows.len(), sel.cols.len()));
        for (t, &scene_idx) in sel.scenes.iter().enumerate() {
            cancel.check()?;
            let scene = &self.scenes[scene_idx].data;
            let subset = scene.select(Axis(0), &sel.bands).select(Axis(1), &sel.rows).select(Axis(2), &sel.cols);
            data.index_axis_mut(Axis(0), t).assign(&subset);
        }

        DataCube::new(
            data,
            sel.scenes.iter().map(|&i| self.scenes[i].time).collect(),
            sel.bands.iter().map(|&i| self.bands[i].clone()).collect(),
            sel.rows.iter().map(|&i| self.y[i]).collect(),
            sel.cols.iter().map(|&i| self.x[i]).collect(),
            self.crs,
        )
    }
}

/// Deferred cube: metadata is resolved eagerly, pixels on first `materialize`
pub struct LazyCube {
    source: Arc<dyn CubeSource>,
    request: LoadRequest,
    metadata: CubeMetadata,
    cache: Mutex<Option<Arc<DataCube>>>,
}

impl LazyCube {
    pub fn new(source: Arc<dyn CubeSource>, request: LoadRequest) -> ScaResult<Self> {
        let metadata = source.describe(&request)?;
        log::debug!("Lazy cube for '{}' with shape {:?}", request.collection, metadata.shape());
        Ok(Self { source, request, metadata, cache: Mutex::new(None) })
    }

    pub fn metadata(&self) -> &CubeMetadata {
        &self.metadata
    }

    pub fn request(&self) -> &LoadRequest {
        &self.request
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Load once and cache; later calls return the cached cube
    pub fn materialize(&self, cancel: &CancelToken) -> ScaResult<Arc<DataCube>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| ScaError::Processing("Lazy cube cache lock poisoned".to_string()))?;
        if let Some(cube) = cache.as_ref() {
            return Ok(Arc::clone(cube));
        }

        cancel.check()?;
        let cube = Arc::new(self.source.load(&self.request, cancel)?);
        if cube.dim() != self.metadata.shape() {
            return Err(ScaError::Processing(format!(
                "Source loaded shape {:?} but described {:?}",
                cube.dim(),
                self.metadata.shape()
            )));
        }
        *cache = Some(Arc::clone(&cube));
        Ok(cube)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source() -> MemorySource {
        let mut src = MemorySource::new(
            "SENTINEL2_L2A",
            vec!["B03".into(), "B11".into(), "SCL".into()],
            vec![46.9, 46.8],
            vec![11.0, 11.1, 11.2],
            CoordinateSystem::Geographic,
        );
        let t0 = Utc.with_ymd_and_hms(2018, 2, 1, 0, 0, 0).unwrap();
        for (i, cloud) in [10.0, 95.0, 40.0].iter().enumerate() {
            src.add_scene(Scene {
                time: t0 + Duration::days(5 * i as i64),
                properties: [("eo:cloud_cover".to_string(), *cloud)].into_iter().collect(),
                data: Array3::from_elem((3, 2, 3), i as f32),
            })
            .unwrap();
        }
        src
    }

    struct CountingSource {
        inner: MemorySource,
        loads: AtomicUsize,
    }

    impl CubeSource for CountingSource {
        fn describe(&self, request: &LoadRequest) -> ScaResult<CubeMetadata> {
            self.inner.describe(request)
        }

        fn load(&self, request: &LoadRequest, cancel: &CancelToken) -> ScaResult<DataCube> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(request, cancel)
        }
    }

    #[test]
    fn test_property_filter_on_cloud_cover() {
        let request = LoadRequest::new("SENTINEL2_L2A")
            .with_bands(["B03", "B11"])
            .with_property(PropertyFilter::new("eo:cloud_cover", Comparison::Lte, 90.0));
        let meta = source().describe(&request).unwrap();
        assert_eq!(meta.shape(), (2, 2, 2, 3));

        let cube = source().load(&request, &CancelToken::new()).unwrap();
        assert_eq!(cube.band("B11").unwrap()[[1, 0, 0]], 2.0);
    }

    #[test]
    fn test_missing_property_never_matches() {
        let filter = PropertyFilter::new("eo:cloud_cover", Comparison::Lt, 50.0);
        assert!(!filter.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_spatial_and_temporal_extent() {
        let request = LoadRequest::new("SENTINEL2_L2A")
            .with_spatial_extent(BoundingBox::new(11.05, 46.75, 11.25, 46.85).unwrap())
            .with_temporal_extent(TemporalExtent::parse("2018-02-02", "2018-02-12").unwrap());
        let meta = source().describe(&request).unwrap();
        assert_eq!(meta.shape(), (2, 3, 1, 2));
        assert_eq!(meta.x, vec![11.1, 11.2]);
    }

    #[test]
    fn test_extent_outside_grid_selects_nothing() {
        let request = LoadRequest::new("SENTINEL2_L2A")
            .with_spatial_extent(BoundingBox::new(12.0, 47.0, 12.5, 47.5).unwrap());
        let err = source().describe(&request).unwrap_err();
        assert!(err.to_string().contains("0 rows"));
    }

    #[test]
    fn test_unknown_collection() {
        assert!(source().describe(&LoadRequest::new("LANDSAT")).is_err());
    }

    #[test]
    fn test_lazy_cube_loads_once() {
        let counting = Arc::new(CountingSource { inner: source(), loads: AtomicUsize::new(0) });
        let lazy = LazyCube::new(counting.clone(), LoadRequest::new("SENTINEL2_L2A")).unwrap();

        assert_eq!(lazy.metadata().shape(), (3, 3, 2, 3));
        assert!(!lazy.is_loaded());

        let cancel = CancelToken::new();
        let first = lazy.materialize(&cancel).unwrap();
        let second = lazy.materialize(&cancel).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counting.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_materialize_canceled() {
        let lazy = LazyCube::new(Arc::new(source()), LoadRequest::new("SENTINEL2_L2A")).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(lazy.materialize(&cancel), Err(ScaError::Canceled)));
        assert!(!lazy.is_loaded());
    }
}
