//! snowcube: Snow Covered Area processing for Sentinel-2 data cubes
//!
//! Computes the Normalized Difference Snow Index from multi-temporal cubes,
//! classifies snow, masks clouds and catchment outlines, aggregates per region
//! into time series, and validates the result against in-situ snow stations.

pub mod core;
pub mod io;
pub mod types;

// Re-export main types
pub use types::{
    class, BoundingBox, CancelToken, ClassRaster, Comparison, CoordinateSystem, DataCube, GeoTransform, ScaError,
    ScaResult, TemporalExtent,
};

pub use crate::core::{
    AggregateTable, BandFormula, ConfusionMatrix, CountLegend, Geometry, GroundTruth, MaskCompositor, Reducer, Region,
    ScaConfig, ScaPipeline, SpatialAggregator, StationValidation, ThresholdClassifier, TimeSeries,
};
pub use crate::io::{AggregateExport, ExportSchema, JobPoller, LazyCube, LoadRequest, MemorySource, StationReader};

#[cfg(feature = "python")]
mod bindings {
    use crate::core::validation::confusion_from_values;
    use crate::core::{band_math, ThresholdClassifier};
    use crate::io::{AggregateExport, ExportSchema};
    use crate::types::{CoordinateSystem, DataCube, ScaError};
    use chrono::{TimeZone, Utc};
    use ndarray::{Array2, Axis};
    use numpy::{PyReadonlyArray2, ToPyArray};
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    fn to_py_err(e: ScaError) -> PyErr {
        match e {
            ScaError::Formula(_) | ScaError::Schema(_) | ScaError::InvalidFormat(_) | ScaError::Json(_) => {
                PyErr::new::<PyValueError, _>(format!("{}", e))
            }
            other => PyErr::new::<PyRuntimeError, _>(format!("{}", other)),
        }
    }

    /// Wrap 2D bands as a single-timestep cube on an index grid
    fn cube_from_arrays(bands: Vec<(&str, Array2<f32>)>) -> Result<DataCube, ScaError> {
        let (ny, nx) = bands.first().map(|(_, a)| a.dim()).unwrap_or((0, 0));
        let t0 = Utc.timestamp_opt(0, 0).single().ok_or_else(|| ScaError::Processing("epoch".to_string()))?;
        DataCube::from_bands(
            vec![t0],
            (0..ny).map(|i| i as f64).collect(),
            (0..nx).map(|i| i as f64).collect(),
            CoordinateSystem::Geographic,
            bands.into_iter().map(|(name, a)| (name.to_string(), a.insert_axis(Axis(0)))).collect(),
        )
    }

    /// (a - b) / (a + b) per cell; undefined cells are NaN
    #[pyfunction]
    fn normalized_difference(py: Python, a: PyReadonlyArray2<f32>, b: PyReadonlyArray2<f32>) -> PyResult<PyObject> {
        let cube = cube_from_arrays(vec![("a", a.as_array().to_owned()), ("b", b.as_array().to_owned())])
            .map_err(to_py_err)?;
        let nd = band_math::normalized_difference(&cube, "a", "b", "nd").map_err(to_py_err)?;
        let layer = nd.data().index_axis(Axis(0), 0).index_axis(Axis(0), 0).to_owned();
        Ok(layer.to_pyarray(py).into())
    }

    /// Binary snow classes: 1 where value > cutoff, 0 otherwise, 254 for NaN
    #[pyfunction]
    fn classify_threshold(py: Python, values: PyReadonlyArray2<f32>, cutoff: f64) -> PyResult<PyObject> {
        let classifier = ThresholdClassifier::binary(cutoff).map_err(to_py_err)?;
        let values = values.as_array().to_owned().insert_axis(Axis(0));
        let classes = classifier.classify_array(values.view());
        Ok(classes.index_axis(Axis(0), 0).to_owned().to_pyarray(py).into())
    }

    /// Decode an aggregate export into `{region: {"time": [...], key: [...]}}`
    #[pyfunction]
    fn parse_aggregate_export(py: Python, json: &str, keys: Vec<String>, regions: Vec<String>) -> PyResult<PyObject> {
        let schema = ExportSchema::new(keys).map_err(to_py_err)?;
        let export = AggregateExport::parse(json, &schema, &regions).map_err(to_py_err)?;

        let result = PyDict::new(py);
        for region in export.regions() {
            let Some(series) = export.series(region) else {
                continue;
            };
            let columns = PyDict::new(py);
            let times: Vec<String> = series.times().iter().map(|t| t.to_rfc3339()).collect();
            columns.set_item("time", times)?;
            for key in schema.keys() {
                columns.set_item(key, series.column(key).map_err(to_py_err)?)?;
            }
            result.set_item(region, columns)?;
        }
        Ok(result.into())
    }

    /// Confusion matrix and accuracy of aligned truth labels and derived snow map
    /// medians. Derived values follow `derived_label`, so cloud and NaN are missing.
    #[pyfunction]
    fn validation_metrics(py: Python, truth: Vec<Option<f64>>, derived: Vec<Option<f64>>) -> PyResult<PyObject> {
        if truth.len() != derived.len() {
            return Err(PyErr::new::<PyValueError, _>(format!(
                "Label lists differ in length: {} vs {}",
                truth.len(),
                derived.len()
            )));
        }

        let (matrix, missing) = confusion_from_values(&truth, &derived);

        let result = PyDict::new(py);
        result.set_item("true_snow", matrix.true_snow)?;
        result.set_item("false_snow", matrix.false_snow)?;
        result.set_item("true_no_snow", matrix.true_no_snow)?;
        result.set_item("false_no_snow", matrix.false_no_snow)?;
        result.set_item("missing", missing)?;
        result.set_item("accuracy", matrix.accuracy())?;
        Ok(result.into())
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(normalized_difference, m)?)?;
        m.add_function(wrap_pyfunction!(classify_threshold, m)?)?;
        m.add_function(wrap_pyfunction!(parse_aggregate_export, m)?)?;
        m.add_function(wrap_pyfunction!(validation_metrics, m)?)?;
        Ok(())
    }
}
