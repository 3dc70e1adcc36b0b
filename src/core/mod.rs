//! Core snow cover processing modules

pub mod aggregate;
pub mod band_math;
pub mod classify;
pub mod geometry;
pub mod masking;
pub mod metadata;
pub mod operators;
pub mod pipeline;
pub mod reproject;
pub mod timeseries;
pub mod validation;

// Re-export main types
pub use aggregate::{AggregateRecord, AggregateTable, CountLegend, Reducer, SpatialAggregator, Statistic};
pub use band_math::{ndsi, normalized_difference, BandFormula};
pub use classify::{reduce_time_median, ThresholdClassifier, ThresholdRule};
pub use geometry::{polygon, rectangle, Geometry, MultiPolygon, Point, Polygon, Region};
pub use masking::{scl_cloud_mask, MaskCompositor, MaskLayer};
pub use metadata::{ProductMetadata, Provider};
pub use operators::{Period, ReduceOp};
pub use pipeline::{ScaConfig, ScaPipeline};
pub use timeseries::TimeSeries;
pub use validation::{
    compare, confusion_from_values, derived_label, truth_label, ConfusionMatrix, GroundTruth, StationValidation,
};
