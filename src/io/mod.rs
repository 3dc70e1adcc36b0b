//! Input/output: sources, interchange formats and remote jobs

pub mod aggregate_json;
pub mod batch_job;
pub mod export;
pub mod geojson;
pub mod source;
pub mod stations;

pub use aggregate_json::{AggregateExport, ExportSchema};
pub use batch_job::{FailurePolicy, JobBackend, JobDescription, JobOutcome, JobPoller, JobStatus, OpenEoBackend, PollConfig};
pub use source::{CubeMetadata, CubeSource, LazyCube, LoadRequest, MemorySource, PropertyFilter, Scene};
pub use stations::{StationCsvConfig, StationMeta, StationReader};
