/*!
 * Product metadata side-record for published snow maps
 *
 * Records what a product covers (footprint, bounding box, time range), who made
 * it (providers), how it was made (processing history) and how to read it
 * (class legend, asset reference). Serialized as a STAC-style item.
 */

use crate::core::geometry::{rectangle, Geometry};
use crate::io::geojson::geometry_to_value;
use crate::types::{class, BoundingBox, ClassRaster, ScaError, ScaResult};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const STAC_VERSION: &str = "1.0.0";

/// Organisation or person involved in producing the data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub roles: Vec<String>,
}

impl Provider {
    pub fn processor(name: impl Into<String>, description: Option<String>) -> Self {
        Self { name: name.into(), description, roles: vec!["processor".to_string()] }
    }
}

/// One recorded processing step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStep {
    pub step_number: u32,
    pub step_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub id: String,
    pub bbox: BoundingBox,
    pub footprint: Geometry,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
    pub providers: Vec<Provider>,
    pub processing_history: Vec<ProcessingStep>,
    /// Class code to label
    pub legend: BTreeMap<u8, String>,
    pub no_data: Option<u8>,
    pub asset_href: String,
    pub processor_version: String,
}

/// Legend of the binary snow map with cloud as the no-data class
pub fn snow_legend() -> BTreeMap<u8, String> {
    [
        (class::NO_SNOW, "nosnow".to_string()),
        (class::SNOW, "snow".to_string()),
        (class::CLOUD, "cloud".to_string()),
    ]
    .into_iter()
    .collect()
}

/// Band description naming the legend, e.g. `SnowCoveredArea_0=nosnow_1=snow_2-nodatavalue=cloud`
pub fn legend_description(legend: &BTreeMap<u8, String>, no_data: Option<u8>) -> String {
    let entries: Vec<String> = legend
        .iter()
        .map(|(code, label)| {
            if Some(*code) == no_data {
                format!("{}-nodatavalue={}", code, label)
            } else {
                format!("{}={}", code, label)
            }
        })
        .collect();
    format!("SnowCoveredArea_{}", entries.join("_"))
}

/// `snowcover_<initials>_<date>` from an author name such as "Jane Doe"
pub fn item_id(author: &str, date: NaiveDate) -> String {
    let initials: String = author
        .split_whitespace()
        .map(|part| part.chars().take(2).collect::<String>())
        .collect::<String>()
        .to_lowercase();
    format!("snowcover_{}_{}", initials, date.format("%Y-%m-%d"))
}

impl ProductMetadata {
    /// Describe a snow map raster written to `asset_href`
    pub fn for_snow_map(raster: &ClassRaster, id: impl Into<String>, asset_href: impl Into<String>) -> ScaResult<Self> {
        let (start, end) = match (raster.times().first(), raster.times().last()) {
            (Some(s), Some(e)) => (*s, *e),
            _ => return Err(ScaError::Metadata("Snow map has no timestamps".to_string())),
        };
        let bbox = raster.bounding_box();
        Ok(Self {
            id: id.into(),
            bbox,
            footprint: Geometry::Polygon(rectangle(&bbox)),
            start_datetime: start,
            end_datetime: end,
            providers: Vec::new(),
            processing_history: Vec::new(),
            legend: snow_legend(),
            no_data: Some(class::CLOUD),
            asset_href: asset_href.into(),
            processor_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub fn with_temporal_extent(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_datetime = start;
        self.end_datetime = end;
        self
    }

    pub fn with_footprint(mut self, footprint: Geometry) -> Self {
        self.bbox = footprint.bounding_box();
        self.footprint = footprint;
        self
    }

    pub fn add_provider(&mut self, provider: Provider) {
        self.providers.push(provider);
    }

    pub fn record_step(&mut self, step_name: &str, parameters: BTreeMap<String, Value>) {
        let step_number = self.processing_history.len() as u32 + 1;
        self.processing_history.push(ProcessingStep {
            step_number,
            step_name: step_name.to_string(),
            timestamp: Utc::now(),
            parameters,
        });
        log::info!("Recorded processing step {}: {}", step_number, step_name);
    }

    pub fn description(&self) -> String {
        legend_description(&self.legend, self.no_data)
    }

    /// STAC-style item document
    pub fn to_item(&self) -> Value {
        let stamp = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
        json!({
            "type": "Feature",
            "stac_version": STAC_VERSION,
            "stac_extensions": [],
            "id": self.id,
            "geometry": geometry_to_value(&self.footprint),
            "bbox": self.bbox.to_array(),
            "properties": {
                "datetime": Value::Null,
                "start_datetime": stamp(&self.start_datetime),
                "end_datetime": stamp(&self.end_datetime),
                "providers": self.providers,
                "description": self.description(),
                "processing:software": { "snowcube": self.processor_version },
                "processing:history": self.processing_history,
            },
            "links": [],
            "assets": {
                "visual": {
                    "href": self.asset_href,
                    "type": "image/tiff; application=geotiff",
                    "title": "Snow coverage",
                    "roles": ["data"],
                }
            },
        })
    }

    pub fn export_json(&self) -> ScaResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_item())?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, output_path: P) -> ScaResult<()> {
        std::fs::write(output_path.as_ref(), self.export_json()?)?;
        log::info!("Metadata saved to: {}", output_path.as_ref().display());
        Ok(())
    }
}
