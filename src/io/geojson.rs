//! GeoJSON region interchange (catchment outlines, station points)

use crate::core::geometry::{polygon, Geometry, MultiPolygon, Point, Polygon, Region};
use geo::LineString;
use crate::types::{CoordinateSystem, ScaError, ScaResult};
use serde_json::{json, Value};
use std::path::Path;

/// Vertices used when a buffer is written as a polygon
const BUFFER_SEGMENTS: usize = 32;

fn position_from(value: &Value) -> ScaResult<(f64, f64)> {
    let coords = value
        .as_array()
        .filter(|c| c.len() >= 2)
        .ok_or_else(|| ScaError::InvalidFormat(format!("Invalid GeoJSON position {}", value)))?;
    match (coords[0].as_f64(), coords[1].as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(ScaError::InvalidFormat(format!("Non-numeric GeoJSON position {}", value))),
    }
}

fn ring_from(value: &Value) -> ScaResult<Vec<(f64, f64)>> {
    value
        .as_array()
        .ok_or_else(|| ScaError::InvalidFormat("GeoJSON ring is not an array".to_string()))?
        .iter()
        .map(position_from)
        .collect()
}

fn polygon_from(value: &Value) -> ScaResult<Polygon> {
    let rings = value
        .as_array()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ScaError::InvalidFormat("GeoJSON polygon has no rings".to_string()))?;
    let exterior = ring_from(&rings[0])?;
    let holes = rings[1..].iter().map(ring_from).collect::<ScaResult<Vec<_>>>()?;
    polygon(exterior, holes)
}

/// Parse a GeoJSON geometry object (Point, Polygon or MultiPolygon)
pub fn geometry_from_value(value: &Value) -> ScaResult<Geometry> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let coords = value
        .get("coordinates")
        .ok_or_else(|| ScaError::InvalidFormat(format!("GeoJSON {} geometry lacks coordinates", kind)))?;
    match kind {
        "Point" => {
            let (x, y) = position_from(coords)?;
            Ok(Geometry::Point(Point::new(x, y)))
        }
        "Polygon" => Ok(Geometry::Polygon(polygon_from(coords)?)),
        "MultiPolygon" => {
            let polygons = coords
                .as_array()
                .ok_or_else(|| ScaError::InvalidFormat("MultiPolygon coordinates are not an array".to_string()))?
                .iter()
                .map(polygon_from)
                .collect::<ScaResult<Vec<_>>>()?;
            Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
        }
        other => Err(ScaError::InvalidFormat(format!("Unsupported GeoJSON geometry type '{}'", other))),
    }
}

/// `geo` rings are stored closed
fn ring_value(ring: &LineString) -> Value {
    Value::Array(ring.coords().map(|c| json!([c.x, c.y])).collect())
}

fn polygon_coordinates(polygon: &Polygon) -> Value {
    Value::Array(
        std::iter::once(polygon.exterior())
            .chain(polygon.interiors().iter())
            .map(ring_value)
            .collect(),
    )
}

/// GeoJSON geometry object; buffers become regular polygons
pub fn geometry_to_value(geometry: &Geometry) -> Value {
    match geometry {
        Geometry::Point(p) => json!({ "type": "Point", "coordinates": [p.x(), p.y()] }),
        Geometry::Polygon(poly) => json!({ "type": "Polygon", "coordinates": polygon_coordinates(poly) }),
        Geometry::MultiPolygon(polys) => json!({
            "type": "MultiPolygon",
            "coordinates": polys.0.iter().map(polygon_coordinates).collect::<Vec<_>>(),
        }),
        Geometry::Buffer { centre, radius } => {
            let ring: LineString = (0..=BUFFER_SEGMENTS)
                .map(|i| {
                    let angle = 2.0 * std::f64::consts::PI * (i % BUFFER_SEGMENTS) as f64 / BUFFER_SEGMENTS as f64;
                    (centre.x() + radius * angle.cos(), centre.y() + radius * angle.sin())
                })
                .collect::<Vec<_>>()
                .into();
            json!({ "type": "Polygon", "coordinates": [ring_value(&ring)] })
        }
    }
}

/// Regions of a FeatureCollection, a single Feature or a bare geometry.
///
/// Region ids come from `id_property`, then the feature `id`, then the feature index.
pub fn parse_regions(json: &str, id_property: &str, crs: CoordinateSystem) -> ScaResult<Vec<Region>> {
    let document: Value = serde_json::from_str(json)?;
    let features: Vec<&Value> = match document.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => document
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| ScaError::InvalidFormat("FeatureCollection without features".to_string()))?
            .iter()
            .collect(),
        Some("Feature") => vec![&document],
        _ => {
            let geometry = geometry_from_value(&document)?;
            return Ok(vec![Region::new("0", geometry, crs)]);
        }
    };

    let regions = features
        .iter()
        .enumerate()
        .map(|(i, feature)| {
            let geometry = feature
                .get("geometry")
                .ok_or_else(|| ScaError::InvalidFormat(format!("Feature {} has no geometry", i)))?;
            let id = feature
                .get("properties")
                .and_then(|p| p.get(id_property))
                .or_else(|| feature.get("id"))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| i.to_string());
            Ok(Region::new(id, geometry_from_value(geometry)?, crs))
        })
        .collect::<ScaResult<Vec<_>>>()?;

    log::info!("Parsed {} region(s) from GeoJSON", regions.len());
    Ok(regions)
}

pub fn read_regions<P: AsRef<Path>>(path: P, id_property: &str, crs: CoordinateSystem) -> ScaResult<Vec<Region>> {
    log::debug!("Reading regions from {}", path.as_ref().display());
    let text = std::fs::read_to_string(path)?;
    parse_regions(&text, id_property, crs)
}

/// FeatureCollection with one feature per region and its id as a property
pub fn regions_to_value(regions: &[Region], id_property: &str) -> Value {
    let features: Vec<Value> = regions
        .iter()
        .map(|r| {
            let mut properties = serde_json::Map::new();
            properties.insert(id_property.to_string(), Value::String(r.id.clone()));
            json!({
                "type": "Feature",
                "properties": properties,
                "geometry": geometry_to_value(&r.geometry),
            })
        })
        .collect();
    json!({ "type": "FeatureCollection", "features": features })
}
