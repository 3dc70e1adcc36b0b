//! Region geometries and their rasterization onto cube grids
//!
//! Shapes are `geo` types; containment and bounding rectangles come from the
//! `geo` algorithms. A buffered station is kept as a centre and radius so the
//! disc test stays exact.

use crate::types::{BoundingBox, CoordinateSystem, ScaError, ScaResult};
use geo::{BoundingRect, Contains, Coord, EuclideanDistance, LineString, Rect};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub use geo::{MultiPolygon, Point, Polygon};

/// Build a polygon from `(x, y)` rings. Rings may be open or closed.
pub fn polygon(exterior: Vec<(f64, f64)>, holes: Vec<Vec<(f64, f64)>>) -> ScaResult<Polygon> {
    for ring in std::iter::once(&exterior).chain(holes.iter()) {
        let distinct = if ring.len() > 1 && ring.first() == ring.last() {
            ring.len() - 1
        } else {
            ring.len()
        };
        if distinct < 3 {
            return Err(ScaError::InvalidFormat(format!(
                "Polygon ring needs at least 3 distinct vertices, got {}",
                distinct
            )));
        }
        if ring.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(ScaError::InvalidFormat("Polygon ring has non-finite vertices".to_string()));
        }
    }
    Ok(Polygon::new(
        LineString::from(exterior),
        holes.into_iter().map(LineString::from).collect(),
    ))
}

pub fn rectangle(bbox: &BoundingBox) -> Polygon {
    Rect::new(
        Coord { x: bbox.west, y: bbox.south },
        Coord { x: bbox.east, y: bbox.north },
    )
    .to_polygon()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Point),
    Polygon(Polygon),
    MultiPolygon(MultiPolygon),
    /// Disc around a point, e.g. a buffered station location
    Buffer { centre: Point, radius: f64 },
}

impl Geometry {
    pub fn buffer(centre: Point, radius: f64) -> ScaResult<Self> {
        if !(radius.is_finite() && radius >= 0.0) {
            return Err(ScaError::InvalidFormat(format!("Invalid buffer radius {}", radius)));
        }
        Ok(Geometry::Buffer { centre, radius })
    }

    /// Whether `p` lies inside the area of this geometry. Points have no area.
    pub fn contains(&self, p: &Point) -> bool {
        match self {
            Geometry::Point(_) => false,
            Geometry::Polygon(poly) => poly.contains(p),
            Geometry::MultiPolygon(polys) => polys.0.iter().any(|poly| poly.contains(p)),
            Geometry::Buffer { centre, radius } => centre.euclidean_distance(p) <= *radius,
        }
    }

    fn bounding_rect(&self) -> Option<Rect> {
        match self {
            Geometry::Point(p) => Some(p.bounding_rect()),
            Geometry::Polygon(poly) => poly.bounding_rect(),
            Geometry::MultiPolygon(polys) => polys.bounding_rect(),
            Geometry::Buffer { centre, radius } => Some(Rect::new(
                Coord { x: centre.x() - radius, y: centre.y() - radius },
                Coord { x: centre.x() + radius, y: centre.y() + radius },
            )),
        }
    }

    /// Envelope of the geometry; an empty geometry gives an inverted infinite box
    pub fn bounding_box(&self) -> BoundingBox {
        match self.bounding_rect() {
            Some(rect) => BoundingBox {
                west: rect.min().x,
                south: rect.min().y,
                east: rect.max().x,
                north: rect.max().y,
            },
            None => BoundingBox {
                west: f64::INFINITY,
                south: f64::INFINITY,
                east: f64::NEG_INFINITY,
                north: f64::NEG_INFINITY,
            },
        }
    }

    /// Representative point used when the geometry covers no cell centre
    fn anchor(&self) -> Option<Point> {
        match self {
            Geometry::Point(p) => Some(*p),
            Geometry::Buffer { centre, .. } => Some(*centre),
            _ => None,
        }
    }

    /// Grid cells `(row, col)` whose centre lies inside the geometry.
    ///
    /// Points, and buffers too small to cover any cell centre, fall back to the
    /// single cell whose extent contains the point. A single-label axis takes
    /// its cell size from the other axis; a 1x1 grid only matches its centre.
    pub fn rasterize(&self, y: &[f64], x: &[f64]) -> Vec<(usize, usize)> {
        let bbox = self.bounding_box();
        let cols: Vec<usize> = (0..x.len()).filter(|&c| x[c] >= bbox.west && x[c] <= bbox.east).collect();
        let mut cells = Vec::new();
        for (row, &yc) in y.iter().enumerate() {
            if yc < bbox.south || yc > bbox.north {
                continue;
            }
            for &col in &cols {
                if self.contains(&Point::new(x[col], yc)) {
                    cells.push((row, col));
                }
            }
        }

        if cells.is_empty() {
            if let Some(anchor) = self.anchor() {
                let step_y = axis_step(y).or_else(|| axis_step(x)).unwrap_or(0.0);
                let step_x = axis_step(x).or_else(|| axis_step(y)).unwrap_or(0.0);
                if let (Some(row), Some(col)) =
                    (containing_index(y, anchor.y(), step_y), containing_index(x, anchor.x(), step_x))
                {
                    cells.push((row, col));
                }
            }
        }
        cells
    }
}

fn axis_step(coords: &[f64]) -> Option<f64> {
    match coords {
        [a, b, ..] => Some((b - a).abs()),
        _ => None,
    }
}

/// Index of the cell of width `step` centred on a label whose extent contains `v`
fn containing_index(coords: &[f64], v: f64, step: f64) -> Option<usize> {
    let half = step / 2.0;
    coords
        .iter()
        .enumerate()
        .map(|(i, &c)| (i, (c - v).abs()))
        .filter(|&(_, d)| d <= half)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// A named geometry in a given coordinate system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub crs: CoordinateSystem,
}

impl Region {
    pub fn new(id: impl Into<String>, geometry: Geometry, crs: CoordinateSystem) -> Self {
        Self { id: id.into(), geometry, crs }
    }

    /// Rasterize onto a grid in `grid_crs`; the coordinate systems must match
    pub fn cells_on(&self, y: &[f64], x: &[f64], grid_crs: CoordinateSystem) -> ScaResult<Vec<(usize, usize)>> {
        if self.crs != grid_crs {
            return Err(ScaError::Processing(format!(
                "Region '{}' is in EPSG:{} but the grid is in EPSG:{}",
                self.id,
                self.crs.epsg(),
                grid_crs.epsg()
            )));
        }
        Ok(self.geometry.rasterize(y, x))
    }

    /// Boolean `(y, x)` mask, true inside the region
    pub fn inside_mask(&self, y: &[f64], x: &[f64], grid_crs: CoordinateSystem) -> ScaResult<Array2<bool>> {
        let mut mask = Array2::from_elem((y.len(), x.len()), false);
        for (row, col) in self.cells_on(y, x, grid_crs)? {
            mask[[row, col]] = true;
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Vec<(f64, f64)> {
        vec![(x0, y0), (x0 + size, y0), (x0 + size, y0 + size), (x0, y0 + size), (x0, y0)]
    }

    #[test]
    fn test_polygon_with_hole() {
        let poly = polygon(square(0.0, 0.0, 10.0), vec![square(4.0, 4.0, 2.0)]).unwrap();
        let geometry = Geometry::Polygon(poly);
        assert!(geometry.contains(&Point::new(1.0, 1.0)));
        assert!(!geometry.contains(&Point::new(5.0, 5.0)));
        assert!(!geometry.contains(&Point::new(11.0, 5.0)));
    }

    #[test]
    fn test_degenerate_ring_rejected() {
        assert!(polygon(vec![(0.0, 0.0), (1.0, 1.0), (0.0, 0.0)], vec![]).is_err());
        assert!(polygon(vec![(0.0, 0.0), (1.0, f64::NAN), (1.0, 1.0)], vec![]).is_err());
    }

    #[test]
    fn test_multipolygon_and_bbox() {
        let a = polygon(square(0.0, 0.0, 1.0), vec![]).unwrap();
        let b = polygon(square(5.0, 5.0, 1.0), vec![]).unwrap();
        let geometry = Geometry::MultiPolygon(MultiPolygon::new(vec![a, b]));
        assert!(geometry.contains(&Point::new(5.5, 5.5)));
        assert!(!geometry.contains(&Point::new(3.0, 3.0)));

        let bbox = geometry.bounding_box();
        assert_eq!((bbox.west, bbox.south, bbox.east, bbox.north), (0.0, 0.0, 6.0, 6.0));
    }

    #[test]
    fn test_rasterize_polygon() {
        let geometry = Geometry::Polygon(polygon(square(0.0, 0.0, 2.0), vec![]).unwrap());
        let x = vec![0.5, 1.5, 2.5, 3.5];
        let y = vec![3.5, 2.5, 1.5, 0.5];
        let mut cells = geometry.rasterize(&y, &x);
        cells.sort();
        assert_eq!(cells, vec![(2, 0), (2, 1), (3, 0), (3, 1)]);
    }

    #[test]
    fn test_small_buffer_falls_back_to_containing_cell() {
        let geometry = Geometry::buffer(Point::new(1.2, 2.7), 0.1).unwrap();
        let x = vec![0.5, 1.5, 2.5];
        let y = vec![2.5, 1.5, 0.5];
        assert_eq!(geometry.rasterize(&y, &x), vec![(0, 1)]);

        let off_grid = Geometry::buffer(Point::new(10.0, 10.0), 0.1).unwrap();
        assert!(off_grid.rasterize(&y, &x).is_empty());
    }

    #[test]
    fn test_single_row_grid_rejects_far_points() {
        // one row at y = 0.5, columns 1 unit wide
        let y = vec![0.5];
        let x = vec![0.5, 1.5, 2.5];
        let on_row = Geometry::Point(Point::new(1.4, 0.9));
        assert_eq!(on_row.rasterize(&y, &x), vec![(0, 1)]);

        let far_north = Geometry::Point(Point::new(1.4, 50.0));
        assert!(far_north.rasterize(&y, &x).is_empty());
        let far_buffer = Geometry::buffer(Point::new(1.4, -20.0), 0.1).unwrap();
        assert!(far_buffer.rasterize(&y, &x).is_empty());
    }

    #[test]
    fn test_single_cell_grid_matches_only_its_centre() {
        let y = vec![0.5];
        let x = vec![0.5];
        assert_eq!(Geometry::buffer(Point::new(0.5, 0.5), 0.0).unwrap().rasterize(&y, &x), vec![(0, 0)]);
        assert!(Geometry::Point(Point::new(3.0, 0.5)).rasterize(&y, &x).is_empty());
    }

    #[test]
    fn test_region_crs_mismatch() {
        let region = Region::new("station", Geometry::Point(Point::new(0.5, 0.5)), CoordinateSystem::Geographic);
        let result = region.cells_on(&[0.5], &[0.5], CoordinateSystem::Projected { epsg: 32632 });
        assert!(result.is_err());
    }
}
