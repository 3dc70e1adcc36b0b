use crate::core::geometry::Region;
use crate::types::{class, ClassRaster, DataCube, ScaError, ScaResult};
use ndarray::{Array2, Array3, Axis, Zip};

/// Boolean mask paired with the class it forces onto masked cells
#[derive(Debug, Clone)]
pub struct MaskLayer {
    /// `(time, y, x)` mask, true where the override applies
    pub mask: Array3<bool>,
    pub class: u8,
}

/// Composes class rasters with ordered override masks.
///
/// Layers are applied in insertion order, so a later layer overwrites an earlier
/// one where both are set. The region outline is applied after every layer and
/// marks cells outside it as [`class::OUTSIDE`].
#[derive(Debug, Clone, Default)]
pub struct MaskCompositor {
    layers: Vec<MaskLayer>,
    region: Option<Array2<bool>>,
}

impl MaskCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, mask: Array3<bool>, class: u8) -> Self {
        self.layers.push(MaskLayer { mask, class });
        self
    }

    /// Restrict to a `(y, x)` inside-mask
    pub fn with_region_mask(mut self, inside: Array2<bool>) -> Self {
        self.region = Some(inside);
        self
    }

    /// Restrict to a region outline rasterized on the grid of `raster`
    pub fn with_region(self, region: &Region, raster: &ClassRaster) -> ScaResult<Self> {
        let inside = region.inside_mask(raster.y(), raster.x(), raster.crs())?;
        Ok(self.with_region_mask(inside))
    }

    pub fn layers(&self) -> &[MaskLayer] {
        &self.layers
    }

    pub fn compose(&self, base: &ClassRaster) -> ScaResult<ClassRaster> {
        let (nt, ny, nx) = base.dim();
        log::info!(
            "Composing {} mask layer(s) over {}x{}x{} class raster",
            self.layers.len(),
            nt,
            ny,
            nx
        );

        let mut data = base.data().clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.mask.dim() != base.dim() {
                return Err(ScaError::Processing(format!(
                    "Mask layer {} has shape {:?}, expected {:?}",
                    i,
                    layer.mask.dim(),
                    base.dim()
                )));
            }
            if layer.class == class::OUTSIDE || layer.class == class::NO_DATA {
                return Err(ScaError::Processing(format!(
                    "Class {} is reserved and cannot be forced by mask layer {}",
                    layer.class, i
                )));
            }
            let class_code = layer.class;
            Zip::from(&mut data).and(&layer.mask).for_each(|c, &m| {
                if m {
                    *c = class_code;
                }
            });
            log::debug!(
                "Layer {} forced class {} on {} cells",
                i,
                class_code,
                layer.mask.iter().filter(|&&m| m).count()
            );
        }

        if let Some(inside) = &self.region {
            if inside.dim() != (ny, nx) {
                return Err(ScaError::Processing(format!(
                    "Region mask has shape {:?}, expected {:?}",
                    inside.dim(),
                    (ny, nx)
                )));
            }
            for mut layer in data.axis_iter_mut(Axis(0)) {
                Zip::from(&mut layer).and(inside).for_each(|c, &is_inside| {
                    if !is_inside {
                        *c = class::OUTSIDE;
                    }
                });
            }
        }

        base.with_data(data)
    }
}

/// Cloud mask from a scene classification band: true where the rounded value is one
/// of `classes`. NaN cells are never cloud.
pub fn scl_cloud_mask(cube: &DataCube, band: &str, classes: &[u8]) -> ScaResult<Array3<bool>> {
    let scl = cube.band(band)?;
    let mask = scl.mapv(|v| !v.is_nan() && classes.iter().any(|&c| v.round() == c as f32));
    log::info!(
        "Cloud mask from '{}' classes {:?}: {} of {} cells",
        band,
        classes,
        mask.iter().filter(|&&m| m).count(),
        mask.len()
    );
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{polygon, Geometry};
    use crate::types::CoordinateSystem;
    use chrono::{TimeZone, Utc};

    fn raster(values: Vec<u8>, ny: usize, nx: usize) -> ClassRaster {
        let t0 = Utc.with_ymd_and_hms(2018, 2, 1, 0, 0, 0).unwrap();
        ClassRaster::new(
            Array3::from_shape_vec((1, ny, nx), values).unwrap(),
            vec![t0],
            (0..ny).rev().map(|i| i as f64 + 0.5).collect(),
            (0..nx).map(|i| i as f64 + 0.5).collect(),
            CoordinateSystem::Geographic,
        )
        .unwrap()
    }

    #[test]
    fn test_cloud_overrides_classification() {
        let base = raster(vec![1, 1, 0, 0], 1, 4);
        let cloud = Array3::from_shape_vec((1, 1, 4), vec![true, false, true, false]).unwrap();
        let result = MaskCompositor::new().with_layer(cloud, class::CLOUD).compose(&base).unwrap();
        assert_eq!(result.data().as_slice().unwrap(), &[2, 1, 2, 0]);
    }

    #[test]
    fn test_layer_order_matters() {
        let base = raster(vec![0, 0, 0], 1, 3);
        let a = Array3::from_shape_vec((1, 1, 3), vec![true, true, false]).unwrap();
        let b = Array3::from_shape_vec((1, 1, 3), vec![false, true, true]).unwrap();

        let ab = MaskCompositor::new()
            .with_layer(a.clone(), class::SNOW)
            .with_layer(b.clone(), class::CLOUD)
            .compose(&base)
            .unwrap();
        let ba = MaskCompositor::new()
            .with_layer(b, class::CLOUD)
            .with_layer(a, class::SNOW)
            .compose(&base)
            .unwrap();

        assert_eq!(ab.data().as_slice().unwrap(), &[1, 2, 2]);
        assert_eq!(ba.data().as_slice().unwrap(), &[1, 1, 2]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_outside_applied_last() {
        let base = raster(vec![1, 1, 1, 1], 2, 2);
        let cloud = Array3::from_elem((1, 2, 2), true);
        let region = Region::new(
            "left-column",
            Geometry::Polygon(
                polygon(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 2.0), (0.0, 2.0)], vec![])
                .unwrap(),
            ),
            CoordinateSystem::Geographic,
        );

        let result = MaskCompositor::new()
            .with_layer(cloud, class::CLOUD)
            .with_region(&region, &base)
            .unwrap()
            .compose(&base)
            .unwrap();
        assert_eq!(result.data().as_slice().unwrap(), &[2, class::OUTSIDE, 2, class::OUTSIDE]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let base = raster(vec![0, 0, 0], 1, 3);
        let mask = Array3::from_elem((1, 1, 2), true);
        assert!(MaskCompositor::new().with_layer(mask, class::CLOUD).compose(&base).is_err());
    }

    #[test]
    fn test_reserved_classes_rejected_as_layers() {
        let base = raster(vec![0, 1], 1, 2);
        for reserved in [class::NO_DATA, class::OUTSIDE] {
            let mask = Array3::from_elem((1, 1, 2), true);
            assert!(MaskCompositor::new().with_layer(mask, reserved).compose(&base).is_err());
        }
    }

    #[test]
    fn test_scl_cloud_mask() {
        let t0 = Utc.with_ymd_and_hms(2018, 2, 1, 0, 0, 0).unwrap();
        let scl = Array3::from_shape_vec((1, 1, 5), vec![3.0, 4.0, 8.0, 9.0, f32::NAN]).unwrap();
        let cube = DataCube::from_bands(
            vec![t0],
            vec![0.5],
            (0..5).map(|i| i as f64).collect(),
            CoordinateSystem::Geographic,
            vec![("SCL".to_string(), scl)],
        )
        .unwrap();

        let mask = scl_cloud_mask(&cube, "SCL", &[3, 8, 9]).unwrap();
        assert_eq!(mask.as_slice().unwrap(), &[true, false, true, true, false]);
    }
}
