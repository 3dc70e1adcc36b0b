use crate::types::{class, ClassArray, ClassRaster, CubeValue, DataCube, ScaError, ScaResult};
use ndarray::{Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// A single threshold rule: cells with `value > cutoff` receive `class`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub cutoff: f64,
    pub class: u8,
}

impl ThresholdRule {
    pub fn new(cutoff: f64, class: u8) -> Self {
        Self { cutoff, class }
    }
}

/// Ordered threshold classifier.
///
/// Rules are kept sorted by descending cutoff; a cell gets the class of the first
/// rule whose cutoff it strictly exceeds, otherwise the default class. A value
/// exactly equal to a cutoff falls below it. NaN cells become [`class::NO_DATA`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdClassifier {
    rules: Vec<ThresholdRule>,
    default_class: u8,
}

impl ThresholdClassifier {
    pub fn new(mut rules: Vec<ThresholdRule>, default_class: u8) -> ScaResult<Self> {
        if rules.iter().any(|r| r.cutoff.is_nan()) {
            return Err(ScaError::Processing("Threshold cutoffs must not be NaN".to_string()));
        }
        let reserved = |c: u8| c == class::NO_DATA || c == class::OUTSIDE;
        if reserved(default_class) || rules.iter().any(|r| reserved(r.class)) {
            return Err(ScaError::Processing(format!(
                "Classes {} and {} are reserved for no-data and outside cells",
                class::NO_DATA,
                class::OUTSIDE
            )));
        }

        rules.sort_by(|a, b| b.cutoff.total_cmp(&a.cutoff));
        if rules.windows(2).any(|w| w[0].cutoff == w[1].cutoff) {
            return Err(ScaError::Processing("Duplicate threshold cutoff".to_string()));
        }

        Ok(Self { rules, default_class })
    }

    /// Snow / no-snow classifier: `value > cutoff` is snow
    pub fn binary(cutoff: f64) -> ScaResult<Self> {
        Self::new(vec![ThresholdRule::new(cutoff, class::SNOW)], class::NO_SNOW)
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    pub fn default_class(&self) -> u8 {
        self.default_class
    }

    pub fn classify_value(&self, value: f64) -> u8 {
        if value.is_nan() {
            return class::NO_DATA;
        }
        self.rules
            .iter()
            .find(|r| value > r.cutoff)
            .map(|r| r.class)
            .unwrap_or(self.default_class)
    }

    /// Cube cells are compared at cube precision so a cell equal to a cutoff stays below it
    fn classify_cell(&self, value: CubeValue) -> u8 {
        if value.is_nan() {
            return class::NO_DATA;
        }
        self.rules
            .iter()
            .find(|r| value > r.cutoff as CubeValue)
            .map(|r| r.class)
            .unwrap_or(self.default_class)
    }

    /// Classify a `(time, y, x)` array
    pub fn classify_array(&self, values: ArrayView3<'_, CubeValue>) -> ClassArray {
        let mut out = Array3::<u8>::zeros(values.dim());

        #[cfg(feature = "parallel")]
        Zip::from(&mut out).and(&values).par_for_each(|c, &v| *c = self.classify_cell(v));

        #[cfg(not(feature = "parallel"))]
        Zip::from(&mut out).and(&values).for_each(|c, &v| *c = self.classify_cell(v));

        out
    }

    /// Classify one band of a cube
    pub fn classify(&self, cube: &DataCube, band: &str) -> ScaResult<ClassRaster> {
        log::info!("Classifying band '{}' with {} threshold rule(s)", band, self.rules.len());
        let values = cube.band(band)?;
        let classes = self.classify_array(values);

        log::debug!(
            "Classification summary: {} no-data cells of {}",
            classes.iter().filter(|&&c| c == class::NO_DATA).count(),
            classes.len()
        );

        ClassRaster::new(classes, cube.times().to_vec(), cube.y().to_vec(), cube.x().to_vec(), cube.crs())
    }
}

/// Lower median of the valid codes of one cell's history.
/// Cells without valid codes stay no-data, or outside when every layer is outside.
fn median_code(history: &mut Vec<u8>) -> u8 {
    let all_outside = !history.is_empty() && history.iter().all(|&c| c == class::OUTSIDE);
    history.retain(|&c| class::is_valid(c));
    if history.is_empty() {
        return if all_outside { class::OUTSIDE } else { class::NO_DATA };
    }
    history.sort_unstable();
    history[(history.len() - 1) / 2]
}

/// Collapse the time axis of a class raster to a single layer using the per-cell
/// median code. The result keeps the first timestamp as its time label.
pub fn reduce_time_median(raster: &ClassRaster) -> ScaResult<ClassRaster> {
    let (nt, ny, nx) = raster.dim();
    if nt == 0 {
        return Err(ScaError::Processing("Cannot reduce an empty time axis".to_string()));
    }
    log::info!("Reducing {} class layers to a median snow map", nt);

    let data = raster.data();
    let mut out = Array3::<u8>::zeros((1, ny, nx));
    Zip::indexed(out.index_axis_mut(Axis(0), 0)).for_each(|(y, x), cell| {
        let mut history: Vec<u8> = (0..nt).map(|t| data[[t, y, x]]).collect();
        *cell = median_code(&mut history);
    });

    ClassRaster::new(
        out,
        vec![raster.times()[0]],
        raster.y().to_vec(),
        raster.x().to_vec(),
        raster.crs(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoordinateSystem;
    use chrono::{Duration, TimeZone, Utc};

    fn single_band_cube(values: Vec<f32>, nt: usize) -> DataCube {
        let nx = values.len() / nt;
        let t0 = Utc.with_ymd_and_hms(2018, 2, 1, 0, 0, 0).unwrap();
        DataCube::from_bands(
            (0..nt).map(|i| t0 + Duration::days(i as i64)).collect(),
            vec![0.0],
            (0..nx).map(|i| i as f64).collect(),
            CoordinateSystem::Geographic,
            vec![("NDSI".to_string(), Array3::from_shape_vec((nt, 1, nx), values).unwrap())],
        )
        .unwrap()
    }

    #[test]
    fn test_binary_threshold_is_strict() {
        let classifier = ThresholdClassifier::binary(0.4).unwrap();
        assert_eq!(classifier.classify_value(0.41), class::SNOW);
        assert_eq!(classifier.classify_value(0.4), class::NO_SNOW);
        assert_eq!(classifier.classify_value(-1.0), class::NO_SNOW);
        assert_eq!(classifier.classify_value(f64::NAN), class::NO_DATA);
    }

    #[test]
    fn test_rules_sorted_descending() {
        let classifier = ThresholdClassifier::new(
            vec![ThresholdRule::new(0.0, 1), ThresholdRule::new(0.5, 2)],
            0,
        )
        .unwrap();
        assert_eq!(classifier.rules()[0].cutoff, 0.5);
        assert_eq!(classifier.classify_value(0.7), 2);
        assert_eq!(classifier.classify_value(0.2), 1);
        assert_eq!(classifier.classify_value(-0.2), 0);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(ThresholdClassifier::new(vec![ThresholdRule::new(f64::NAN, 1)], 0).is_err());
        assert!(ThresholdClassifier::new(
            vec![ThresholdRule::new(0.4, 1), ThresholdRule::new(0.4, 2)],
            0
        )
        .is_err());
        assert!(ThresholdClassifier::new(vec![ThresholdRule::new(0.4, class::OUTSIDE)], 0).is_err());
    }

    #[test]
    fn test_classification_idempotent() {
        let cube = single_band_cube(vec![-0.3, 0.0, 0.39, 0.4, 0.41, 0.9, 1.0, f32::NAN], 1);
        let classifier = ThresholdClassifier::binary(0.4).unwrap();

        let once = classifier.classify(&cube, "NDSI").unwrap();
        let again = classifier.classify_array(once.as_values().view());
        assert_eq!(once.data(), &again);
        assert_eq!(once.data().as_slice().unwrap(), &[0, 0, 0, 0, 1, 1, 1, class::NO_DATA]);
    }

    #[test]
    fn test_missing_band() {
        let cube = single_band_cube(vec![0.5], 1);
        let classifier = ThresholdClassifier::binary(0.4).unwrap();
        assert!(classifier.classify(&cube, "B03").is_err());
    }

    #[test]
    fn test_reduce_time_median() {
        // three timesteps, four cells
        let values = vec![
            1.0, 0.0, f32::NAN, 0.9, //
            1.0, 1.0, f32::NAN, 0.1, //
            0.0, 0.0, 0.8, f32::NAN,
        ];
        let cube = single_band_cube(values, 3);
        let raster = ThresholdClassifier::binary(0.4).unwrap().classify(&cube, "NDSI").unwrap();

        let reduced = reduce_time_median(&raster).unwrap();
        assert_eq!(reduced.dim(), (1, 1, 4));
        assert_eq!(reduced.times()[0], raster.times()[0]);
        // [1,1,0] -> 1, [0,1,0] -> 0, [nd,nd,1] -> 1, [1,0,nd] -> lower median 0
        assert_eq!(reduced.data().as_slice().unwrap(), &[1, 0, 1, 0]);
    }
}
