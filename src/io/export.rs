use crate::core::timeseries::TimeSeries;
use crate::types::{class, ClassRaster, ScaError, ScaResult};
use ndarray::Array2;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

#[cfg(feature = "geotiff")]
use crate::core::metadata::{legend_description, snow_legend};
#[cfg(feature = "geotiff")]
use gdal::{DriverManager, Metadata};

/// Write a time series as CSV (`time` column first, NaN as empty field)
pub fn write_series_csv<P: AsRef<Path>>(series: &TimeSeries, output_path: P) -> ScaResult<()> {
    log::info!(
        "Writing {} timesteps x {} columns to {}",
        series.len(),
        series.columns().len(),
        output_path.as_ref().display()
    );
    let file = File::create(output_path.as_ref())?;
    series.write_csv(BufWriter::new(file))
}

/// One layer of a class raster ready for a single-byte product: no-data and
/// outside cells are folded into `no_data`.
pub fn product_layer(raster: &ClassRaster, time_index: usize, no_data: u8) -> ScaResult<Array2<u8>> {
    if time_index >= raster.times().len() {
        return Err(ScaError::Processing(format!(
            "Time index {} out of range for {} layers",
            time_index,
            raster.times().len()
        )));
    }
    Ok(raster
        .layer(time_index)
        .mapv(|c| if class::is_valid(c) { c } else { no_data }))
}

/// Single-band Byte GeoTIFF of one snow map layer. Cloud (2) is the no-data value
/// and the band description names the legend.
#[cfg(feature = "geotiff")]
pub fn write_class_geotiff<P: AsRef<Path>>(raster: &ClassRaster, time_index: usize, output_path: P) -> ScaResult<()> {
    log::info!("Saving snow map as GeoTIFF: {}", output_path.as_ref().display());

    let layer = product_layer(raster, time_index, class::CLOUD)?;
    let transform = raster.geo_transform()?;
    let (height, width) = layer.dim();

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<u8, _>(output_path.as_ref(), width as isize, height as isize, 1)?;
    dataset.set_geo_transform(&transform.to_gdal())?;
    dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(raster.crs().epsg())?)?;

    let description = legend_description(&snow_legend(), Some(class::CLOUD));
    dataset.set_metadata_item("TIFFTAG_IMAGEDESCRIPTION", &description, "")?;

    let mut band = dataset.rasterband(1)?;
    let flat: Vec<u8> = layer.iter().copied().collect();
    let buffer = gdal::raster::Buffer::new((width, height), flat);
    band.write((0, 0), (width, height), &buffer)?;
    band.set_no_data_value(Some(class::CLOUD as f64))?;
    band.set_description(&description)?;

    log::info!("GeoTIFF saved ({}x{})", width, height);
    Ok(())
}
