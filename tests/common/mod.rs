//! Granule fixtures for the integration tests.
//!
//! Each generated file mirrors the structure used throughout the suite:
//!
//! - latitude  (1-D dimension variable)
//! - longitude (1-D dimension variable)
//! - time      (1-D dimension variable, CF temporal units)
//! - flat_variable (3-D gridded variable)
//! - science_group/nested (3-D gridded variable)

use std::path::{Path, PathBuf};

pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    if count == 1 {
        return vec![start];
    }
    let step = (stop - start) / (count - 1) as f64;
    (0..count).map(|i| start + i as f64 * step).collect()
}

pub fn default_lat() -> Vec<f64> {
    linspace(-90.0, 90.0, 19)
}

pub fn default_lon() -> Vec<f64> {
    linspace(-180.0, 180.0, 37)
}

/// Write one granule with the standard structure. Gridded variables are
/// filled with `fill`, so tests can tell granules apart in the mosaic.
pub fn generate_granule(
    path: &Path,
    lat: &[f64],
    lon: &[f64],
    time_values: &[f64],
    time_units: &str,
    fill: f64,
) -> PathBuf {
    let mut file = netcdf::create(path).expect("create granule");

    file.add_dimension("latitude", lat.len()).unwrap();
    file.add_dimension("longitude", lon.len()).unwrap();
    file.add_dimension("time", time_values.len()).unwrap();

    let mut latitude = file.add_variable::<f64>("latitude", &["latitude"]).unwrap();
    latitude.put_values(lat, ..).unwrap();
    latitude.put_attribute("units", "degrees_north").unwrap();

    let mut longitude = file
        .add_variable::<f64>("longitude", &["longitude"])
        .unwrap();
    longitude.put_values(lon, ..).unwrap();
    longitude.put_attribute("units", "degrees_east").unwrap();

    let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
    time.put_values(time_values, ..).unwrap();
    time.put_attribute("units", time_units).unwrap();

    let grid_len = time_values.len() * lat.len() * lon.len();
    let grid_data = vec![fill; grid_len];

    let mut flat = file
        .add_variable::<f64>("flat_variable", &["time", "latitude", "longitude"])
        .unwrap();
    flat.put_values(&grid_data, ..).unwrap();

    let mut science_group = file.add_group("science_group").unwrap();
    let mut nested = science_group
        .add_variable::<f64>("nested", &["time", "latitude", "longitude"])
        .unwrap();
    nested.put_values(&grid_data, ..).unwrap();

    path.to_path_buf()
}

/// Write a granule whose time dimension carries a `(time, 2)` bounds
/// companion referenced by a `bounds` attribute.
pub fn generate_bounded_granule(
    path: &Path,
    time_values: &[f64],
    time_bounds: &[f64],
    time_units: &str,
) -> PathBuf {
    let lat = default_lat();
    let lon = default_lon();
    let mut file = netcdf::create(path).expect("create granule");

    file.add_dimension("latitude", lat.len()).unwrap();
    file.add_dimension("longitude", lon.len()).unwrap();
    file.add_dimension("time", time_values.len()).unwrap();
    file.add_dimension("nv", 2).unwrap();

    let mut latitude = file.add_variable::<f64>("latitude", &["latitude"]).unwrap();
    latitude.put_values(&lat, ..).unwrap();
    latitude.put_attribute("units", "degrees_north").unwrap();

    let mut longitude = file
        .add_variable::<f64>("longitude", &["longitude"])
        .unwrap();
    longitude.put_values(&lon, ..).unwrap();
    longitude.put_attribute("units", "degrees_east").unwrap();

    let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
    time.put_values(time_values, ..).unwrap();
    time.put_attribute("units", time_units).unwrap();
    time.put_attribute("bounds", "time_bnds").unwrap();

    let mut bounds = file
        .add_variable::<f64>("time_bnds", &["time", "nv"])
        .unwrap();
    bounds.put_values(time_bounds, ..).unwrap();

    let grid_data = vec![1.0; time_values.len() * lat.len() * lon.len()];
    let mut flat = file
        .add_variable::<f64>("flat_variable", &["time", "latitude", "longitude"])
        .unwrap();
    flat.put_values(&grid_data, ..).unwrap();

    path.to_path_buf()
}
