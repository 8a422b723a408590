//! End-to-end conversion scenarios against local stores.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use zarrmosaic::dimension::DimensionsMapping;
use zarrmosaic::types::{DataType, Endian, bytes_to_array_data};
use zarrmosaic::zarr::ZarrStore;
use zarrmosaic::{ConversionOptions, ConvertError, LocalBackend, mosaic_to_zarr};

use common::{default_lat, default_lon, generate_bounded_granule, generate_granule, linspace};

const SECONDS_EPOCH: &str = "seconds since 2020-01-27T14:00:00";

fn local_store(dir: &tempfile::TempDir, root: &str) -> ZarrStore {
    let backend = Arc::new(LocalBackend::new(dir.path()));
    ZarrStore::new(backend, root)
}

async fn read_f64(store: &ZarrStore, node: &str) -> (Vec<usize>, Vec<f64>) {
    let array = store.open_array(node).await.unwrap();
    let shape = array.shape().to_vec();
    let bytes = array.read_all().await.unwrap();
    let data = bytes_to_array_data(Endian::Little, DataType::Float64, &bytes).unwrap();
    (shape, data.to_f64_vec())
}

async fn array_dimensions(store: &ZarrStore, node: &str) -> Vec<String> {
    let attrs = store.get_attrs(node).await.unwrap();
    serde_json::from_value(attrs["_ARRAY_DIMENSIONS"].clone()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn single_granule_passthrough() {
    let work = tempfile::tempdir().unwrap();
    let granule = generate_granule(
        &work.path().join("input.nc4"),
        &default_lat(),
        &default_lon(),
        &[30.0],
        SECONDS_EPOCH,
        1.0,
    );

    let store = local_store(&work, "output.zarr");
    mosaic_to_zarr(&[granule], &store, &ConversionOptions::default())
        .await
        .unwrap();

    // Dimensions reproduce the input grid exactly.
    let (shape, time) = read_f64(&store, "time").await;
    assert_eq!(shape, vec![1]);
    assert_eq!(time, vec![30.0]);
    let (shape, lat) = read_f64(&store, "latitude").await;
    assert_eq!(shape, vec![19]);
    assert_eq!(lat, default_lat());

    // The science variable is copied as-is.
    let (shape, values) = read_f64(&store, "flat_variable").await;
    assert_eq!(shape, vec![1, 19, 37]);
    assert!(values.iter().all(|v| *v == 1.0));
    assert_eq!(
        array_dimensions(&store, "flat_variable").await,
        vec!["time", "latitude", "longitude"]
    );

    // The nested group variable survives with its hierarchy.
    let (shape, _) = read_f64(&store, "science_group/nested").await;
    assert_eq!(shape, vec![1, 19, 37]);

    // Consolidated metadata is present and complete.
    let consolidated = store.read_consolidated_metadata().await.unwrap();
    assert!(consolidated.metadata.contains_key("flat_variable/.zarray"));
    assert!(consolidated.metadata.contains_key("science_group/.zgroup"));
}

#[tokio::test(flavor = "multi_thread")]
async fn two_granules_same_epoch_mosaic() {
    let work = tempfile::tempdir().unwrap();
    let lat = default_lat();
    let lon = default_lon();
    let one = generate_granule(
        &work.path().join("one.nc4"),
        &lat,
        &lon,
        &[30.0],
        SECONDS_EPOCH,
        1.0,
    );
    let two = generate_granule(
        &work.path().join("two.nc4"),
        &lat,
        &lon,
        &[1830.0],
        SECONDS_EPOCH,
        2.0,
    );

    let store = local_store(&work, "output.zarr");
    mosaic_to_zarr(&[one, two], &store, &ConversionOptions::default())
        .await
        .unwrap();

    let (shape, time) = read_f64(&store, "time").await;
    assert_eq!(shape, vec![2]);
    assert_eq!(time, vec![30.0, 1830.0]);

    let time_attrs = store.get_attrs("time").await.unwrap();
    assert_eq!(time_attrs["units"], serde_json::json!(SECONDS_EPOCH));

    // Each granule lands in its own slice of the output grid.
    let (shape, values) = read_f64(&store, "flat_variable").await;
    assert_eq!(shape, vec![2, 19, 37]);
    let plane = 19 * 37;
    assert!(values[..plane].iter().all(|v| *v == 1.0));
    assert!(values[plane..].iter().all(|v| *v == 2.0));

    assert_eq!(
        array_dimensions(&store, "flat_variable").await,
        vec!["time", "latitude", "longitude"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn different_epochs_reconcile_onto_earliest() {
    let work = tempfile::tempdir().unwrap();
    let lat = default_lat();
    let lon = default_lon();
    let hourly = linspace(0.0, 1380.0, 24);
    let one = generate_granule(
        &work.path().join("merra_one.nc4"),
        &lat,
        &lon,
        &hourly,
        "minutes since 2020-01-01T00:30:00",
        1.0,
    );
    let two = generate_granule(
        &work.path().join("merra_two.nc4"),
        &lat,
        &lon,
        &hourly,
        "minutes since 2020-01-02T00:30:00",
        2.0,
    );

    let mapping = DimensionsMapping::new(&[one.clone(), two.clone()]).unwrap();
    let time = &mapping.output_dimensions["/time"];
    assert_eq!(
        time.units.as_deref(),
        Some("minutes since 2020-01-01T00:30:00")
    );
    assert_eq!(time.values, linspace(0.0, 2820.0, 48));

    // Spatial dimensions are never aggregated.
    assert!(!mapping.output_dimensions.contains_key("/latitude"));
    assert!(!mapping.output_dimensions.contains_key("/longitude"));

    // And the full conversion produces the 48-slot mosaic.
    let store = local_store(&work, "output.zarr");
    mosaic_to_zarr(&[one, two], &store, &ConversionOptions::default())
        .await
        .unwrap();
    let (shape, values) = read_f64(&store, "flat_variable").await;
    assert_eq!(shape, vec![48, 19, 37]);
    let plane = 19 * 37;
    assert!(values[..24 * plane].iter().all(|v| *v == 1.0));
    assert!(values[24 * plane..].iter().all(|v| *v == 2.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn gaps_are_bridged_with_fill_values() {
    let work = tempfile::tempdir().unwrap();
    let lat = default_lat();
    let lon = default_lon();
    let daily = linspace(0.0, 432000.0, 6);
    let granules: Vec<PathBuf> = [(0usize, 1.0), (2, 2.0), (5, 3.0)]
        .iter()
        .map(|(index, fill)| {
            generate_granule(
                &work.path().join(format!("gpm_{index}.nc4")),
                &lat,
                &lon,
                &[daily[*index]],
                SECONDS_EPOCH,
                *fill,
            )
        })
        .collect();

    let store = local_store(&work, "output.zarr");
    mosaic_to_zarr(&granules, &store, &ConversionOptions::default())
        .await
        .unwrap();

    let (shape, time) = read_f64(&store, "time").await;
    assert_eq!(shape, vec![6]);
    assert_eq!(time, daily);

    let (shape, values) = read_f64(&store, "flat_variable").await;
    assert_eq!(shape, vec![6, 19, 37]);
    let plane = 19 * 37;
    let slab = |i: usize| &values[i * plane..(i + 1) * plane];
    assert!(slab(0).iter().all(|v| *v == 1.0));
    assert!(slab(2).iter().all(|v| *v == 2.0));
    assert!(slab(5).iter().all(|v| *v == 3.0));
    // Uncovered slots hold the fill value (no _FillValue attribute -> 0).
    for gap in [1, 3, 4] {
        assert!(slab(gap).iter().all(|v| *v == 0.0), "slot {gap} not fill");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn bounds_rows_copy_and_gap_fill() {
    let work = tempfile::tempdir().unwrap();
    let units = "days since 2020-01-01T12:00:00";
    let one = generate_bounded_granule(
        &work.path().join("one.nc4"),
        &[0.0, 1.0, 2.0],
        &[-0.5, 0.5, 0.5, 1.5, 1.5, 2.5],
        units,
    );
    let two = generate_bounded_granule(
        &work.path().join("two.nc4"),
        &[9.0, 10.0, 11.0],
        &[8.5, 9.5, 9.5, 10.5, 10.5, 11.5],
        units,
    );

    let granules = [one, two];
    let mapping = DimensionsMapping::new(&granules).unwrap();
    assert_eq!(
        mapping.output_bounds.get("/time_bnds").map(String::as_str),
        Some("/time")
    );

    let store = local_store(&work, "output.zarr");
    mosaic_to_zarr(&granules, &store, &ConversionOptions::default())
        .await
        .unwrap();

    let (shape, bounds) = read_f64(&store, "time_bnds").await;
    assert_eq!(shape, vec![12, 2]);
    let (_, time) = read_f64(&store, "time").await;
    assert_eq!(time, linspace(0.0, 11.0, 12));
    // Rows 0..2 and 9..11 are copied; 3..8 use the median offsets (0.5, 0.5).
    for (i, value) in time.iter().enumerate() {
        assert_eq!(bounds[2 * i], value - 0.5, "lower bound of row {i}");
        assert_eq!(bounds[2 * i + 1], value + 0.5, "upper bound of row {i}");
    }

    let bounds_attrs = store.get_attrs("time_bnds").await.unwrap();
    assert_eq!(bounds_attrs["units"], serde_json::json!(units));
}

#[tokio::test(flavor = "multi_thread")]
async fn attribute_writes_are_idempotent() {
    let work = tempfile::tempdir().unwrap();
    let granule = generate_granule(
        &work.path().join("input.nc4"),
        &default_lat(),
        &default_lon(),
        &[30.0],
        SECONDS_EPOCH,
        1.0,
    );

    let store = local_store(&work, "output.zarr");
    mosaic_to_zarr(
        &[granule.clone()],
        &store,
        &ConversionOptions::default(),
    )
    .await
    .unwrap();
    let first = store.get_attrs("flat_variable").await.unwrap();
    let first_time = store.get_attrs("time").await.unwrap();

    // Writing the same granule again must not change any attribute map.
    mosaic_to_zarr(&[granule], &store, &ConversionOptions::default())
        .await
        .unwrap();
    assert_eq!(store.get_attrs("flat_variable").await.unwrap(), first);
    assert_eq!(store.get_attrs("time").await.unwrap(), first_time);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_granule_fails_without_consolidation() {
    let work = tempfile::tempdir().unwrap();
    let good = generate_granule(
        &work.path().join("good.nc4"),
        &default_lat(),
        &default_lon(),
        &[30.0],
        SECONDS_EPOCH,
        1.0,
    );
    let bad = work.path().join("bad.nc4");
    std::fs::write(&bad, b"not a netcdf file").unwrap();

    let store = local_store(&work, "output.zarr");
    let result = mosaic_to_zarr(&[good, bad], &store, &ConversionOptions::default()).await;
    assert!(matches!(result, Err(ConvertError::BadInputDataset(_))));

    // A failed conversion never publishes consolidated metadata.
    assert!(store.read_consolidated_metadata().await.is_err());
}
