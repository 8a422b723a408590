//! Conversion orchestration: aggregate dimensions, seed the output grid,
//! fan granules out to workers, finalize the store.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::chunking::compute_chunksize;
use crate::dataset::GranuleSnapshot;
use crate::dimension::DimensionsMapping;
use crate::error::{ConvertError, ConvertResult};
use crate::metadata::v2::ZarrArrayMetadata;
use crate::pool::{run_worker_pool, worker_count};
use crate::sync::StoreSynchronizer;
use crate::types::{ArrayData, DataType, FillValue};
use crate::writer::{WriterContext, aggregated_shape, write_granule};
use crate::zarr::ZarrStore;

/// Store key written and immediately deleted by the finalizer to force any
/// lazy flush in the store mapping.
const FORCE_FLUSH_KEY: &str = ".zforceflush";

#[derive(Debug, Clone, Default)]
pub struct ConversionOptions {
    /// Requested worker count; capped by available CPUs and input count.
    pub worker_count: Option<usize>,
}

/// Convert the input granules into a single Zarr store, mosaicking along
/// shared temporal axes when more than one granule is supplied.
pub async fn mosaic_to_zarr(
    input_paths: &[PathBuf],
    store: &ZarrStore,
    options: &ConversionOptions,
) -> ConvertResult<()> {
    if input_paths.is_empty() {
        return Err(ConvertError::Other("no input granules supplied".into()));
    }
    info!(
        inputs = input_paths.len(),
        store = store.root(),
        "starting conversion"
    );

    let paths = input_paths.to_vec();
    let mapping = tokio::task::spawn_blocking(move || DimensionsMapping::new(&paths))
        .await
        .map_err(|e| ConvertError::Other(format!("aggregation task failed: {e}")))??;
    let mapping = Arc::new(mapping);

    store.ensure_group("").await?;
    write_aggregated_dimensions(store, &mapping).await?;

    let first_granule = input_paths[0].clone();
    let chunk_mapping = mapping.clone();
    let chunk_shapes = tokio::task::spawn_blocking(move || {
        granule_chunk_shapes(&first_granule, &chunk_mapping)
    })
    .await
    .map_err(|e| ConvertError::Other(format!("chunk planning task failed: {e}")))??;

    let ctx = Arc::new(WriterContext {
        store: store.clone(),
        sync: StoreSynchronizer::new(store.root()),
        aggregated_paths: mapping.aggregated_paths(),
        chunk_shapes,
        mapping,
    });

    let workers = worker_count(options.worker_count, input_paths.len());
    let job_ctx = ctx.clone();
    run_worker_pool(input_paths.to_vec(), workers, move |granule| {
        let ctx = job_ctx.clone();
        async move { write_granule(ctx, granule).await }
    })
    .await?;

    finalize_store(store).await
}

/// Seed the aggregated dimension and bounds arrays (values only) before any
/// worker starts, so no worker ever races on them. Workers later fill in
/// attributes under the "existing wins" rule.
async fn write_aggregated_dimensions(
    store: &ZarrStore,
    mapping: &DimensionsMapping,
) -> ConvertResult<()> {
    let sync = StoreSynchronizer::new(store.root());
    let mut dimension_paths: Vec<&String> = mapping.output_dimensions.keys().collect();
    dimension_paths.sort();

    for dimension_path in dimension_paths {
        let dimension = &mapping.output_dimensions[dimension_path];
        let node = dimension_path.trim_start_matches('/').to_string();
        if let Some((parent, _)) = node.rsplit_once('/') {
            store.ensure_group(parent).await?;
        } else {
            store.ensure_group("").await?;
        }

        let shape = vec![dimension.values.len()];
        let chunks = compute_chunksize(&shape, DataType::Float64)?;
        let array = store
            .create_or_open_array(
                &node,
                ZarrArrayMetadata::new(shape.clone(), chunks, DataType::Float64, FillValue::Value(0.0)),
            )
            .await?;
        let buffer = ArrayData::Float64(dimension.values.clone()).to_le_bytes();
        array
            .write_region(&[0..dimension.values.len()], &buffer, &sync)
            .await?;

        let (Some(bounds_path), Some(bounds_values)) =
            (&dimension.bounds_path, &dimension.bounds_values)
        else {
            continue;
        };
        let bounds_node = bounds_path.trim_start_matches('/').to_string();
        if let Some((parent, _)) = bounds_node.rsplit_once('/') {
            store.ensure_group(parent).await?;
        }
        let bounds_shape = vec![dimension.values.len(), 2];
        let bounds_chunks = compute_chunksize(&bounds_shape, DataType::Float64)?;
        let bounds_array = store
            .create_or_open_array(
                &bounds_node,
                ZarrArrayMetadata::new(
                    bounds_shape,
                    bounds_chunks,
                    DataType::Float64,
                    FillValue::Value(0.0),
                ),
            )
            .await?;
        let buffer = ArrayData::Float64(bounds_values.clone()).to_le_bytes();
        bounds_array
            .write_region(&[0..dimension.values.len(), 0..2], &buffer, &sync)
            .await?;
    }
    Ok(())
}

/// Plan every variable's chunk shape from the first granule's structure and
/// the aggregated output shapes.
fn granule_chunk_shapes(
    granule_path: &PathBuf,
    mapping: &DimensionsMapping,
) -> ConvertResult<std::collections::HashMap<String, Vec<usize>>> {
    let snapshot = GranuleSnapshot::load_structure(granule_path)?;
    let mut chunk_shapes = std::collections::HashMap::new();
    for variable in snapshot.variables() {
        let Some(dtype) = variable.data_type else {
            continue;
        };
        if variable.shape.is_empty() {
            continue;
        }
        let shape = aggregated_shape(mapping, variable);
        chunk_shapes.insert(variable.path.clone(), compute_chunksize(&shape, dtype)?);
    }
    Ok(chunk_shapes)
}

/// Flush the store and write consolidated metadata at the root.
pub async fn finalize_store(store: &ZarrStore) -> ConvertResult<()> {
    let flush_key = store.key("", FORCE_FLUSH_KEY);
    store.put(&flush_key, b"{}".to_vec()).await?;
    store.delete(&flush_key).await?;
    store.consolidate_metadata().await?;
    info!(store = store.root(), "store finalized");
    Ok(())
}
