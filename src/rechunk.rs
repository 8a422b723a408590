//! Rechunk pass: rewrite a finalized store into planner-selected chunk
//! shapes with a bounded-memory, out-of-core copy.
//!
//! Coordinates (dimension variables) and cell-bounds variables keep their
//! chunking and are copied raw, chunk key by chunk key, without
//! recompression. Everything else is assembled one target chunk at a time
//! from the overlapping source chunks.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::chunking::compute_chunksize;
use crate::error::{ConvertError, ConvertResult};
use crate::metadata::v2::{ConsolidatedMetadata, ZarrArrayMetadata, cartesian_product};
use crate::sync::StoreSynchronizer;
use crate::zarr::{ZATTRS_KEY, ZGROUP_KEY, ZarrStore};

/// Memory budget for the copy plan. Sized for an 8 GiB container with
/// headroom for codec buffers.
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 1 << 30;

/// Rewrite `source` into `target` with re-planned chunks, staging through
/// `temp` where the budget demands it. On success the source and temp stores
/// are removed; on failure the source store survives.
pub async fn rechunk_zarr(
    source: &ZarrStore,
    target: &ZarrStore,
    temp: &ZarrStore,
    max_memory_bytes: usize,
) -> ConvertResult<()> {
    info!(
        source = source.root(),
        target = target.root(),
        "rechunking store"
    );
    match rechunk_store(source, target, temp, max_memory_bytes).await {
        Ok(()) => {
            source.remove_all().await?;
            temp.remove_all().await?;
            info!(target = target.root(), "rechunk complete");
            Ok(())
        }
        Err(err) => Err(ConvertError::RechunkFailed(err.to_string())),
    }
}

async fn rechunk_store(
    source: &ZarrStore,
    target: &ZarrStore,
    temp: &ZarrStore,
    max_memory_bytes: usize,
) -> ConvertResult<()> {
    let consolidated = source.read_consolidated_metadata().await?;

    // Group documents and every attribute document carry over verbatim.
    for (key, value) in &consolidated.metadata {
        let name = key.rsplit('/').next().unwrap_or(key);
        if matches!(name, ZGROUP_KEY | ZATTRS_KEY) {
            let target_key = if target.root().is_empty() {
                key.clone()
            } else {
                format!("{}/{}", target.root(), key)
            };
            target
                .put(&target_key, serde_json::to_vec_pretty(value)?)
                .await?;
        }
    }

    let target_chunks = get_target_chunks(&consolidated)?;
    for (path, metadata) in consolidated.arrays()? {
        match &target_chunks[&path] {
            Some(chunks) if *chunks != metadata.chunks => {
                copy_array_rechunked(source, target, temp, &path, &metadata, chunks, max_memory_bytes)
                    .await?;
            }
            _ => copy_array_raw(source, target, &path, &metadata).await?,
        }
    }

    target.consolidate_metadata().await
}

/// Planner-selected chunks for every variable that is neither a coordinate
/// nor a bounds variable; `None` preserves the existing chunking.
pub fn get_target_chunks(
    consolidated: &ConsolidatedMetadata,
) -> ConvertResult<HashMap<String, Option<Vec<usize>>>> {
    let mut targets = HashMap::new();
    for (path, metadata) in consolidated.arrays()? {
        let name = path.rsplit('/').next().unwrap_or(&path);
        let preserve = is_bounds_variable(name) || is_coordinate(consolidated, &path, name);
        let plan = if preserve {
            None
        } else {
            Some(compute_chunksize(&metadata.shape, metadata.dtype.data_type)?)
        };
        targets.insert(path, plan);
    }
    Ok(targets)
}

fn is_bounds_variable(name: &str) -> bool {
    name.ends_with("_bnds") || name.ends_with("_bounds")
}

/// A coordinate is a variable that labels one of its own axes, per its
/// `_ARRAY_DIMENSIONS` attribute.
fn is_coordinate(consolidated: &ConsolidatedMetadata, path: &str, name: &str) -> bool {
    let Some(attrs) = consolidated.metadata.get(&format!("{path}/{ZATTRS_KEY}")) else {
        return false;
    };
    attrs
        .get("_ARRAY_DIMENSIONS")
        .and_then(|dims| dims.as_array())
        .map(|dims| dims.iter().any(|d| d.as_str() == Some(name)))
        .unwrap_or(false)
}

/// Copy an array without recompression: `.zarray` and every present chunk
/// key travel as raw bytes.
async fn copy_array_raw(
    source: &ZarrStore,
    target: &ZarrStore,
    path: &str,
    metadata: &ZarrArrayMetadata,
) -> ConvertResult<()> {
    debug!(array = path, "copying with preserved chunks");
    target
        .put(&target.key(path, crate::zarr::ZARRAY_KEY), metadata.to_document()?)
        .await?;
    for chunk_key in metadata.chunk_keys() {
        let source_key = source.key(path, &chunk_key);
        if let Some(bytes) = source.get(&source_key).await? {
            target
                .put(&target.key(path, &chunk_key), bytes.to_vec())
                .await?;
        }
    }
    Ok(())
}

async fn copy_array_rechunked(
    source: &ZarrStore,
    target: &ZarrStore,
    temp: &ZarrStore,
    path: &str,
    metadata: &ZarrArrayMetadata,
    chunks: &[usize],
    max_memory_bytes: usize,
) -> ConvertResult<()> {
    let elem_size = metadata.dtype.data_type.byte_size();
    let source_chunk_bytes: usize = metadata.chunks.iter().product::<usize>() * elem_size;
    let target_chunk_bytes: usize = chunks.iter().product::<usize>() * elem_size;

    if source_chunk_bytes + target_chunk_bytes > max_memory_bytes {
        // Stage through the temp store with chunks small on every axis, so
        // neither leg holds a source-sized and target-sized buffer at once.
        let intermediate: Vec<usize> = metadata
            .chunks
            .iter()
            .zip(chunks.iter())
            .map(|(a, b)| (*a).min(*b))
            .collect();
        let intermediate_bytes: usize = intermediate.iter().product::<usize>() * elem_size;
        if source_chunk_bytes + intermediate_bytes > max_memory_bytes {
            warn!(
                array = path,
                "source chunks alone exceed the memory budget; proceeding chunk-at-a-time"
            );
        }
        debug!(array = path, chunks = ?intermediate, "staging through temp store");
        copy_with_chunks(source, temp, path, metadata, &intermediate).await?;
        let staged = ZarrArrayMetadata {
            chunks: intermediate,
            ..metadata.clone()
        };
        copy_with_chunks(temp, target, path, &staged, chunks).await
    } else {
        copy_with_chunks(source, target, path, metadata, chunks).await
    }
}

/// Assemble the destination one chunk at a time from overlapping source
/// chunks. Peak memory is one destination chunk plus one source chunk.
async fn copy_with_chunks(
    from: &ZarrStore,
    to: &ZarrStore,
    path: &str,
    metadata: &ZarrArrayMetadata,
    chunks: &[usize],
) -> ConvertResult<()> {
    let src = from.open_array(path).await?;
    let dst_metadata = ZarrArrayMetadata {
        chunks: chunks.to_vec(),
        ..metadata.clone()
    };
    let dst = to.create_or_open_array(path, dst_metadata).await?;
    let sync = StoreSynchronizer::new(to.root());

    let shape = &metadata.shape;
    let grid: Vec<usize> = shape
        .iter()
        .zip(chunks.iter())
        .map(|(s, c)| s.div_ceil((*c).max(1)))
        .collect();
    for chunk_index in cartesian_product(&grid) {
        let selection: Vec<std::ops::Range<usize>> = chunk_index
            .iter()
            .zip(chunks.iter())
            .zip(shape.iter())
            .map(|((index, chunk), dim)| {
                let start = index * chunk;
                start..(start + chunk).min(*dim)
            })
            .collect();
        let buffer = src.read_region(&selection).await?;
        dst.write_region(&selection, &buffer, &sync).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::finalize_store;
    use crate::store::LocalBackend;
    use crate::types::{ArrayData, DataType, Endian, FillValue, bytes_to_array_data};
    use crate::zarr::AttrMap;
    use std::sync::Arc;

    async fn seed_source(store: &ZarrStore) {
        store.ensure_group("").await.unwrap();
        let sync = StoreSynchronizer::new(store.root());

        let lon: Vec<f64> = (0..3600).map(|i| -180.0 + i as f64 * 0.1).collect();
        let lat: Vec<f64> = (0..1800).map(|i| -90.0 + i as f64 * 0.1).collect();

        for (name, values) in [("lon", lon), ("lat", lat)] {
            let n = values.len();
            let metadata = ZarrArrayMetadata::new(
                vec![n],
                vec![n],
                DataType::Float64,
                FillValue::Value(0.0),
            );
            let array = store.create_or_open_array(name, metadata).await.unwrap();
            array
                .write_region(&[0..n], &ArrayData::Float64(values).to_le_bytes(), &sync)
                .await
                .unwrap();
            let mut attrs = AttrMap::new();
            attrs.insert("_ARRAY_DIMENSIONS".into(), serde_json::json!([name]));
            store.update_attrs(name, attrs).await.unwrap();
        }

        for (name, data) in [
            ("temperature", ArrayData::Int16(vec![1i16; 3600 * 1800])),
            (
                "precipitation",
                ArrayData::Float64(vec![1.0f64; 3600 * 1800]),
            ),
        ] {
            let dtype = data.data_type();
            let metadata = ZarrArrayMetadata::new(
                vec![3600, 1800],
                vec![3600, 450],
                dtype,
                FillValue::Value(0.0),
            );
            let array = store.create_or_open_array(name, metadata).await.unwrap();
            array
                .write_region(&[0..3600, 0..1800], &data.to_le_bytes(), &sync)
                .await
                .unwrap();
            let mut attrs = AttrMap::new();
            attrs.insert("_ARRAY_DIMENSIONS".into(), serde_json::json!(["lon", "lat"]));
            store.update_attrs(name, attrs).await.unwrap();
        }

        finalize_store(store).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn target_chunks_preserve_coordinates_and_retune_variables() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        let store = ZarrStore::new(backend, "source.zarr");
        seed_source(&store).await;

        let consolidated = store.read_consolidated_metadata().await.unwrap();
        let targets = get_target_chunks(&consolidated).unwrap();

        assert_eq!(targets["lon"], None);
        assert_eq!(targets["lat"], None);
        assert_eq!(targets["temperature"], Some(vec![3600, 1800]));
        assert_eq!(targets["precipitation"], Some(vec![1402, 1402]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rechunk_rewrites_variables_and_removes_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<LocalBackend> = Arc::new(LocalBackend::new(dir.path()));
        let backend: Arc<dyn crate::store::StorageBackend> = backend;
        let source = ZarrStore::new(backend.clone(), "source.zarr");
        let target = ZarrStore::new(backend.clone(), "target.zarr");
        let temp = ZarrStore::new(backend.clone(), "temp.zarr");
        seed_source(&source).await;

        rechunk_zarr(&source, &target, &temp, DEFAULT_MAX_MEMORY_BYTES)
            .await
            .unwrap();

        let precipitation = target.open_array("precipitation").await.unwrap();
        assert_eq!(precipitation.chunks(), &[1402, 1402]);
        let temperature = target.open_array("temperature").await.unwrap();
        assert_eq!(temperature.chunks(), &[3600, 1800]);
        let lon = target.open_array("lon").await.unwrap();
        assert_eq!(lon.chunks(), &[3600]);

        // Values survive the rewrite.
        let bytes = temperature.read_region(&[0..2, 0..3]).await.unwrap();
        let data = bytes_to_array_data(Endian::Little, DataType::Int16, &bytes).unwrap();
        assert_eq!(data.to_f64_vec(), vec![1.0; 6]);

        // Destination is consolidated; source and temp stores are gone.
        target.read_consolidated_metadata().await.unwrap();
        assert!(backend.list_prefix("source.zarr").await.unwrap().is_empty());
        assert!(backend.list_prefix("temp.zarr").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rechunk_failure_keeps_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn crate::store::StorageBackend> =
            Arc::new(LocalBackend::new(dir.path()));
        let source = ZarrStore::new(backend.clone(), "source.zarr");
        let target = ZarrStore::new(backend.clone(), "target.zarr");
        let temp = ZarrStore::new(backend.clone(), "temp.zarr");

        // No consolidated metadata: the rechunk plan cannot start.
        source.ensure_group("").await.unwrap();
        let result = rechunk_zarr(&source, &target, &temp, DEFAULT_MAX_MEMORY_BYTES).await;
        assert!(matches!(result, Err(ConvertError::RechunkFailed(_))));
        assert!(!backend.list_prefix("source.zarr").await.unwrap().is_empty());
    }
}
