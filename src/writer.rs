//! Per-granule store writer: copies one granule's groups, variables and
//! attributes into the shared output store, placing aggregated-axis data into
//! its slice of the output grid.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunking::compute_chunksize;
use crate::dataset::{GranuleSnapshot, GroupNode, VariableNode};
use crate::dimension::DimensionsMapping;
use crate::error::{ConvertError, ConvertResult};
use crate::metadata::v2::ZarrArrayMetadata;
use crate::sync::StoreSynchronizer;
use crate::types::FillValue;
use crate::zarr::{AttrMap, ZarrStore};

/// Shared state for every worker writing into one output store.
pub struct WriterContext {
    pub store: ZarrStore,
    pub sync: Arc<StoreSynchronizer>,
    pub mapping: Arc<DimensionsMapping>,
    /// Aggregated dimension/bounds paths, seeded before workers start and
    /// never overwritten by granule data.
    pub aggregated_paths: HashSet<String>,
    /// Per-variable chunk shapes precomputed from the first granule.
    pub chunk_shapes: HashMap<String, Vec<usize>>,
}

/// Write one granule into the output store.
pub async fn write_granule(ctx: Arc<WriterContext>, granule_path: PathBuf) -> ConvertResult<()> {
    info!(granule = %granule_path.display(), "copying granule into store");
    let load_path = granule_path.clone();
    let snapshot = tokio::task::spawn_blocking(move || GranuleSnapshot::load(&load_path))
        .await
        .map_err(|e| ConvertError::Other(format!("snapshot task failed: {e}")))??;

    let mut stack: Vec<&GroupNode> = vec![&snapshot.root];
    while let Some(group) = stack.pop() {
        copy_group(&ctx, group).await?;
        for variable in &group.variables {
            copy_variable(&ctx, variable, &granule_path).await?;
        }
        stack.extend(group.groups.iter());
    }
    Ok(())
}

async fn copy_group(ctx: &WriterContext, group: &GroupNode) -> ConvertResult<()> {
    ctx.store.ensure_group(&group.path).await?;
    let incoming = attrs_to_map(&group.attributes);
    ctx.store.update_attrs(&group.path, incoming).await
}

async fn copy_variable(
    ctx: &WriterContext,
    variable: &VariableNode,
    granule_path: &PathBuf,
) -> ConvertResult<()> {
    let node = variable.path.trim_start_matches('/').to_string();

    // Zarr has no rank-0 arrays; a dimensionless variable becomes an empty
    // group carrying the variable's attributes.
    if variable.shape.is_empty() {
        ctx.store.ensure_group(&node).await?;
        let mut incoming = attrs_to_map(&variable.attributes);
        incoming.insert("_ARRAY_DIMENSIONS".to_string(), serde_json::json!([]));
        return ctx.store.update_attrs(&node, incoming).await;
    }

    let Some(dtype) = variable.data_type else {
        warn!(variable = %variable.path, "skipping variable with non-numeric type");
        return Ok(());
    };

    let shape = aggregated_shape(&ctx.mapping, variable);
    let chunks = match ctx.chunk_shapes.get(&variable.path) {
        Some(chunks) => chunks.clone(),
        None => compute_chunksize(&variable.shape, dtype)?,
    };
    let fill_value = variable
        .f64_attribute("_FillValue")
        .map(FillValue::Value)
        .unwrap_or(FillValue::Value(0.0));

    let array = ctx
        .store
        .create_or_open_array(&node, ZarrArrayMetadata::new(shape, chunks, dtype, fill_value))
        .await?;

    if !ctx.aggregated_paths.contains(&variable.path) {
        let selection = output_selection(ctx, variable, granule_path)?;
        let data = variable.data.as_ref().ok_or_else(|| {
            ConvertError::Metadata(format!("No data snapshot for {}", variable.path))
        })?;
        debug!(variable = %variable.path, selection = ?selection, "writing slice");
        array
            .write_region(&selection, &data.to_le_bytes(), &ctx.sync)
            .await?;
    }

    // The xarray contract: _ARRAY_DIMENSIONS lets readers resolve axes.
    let mut incoming = attrs_to_map(&variable.attributes);
    incoming.insert(
        "_ARRAY_DIMENSIONS".to_string(),
        serde_json::json!(variable.dimension_names),
    );
    if ctx.aggregated_paths.contains(&variable.path) {
        if let Some(units) = ctx.mapping.output_units(&variable.path) {
            incoming.insert("units".to_string(), serde_json::json!(units));
        }
    }
    ctx.store.update_attrs(&node, incoming).await
}

/// The output-store shape of a variable: aggregated axes grow to the
/// aggregated length; everything else keeps its input extent.
pub(crate) fn aggregated_shape(
    mapping: &DimensionsMapping,
    variable: &VariableNode,
) -> Vec<usize> {
    if let Some(dimension) = mapping.output_dimensions.get(&variable.path) {
        return vec![dimension.values.len()];
    }
    if let Some(dimension_path) = mapping.output_bounds.get(&variable.path) {
        let length = mapping.output_dimensions[dimension_path].values.len();
        return vec![length, 2];
    }
    variable
        .dimension_paths
        .iter()
        .zip(variable.shape.iter())
        .map(|(dimension_path, input_length)| {
            mapping
                .output_dimensions
                .get(dimension_path)
                .map(|d| d.values.len())
                .unwrap_or(*input_length)
        })
        .collect()
}

/// Where this granule's data lands on each axis: aggregated axes map their
/// input values onto the output grid (a single granule always occupies a
/// contiguous index range); all other axes are written whole.
fn output_selection(
    ctx: &WriterContext,
    variable: &VariableNode,
    granule_path: &PathBuf,
) -> ConvertResult<Vec<Range<usize>>> {
    variable
        .dimension_paths
        .iter()
        .zip(variable.shape.iter())
        .map(|(dimension_path, input_length)| {
            let Some(output) = ctx.mapping.output_dimensions.get(dimension_path) else {
                return Ok(0..*input_length);
            };
            let record = ctx
                .mapping
                .input_dimensions
                .get(dimension_path)
                .and_then(|per_file| per_file.get(granule_path))
                .ok_or_else(|| {
                    ConvertError::Metadata(format!(
                        "No dimension record for {dimension_path} in {}",
                        granule_path.display()
                    ))
                })?;
            let values = record.get_values(output.units.as_deref());
            let mut indices = values.iter().map(|value| {
                output
                    .values
                    .iter()
                    .position(|candidate| crate::dimension::values_match(*candidate, *value))
                    .ok_or_else(|| {
                        ConvertError::Metadata(format!(
                            "Value {value} of {dimension_path} in {} is not on the output grid",
                            granule_path.display()
                        ))
                    })
            });
            let first = indices.next().ok_or_else(|| {
                ConvertError::Metadata(format!("{dimension_path} has no values"))
            })??;
            let (mut low, mut high) = (first, first);
            for index in indices {
                let index = index?;
                low = low.min(index);
                high = high.max(index);
            }
            Ok(low..high + 1)
        })
        .collect()
}

pub(crate) fn attrs_to_map(attributes: &[(String, crate::types::AttrValue)]) -> AttrMap {
    let mut map = AttrMap::new();
    for (name, value) in attributes {
        map.insert(name.clone(), value.to_json());
    }
    map
}
