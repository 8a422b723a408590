//! Zarr V2 group and array handles over a [`StorageBackend`].
//!
//! Everything here operates on raw little-endian element buffers; typed
//! interpretation happens in `types`. Region reads and writes are chunk-wise
//! read-modify-write through the codec pipeline.

use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;

use crate::codecs::Compressor;
use crate::error::{ConvertError, ConvertResult};
use crate::metadata::v2::{
    ConsolidatedMetadata, ZarrArrayMetadata, cartesian_product, group_document,
};
use crate::store::StorageBackend;
use crate::sync::StoreSynchronizer;
use crate::types::Endian;

pub type AttrMap = serde_json::Map<String, serde_json::Value>;

pub const ZGROUP_KEY: &str = ".zgroup";
pub const ZARRAY_KEY: &str = ".zarray";
pub const ZATTRS_KEY: &str = ".zattrs";
pub const ZMETADATA_KEY: &str = ".zmetadata";

// ---------------------------------------------------------------------------
// ZarrStore
// ---------------------------------------------------------------------------

/// A handle on one Zarr V2 store rooted at a backend prefix.
#[derive(Clone)]
pub struct ZarrStore {
    backend: Arc<dyn StorageBackend>,
    root: String,
}

impl ZarrStore {
    pub fn new(backend: Arc<dyn StorageBackend>, root: impl Into<String>) -> Self {
        Self {
            backend,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Store key for a node-relative entry, e.g. `key("data/var", ".zarray")`.
    pub fn key(&self, node: &str, entry: &str) -> String {
        let node_key = self.node_key(node);
        if node_key.is_empty() {
            entry.to_string()
        } else {
            self.backend.join(&node_key, entry)
        }
    }

    /// Store key of a node path (leading slashes stripped, root prefix added).
    pub fn node_key(&self, node: &str) -> String {
        let node = node.trim_matches('/');
        if self.root.is_empty() {
            node.to_string()
        } else if node.is_empty() {
            self.root.clone()
        } else {
            self.backend.join(&self.root, node)
        }
    }

    pub async fn get(&self, key: &str) -> ConvertResult<Option<Bytes>> {
        self.backend.get(key).await
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> ConvertResult<()> {
        self.backend.put(key, Bytes::from(data)).await
    }

    pub async fn delete(&self, key: &str) -> ConvertResult<()> {
        self.backend.delete(key).await
    }

    /// Remove the whole store (every key under the root prefix).
    pub async fn remove_all(&self) -> ConvertResult<()> {
        self.backend.delete_prefix(&self.root).await
    }

    // -- groups -------------------------------------------------------------

    /// Ensure a group node (and all its ancestors) exist.
    pub async fn ensure_group(&self, node: &str) -> ConvertResult<()> {
        let node = node.trim_matches('/');
        let mut current = String::new();
        let segments: Vec<&str> = if node.is_empty() {
            Vec::new()
        } else {
            node.split('/').collect()
        };

        self.ensure_group_node("").await?;
        for segment in segments {
            current = if current.is_empty() {
                segment.to_string()
            } else {
                format!("{current}/{segment}")
            };
            self.ensure_group_node(&current).await?;
        }
        Ok(())
    }

    async fn ensure_group_node(&self, node: &str) -> ConvertResult<()> {
        let key = self.key(node, ZGROUP_KEY);
        if self.get(&key).await?.is_none() {
            let doc = serde_json::to_vec_pretty(&group_document())?;
            self.put(&key, doc).await?;
        }
        Ok(())
    }

    // -- attributes ---------------------------------------------------------

    pub async fn get_attrs(&self, node: &str) -> ConvertResult<AttrMap> {
        let key = self.key(node, ZATTRS_KEY);
        match self.get(&key).await? {
            Some(bytes) => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| ConvertError::Metadata(format!("Invalid .zattrs at {node}: {e}")))?;
                value
                    .as_object()
                    .cloned()
                    .ok_or_else(|| ConvertError::Metadata(format!(".zattrs at {node} is not an object")))
            }
            None => Ok(AttrMap::new()),
        }
    }

    pub async fn put_attrs(&self, node: &str, attrs: &AttrMap) -> ConvertResult<()> {
        let key = self.key(node, ZATTRS_KEY);
        let doc = serde_json::to_vec_pretty(&serde_json::Value::Object(attrs.clone()))?;
        self.put(&key, doc).await
    }

    /// Merge `incoming` into the node's attributes. Attributes already present
    /// on the node win over incoming values, so repeated granule writes are
    /// idempotent.
    pub async fn update_attrs(&self, node: &str, incoming: AttrMap) -> ConvertResult<()> {
        let existing = self.get_attrs(node).await?;
        let mut merged = incoming;
        for (key, value) in existing {
            merged.insert(key, value);
        }
        self.put_attrs(node, &merged).await
    }

    // -- arrays -------------------------------------------------------------

    /// Open the array at `node`, or create it with `metadata` when absent.
    /// A pre-existing array keeps its stored metadata, so concurrent workers
    /// converge on whichever `.zarray` landed first.
    pub async fn create_or_open_array(
        &self,
        node: &str,
        metadata: ZarrArrayMetadata,
    ) -> ConvertResult<ZarrArray> {
        let key = self.key(node, ZARRAY_KEY);
        match self.get(&key).await? {
            Some(bytes) => {
                let existing = ZarrArrayMetadata::parse(&bytes)?;
                ZarrArray::from_metadata(self.clone(), node, existing)
            }
            None => {
                self.put(&key, metadata.to_document()?).await?;
                ZarrArray::from_metadata(self.clone(), node, metadata)
            }
        }
    }

    pub async fn open_array(&self, node: &str) -> ConvertResult<ZarrArray> {
        let key = self.key(node, ZARRAY_KEY);
        let bytes = self
            .get(&key)
            .await?
            .ok_or_else(|| ConvertError::NotFound(format!("No .zarray at {node}")))?;
        let metadata = ZarrArrayMetadata::parse(&bytes)?;
        ZarrArray::from_metadata(self.clone(), node, metadata)
    }

    // -- consolidation ------------------------------------------------------

    /// Collect every `.zgroup`, `.zarray` and `.zattrs` document under the
    /// root into a single `.zmetadata` key, so readers open the store with one
    /// round trip.
    pub async fn consolidate_metadata(&self) -> ConvertResult<()> {
        let keys = self.backend.list_prefix(&self.root).await?;
        let mut metadata = std::collections::BTreeMap::new();
        for key in keys {
            let name = key.rsplit('/').next().unwrap_or(&key);
            if !matches!(name, ZGROUP_KEY | ZARRAY_KEY | ZATTRS_KEY) {
                continue;
            }
            let bytes = self
                .get(&key)
                .await?
                .ok_or_else(|| ConvertError::NotFound(format!("Listed key vanished: {key}")))?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| ConvertError::Metadata(format!("Invalid JSON at {key}: {e}")))?;
            metadata.insert(self.relative_key(&key), value);
        }
        let doc = ConsolidatedMetadata::new(metadata).to_document()?;
        let target = self.key("", ZMETADATA_KEY);
        self.put(&target, doc).await
    }

    pub async fn read_consolidated_metadata(&self) -> ConvertResult<ConsolidatedMetadata> {
        let key = self.key("", ZMETADATA_KEY);
        let bytes = self
            .get(&key)
            .await?
            .ok_or_else(|| ConvertError::NotFound(format!("No .zmetadata under {}", self.root)))?;
        ConsolidatedMetadata::parse(&bytes)
    }

    fn relative_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            key.strip_prefix(&format!("{}/", self.root))
                .unwrap_or(key)
                .to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// ZarrArray
// ---------------------------------------------------------------------------

pub struct ZarrArray {
    store: ZarrStore,
    node: String,
    pub metadata: ZarrArrayMetadata,
    compressor: Option<Compressor>,
}

impl ZarrArray {
    fn from_metadata(
        store: ZarrStore,
        node: &str,
        metadata: ZarrArrayMetadata,
    ) -> ConvertResult<Self> {
        let compressor = metadata
            .compressor
            .as_ref()
            .map(Compressor::from_config)
            .transpose()?;
        Ok(Self {
            store,
            node: node.trim_matches('/').to_string(),
            metadata,
            compressor,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn shape(&self) -> &[usize] {
        &self.metadata.shape
    }

    pub fn chunks(&self) -> &[usize] {
        &self.metadata.chunks
    }

    fn elem_size(&self) -> usize {
        self.metadata.dtype.data_type.byte_size()
    }

    pub fn endian(&self) -> Endian {
        self.metadata.dtype.byte_order
    }

    fn chunk_store_key(&self, chunk_index: &[usize]) -> String {
        let name = chunk_index
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(".");
        self.store.key(&self.node, &name)
    }

    /// Read one chunk as a decoded element buffer. Missing chunks materialize
    /// as fill-value buffers.
    async fn read_chunk(&self, chunk_index: &[usize]) -> ConvertResult<Vec<u8>> {
        let key = self.chunk_store_key(chunk_index);
        match self.store.get(&key).await? {
            Some(raw) => {
                let decoded = match &self.compressor {
                    Some(compressor) => compressor.decode(&raw)?,
                    None => raw.to_vec(),
                };
                let expected = self.chunk_elem_count() * self.elem_size();
                if decoded.len() != expected {
                    return Err(ConvertError::Decode(format!(
                        "Chunk {key} decoded to {} bytes, expected {expected}",
                        decoded.len()
                    )));
                }
                Ok(decoded)
            }
            None => Ok(self.fill_chunk_buffer()),
        }
    }

    async fn write_chunk(&self, chunk_index: &[usize], buffer: &[u8]) -> ConvertResult<()> {
        let key = self.chunk_store_key(chunk_index);
        let encoded = match &self.compressor {
            Some(compressor) => compressor.encode(buffer)?,
            None => buffer.to_vec(),
        };
        self.store.put(&key, encoded).await
    }

    fn chunk_elem_count(&self) -> usize {
        self.metadata.chunks.iter().product()
    }

    fn fill_chunk_buffer(&self) -> Vec<u8> {
        let elem = self
            .metadata
            .fill_value
            .element_bytes(self.metadata.dtype.data_type);
        let count = self.chunk_elem_count();
        let mut buffer = Vec::with_capacity(count * elem.len());
        for _ in 0..count {
            buffer.extend_from_slice(&elem);
        }
        buffer
    }

    /// Write `data` (a row-major element buffer covering the selection) into
    /// the selected region, under the store synchronizer's lock for this
    /// array. Chunks are read-modify-written, so partial-chunk writes from
    /// other arrays are never disturbed.
    pub async fn write_region(
        &self,
        selection: &[Range<usize>],
        data: &[u8],
        sync: &StoreSynchronizer,
    ) -> ConvertResult<()> {
        // Region buffers are little-endian; every array this crate creates
        // declares `<` (or `|` for one-byte types), so a big-endian dtype
        // means the write targets an array from some other producer.
        if self.metadata.dtype.byte_order == Endian::Big {
            return Err(ConvertError::Encode(format!(
                "Array {} declares a big-endian dtype; refusing to mix byte orders",
                self.node
            )));
        }
        self.check_selection(selection)?;
        let region_shape: Vec<usize> = selection.iter().map(|r| r.end - r.start).collect();
        let expected = region_shape.iter().product::<usize>() * self.elem_size();
        if data.len() != expected {
            return Err(ConvertError::Encode(format!(
                "Region buffer for {} holds {} bytes, expected {expected}",
                self.node,
                data.len()
            )));
        }

        let _guard = sync.lock(&self.node).await;
        for chunk_index in self.chunks_overlapping(selection) {
            let mut chunk = self.read_chunk(&chunk_index).await?;
            for (chunk_range, region_range) in self.runs(selection, &chunk_index, &region_shape) {
                chunk[chunk_range].copy_from_slice(&data[region_range]);
            }
            self.write_chunk(&chunk_index, &chunk).await?;
        }
        Ok(())
    }

    /// Read the selected region into a row-major element buffer.
    pub async fn read_region(&self, selection: &[Range<usize>]) -> ConvertResult<Vec<u8>> {
        self.check_selection(selection)?;
        let region_shape: Vec<usize> = selection.iter().map(|r| r.end - r.start).collect();
        let mut out = vec![0u8; region_shape.iter().product::<usize>() * self.elem_size()];

        for chunk_index in self.chunks_overlapping(selection) {
            let chunk = self.read_chunk(&chunk_index).await?;
            for (chunk_range, region_range) in self.runs(selection, &chunk_index, &region_shape) {
                out[region_range].copy_from_slice(&chunk[chunk_range]);
            }
        }
        Ok(out)
    }

    /// Read the whole array.
    pub async fn read_all(&self) -> ConvertResult<Vec<u8>> {
        let selection: Vec<Range<usize>> =
            self.metadata.shape.iter().map(|s| 0..*s).collect();
        self.read_region(&selection).await
    }

    fn check_selection(&self, selection: &[Range<usize>]) -> ConvertResult<()> {
        if selection.len() != self.metadata.shape.len() {
            return Err(ConvertError::Other(format!(
                "Selection rank {} does not match array rank {} at {}",
                selection.len(),
                self.metadata.shape.len(),
                self.node
            )));
        }
        for (range, dim) in selection.iter().zip(self.metadata.shape.iter()) {
            if range.start > range.end || range.end > *dim {
                return Err(ConvertError::Other(format!(
                    "Selection {range:?} out of bounds for dimension of length {dim} at {}",
                    self.node
                )));
            }
        }
        Ok(())
    }

    fn chunks_overlapping(&self, selection: &[Range<usize>]) -> Vec<Vec<usize>> {
        let spans: Vec<usize> = selection
            .iter()
            .zip(self.metadata.chunks.iter())
            .map(|(range, chunk)| {
                if range.start == range.end {
                    0
                } else {
                    (range.end - 1) / chunk - range.start / chunk + 1
                }
            })
            .collect();
        if spans.contains(&0) {
            return Vec::new();
        }
        let firsts: Vec<usize> = selection
            .iter()
            .zip(self.metadata.chunks.iter())
            .map(|(range, chunk)| range.start / chunk)
            .collect();
        cartesian_product(&spans)
            .into_iter()
            .map(|offsets| {
                offsets
                    .iter()
                    .zip(firsts.iter())
                    .map(|(o, f)| o + f)
                    .collect()
            })
            .collect()
    }

    /// Byte-range pairs `(chunk, region)` covering the intersection of
    /// `selection` and one chunk, one innermost-axis run each.
    fn runs(
        &self,
        selection: &[Range<usize>],
        chunk_index: &[usize],
        region_shape: &[usize],
    ) -> Vec<(Range<usize>, Range<usize>)> {
        let rank = selection.len();
        let elem = self.elem_size();
        let chunks = &self.metadata.chunks;

        // Intersection of the chunk box and the selection, in array coords.
        let lo: Vec<usize> = (0..rank)
            .map(|axis| selection[axis].start.max(chunk_index[axis] * chunks[axis]))
            .collect();
        let hi: Vec<usize> = (0..rank)
            .map(|axis| {
                selection[axis]
                    .end
                    .min((chunk_index[axis] + 1) * chunks[axis])
                    .min(self.metadata.shape[axis])
            })
            .collect();
        if (0..rank).any(|axis| lo[axis] >= hi[axis]) {
            return Vec::new();
        }

        let chunk_strides = strides(chunks);
        let region_strides = strides(region_shape);
        let run = hi[rank - 1] - lo[rank - 1];

        let outer_shape: Vec<usize> = (0..rank - 1).map(|axis| hi[axis] - lo[axis]).collect();
        let mut runs = Vec::new();
        for outer in cartesian_product(&outer_shape) {
            let mut chunk_offset = 0usize;
            let mut region_offset = 0usize;
            for axis in 0..rank - 1 {
                let coord = lo[axis] + outer[axis];
                chunk_offset += (coord - chunk_index[axis] * chunks[axis]) * chunk_strides[axis];
                region_offset += (coord - selection[axis].start) * region_strides[axis];
            }
            chunk_offset += (lo[rank - 1] - chunk_index[rank - 1] * chunks[rank - 1])
                * chunk_strides[rank - 1];
            region_offset +=
                (lo[rank - 1] - selection[rank - 1].start) * region_strides[rank - 1];

            runs.push((
                chunk_offset * elem..(chunk_offset + run) * elem,
                region_offset * elem..(region_offset + run) * elem,
            ));
        }
        runs
    }
}

/// Row-major element strides for a shape.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides: Vec<usize> = shape
        .iter()
        .rev()
        .scan(1usize, |state, &dim| {
            let stride = *state;
            *state *= dim;
            Some(stride)
        })
        .collect();
    strides.reverse();
    strides
}
