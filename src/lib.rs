//! Mosaic NetCDF-4 granules into a single chunked Zarr (V2) store.
//!
//! The conversion pipeline: aggregate dimensions across all inputs
//! ([`dimension::DimensionsMapping`]), seed the aggregated dimension arrays,
//! copy granules concurrently ([`pool`] + [`writer`]), consolidate metadata
//! ([`convert::finalize_store`]), then rewrite the store into planner-chosen
//! chunk shapes ([`rechunk`]).

pub mod chunking;
pub mod codecs;
pub mod convert;
pub mod dataset;
pub mod dimension;
pub mod error;
pub mod metadata;
pub mod pool;
pub mod rechunk;
pub mod store;
pub mod sync;
pub mod types;
pub mod writer;
pub mod zarr;

// Re-export key types at crate root for convenience.
pub use chunking::{ChunkSpec, CompressedSize, compute_chunksize, compute_chunksize_with};
pub use convert::{ConversionOptions, finalize_store, mosaic_to_zarr};
pub use dimension::{DimensionInfo, DimensionsMapping, TimeUnit};
pub use error::{ConvertError, ConvertResult};
pub use rechunk::rechunk_zarr;
pub use store::{LocalBackend, ObjectStoreBackend, StorageBackend};
pub use sync::StoreSynchronizer;
pub use types::{ArrayData, AttrValue, DataType, Endian, FillValue};
pub use zarr::{ZarrArray, ZarrStore};
