use thiserror::Error;

pub type ConvertResult<T> = Result<T, ConvertError>;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not open input dataset: {0}")]
    BadInputDataset(#[from] netcdf::Error),

    #[error("Invalid chunk specification: {0}")]
    InvalidChunkSpec(String),

    #[error("{0} has mixed input types, both temporal and non-temporal.")]
    MixedDimensionType(String),

    #[error("Problem writing data to Zarr store: {0}")]
    WorkerException(String),

    #[error("Problem writing data to Zarr store: worker exit codes: {0:?}")]
    WorkerCrash(Vec<i32>),

    #[error("Rechunking failed: {0}")]
    RechunkFailed(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}
