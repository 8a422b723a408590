//! Per-variable chunk-shape planning.
//!
//! Chunk shapes target a fixed *compressed* byte budget: equal-sided chunks
//! minimize worst-case access cost over unknown query patterns, and each axis
//! is clamped so no chunk extent exceeds its dimension.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{ConvertError, ConvertResult};
use crate::types::DataType;

/// Compressed bytes each chunk should occupy after encoding.
pub const DEFAULT_COMPRESSED_CHUNK_SIZE: &str = "10 Mi";

/// Expected compression ratio of the output codec on typical science data.
pub const DEFAULT_COMPRESSION_RATIO: f64 = 1.5;

/// Target compressed chunk size: either a byte count or a binary-prefix
/// string such as `"10 Mi"`.
#[derive(Debug, Clone)]
pub enum CompressedSize {
    Bytes(u64),
    Text(String),
}

impl CompressedSize {
    fn resolve(&self) -> ConvertResult<u64> {
        match self {
            CompressedSize::Bytes(n) => Ok(*n),
            CompressedSize::Text(text) => parse_binary_prefix(text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub compression_ratio: f64,
    pub compressed_chunk_size: CompressedSize,
}

impl Default for ChunkSpec {
    fn default() -> Self {
        Self {
            compression_ratio: DEFAULT_COMPRESSION_RATIO,
            compressed_chunk_size: CompressedSize::Text(DEFAULT_COMPRESSED_CHUNK_SIZE.to_string()),
        }
    }
}

/// Parse a `"<number> Ki|Mi|Gi"` string into bytes. The numeric part is
/// truncated to a whole unit count before multiplying, so `"26.8 Mi"` is
/// 26 MiB.
fn parse_binary_prefix(text: &str) -> ConvertResult<u64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([\d.]+)\s*(Ki|Mi|Gi)\s*$").expect("binary prefix pattern")
    });

    let captures = pattern.captures(text).ok_or_else(|| {
        ConvertError::InvalidChunkSpec(format!(
            "chunk size must be a byte count or a '<number> Ki|Mi|Gi' string, got '{text}'"
        ))
    })?;
    let value: f64 = captures[1].parse().map_err(|_| {
        ConvertError::InvalidChunkSpec(format!("unreadable chunk size number in '{text}'"))
    })?;
    let unit: u64 = match &captures[2] {
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        _ => 1 << 30,
    };
    Ok(value.trunc() as u64 * unit)
}

/// Compute a chunk shape for `shape` with the default budget.
pub fn compute_chunksize(shape: &[usize], dtype: DataType) -> ConvertResult<Vec<usize>> {
    compute_chunksize_with(shape, dtype, &ChunkSpec::default())
}

/// Compute a chunk shape near the compressed-byte budget in `spec`.
///
/// The uncompressed element budget is spread evenly across all axes; any axis
/// smaller than the even split is fixed to its full extent and the remaining
/// budget is re-split across the other axes until every axis is fixed.
pub fn compute_chunksize_with(
    shape: &[usize],
    dtype: DataType,
    spec: &ChunkSpec,
) -> ConvertResult<Vec<usize>> {
    if spec.compression_ratio < 1.0 {
        return Err(ConvertError::InvalidChunkSpec(format!(
            "compression ratio must be >= 1, got {}",
            spec.compression_ratio
        )));
    }
    let compressed_bytes = spec.compressed_chunk_size.resolve()?;
    let element_budget =
        (compressed_bytes as f64 * spec.compression_ratio / dtype.byte_size() as f64).floor();

    let mut chunk: Vec<Option<usize>> = vec![None; shape.len()];
    loop {
        let unfixed: Vec<usize> = (0..shape.len()).filter(|i| chunk[*i].is_none()).collect();
        if unfixed.is_empty() {
            break;
        }

        let fixed_product: f64 = chunk.iter().flatten().map(|c| *c as f64).product();
        let remaining = element_budget / fixed_product;
        let candidate = nth_root(remaining, unfixed.len()).floor().max(1.0) as usize;

        let mut clamped = false;
        for index in &unfixed {
            if shape[*index] < candidate {
                chunk[*index] = Some(shape[*index]);
                clamped = true;
            }
        }
        if !clamped {
            for index in unfixed {
                chunk[index] = Some(candidate);
            }
        }
    }

    Ok(chunk.into_iter().flatten().collect())
}

fn nth_root(value: f64, n: usize) -> f64 {
    match n {
        1 => value,
        2 => value.sqrt(),
        3 => value.cbrt(),
        _ => value.powf(1.0 / n as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_shape_is_not_split() {
        let chunks = compute_chunksize(&[100, 100, 100], DataType::Float64).unwrap();
        assert_eq!(chunks, vec![100, 100, 100]);
    }

    #[test]
    fn medium_shape_clamps_short_axis_then_splits() {
        let chunks = compute_chunksize(&[100, 1000, 1000], DataType::Float64).unwrap();
        assert_eq!(chunks, vec![100, 140, 140]);
    }

    #[test]
    fn large_shape_splits_evenly() {
        let chunks = compute_chunksize(&[1000, 1000, 1000], DataType::Float64).unwrap();
        assert_eq!(chunks, vec![125, 125, 125]);
    }

    #[test]
    fn two_dimensional_reference_shapes() {
        let chunks = compute_chunksize(&[3600, 1800], DataType::Float64).unwrap();
        assert_eq!(chunks, vec![1402, 1402]);
        let chunks = compute_chunksize(&[3600, 1800], DataType::Int16).unwrap();
        assert_eq!(chunks, vec![3600, 1800]);
    }

    #[test]
    fn custom_ratio_and_fractional_prefix() {
        let spec = ChunkSpec {
            compression_ratio: 6.8,
            compressed_chunk_size: CompressedSize::Text("26.8 Mi".to_string()),
        };
        let chunks = compute_chunksize_with(&[100, 1000, 1000], DataType::Int32, &spec).unwrap();
        assert_eq!(chunks, vec![100, 680, 680]);
    }

    #[test]
    fn planner_output_never_exceeds_shape_and_is_stable() {
        let shape = [7, 3000, 11];
        let first = compute_chunksize(&shape, DataType::Float32).unwrap();
        let second = compute_chunksize(&shape, DataType::Float32).unwrap();
        assert_eq!(first, second);
        for (chunk, dim) in first.iter().zip(shape.iter()) {
            assert!(chunk <= dim);
        }
    }

    #[test]
    fn rejects_bad_specs() {
        let spec = ChunkSpec {
            compression_ratio: 0.5,
            compressed_chunk_size: CompressedSize::Bytes(1 << 20),
        };
        assert!(matches!(
            compute_chunksize_with(&[10], DataType::Float64, &spec),
            Err(ConvertError::InvalidChunkSpec(_))
        ));

        let spec = ChunkSpec {
            compression_ratio: 6.8,
            compressed_chunk_size: CompressedSize::Text("26.8 MB".to_string()),
        };
        assert!(matches!(
            compute_chunksize_with(&[10], DataType::Float64, &spec),
            Err(ConvertError::InvalidChunkSpec(_))
        ));
    }
}
