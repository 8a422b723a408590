use crate::error::{ConvertError, ConvertResult};
use crate::types::{DataType, Endian, FillValue};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// V2 DataType  (NumPy format wrapper)
// ---------------------------------------------------------------------------

/// V2-specific data type that wraps the core `DataType` along with byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2DataType {
    pub data_type: DataType,
    pub byte_order: Endian,
}

impl V2DataType {
    /// The dtype this crate writes for a given element type. One-byte types
    /// carry the `|` (not applicable) byte-order marker; everything else is
    /// written little-endian.
    pub fn native(data_type: DataType) -> Self {
        let byte_order = match data_type {
            DataType::Int8 | DataType::UInt8 => Endian::NotApplicable,
            _ => Endian::Little,
        };
        Self {
            data_type,
            byte_order,
        }
    }
}

/// Parse a NumPy dtype format string (e.g. `"<f8"`, `">i4"`, `"|u1"`) into a
/// [`V2DataType`].
pub fn parse_numpy_dtype(s: &str) -> Result<V2DataType, String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < 3 {
        return Err(format!("NumPy format string too short: {s}"));
    }

    let byte_order = match chars[0] {
        '<' => Endian::Little,
        '>' => Endian::Big,
        '|' => Endian::NotApplicable,
        other => return Err(format!("Invalid byte order: {other}")),
    };

    let type_code = chars[1];
    let size: String = chars[2..].iter().collect();
    let data_type = match (type_code, size.as_str()) {
        ('i', "1") => DataType::Int8,
        ('i', "2") => DataType::Int16,
        ('i', "4") => DataType::Int32,
        ('i', "8") => DataType::Int64,
        ('u', "1") => DataType::UInt8,
        ('u', "2") => DataType::UInt16,
        ('u', "4") => DataType::UInt32,
        ('u', "8") => DataType::UInt64,
        ('f', "4") => DataType::Float32,
        ('f', "8") => DataType::Float64,
        _ => return Err(format!("Unsupported NumPy type: {type_code}{size}")),
    };

    Ok(V2DataType {
        data_type,
        byte_order,
    })
}

// Serde: V2DataType serialises as the NumPy format string
impl Serialize for V2DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bo = match self.byte_order {
            Endian::Little => "<",
            Endian::Big => ">",
            Endian::NotApplicable => "|",
        };
        let (tc, bs) = match self.data_type {
            DataType::Int8 => ("i", "1"),
            DataType::Int16 => ("i", "2"),
            DataType::Int32 => ("i", "4"),
            DataType::Int64 => ("i", "8"),
            DataType::UInt8 => ("u", "1"),
            DataType::UInt16 => ("u", "2"),
            DataType::UInt32 => ("u", "4"),
            DataType::UInt64 => ("u", "8"),
            DataType::Float32 => ("f", "4"),
            DataType::Float64 => ("f", "8"),
        };
        serializer.serialize_str(&format!("{bo}{tc}{bs}"))
    }
}

impl<'de> Deserialize<'de> for V2DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_numpy_dtype(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ArrayOrder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArrayOrder {
    #[default]
    C,
    F,
}

impl Serialize for ArrayOrder {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ArrayOrder::C => serializer.serialize_str("C"),
            ArrayOrder::F => serializer.serialize_str("F"),
        }
    }
}

impl<'de> Deserialize<'de> for ArrayOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "C" | "c" => Ok(ArrayOrder::C),
            "F" | "f" => Ok(ArrayOrder::F),
            _ => Err(serde::de::Error::custom(format!("Unknown order: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ZarrCompressor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZarrCompressor {
    pub id: String,
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl ZarrCompressor {
    /// The compressor this crate writes: numcodecs zlib.
    pub fn default_zlib() -> Self {
        let mut config = serde_json::Map::new();
        config.insert("level".to_string(), serde_json::json!(1));
        Self {
            id: "zlib".to_string(),
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// ZarrArrayMetadata  (.zarray document)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZarrArrayMetadata {
    pub chunks: Vec<usize>,

    #[serde(default)]
    pub compressor: Option<ZarrCompressor>,

    pub dtype: V2DataType,

    #[serde(
        serialize_with = "serialize_fill_value_field",
        deserialize_with = "deserialize_fill_value_field"
    )]
    pub fill_value: FillValue,

    #[serde(default)]
    pub filters: Option<serde_json::Value>,

    #[serde(default)]
    pub order: ArrayOrder,

    pub shape: Vec<usize>,

    #[serde(default = "default_zarr_format")]
    pub zarr_format: u32,
}

fn default_zarr_format() -> u32 {
    2
}

fn serialize_fill_value_field<S: serde::Serializer>(
    fill: &FillValue,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    super::fill_value_to_json(fill).serialize(serializer)
}

/// Placeholder pass: `fill_value` needs the sibling `dtype` field, which
/// serde cannot provide, so the real interpretation happens in
/// [`ZarrArrayMetadata::parse`].
fn deserialize_fill_value_field<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<FillValue, D::Error> {
    let _raw = serde_json::Value::deserialize(deserializer)?;
    Ok(FillValue::Null)
}

impl ZarrArrayMetadata {
    pub fn new(
        shape: Vec<usize>,
        chunks: Vec<usize>,
        data_type: DataType,
        fill_value: FillValue,
    ) -> Self {
        Self {
            chunks,
            compressor: Some(ZarrCompressor::default_zlib()),
            dtype: V2DataType::native(data_type),
            fill_value,
            filters: None,
            order: ArrayOrder::C,
            shape,
            zarr_format: 2,
        }
    }

    /// Parse from raw JSON bytes, fully resolving fill_value against dtype.
    pub fn parse(json_bytes: &[u8]) -> ConvertResult<Self> {
        let raw: serde_json::Value = serde_json::from_slice(json_bytes)
            .map_err(|e| ConvertError::Metadata(format!("Invalid .zarray JSON: {e}")))?;
        Self::from_value(&raw)
    }

    /// Parse from an already-deserialized JSON value (consolidated metadata).
    pub fn from_value(raw: &serde_json::Value) -> ConvertResult<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| ConvertError::Metadata("Expected .zarray JSON object".into()))?;

        let dtype_str = obj
            .get("dtype")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConvertError::Metadata("Missing 'dtype' field".into()))?;
        let dtype = parse_numpy_dtype(dtype_str).map_err(ConvertError::Metadata)?;

        let fill_raw = obj.get("fill_value").unwrap_or(&serde_json::Value::Null);
        let fill_value = super::parse_fill_value(dtype.data_type, fill_raw)
            .map_err(|e| ConvertError::Metadata(format!("fill_value: {e}")))?;

        let mut md: ZarrArrayMetadata = serde_json::from_value(raw.clone())
            .map_err(|e| ConvertError::Metadata(format!("Metadata parse error: {e}")))?;
        md.fill_value = fill_value;
        Ok(md)
    }

    pub fn to_document(&self) -> ConvertResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ConvertError::Metadata(format!("Serialize .zarray: {e}")))
    }

    /// Enumerate every chunk key of this array, e.g. `"0.1"`.
    pub fn chunk_keys(&self) -> Vec<String> {
        list_keys(&self.shape, &self.chunks)
    }
}

// ---------------------------------------------------------------------------
// Group and consolidated documents
// ---------------------------------------------------------------------------

pub fn group_document() -> serde_json::Value {
    serde_json::json!({"zarr_format": 2})
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedMetadata {
    pub zarr_consolidated_format: u32,
    /// All `.zgroup`, `.zarray` and `.zattrs` documents keyed by their store
    /// key (relative to the store root, no leading slash).
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ConsolidatedMetadata {
    pub fn new(metadata: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            zarr_consolidated_format: 1,
            metadata,
        }
    }

    pub fn parse(json_bytes: &[u8]) -> ConvertResult<Self> {
        let doc: ConsolidatedMetadata = serde_json::from_slice(json_bytes)
            .map_err(|e| ConvertError::Metadata(format!("Invalid .zmetadata JSON: {e}")))?;
        if doc.zarr_consolidated_format != 1 {
            return Err(ConvertError::Metadata(
                "Metadata is not in zarr-consolidated-v1 format".into(),
            ));
        }
        Ok(doc)
    }

    pub fn to_document(&self) -> ConvertResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ConvertError::Metadata(format!("Serialize .zmetadata: {e}")))
    }

    /// Paths of every group recorded in the document, root first.
    pub fn group_paths(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .metadata
            .keys()
            .filter_map(|key| {
                key.strip_suffix(".zgroup")
                    .map(|prefix| prefix.trim_end_matches('/').to_string())
            })
            .collect();
        groups.sort();
        groups
    }

    /// `(array path, metadata)` for every array recorded in the document.
    pub fn arrays(&self) -> ConvertResult<Vec<(String, ZarrArrayMetadata)>> {
        let mut arrays = Vec::new();
        for (key, value) in &self.metadata {
            if let Some(prefix) = key.strip_suffix(".zarray") {
                let path = prefix.trim_end_matches('/').to_string();
                arrays.push((path, ZarrArrayMetadata::from_value(value)?));
            }
        }
        Ok(arrays)
    }
}

// ---------------------------------------------------------------------------
// Key generation
// ---------------------------------------------------------------------------

/// Generate all storage keys for a given array shape and chunk sizes.
pub fn list_keys(shape: &[usize], chunks: &[usize]) -> Vec<String> {
    let chunks_per_dim: Vec<usize> = shape
        .iter()
        .zip(chunks.iter())
        .map(|(s, c)| s.div_ceil((*c).max(1)))
        .collect();

    cartesian_product(&chunks_per_dim)
        .into_iter()
        .map(|idx| {
            idx.iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(".")
        })
        .collect()
}

pub fn cartesian_product(dims: &[usize]) -> Vec<Vec<usize>> {
    if dims.is_empty() {
        return vec![vec![]];
    }
    let first = dims[0];
    let rest = cartesian_product(&dims[1..]);
    let mut result = Vec::new();
    for i in 0..first {
        for r in &rest {
            let mut v = vec![i];
            v.extend_from_slice(r);
            result.push(v);
        }
    }
    result
}
