use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{ConvertError, ConvertResult};

// ---------------------------------------------------------------------------
// Endian
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
    NotApplicable,
}

// ---------------------------------------------------------------------------
// DataType
// ---------------------------------------------------------------------------

/// Element types shared by the NetCDF-4 classic model and Zarr V2 arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Number of bytes per element.
    pub fn byte_size(&self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }
}

// ---------------------------------------------------------------------------
// FillValue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillValue {
    Value(f64),
    NaN,
    Infinity,
    NegativeInfinity,
    Null,
}

impl FillValue {
    pub fn to_f64(&self) -> f64 {
        match self {
            FillValue::Value(v) => *v,
            FillValue::NaN | FillValue::Null => f64::NAN,
            FillValue::Infinity => f64::INFINITY,
            FillValue::NegativeInfinity => f64::NEG_INFINITY,
        }
    }

    /// Little-endian element bytes for a single fill element of `dtype`.
    pub fn element_bytes(&self, dtype: DataType) -> Vec<u8> {
        let value = match self {
            FillValue::Value(v) => *v,
            FillValue::Null => 0.0,
            other => other.to_f64(),
        };
        f64_to_element_bytes(value, dtype)
    }
}

/// Encode a single scalar as little-endian element bytes of the given dtype.
pub fn f64_to_element_bytes(value: f64, dtype: DataType) -> Vec<u8> {
    match dtype {
        DataType::Int8 => vec![value as i8 as u8],
        DataType::UInt8 => vec![value as u8],
        DataType::Int16 => (value as i16).to_le_bytes().to_vec(),
        DataType::UInt16 => (value as u16).to_le_bytes().to_vec(),
        DataType::Int32 => (value as i32).to_le_bytes().to_vec(),
        DataType::UInt32 => (value as u32).to_le_bytes().to_vec(),
        DataType::Int64 => (value as i64).to_le_bytes().to_vec(),
        DataType::UInt64 => (value as u64).to_le_bytes().to_vec(),
        DataType::Float32 => (value as f32).to_le_bytes().to_vec(),
        DataType::Float64 => value.to_le_bytes().to_vec(),
    }
}

// ---------------------------------------------------------------------------
// AttrValue  (normalized attribute sum)
// ---------------------------------------------------------------------------

/// Normalized attribute value. Every attribute read from an input dataset is
/// coerced into this shape before it is written as Zarr `.zattrs` JSON, so
/// repeated writes round-trip byte-identically.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
}

impl AttrValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Int(v) => serde_json::json!(v),
            AttrValue::Float(v) => serde_json::json!(v),
            AttrValue::Bool(v) => serde_json::json!(v),
            AttrValue::Str(v) => serde_json::json!(v),
            AttrValue::IntArray(v) => serde_json::json!(v),
            AttrValue::FloatArray(v) => serde_json::json!(v),
            AttrValue::StrArray(v) => serde_json::json!(v),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ArrayData  (typed element buffers)
// ---------------------------------------------------------------------------

/// A flat, typed buffer of array elements in row-major order.
#[derive(Debug, Clone)]
pub enum ArrayData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl ArrayData {
    pub fn data_type(&self) -> DataType {
        match self {
            ArrayData::Int8(_) => DataType::Int8,
            ArrayData::Int16(_) => DataType::Int16,
            ArrayData::Int32(_) => DataType::Int32,
            ArrayData::Int64(_) => DataType::Int64,
            ArrayData::UInt8(_) => DataType::UInt8,
            ArrayData::UInt16(_) => DataType::UInt16,
            ArrayData::UInt32(_) => DataType::UInt32,
            ArrayData::UInt64(_) => DataType::UInt64,
            ArrayData::Float32(_) => DataType::Float32,
            ArrayData::Float64(_) => DataType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int8(v) => v.len(),
            ArrayData::Int16(v) => v.len(),
            ArrayData::Int32(v) => v.len(),
            ArrayData::Int64(v) => v.len(),
            ArrayData::UInt8(v) => v.len(),
            ArrayData::UInt16(v) => v.len(),
            ArrayData::UInt32(v) => v.len(),
            ArrayData::UInt64(v) => v.len(),
            ArrayData::Float32(v) => v.len(),
            ArrayData::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lossily convert the entire buffer to `Vec<f64>`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            ArrayData::Int8(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::Int16(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::Int32(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::Int64(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::UInt8(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::UInt16(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::UInt32(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::UInt64(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::Float32(v) => v.iter().map(|x| *x as f64).collect(),
            ArrayData::Float64(v) => v.clone(),
        }
    }

    /// Serialize the buffer as little-endian bytes (the layout this crate
    /// writes to every Zarr chunk).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        fn write_all<T, F: Fn(&mut [u8], T)>(items: &[T], size: usize, put: F) -> Vec<u8>
        where
            T: Copy,
        {
            let mut out = vec![0u8; items.len() * size];
            for (i, item) in items.iter().enumerate() {
                put(&mut out[i * size..(i + 1) * size], *item);
            }
            out
        }

        match self {
            ArrayData::Int8(v) => v.iter().map(|x| *x as u8).collect(),
            ArrayData::UInt8(v) => v.clone(),
            ArrayData::Int16(v) => write_all(v, 2, |b, x| LittleEndian::write_i16(b, x)),
            ArrayData::UInt16(v) => write_all(v, 2, |b, x| LittleEndian::write_u16(b, x)),
            ArrayData::Int32(v) => write_all(v, 4, |b, x| LittleEndian::write_i32(b, x)),
            ArrayData::UInt32(v) => write_all(v, 4, |b, x| LittleEndian::write_u32(b, x)),
            ArrayData::Int64(v) => write_all(v, 8, |b, x| LittleEndian::write_i64(b, x)),
            ArrayData::UInt64(v) => write_all(v, 8, |b, x| LittleEndian::write_u64(b, x)),
            ArrayData::Float32(v) => write_all(v, 4, |b, x| LittleEndian::write_f32(b, x)),
            ArrayData::Float64(v) => write_all(v, 8, |b, x| LittleEndian::write_f64(b, x)),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw bytes -> typed buffer
// ---------------------------------------------------------------------------

/// Interpret raw bytes as a typed buffer according to `endian` and `dtype`.
pub fn bytes_to_array_data(
    endian: Endian,
    dtype: DataType,
    data: &[u8],
) -> ConvertResult<ArrayData> {
    match dtype {
        DataType::Int8 => Ok(ArrayData::Int8(data.iter().map(|b| *b as i8).collect())),
        DataType::UInt8 => Ok(ArrayData::UInt8(data.to_vec())),
        DataType::Int16 => read_vec_typed(
            endian,
            data,
            |c| c.read_i16::<LittleEndian>(),
            |c| c.read_i16::<BigEndian>(),
            ArrayData::Int16,
        ),
        DataType::UInt16 => read_vec_typed(
            endian,
            data,
            |c| c.read_u16::<LittleEndian>(),
            |c| c.read_u16::<BigEndian>(),
            ArrayData::UInt16,
        ),
        DataType::Int32 => read_vec_typed(
            endian,
            data,
            |c| c.read_i32::<LittleEndian>(),
            |c| c.read_i32::<BigEndian>(),
            ArrayData::Int32,
        ),
        DataType::UInt32 => read_vec_typed(
            endian,
            data,
            |c| c.read_u32::<LittleEndian>(),
            |c| c.read_u32::<BigEndian>(),
            ArrayData::UInt32,
        ),
        DataType::Int64 => read_vec_typed(
            endian,
            data,
            |c| c.read_i64::<LittleEndian>(),
            |c| c.read_i64::<BigEndian>(),
            ArrayData::Int64,
        ),
        DataType::UInt64 => read_vec_typed(
            endian,
            data,
            |c| c.read_u64::<LittleEndian>(),
            |c| c.read_u64::<BigEndian>(),
            ArrayData::UInt64,
        ),
        DataType::Float32 => read_vec_typed(
            endian,
            data,
            |c| c.read_f32::<LittleEndian>(),
            |c| c.read_f32::<BigEndian>(),
            ArrayData::Float32,
        ),
        DataType::Float64 => read_vec_typed(
            endian,
            data,
            |c| c.read_f64::<LittleEndian>(),
            |c| c.read_f64::<BigEndian>(),
            ArrayData::Float64,
        ),
    }
}

/// Helper: read a vector of a fixed-size numeric type.
fn read_vec_typed<T: Clone, F1, F2>(
    endian: Endian,
    data: &[u8],
    read_le: F1,
    read_be: F2,
    wrap: fn(Vec<T>) -> ArrayData,
) -> ConvertResult<ArrayData>
where
    F1: Fn(&mut Cursor<&[u8]>) -> std::io::Result<T>,
    F2: Fn(&mut Cursor<&[u8]>) -> std::io::Result<T>,
{
    let elem_size = std::mem::size_of::<T>();
    let count = data.len() / elem_size;
    let mut out = Vec::with_capacity(count);
    let mut cursor = Cursor::new(data);
    for _ in 0..count {
        let val = match endian {
            Endian::Little | Endian::NotApplicable => (read_le)(&mut cursor),
            Endian::Big => (read_be)(&mut cursor),
        }
        .map_err(|e| ConvertError::Decode(format!("Failed to read value: {e}")))?;
        out.push(val);
    }
    Ok(wrap(out))
}
