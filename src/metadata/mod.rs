pub mod v2;

use crate::types::{DataType, FillValue};

/// Parse a fill value from a JSON value, given the target data type.
/// Handles special string values like "NaN", "Infinity", "-Infinity",
/// JSON null, and normal numeric values.
pub fn parse_fill_value(dtype: DataType, value: &serde_json::Value) -> Result<FillValue, String> {
    match value {
        serde_json::Value::Null => Ok(FillValue::Null),

        serde_json::Value::String(s) => match s.as_str() {
            "NaN" => float_only(dtype, FillValue::NaN),
            "Infinity" => float_only(dtype, FillValue::Infinity),
            "-Infinity" => float_only(dtype, FillValue::NegativeInfinity),
            other => Err(format!("Expected {dtype:?} value, got string: {other}")),
        },

        serde_json::Value::Number(n) => n
            .as_f64()
            .map(FillValue::Value)
            .ok_or_else(|| format!("Unrepresentable fill_value number: {n}")),

        _ => Err(format!("Unexpected fill_value JSON: {value}")),
    }
}

fn float_only(dtype: DataType, fill: FillValue) -> Result<FillValue, String> {
    match dtype {
        DataType::Float32 | DataType::Float64 => Ok(fill),
        _ => Err(format!("{fill:?} not valid for {dtype:?}")),
    }
}

/// Serialize a fill value into `.zarray` JSON.
pub fn fill_value_to_json(fill: &FillValue) -> serde_json::Value {
    match fill {
        FillValue::Null => serde_json::Value::Null,
        FillValue::NaN => serde_json::json!("NaN"),
        FillValue::Infinity => serde_json::json!("Infinity"),
        FillValue::NegativeInfinity => serde_json::json!("-Infinity"),
        FillValue::Value(v) => {
            if v.is_nan() {
                serde_json::json!("NaN")
            } else if v.fract() == 0.0 && v.abs() < 9.0e15 {
                serde_json::json!(*v as i64)
            } else {
                serde_json::json!(v)
            }
        }
    }
}
