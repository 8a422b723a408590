//! Input-side adapter over NetCDF-4 granules.
//!
//! The `netcdf` crate reads values exactly as stored on disk (no implicit
//! scale/offset or mask transforms), which is the copy contract the writer
//! relies on: `scale_factor` and `add_offset` travel as plain attributes.

use std::path::{Path, PathBuf};

use netcdf::AttributeValue;
use netcdf::types::{BasicType, VariableType};

use crate::error::{ConvertError, ConvertResult};
use crate::types::{ArrayData, AttrValue, DataType};

// ---------------------------------------------------------------------------
// Granule
// ---------------------------------------------------------------------------

/// One locally accessible input granule.
pub struct Granule {
    path: PathBuf,
    file: netcdf::File,
}

impl Granule {
    pub fn open(path: &Path) -> ConvertResult<Self> {
        let file = netcdf::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> ConvertResult<netcdf::Group<'_>> {
        self.file.root().ok_or_else(|| {
            ConvertError::Metadata(format!("{} has no root group", self.path.display()))
        })
    }

    /// Find a variable by its fully qualified path (leading-slash form).
    pub fn variable(&self, full_path: &str) -> Option<netcdf::Variable<'_>> {
        let path = full_path.trim_start_matches('/');
        self.file.variable(path)
    }

    /// Check if a variable exists at a fully qualified path. A missing group
    /// anywhere along the path also counts as absent.
    pub fn has_variable(&self, full_path: &str) -> bool {
        self.variable(full_path).is_some()
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Qualify a dimension or bounds reference made by a variable.
///
/// A leading slash means the reference is already absolute. Otherwise, if the
/// referencing variable's own (non-root) group holds a variable of that name,
/// the reference resolves within the group; anything else resolves to the
/// root.
pub fn resolve_reference_path(
    group: &netcdf::Group<'_>,
    group_path: &str,
    reference: &str,
) -> String {
    if reference.starts_with('/') {
        reference.to_string()
    } else if !group_path.is_empty() && group.variable(reference).is_some() {
        format!("/{group_path}/{reference}")
    } else {
        format!("/{reference}")
    }
}

// ---------------------------------------------------------------------------
// Attribute coercion
// ---------------------------------------------------------------------------

/// Coerce a NetCDF attribute into the normalized [`AttrValue`] sum.
/// Numeric scalars widen to i64/f64, numeric arrays to homogeneous arrays,
/// and byte-ish strings arrive as UTF-8 via the `netcdf` crate.
pub fn coerce_attribute(value: AttributeValue) -> Option<AttrValue> {
    match value {
        AttributeValue::Uchar(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Schar(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Ushort(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Short(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Uint(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Int(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Ulonglong(v) => Some(AttrValue::Int(v as i64)),
        AttributeValue::Longlong(v) => Some(AttrValue::Int(v)),
        AttributeValue::Float(v) => Some(AttrValue::Float(v as f64)),
        AttributeValue::Double(v) => Some(AttrValue::Float(v)),
        AttributeValue::Str(v) => Some(AttrValue::Str(v)),
        AttributeValue::Uchars(v) => {
            Some(AttrValue::IntArray(v.into_iter().map(|x| x as i64).collect()))
        }
        AttributeValue::Schars(v) => {
            Some(AttrValue::IntArray(v.into_iter().map(|x| x as i64).collect()))
        }
        AttributeValue::Ushorts(v) => {
            Some(AttrValue::IntArray(v.into_iter().map(|x| x as i64).collect()))
        }
        AttributeValue::Shorts(v) => {
            Some(AttrValue::IntArray(v.into_iter().map(|x| x as i64).collect()))
        }
        AttributeValue::Uints(v) => {
            Some(AttrValue::IntArray(v.into_iter().map(|x| x as i64).collect()))
        }
        AttributeValue::Ints(v) => {
            Some(AttrValue::IntArray(v.into_iter().map(|x| x as i64).collect()))
        }
        AttributeValue::Ulonglongs(v) => {
            Some(AttrValue::IntArray(v.into_iter().map(|x| x as i64).collect()))
        }
        AttributeValue::Longlongs(v) => Some(AttrValue::IntArray(v)),
        AttributeValue::Floats(v) => {
            Some(AttrValue::FloatArray(v.into_iter().map(|x| x as f64).collect()))
        }
        AttributeValue::Doubles(v) => Some(AttrValue::FloatArray(v)),
        AttributeValue::Strs(v) => Some(AttrValue::StrArray(v)),
    }
}

/// All attributes of a variable, in declaration order, coerced.
pub fn variable_attributes(
    variable: &netcdf::Variable<'_>,
) -> ConvertResult<Vec<(String, AttrValue)>> {
    let mut attrs = Vec::new();
    for attribute in variable.attributes() {
        let name = attribute.name().to_string();
        if let Some(value) = coerce_attribute(attribute.value()?) {
            attrs.push((name, value));
        }
    }
    Ok(attrs)
}

/// All attributes of a group, in declaration order, coerced.
pub fn group_attributes(group: &netcdf::Group<'_>) -> ConvertResult<Vec<(String, AttrValue)>> {
    let mut attrs = Vec::new();
    for attribute in group.attributes() {
        let name = attribute.name().to_string();
        if let Some(value) = coerce_attribute(attribute.value()?) {
            attrs.push((name, value));
        }
    }
    Ok(attrs)
}

/// Fetch one attribute of a variable, coerced, or `None` when absent.
pub fn variable_attribute(
    variable: &netcdf::Variable<'_>,
    name: &str,
) -> ConvertResult<Option<AttrValue>> {
    match variable.attribute(name) {
        Some(attribute) => Ok(coerce_attribute(attribute.value()?)),
        None => Ok(None),
    }
}

/// Fetch a string attribute of a variable.
pub fn string_attribute(
    variable: &netcdf::Variable<'_>,
    name: &str,
) -> ConvertResult<Option<String>> {
    Ok(variable_attribute(variable, name)?
        .and_then(|v| v.as_str().map(|s| s.to_string())))
}

// ---------------------------------------------------------------------------
// Typed reads
// ---------------------------------------------------------------------------

/// The crate-native element type of a variable, or `None` for types outside
/// the numeric classic model (strings, compounds, enums, ...).
pub fn variable_data_type(variable: &netcdf::Variable<'_>) -> Option<DataType> {
    match variable.vartype() {
        VariableType::Basic(basic) => match basic {
            BasicType::Byte => Some(DataType::Int8),
            BasicType::Char | BasicType::Ubyte => Some(DataType::UInt8),
            BasicType::Short => Some(DataType::Int16),
            BasicType::Ushort => Some(DataType::UInt16),
            BasicType::Int => Some(DataType::Int32),
            BasicType::Uint => Some(DataType::UInt32),
            BasicType::Int64 => Some(DataType::Int64),
            BasicType::Uint64 => Some(DataType::UInt64),
            BasicType::Float => Some(DataType::Float32),
            BasicType::Double => Some(DataType::Float64),
        },
        _ => None,
    }
}

/// Read a whole variable as stored on disk, preserving its element type.
pub fn read_variable(variable: &netcdf::Variable<'_>) -> ConvertResult<ArrayData> {
    let dtype = variable_data_type(variable).ok_or_else(|| {
        ConvertError::Metadata(format!(
            "Variable {} has a non-numeric type",
            variable.name()
        ))
    })?;
    let data = match dtype {
        DataType::Int8 => ArrayData::Int8(variable.get_values::<i8, _>(..)?),
        DataType::UInt8 => ArrayData::UInt8(variable.get_values::<u8, _>(..)?),
        DataType::Int16 => ArrayData::Int16(variable.get_values::<i16, _>(..)?),
        DataType::UInt16 => ArrayData::UInt16(variable.get_values::<u16, _>(..)?),
        DataType::Int32 => ArrayData::Int32(variable.get_values::<i32, _>(..)?),
        DataType::UInt32 => ArrayData::UInt32(variable.get_values::<u32, _>(..)?),
        DataType::Int64 => ArrayData::Int64(variable.get_values::<i64, _>(..)?),
        DataType::UInt64 => ArrayData::UInt64(variable.get_values::<u64, _>(..)?),
        DataType::Float32 => ArrayData::Float32(variable.get_values::<f32, _>(..)?),
        DataType::Float64 => ArrayData::Float64(variable.get_values::<f64, _>(..)?),
    };
    Ok(data)
}

/// Read a whole variable widened to f64 (dimension variables).
pub fn read_variable_f64(variable: &netcdf::Variable<'_>) -> ConvertResult<Vec<f64>> {
    Ok(variable.get_values::<f64, _>(..)?)
}

/// The shape of a variable, from its dimension lengths.
pub fn variable_shape(variable: &netcdf::Variable<'_>) -> Vec<usize> {
    variable.dimensions().iter().map(|d| d.len()).collect()
}

/// The declared dimension names of a variable, in order.
pub fn variable_dimension_names(variable: &netcdf::Variable<'_>) -> Vec<String> {
    variable.dimensions().iter().map(|d| d.name()).collect()
}

// ---------------------------------------------------------------------------
// Owned snapshots
// ---------------------------------------------------------------------------

/// An owned, `Send` copy of one granule's tree. NetCDF handles cannot cross
/// await points, so workers snapshot a granule on a blocking thread and the
/// async writer consumes the snapshot.
#[derive(Debug)]
pub struct GranuleSnapshot {
    pub path: PathBuf,
    pub root: GroupNode,
}

#[derive(Debug)]
pub struct GroupNode {
    /// Store-relative path: `""` for the root, `"data/vertical"` below it.
    pub path: String,
    pub attributes: Vec<(String, AttrValue)>,
    pub variables: Vec<VariableNode>,
    pub groups: Vec<GroupNode>,
}

#[derive(Debug)]
pub struct VariableNode {
    pub name: String,
    /// Fully qualified path, leading-slash form: `"/science_group/nested"`.
    pub path: String,
    /// Declared dimension names, in order.
    pub dimension_names: Vec<String>,
    /// The declared dimensions resolved to fully qualified paths.
    pub dimension_paths: Vec<String>,
    pub shape: Vec<usize>,
    /// `None` for types outside the numeric classic model.
    pub data_type: Option<DataType>,
    pub attributes: Vec<(String, AttrValue)>,
    pub data: Option<ArrayData>,
}

impl VariableNode {
    pub fn f64_attribute(&self, name: &str) -> Option<f64> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr == name)
            .and_then(|(_, value)| value.as_f64())
    }
}

impl GranuleSnapshot {
    /// Snapshot a granule including variable data.
    pub fn load(path: &Path) -> ConvertResult<Self> {
        Self::load_inner(path, true)
    }

    /// Snapshot a granule's structure only (shapes, types, attributes).
    pub fn load_structure(path: &Path) -> ConvertResult<Self> {
        Self::load_inner(path, false)
    }

    fn load_inner(path: &Path, with_data: bool) -> ConvertResult<Self> {
        let granule = Granule::open(path)?;
        let root = granule.root()?;
        let root = snapshot_group(&granule, &root, "", with_data)?;
        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }

    /// Every variable in the tree, depth first.
    pub fn variables(&self) -> Vec<&VariableNode> {
        let mut out = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(group) = stack.pop() {
            out.extend(group.variables.iter());
            stack.extend(group.groups.iter());
        }
        out
    }
}

fn snapshot_group(
    granule: &Granule,
    group: &netcdf::Group<'_>,
    group_path: &str,
    with_data: bool,
) -> ConvertResult<GroupNode> {
    let mut variables = Vec::new();
    for variable in group.variables() {
        let name = variable.name();
        let full_path = if group_path.is_empty() {
            format!("/{name}")
        } else {
            format!("/{group_path}/{name}")
        };
        let dimension_names = variable_dimension_names(&variable);
        let dimension_paths = dimension_names
            .iter()
            .map(|dim| resolve_reference_path(group, group_path, dim))
            .collect();
        let data_type = variable_data_type(&variable);
        let shape = variable_shape(&variable);
        let data = if with_data && data_type.is_some() && !shape.is_empty() {
            Some(read_variable(&variable)?)
        } else {
            None
        };
        variables.push(VariableNode {
            name,
            path: full_path,
            dimension_names,
            dimension_paths,
            shape,
            data_type,
            attributes: variable_attributes(&variable)?,
            data,
        });
    }

    let mut groups = Vec::new();
    for nested in group.groups() {
        let nested_path = if group_path.is_empty() {
            nested.name().to_string()
        } else {
            format!("{group_path}/{}", nested.name())
        };
        groups.push(snapshot_group(granule, &nested, &nested_path, with_data)?);
    }

    Ok(GroupNode {
        path: group_path.to_string(),
        attributes: group_attributes(group)?,
        variables,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_coercion_widens_numeric_scalars() {
        assert_eq!(
            coerce_attribute(AttributeValue::Short(-3)),
            Some(AttrValue::Int(-3))
        );
        assert_eq!(
            coerce_attribute(AttributeValue::Float(0.5)),
            Some(AttrValue::Float(0.5))
        );
        assert_eq!(
            coerce_attribute(AttributeValue::Ints(vec![0, 25])),
            Some(AttrValue::IntArray(vec![0, 25]))
        );
        assert_eq!(
            coerce_attribute(AttributeValue::Str("degrees_north".into())),
            Some(AttrValue::Str("degrees_north".into()))
        );
    }
}
