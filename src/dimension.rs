//! Dimension discovery and aggregation across input granules.
//!
//! Every input is scanned for dimension variables; when more than one granule
//! is supplied, temporal dimensions are reconciled onto a single epoch and a
//! regular output grid (plus aggregated cell bounds) is reconstructed from
//! the union of all input values.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info};

use crate::dataset::{
    Granule, read_variable_f64, resolve_reference_path, string_attribute,
    variable_dimension_names,
};
use crate::error::{ConvertError, ConvertResult};

/// Cap for the integer-scaling loop. Recurring decimals would otherwise
/// never satisfy the integrality check.
pub const MAX_INTEGER_SCALE: f64 = 1e10;

const INTEGRAL_TOLERANCE: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Time units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn seconds(&self) -> f64 {
        match self {
            TimeUnit::Second => 1.0,
            TimeUnit::Minute => 60.0,
            TimeUnit::Hour => 3600.0,
            TimeUnit::Day => 86400.0,
        }
    }

    /// Parse the CF spelling variants for a time unit.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "seconds" | "second" | "secs" | "sec" | "s" => Some(TimeUnit::Second),
            "minutes" | "minute" | "mins" | "min" => Some(TimeUnit::Minute),
            "hours" | "hour" | "hrs" | "hr" | "h" => Some(TimeUnit::Hour),
            "days" | "day" | "d" => Some(TimeUnit::Day),
            _ => None,
        }
    }
}

/// Parse the epoch timestamp of a CF temporal `units` string.
pub fn parse_epoch(text: &str) -> Option<NaiveDateTime> {
    let trimmed = text.trim().trim_end_matches('Z');
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for format in FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(datetime);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Split a `"<unit> since <timestamp>"` units string. Anything that does not
/// match the CF temporal pattern is non-temporal.
pub fn parse_temporal_units(units: &str) -> Option<(TimeUnit, NaiveDateTime)> {
    let (unit_text, epoch_text) = units.split_once(" since ")?;
    let unit = TimeUnit::parse(unit_text)?;
    let epoch = parse_epoch(epoch_text)?;
    Some((unit, epoch))
}

// ---------------------------------------------------------------------------
// DimensionInfo
// ---------------------------------------------------------------------------

/// Everything known about one dimension variable: its fully qualified path,
/// 1-D values, `units` metadata, temporal epoch/unit when the units follow
/// the CF temporal convention, and optional (N, 2) cell bounds.
#[derive(Debug, Clone)]
pub struct DimensionInfo {
    pub path: String,
    pub values: Vec<f64>,
    pub units: Option<String>,
    pub epoch: Option<NaiveDateTime>,
    pub time_unit: Option<TimeUnit>,
    pub bounds_path: Option<String>,
    /// Row-major (N, 2) bounds values.
    pub bounds_values: Option<Vec<f64>>,
}

impl DimensionInfo {
    pub fn new(path: impl Into<String>, values: Vec<f64>, units: Option<String>) -> Self {
        let (time_unit, epoch) = units
            .as_deref()
            .and_then(parse_temporal_units)
            .map(|(unit, epoch)| (Some(unit), Some(epoch)))
            .unwrap_or((None, None));
        Self {
            path: path.into(),
            values,
            units,
            epoch,
            time_unit,
            bounds_path: None,
            bounds_values: None,
        }
    }

    /// Extract a dimension variable (and its bounds companion, if declared)
    /// from an open granule.
    pub fn from_granule(granule: &Granule, path: &str) -> ConvertResult<Self> {
        let variable = granule
            .variable(path)
            .ok_or_else(|| ConvertError::NotFound(format!("No dimension variable at {path}")))?;
        let values = read_variable_f64(&variable)?;
        let units = string_attribute(&variable, "units")?;
        let mut info = Self::new(path, values, units);

        if let Some(bounds_ref) = string_attribute(&variable, "bounds")? {
            let bounds_path = if bounds_ref.starts_with('/') {
                bounds_ref
            } else {
                // Bounds live alongside their dimension variable.
                match path.rsplit_once('/') {
                    Some((parent, _)) if !parent.is_empty() => format!("{parent}/{bounds_ref}"),
                    _ => format!("/{bounds_ref}"),
                }
            };
            if let Some(bounds_variable) = granule.variable(&bounds_path) {
                info.bounds_values = Some(read_variable_f64(&bounds_variable)?);
                info.bounds_path = Some(bounds_path);
            }
        }
        Ok(info)
    }

    pub fn is_temporal(&self) -> bool {
        self.epoch.is_some() && self.time_unit.is_some()
    }

    /// Values under the requested output units. Non-temporal dimensions, and
    /// calls without an output epoch, return the stored values unchanged.
    pub fn get_values(&self, output_units: Option<&str>) -> Vec<f64> {
        match output_units {
            Some(units) => self.convert(&self.values, units),
            None => self.values.clone(),
        }
    }

    /// Bounds values under the requested output units.
    pub fn get_bounds_values(&self, output_units: Option<&str>) -> Option<Vec<f64>> {
        let bounds = self.bounds_values.as_ref()?;
        Some(match output_units {
            Some(units) => self.convert(bounds, units),
            None => bounds.clone(),
        })
    }

    fn convert(&self, values: &[f64], output_units: &str) -> Vec<f64> {
        let (Some(unit), Some(epoch)) = (self.time_unit, self.epoch) else {
            return values.to_vec();
        };
        let Some((output_unit, output_epoch)) = parse_temporal_units(output_units) else {
            return values.to_vec();
        };
        let offset_seconds = (epoch - output_epoch).num_milliseconds() as f64 / 1000.0;
        values
            .iter()
            .map(|v| (v * unit.seconds() + offset_seconds) / output_unit.seconds())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Grid reconstruction helpers
// ---------------------------------------------------------------------------

/// Multiply by 10 until every value is integral (within floating tolerance),
/// capped at [`MAX_INTEGER_SCALE`]. Returns the scaled integers and the scale.
pub fn scale_to_integers(values: &[f64]) -> (Vec<i128>, f64) {
    let integral = |scale: f64| {
        values.iter().all(|v| {
            let scaled = v * scale;
            (scaled - scaled.round()).abs() <= INTEGRAL_TOLERANCE
        })
    };
    let mut scale = 1.0f64;
    while scale < MAX_INTEGER_SCALE && !integral(scale) {
        scale *= 10.0;
    }
    let integers = values.iter().map(|v| (v * scale).round() as i128).collect();
    (integers, scale)
}

/// The regular grid spacing implied by a set of values: the GCD of all
/// integer-scaled differences from the minimum. A single value has
/// resolution zero.
pub fn get_resolution(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let (integers, scale) = scale_to_integers(values);
    let minimum = *integers.iter().min().expect("non-empty values");
    let gcd = integers
        .iter()
        .map(|v| v - minimum)
        .filter(|diff| *diff != 0)
        .fold(0i128, gcd_i128);
    gcd as f64 / scale
}

fn gcd_i128(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Linearly spaced grid from min to max inclusive, with the given spacing.
/// Grid points are re-rounded to the decimal precision implied by the input
/// values' integer scale, which suppresses linspace artifacts like
/// `-179.849999…`.
pub fn get_grid_values(values: &[f64], resolution: f64) -> Vec<f64> {
    if values.len() < 2 || resolution == 0.0 {
        return values.to_vec();
    }
    let (_, scale) = scale_to_integers(values);
    let decimals = scale.log10().round() as i32;
    let minimum = values.iter().copied().fold(f64::INFINITY, f64::min);
    let maximum = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let count = ((maximum - minimum) / resolution).round() as usize + 1;
    (0..count)
        .map(|i| round_decimals(minimum + i as f64 * resolution, decimals))
        .collect()
}

pub(crate) fn round_decimals(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).expect("no NaN offsets"));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// Equality for grid values after epoch normalization and rounding, with
/// tolerance for the float noise both introduce.
pub(crate) fn values_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 * a.abs().max(b.abs()).max(1.0)
}

// ---------------------------------------------------------------------------
// DimensionsMapping
// ---------------------------------------------------------------------------

/// The dimension information of every input granule, and — for multi-granule
/// conversions — the aggregated output dimensions.
#[derive(Debug)]
pub struct DimensionsMapping {
    pub input_paths: Vec<PathBuf>,
    /// Dimension path -> input file -> that file's dimension record.
    pub input_dimensions: HashMap<String, HashMap<PathBuf, DimensionInfo>>,
    /// Dimension path -> single aggregated record. Empty for single-granule
    /// conversions, which reproduce the input grid exactly.
    pub output_dimensions: HashMap<String, DimensionInfo>,
    /// Bounds variable path -> owning dimension path.
    pub output_bounds: HashMap<String, String>,
}

impl DimensionsMapping {
    pub fn new(input_paths: &[PathBuf]) -> ConvertResult<Self> {
        let mut mapping = Self {
            input_paths: input_paths.to_vec(),
            input_dimensions: HashMap::new(),
            output_dimensions: HashMap::new(),
            output_bounds: HashMap::new(),
        };
        for input_path in input_paths {
            mapping.map_input_dimensions(input_path)?;
        }
        if input_paths.len() > 1 {
            mapping.aggregate_output_dimensions()?;
        }
        Ok(mapping)
    }

    /// The set of aggregated dimension and bounds paths. These arrays are
    /// seeded once before workers start and must not be overwritten by
    /// granule data.
    pub fn aggregated_paths(&self) -> HashSet<String> {
        self.output_dimensions
            .keys()
            .cloned()
            .chain(self.output_bounds.keys().cloned())
            .collect()
    }

    /// The output units of an aggregated dimension or bounds path.
    pub fn output_units(&self, path: &str) -> Option<&str> {
        let dimension_path = self.output_bounds.get(path).map(String::as_str).unwrap_or(path);
        self.output_dimensions
            .get(dimension_path)
            .and_then(|info| info.units.as_deref())
    }

    fn map_input_dimensions(&mut self, input_path: &Path) -> ConvertResult<()> {
        let granule = Granule::open(input_path)?;
        let root = granule.root()?;
        self.parse_group(&granule, &root, "", input_path)?;
        Ok(())
    }

    fn parse_group(
        &mut self,
        granule: &Granule,
        group: &netcdf::Group<'_>,
        group_path: &str,
        input_path: &Path,
    ) -> ConvertResult<()> {
        for variable in group.variables() {
            for dimension_name in variable_dimension_names(&variable) {
                let dimension_path = resolve_reference_path(group, group_path, &dimension_name);
                if !granule.has_variable(&dimension_path) {
                    continue;
                }
                let per_file = self
                    .input_dimensions
                    .entry(dimension_path.clone())
                    .or_default();
                if !per_file.contains_key(input_path) {
                    let info = DimensionInfo::from_granule(granule, &dimension_path)?;
                    per_file.insert(input_path.to_path_buf(), info);
                }
            }
        }

        for nested in group.groups() {
            let nested_path = if group_path.is_empty() {
                nested.name().to_string()
            } else {
                format!("{group_path}/{}", nested.name())
            };
            self.parse_group(granule, &nested, &nested_path, input_path)?;
        }
        Ok(())
    }

    /// Reconcile each dimension across all inputs. Temporal dimensions are
    /// aggregated; non-temporal dimensions are skipped by policy (spatial
    /// grids are assumed identical across inputs); a temporal/non-temporal
    /// mix is an error.
    fn aggregate_output_dimensions(&mut self) -> ConvertResult<()> {
        let mut dimension_paths: Vec<String> = self.input_dimensions.keys().cloned().collect();
        dimension_paths.sort();

        for dimension_path in dimension_paths {
            let records = self.records_in_input_order(&dimension_path);
            let temporal_count = records.iter().filter(|r| r.is_temporal()).count();

            if temporal_count == 0 {
                debug!(dimension = %dimension_path, "skipping non-temporal dimension");
                continue;
            }
            if temporal_count != records.len() {
                return Err(ConvertError::MixedDimensionType(dimension_path));
            }

            let output = aggregate_temporal_dimension(&dimension_path, &records)?;
            info!(
                dimension = %dimension_path,
                size = output.values.len(),
                units = output.units.as_deref().unwrap_or(""),
                "aggregated temporal dimension"
            );
            if let Some(bounds_path) = &output.bounds_path {
                self.output_bounds
                    .insert(bounds_path.clone(), dimension_path.clone());
            }
            self.output_dimensions.insert(dimension_path, output);
        }
        Ok(())
    }

    fn records_in_input_order(&self, dimension_path: &str) -> Vec<&DimensionInfo> {
        let per_file = &self.input_dimensions[dimension_path];
        self.input_paths
            .iter()
            .filter_map(|path| per_file.get(path))
            .collect()
    }
}

/// Build the aggregated record for one temporal dimension: the earliest epoch
/// wins (units string taken verbatim), all values convert onto it, and the
/// output grid spans the sorted union at the GCD-derived resolution.
fn aggregate_temporal_dimension(
    dimension_path: &str,
    records: &[&DimensionInfo],
) -> ConvertResult<DimensionInfo> {
    // First record with the earliest epoch wins, so ties resolve in input
    // order.
    let reference = records
        .iter()
        .copied()
        .reduce(|best, record| if record.epoch < best.epoch { record } else { best })
        .expect("at least one record");
    let output_units = reference
        .units
        .clone()
        .expect("temporal record has units");

    let mut union: Vec<f64> = records
        .iter()
        .flat_map(|record| record.get_values(Some(&output_units)))
        .collect();
    union.sort_by(|a, b| a.partial_cmp(b).expect("finite dimension values"));
    union.dedup_by(|a, b| values_match(*a, *b));

    let resolution = get_resolution(&union);
    let grid = get_grid_values(&union, resolution);

    let mut output = DimensionInfo::new(dimension_path, grid, Some(output_units.clone()));
    if let Some(bounds_path) = records.iter().find_map(|r| r.bounds_path.clone()) {
        aggregate_bounds(&mut output, records, &output_units)?;
        output.bounds_path = Some(bounds_path);
    }
    Ok(output)
}

/// Fill the (N, 2) output bounds: copy each input's rows into the slots whose
/// dimension values match, then bridge coverage gaps with the median
/// lower/upper offsets of the filled rows.
fn aggregate_bounds(
    output: &mut DimensionInfo,
    records: &[&DimensionInfo],
    output_units: &str,
) -> ConvertResult<()> {
    let n = output.values.len();
    let mut rows: Vec<Option<[f64; 2]>> = vec![None; n];

    for record in records {
        let Some(bounds) = record.get_bounds_values(Some(output_units)) else {
            continue;
        };
        let values = record.get_values(Some(output_units));
        if bounds.len() != values.len() * 2 {
            return Err(ConvertError::Metadata(format!(
                "Bounds of {} are not (N, 2)-shaped",
                record.path
            )));
        }
        for (i, value) in values.iter().enumerate() {
            if let Some(slot) = output.values.iter().position(|o| values_match(*o, *value)) {
                rows[slot] = Some([bounds[2 * i], bounds[2 * i + 1]]);
            }
        }
    }

    let lower_offsets: Vec<f64> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| row.map(|r| output.values[i] - r[0]))
        .collect();
    let upper_offsets: Vec<f64> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| row.map(|r| r[1] - output.values[i]))
        .collect();
    if lower_offsets.is_empty() {
        return Err(ConvertError::Metadata(format!(
            "No input bounds rows matched the output grid of {}",
            output.path
        )));
    }
    let median_lower = median(lower_offsets);
    let median_upper = median(upper_offsets);

    let mut flat = Vec::with_capacity(n * 2);
    for (i, row) in rows.iter().enumerate() {
        let [lower, upper] = row.unwrap_or([
            output.values[i] - median_lower,
            output.values[i] + median_upper,
        ]);
        flat.push(lower);
        flat.push(upper);
    }

    // Re-round to the decimal precision the bounds themselves imply, so
    // gap-filled rows do not carry accumulated float noise. The grid values
    // participate so the precision never drops below the grid's own.
    let mut precision_basis = flat.clone();
    precision_basis.extend_from_slice(&output.values);
    let (_, scale) = scale_to_integers(&precision_basis);
    let decimals = scale.log10().round() as i32;
    for value in &mut flat {
        *value = round_decimals(*value, decimals);
    }
    output.bounds_values = Some(flat);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
        if count == 1 {
            return vec![start];
        }
        let step = (stop - start) / (count - 1) as f64;
        (0..count).map(|i| start + i as f64 * step).collect()
    }

    #[test]
    fn parses_cf_temporal_units() {
        let (unit, epoch) = parse_temporal_units("seconds since 2020-01-27T14:00:00").unwrap();
        assert_eq!(unit, TimeUnit::Second);
        assert_eq!(
            epoch,
            NaiveDate::from_ymd_opt(2020, 1, 27)
                .unwrap()
                .and_hms_opt(14, 0, 0)
                .unwrap()
        );

        let (unit, _) = parse_temporal_units("hours since 2001-01-01 00:00:00.0").unwrap();
        assert_eq!(unit, TimeUnit::Hour);

        assert!(parse_temporal_units("degrees_east").is_none());
        assert!(parse_temporal_units("fortnights since 2020-01-01").is_none());
    }

    #[test]
    fn temporal_detection_from_units() {
        let temporal = DimensionInfo::new(
            "/time",
            vec![30.0],
            Some("seconds since 2020-01-27T14:00:00".to_string()),
        );
        assert!(temporal.is_temporal());
        assert_eq!(temporal.time_unit, Some(TimeUnit::Second));

        let spatial = DimensionInfo::new("/longitude", vec![0.0], Some("degrees_east".into()));
        assert!(!spatial.is_temporal());
        assert!(spatial.epoch.is_none());
    }

    #[test]
    fn get_values_converts_onto_output_epoch() {
        let values = linspace(0.0, 1380.0, 24);
        let dimension = DimensionInfo::new(
            "/time",
            values.clone(),
            Some("minutes since 2021-01-02T00:30:00".to_string()),
        );

        assert_eq!(dimension.get_values(None), values);

        let shifted = dimension.get_values(Some("minutes since 2021-01-01T00:30:00"));
        let expected: Vec<f64> = values.iter().map(|v| v + 1440.0).collect();
        assert_eq!(shifted, expected);
    }

    #[test]
    fn scaling_makes_values_integral() {
        let (integers, scale) = scale_to_integers(&[0.0, 0.125, 0.25, 0.375, 0.5]);
        assert_eq!(integers, vec![0, 125, 250, 375, 500]);
        assert_eq!(scale, 1000.0);

        let (integers, scale) = scale_to_integers(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(integers, vec![1, 2, 3, 4]);
        assert_eq!(scale, 1.0);

        // Recurring decimals stop at the cap instead of looping forever.
        let (integers, scale) = scale_to_integers(&[0.0, 0.99999999999, 2.0]);
        assert_eq!(scale, MAX_INTEGER_SCALE);
        assert_eq!(integers, vec![0, 10_000_000_000, 20_000_000_000]);
    }

    #[test]
    fn resolution_reference_values() {
        let mut merra_times = linspace(0.0, 1380.0, 24);
        merra_times.extend(linspace(2880.0, 4260.0, 24));
        assert_eq!(get_resolution(&merra_times), 60.0);

        assert_eq!(get_resolution(&[1_577_836_800.0, 1_577_923_200.0]), 86400.0);
        assert_eq!(get_resolution(&[0.25, 0.0, 0.625]), 0.125);
        assert_eq!(get_resolution(&[10.0]), 0.0);
    }

    #[test]
    fn grid_covers_inputs_at_constant_spacing() {
        let input = [0.25, 0.0, 0.625];
        let grid = get_grid_values(&input, 0.125);
        assert_eq!(grid, vec![0.0, 0.125, 0.25, 0.375, 0.5, 0.625]);
        for value in input {
            assert!(grid.contains(&value));
        }

        assert_eq!(get_grid_values(&[0.25], 0.0), vec![0.25]);
    }

    #[test]
    fn grid_rounding_suppresses_linspace_artifacts() {
        // 0.05-spaced values pick up binary noise when accumulated.
        let input = [-179.85, -179.75];
        let grid = get_grid_values(&input, 0.05);
        assert_eq!(grid, vec![-179.85, -179.8, -179.75]);
    }

    #[test]
    fn temporal_aggregation_earliest_epoch_wins() {
        let values = linspace(0.0, 1380.0, 24);
        let one = DimensionInfo::new(
            "/time",
            values.clone(),
            Some("minutes since 2020-01-01T00:30:00".to_string()),
        );
        let two = DimensionInfo::new(
            "/time",
            values,
            Some("minutes since 2020-01-02T00:30:00".to_string()),
        );

        let output = aggregate_temporal_dimension("/time", &[&one, &two]).unwrap();
        assert_eq!(
            output.units.as_deref(),
            Some("minutes since 2020-01-01T00:30:00")
        );
        assert_eq!(output.values, linspace(0.0, 2820.0, 48));
    }

    #[test]
    fn temporal_aggregation_bridges_gaps() {
        let daily = linspace(0.0, 432000.0, 6);
        let units = Some("seconds since 2020-01-27T14:00:00".to_string());
        let one = DimensionInfo::new("/time", vec![daily[0]], units.clone());
        let two = DimensionInfo::new("/time", vec![daily[2]], units.clone());
        let three = DimensionInfo::new("/time", vec![daily[5]], units);

        let output = aggregate_temporal_dimension("/time", &[&one, &two, &three]).unwrap();
        assert_eq!(output.values, daily);
    }

    #[test]
    fn bounds_gap_fill_uses_median_offsets() {
        let units = Some("days since 2020-01-01T12:00:00".to_string());
        let mut one = DimensionInfo::new("/time", vec![0.0, 1.0, 2.0], units.clone());
        one.bounds_path = Some("/time_bnds".to_string());
        one.bounds_values = Some(vec![-0.5, 0.5, 0.5, 1.5, 1.5, 2.5]);
        let mut two = DimensionInfo::new("/time", vec![9.0, 10.0, 11.0], units);
        two.bounds_path = Some("/time_bnds".to_string());
        two.bounds_values = Some(vec![8.5, 9.5, 9.5, 10.5, 10.5, 11.5]);

        let output = aggregate_temporal_dimension("/time", &[&one, &two]).unwrap();
        assert_eq!(output.values.len(), 12);
        assert_eq!(output.bounds_path.as_deref(), Some("/time_bnds"));

        let bounds = output.bounds_values.as_ref().unwrap();
        assert_eq!(bounds.len(), 24);
        for (i, value) in output.values.iter().enumerate() {
            assert_eq!(bounds[2 * i], value - 0.5, "lower bound of row {i}");
            assert_eq!(bounds[2 * i + 1], value + 0.5, "upper bound of row {i}");
        }
    }
}
