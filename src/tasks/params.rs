//! Tagged job parameters.
//!
//! Parameters arrive from two places: overrides in the job description and
//! values declared in the config file. Both are flattened (nested maps lifted
//! to the top level) and then merged, with overrides winning.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ParamError;

/// Key whose list value names sections that must stay nested.
pub const NO_FLATTEN_KEY: &str = "no_flatten";

/// Parameter injected into every run so the pipeline knows its own task id.
pub const TASK_ID_KEY: &str = "task_id";

/// Ordered map of parameter names to values.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(ParamMap),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ParamMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Collect the section names listed under `no_flatten`, if any.
pub fn no_flatten_keys(map: &ParamMap) -> BTreeSet<String> {
    match map.get(NO_FLATTEN_KEY) {
        Some(ParamValue::List(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(ParamValue::String(s)) => BTreeSet::from([s.clone()]),
        _ => BTreeSet::new(),
    }
}

/// Lift nested maps to the top level.
///
/// Keys in `keep_nested` are copied as-is. A key appearing twice after
/// flattening is an error rather than a silent overwrite.
pub fn flatten(map: &ParamMap, keep_nested: &BTreeSet<String>) -> Result<ParamMap, ParamError> {
    let mut flat = ParamMap::new();
    flatten_into(map, keep_nested, &mut flat)?;
    Ok(flat)
}

fn flatten_into(
    map: &ParamMap,
    keep_nested: &BTreeSet<String>,
    out: &mut ParamMap,
) -> Result<(), ParamError> {
    for (key, value) in map {
        match value {
            ParamValue::Map(nested) if !keep_nested.contains(key) => {
                flatten_into(nested, keep_nested, out)?;
            }
            _ => {
                if out.contains_key(key) {
                    return Err(ParamError::KeyConflict(key.clone()));
                }
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}

/// Merge flattened config values with flattened overrides. Overrides win.
pub fn merge(config: ParamMap, overrides: ParamMap) -> ParamMap {
    let mut merged = config;
    merged.extend(overrides);
    merged
}

/// Flatten both sources and merge them into the parameters for one run.
pub fn resolve(config: Option<&ParamMap>, overrides: Option<&ParamMap>) -> Result<ParamMap, ParamError> {
    let empty = ParamMap::new();
    let config = config.unwrap_or(&empty);
    let overrides = overrides.unwrap_or(&empty);

    let mut keep_nested = no_flatten_keys(config);
    keep_nested.extend(no_flatten_keys(overrides));

    let config_flat = flatten(config, &keep_nested)?;
    let overrides_flat = flatten(overrides, &keep_nested)?;
    Ok(merge(config_flat, overrides_flat))
}
