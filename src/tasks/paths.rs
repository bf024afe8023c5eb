//! Config references, path aliases and output-location lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value as YamlValue;
use tracing::{debug, warn};

use super::params::{ParamMap, ParamValue};
use crate::error::ParamError;

/// Parameter / config key naming the run's output directory.
pub const OUTPUT_DIR_KEY: &str = "output_dir";

/// Nested alias expansion stops after this many levels.
const MAX_ALIAS_DEPTH: usize = 5;

/// Named path prefixes (`alias` or `alias:rest/of/path`).
pub type PathAliases = HashMap<String, String>;

/// Expand aliases in a path reference.
///
/// An exact alias match is replaced by its value; a leading `alias:` prefix is
/// replaced by the alias value joined with the rest. Expansion recurses up to
/// `MAX_ALIAS_DEPTH` levels and returns the partially expanded string beyond that.
pub fn resolve_alias(reference: &str, aliases: &PathAliases) -> String {
    resolve_alias_at(reference, aliases, 0)
}

fn resolve_alias_at(reference: &str, aliases: &PathAliases, depth: usize) -> String {
    if reference.is_empty() {
        return String::new();
    }
    if depth > MAX_ALIAS_DEPTH {
        warn!(reference, "Alias expansion depth exceeded, returning unresolved");
        return reference.to_string();
    }

    let mut resolved = reference.to_string();

    if let Some(target) = aliases.get(&resolved) {
        resolved = resolve_alias_at(target, aliases, depth + 1);
    }

    if let Some((prefix, rest)) = resolved.split_once(':') {
        if let Some(base) = aliases.get(prefix) {
            let base = resolve_alias_at(base, aliases, depth + 1);
            resolved = join_alias(&base, rest);
        }
    }

    resolved
}

fn join_alias(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            rest.trim_start_matches('/')
        ),
    }
}

/// Make `path` absolute relative to `base` when it is not already.
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load the `path_aliases` table from a YAML super-config file.
pub fn load_aliases(path: &Path) -> Result<PathAliases, ParamError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ParamError::ConfigUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let doc: YamlValue = serde_yaml::from_str(&raw).map_err(|e| ParamError::InvalidConfig {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut aliases = PathAliases::new();
    if let Some(YamlValue::Mapping(table)) = doc.get("path_aliases") {
        for (k, v) in table {
            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                aliases.insert(k.to_string(), v.to_string());
            }
        }
    }
    Ok(aliases)
}

/// A loaded pipeline config file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    /// Raw document, kept for ordered key search.
    pub document: YamlValue,
    /// The document as parameters (empty if the document is not a mapping).
    pub params: ParamMap,
}

/// Resolve a config reference and load it.
pub fn load_config(
    reference: &str,
    aliases: &PathAliases,
    base: &Path,
) -> Result<LoadedConfig, ParamError> {
    let expanded = resolve_alias(reference, aliases);
    let path = absolutize(Path::new(&expanded), base);
    if !path.is_file() {
        return Err(ParamError::ConfigNotFound(path.display().to_string()));
    }

    let raw = std::fs::read_to_string(&path).map_err(|e| ParamError::ConfigUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let document: YamlValue = serde_yaml::from_str(&raw).map_err(|e| ParamError::InvalidConfig {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let params = match &document {
        YamlValue::Mapping(_) => {
            serde_yaml::from_value::<ParamMap>(document.clone()).map_err(|e| {
                ParamError::InvalidConfig {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?
        }
        YamlValue::Null => ParamMap::new(),
        _ => {
            return Err(ParamError::InvalidConfig {
                path: path.display().to_string(),
                reason: "top level must be a mapping".to_string(),
            });
        }
    };

    debug!(path = %path.display(), keys = params.len(), "Loaded pipeline config");
    Ok(LoadedConfig {
        path,
        document,
        params,
    })
}

/// Depth-first search for the first string value stored under `key`, in
/// document order. Non-string values under `key` are skipped.
pub fn find_first_string(value: &YamlValue, key: &str) -> Option<String> {
    match value {
        YamlValue::Mapping(map) => {
            for (k, v) in map {
                if k.as_str() == Some(key) {
                    if let Some(s) = v.as_str() {
                        return Some(s.to_string());
                    }
                    debug!(key, "Key found with a non-string value, continuing search");
                } else if let Some(found) = find_first_string(v, key) {
                    return Some(found);
                }
            }
            None
        }
        YamlValue::Sequence(items) => items.iter().find_map(|item| find_first_string(item, key)),
        YamlValue::Tagged(tagged) => find_first_string(&tagged.value, key),
        _ => None,
    }
}

/// Where a run writes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLocation {
    Resolved(PathBuf),
    /// Neither the overrides nor the config name an output directory.
    Undefined,
}

/// Determine the output location: explicit parameter first, then the config
/// document, otherwise `Undefined`. Relative paths resolve against `base`.
pub fn resolve_output_location(
    params: &ParamMap,
    config: Option<&LoadedConfig>,
    base: &Path,
) -> OutputLocation {
    let from_params = params.get(OUTPUT_DIR_KEY).and_then(ParamValue::as_str).map(str::to_string);
    let from_config = || config.and_then(|c| find_first_string(&c.document, OUTPUT_DIR_KEY));

    match from_params.or_else(from_config) {
        Some(dir) if !dir.is_empty() => {
            OutputLocation::Resolved(absolutize(Path::new(&dir), base))
        }
        _ => OutputLocation::Undefined,
    }
}
