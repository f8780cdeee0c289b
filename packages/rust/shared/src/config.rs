//! Settings and parameters documents.
//!
//! Both documents are YAML. The settings document is a nested mapping of
//! paths, URIs and credential placeholders addressed by dotted keys
//! (`data_ingestion.source_url`). The parameters document is a flat mapping of
//! hyperparameters whose YAML types are checked against what each stage
//! expects. Both are loaded once and never mutated.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_yaml::Value;

use crate::error::{PipelineError, Result};
use crate::types::ImageShape;

/// Default settings document location, relative to the project root.
pub const DEFAULT_SETTINGS_FILE: &str = "config/config.yaml";

/// Default parameters document location, relative to the project root.
pub const DEFAULT_PARAMS_FILE: &str = "params.yaml";

fn read_yaml(path: &Path, what: &str) -> Result<Value> {
    if !path.is_file() {
        return Err(PipelineError::config(format!(
            "{what} not found at {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    serde_yaml::from_str(&content).map_err(|e| {
        PipelineError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

// ---------------------------------------------------------------------------
// SettingsDocument
// ---------------------------------------------------------------------------

/// Nested mapping of paths, URIs and credential placeholders.
#[derive(Debug, Clone)]
pub struct SettingsDocument {
    root: Value,
}

impl SettingsDocument {
    /// Load the settings document from disk. A missing file is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let root = read_yaml(path, "settings document")?;
        let doc = Self::from_value(root)?;
        tracing::debug!(path = %path.display(), "loaded settings document");
        Ok(doc)
    }

    /// Parse a settings document from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::config(format!("failed to parse settings: {e}")))?;
        Self::from_value(root)
    }

    fn from_value(root: Value) -> Result<Self> {
        if !root.is_mapping() {
            return Err(PipelineError::config(
                "settings document must be a mapping at the top level",
            ));
        }
        Ok(Self { root })
    }

    /// Look up a value by dotted key, returning `None` if any segment is absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.root, |node, segment| node.get(segment))
            .filter(|value| !value.is_null())
    }

    /// Whether a (possibly nested) key is present and non-null.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Require a string value at a dotted key.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.optional_str(key)?.ok_or_else(|| {
            PipelineError::config(format!("settings key `{key}` is missing"))
        })
    }

    /// Read an optional string value at a dotted key.
    pub fn optional_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Err(PipelineError::config(
                format!("settings key `{key}` must not be empty"),
            )),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(PipelineError::config(format!(
                "settings key `{key}` must be a string, found {}",
                describe(other)
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ParamValue
// ---------------------------------------------------------------------------

/// A hyperparameter value with its YAML type preserved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
    Null,
}

impl ParamValue {
    fn from_yaml(key: &str, value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Self::Int(i),
                (None, Some(f)) => Self::Float(f),
                (None, None) => {
                    return Err(PipelineError::config(format!(
                        "parameter `{key}` is out of range: {n}"
                    )));
                }
            },
            Value::String(s) => Self::Text(s.clone()),
            Value::Sequence(items) => Self::List(
                items
                    .iter()
                    .map(|item| Self::from_yaml(key, item))
                    .collect::<Result<_>>()?,
            ),
            Value::Mapping(_) | Value::Tagged(_) => {
                return Err(PipelineError::config(format!(
                    "parameter `{key}` must be a scalar or list; the parameters document is flat"
                )));
            }
        })
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
            Self::List(_) => "list",
            Self::Null => "null",
        }
    }

    /// Convert to a JSON value for metric sinks.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Null => serde_json::Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// ParametersDocument
// ---------------------------------------------------------------------------

/// Flat mapping of hyperparameter names to typed values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParametersDocument {
    values: BTreeMap<String, ParamValue>,
}

impl ParametersDocument {
    /// Load the parameters document from disk. A missing file is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let root = read_yaml(path, "parameters document")?;
        let doc = Self::from_value(&root)?;
        tracing::debug!(path = %path.display(), count = doc.values.len(), "loaded parameters document");
        Ok(doc)
    }

    /// Parse a parameters document from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::config(format!("failed to parse parameters: {e}")))?;
        Self::from_value(&root)
    }

    fn from_value(root: &Value) -> Result<Self> {
        let mapping = root.as_mapping().ok_or_else(|| {
            PipelineError::config("parameters document must be a mapping at the top level")
        })?;

        let mut values = BTreeMap::new();
        for (key, value) in mapping {
            let key = key.as_str().ok_or_else(|| {
                PipelineError::config(format!(
                    "parameter names must be strings, found {}",
                    describe(key)
                ))
            })?;
            values.insert(key.to_string(), ParamValue::from_yaml(key, value)?);
        }
        Ok(Self { values })
    }

    /// All parameters, sorted by name.
    pub fn all(&self) -> &BTreeMap<String, ParamValue> {
        &self.values
    }

    fn require(&self, key: &str) -> Result<&ParamValue> {
        self.values
            .get(key)
            .ok_or_else(|| PipelineError::config(format!("parameter `{key}` is missing")))
    }

    fn mismatch(key: &str, expected: &str, found: &ParamValue) -> PipelineError {
        PipelineError::config(format!(
            "parameter `{key}` must be {expected}, found {}",
            found.type_name()
        ))
    }

    /// Require an integer parameter.
    pub fn require_int(&self, key: &str) -> Result<i64> {
        match self.require(key)? {
            ParamValue::Int(i) => Ok(*i),
            other => Err(Self::mismatch(key, "an integer", other)),
        }
    }

    /// Require a non-negative integer parameter that fits in `u32`.
    pub fn require_u32(&self, key: &str) -> Result<u32> {
        let value = self.require_int(key)?;
        u32::try_from(value).map_err(|_| {
            PipelineError::config(format!(
                "parameter `{key}` must be a non-negative integer, got {value}"
            ))
        })
    }

    /// Require a non-negative integer parameter that fits in `u64`.
    pub fn require_u64(&self, key: &str) -> Result<u64> {
        let value = self.require_int(key)?;
        u64::try_from(value).map_err(|_| {
            PipelineError::config(format!(
                "parameter `{key}` must be a non-negative integer, got {value}"
            ))
        })
    }

    /// Require a float parameter. Integer literals are widened.
    pub fn require_f64(&self, key: &str) -> Result<f64> {
        match self.require(key)? {
            ParamValue::Float(f) => Ok(*f),
            ParamValue::Int(i) => Ok(*i as f64),
            other => Err(Self::mismatch(key, "a number", other)),
        }
    }

    /// Require a bool parameter.
    pub fn require_bool(&self, key: &str) -> Result<bool> {
        match self.require(key)? {
            ParamValue::Bool(b) => Ok(*b),
            other => Err(Self::mismatch(key, "a bool", other)),
        }
    }

    /// Read an optional, nullable string parameter.
    pub fn optional_text(&self, key: &str) -> Result<Option<String>> {
        match self.values.get(key) {
            None | Some(ParamValue::Null) => Ok(None),
            Some(ParamValue::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(Self::mismatch(key, "a string", other)),
        }
    }

    /// Read an optional, nullable non-negative integer parameter.
    pub fn optional_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.values.get(key) {
            None | Some(ParamValue::Null) => Ok(None),
            Some(_) => self.require_u32(key).map(Some),
        }
    }

    /// Require an `[height, width, channels]` list.
    pub fn require_shape(&self, key: &str) -> Result<ImageShape> {
        let items = match self.require(key)? {
            ParamValue::List(items) => items,
            other => return Err(Self::mismatch(key, "a list of three integers", other)),
        };

        let dims = items
            .iter()
            .map(|item| match item {
                ParamValue::Int(i) => u32::try_from(*i).ok(),
                _ => None,
            })
            .collect::<Option<Vec<u32>>>()
            .filter(|dims| dims.len() == 3)
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "parameter `{key}` must be a list of three non-negative integers"
                ))
            })?;

        ImageShape::new(dims[0], dims[1], dims[2])
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
