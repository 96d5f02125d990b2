use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ModelError;

/// A parameter or measure value: numeric or categorical text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// One recognized uncertainty or lever, with its default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub default: ParamValue,
}

/// The immutable schema for a study: recognized parameter names with
/// defaults (in declaration order, which is also binding order) and
/// recognized output measure names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    pub parameters: Vec<ParameterDef>,
    pub measures: Vec<String>,
}

impl Scope {
    pub fn from_yaml_str(text: &str) -> Result<Scope, ModelError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Scope, ModelError> {
        Scope::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Resolve a possibly-partial mapping into a full one covering every
    /// declared parameter, in declaration order. Names not declared in the
    /// scope are a `Configuration` error; omitted names take their default.
    pub fn resolve(
        &self,
        supplied: &BTreeMap<String, ParamValue>,
    ) -> Result<Vec<(String, ParamValue)>, ModelError> {
        for name in supplied.keys() {
            if self.parameter(name).is_none() {
                return Err(ModelError::Configuration {
                    scope: self.name.clone(),
                    name: name.clone(),
                });
            }
        }
        let mut resolved = Vec::with_capacity(self.parameters.len());
        for p in &self.parameters {
            let value = match supplied.get(&p.name) {
                Some(v) => v.clone(),
                None => {
                    debug!(parameter = %p.name, default = %p.default, "using default value");
                    p.default.clone()
                }
            };
            resolved.push((p.name.clone(), value));
        }
        Ok(resolved)
    }
}
