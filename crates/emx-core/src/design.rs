use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::fsutil::canonical_json_digest;
use crate::{ModelError, ParamValue, Scope};

/// One parameter mapping to be evaluated by the simulator. May be partial;
/// resolution against the scope fills defaults.
pub type Experiment = BTreeMap<String, ParamValue>;

/// A named ordered batch of experiments, immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Design {
    pub name: String,
    pub scope: String,
    pub experiments: Vec<Experiment>,
}

impl Design {
    /// The single-experiment design holding the scope's defaults, used to
    /// establish a baseline before sampled designs are run.
    pub fn reference(scope: &Scope) -> Design {
        Design {
            name: "reference".to_string(),
            scope: scope.name.clone(),
            experiments: vec![Experiment::new()],
        }
    }

    /// Load a design from a YAML file and verify every experiment resolves
    /// against the scope (so unrecognized names fail at load time, not midway
    /// through a batch).
    pub fn from_yaml_file(path: &Path, scope: &Scope) -> Result<Design, ModelError> {
        let design: Design = serde_yaml::from_str(&fs::read_to_string(path)?)?;
        if design.scope != scope.name {
            return Err(ModelError::Configuration {
                scope: scope.name.clone(),
                name: format!("design '{}' targets scope '{}'", design.name, design.scope),
            });
        }
        for experiment in &design.experiments {
            scope.resolve(experiment)?;
        }
        Ok(design)
    }
}

/// Stable experiment id: digest of the fully resolved parameter mapping.
/// Identical vectors always get identical ids, so results arriving from
/// different workers in any order key to the same row.
pub fn experiment_id(scope: &Scope, experiment: &Experiment) -> Result<String, ModelError> {
    let resolved = scope.resolve(experiment)?;
    let mut doc = serde_json::Map::new();
    for (name, value) in &resolved {
        doc.insert(name.clone(), serde_json::to_value(value)?);
    }
    let digest = canonical_json_digest(&json!({
        "scope": scope.name,
        "parameters": doc,
    }))?;
    Ok(digest[..12].to_string())
}
