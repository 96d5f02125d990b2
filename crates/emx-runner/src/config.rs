use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use emx_core::ModelError;

fn default_operator() -> String {
    ":".to_string()
}

fn default_output_path() -> String {
    "output".to_string()
}

fn default_timeout() -> u64 {
    3600
}

fn default_computed_file() -> String {
    "ComputedMeasures.json".to_string()
}

fn default_scale() -> f64 {
    1.0
}

/// How one parameter lands in the model's files or invocation.
///
/// `Assign` edits a runnable file in place, `Fill` renders a template,
/// `Variant` drops in one of several alternative file sets, `Mixture`
/// weight-blends two variant file sets, `JsonPointer` sets a field in a
/// JSON document, `Argument` extends the simulator argv.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingAction {
    Assign {
        file: String,
        key: String,
        #[serde(default = "default_operator")]
        operator: String,
    },
    Fill {
        template: String,
        output: String,
        /// Tokens this parameter fills. Empty means the single implicit
        /// `__NAME__` token at scale 1.
        #[serde(default)]
        substitutions: Vec<FillToken>,
    },
    Variant {
        dest: String,
        choices: BTreeMap<String, String>,
    },
    Mixture {
        dest: String,
        low: String,
        high: String,
        /// Columns copied verbatim from the low variant instead of blended.
        #[serde(default)]
        keys: Vec<String>,
    },
    JsonPointer {
        file: String,
        pointer: String,
        #[serde(default)]
        as_string: bool,
    },
    Argument {
        #[serde(default)]
        flag: Option<String>,
    },
}

/// One placeholder substitution within a fill template. A single parameter
/// may feed several tokens at different scales.
#[derive(Debug, Clone, Deserialize)]
pub struct FillToken {
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterBinding {
    pub parameter: String,
    #[serde(flatten)]
    pub action: BindingAction,
}

/// Reference into a simulator output table: `<table>.csv`, column header.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

/// Derived-measure arithmetic over raw output tables. Enough to replicate
/// the summary calculations a simulator's own reporting layer would perform:
/// constants, column sums and means, ratios of sums, and scaling.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formula {
    Constant {
        value: f64,
    },
    Sum {
        columns: Vec<ColumnRef>,
        #[serde(default)]
        per: Option<Vec<ColumnRef>>,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    Mean {
        column: ColumnRef,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DerivedMeasure {
    pub name: String,
    #[serde(flatten)]
    pub formula: Formula,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostProcessConfig {
    #[serde(default = "default_computed_file")]
    pub output_file: String,
    pub measures: Vec<DerivedMeasure>,
}

/// Model configuration, loaded from YAML next to the model template. Mirrors
/// the layout the walkthrough model ships: a template directory, a scope
/// file, bindings describing how parameters reach the model's input files,
/// and derived-measure definitions for post-processing.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Scope declaration file.
    pub scope_file: PathBuf,
    /// Source directory copied verbatim into each workspace.
    pub model_source: PathBuf,
    /// Directory name the model tree takes inside a workspace.
    pub model_path: String,
    #[serde(default = "default_output_path")]
    pub rel_output_path: String,
    /// Long-term archive root.
    pub archive_path: PathBuf,
    /// Read-only directory holding templates and variant file sets.
    #[serde(default)]
    pub scenario_path: Option<PathBuf>,
    /// Simulator argv; binder-produced arguments are appended.
    pub command: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub bindings: Vec<ParameterBinding>,
    #[serde(default)]
    pub post_process: Option<PostProcessConfig>,
    /// JSON mapping files (relative to the output dir) read by
    /// load-measures, in addition to the post-process output file.
    #[serde(default)]
    pub measure_files: Vec<String>,
    /// Top-level output paths excluded from archiving.
    #[serde(default)]
    pub archive_exclude: Vec<String>,
}

impl ModelConfig {
    pub fn from_yaml_str(text: &str) -> Result<ModelConfig, ModelError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a config file, resolving its relative paths against the file's
    /// own directory so the config stays portable between machines.
    pub fn from_yaml_file(path: &Path) -> Result<ModelConfig, ModelError> {
        let mut config = ModelConfig::from_yaml_str(&fs::read_to_string(path)?)?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.scope_file = resolve_against(base, &config.scope_file);
        config.model_source = resolve_against(base, &config.model_source);
        config.archive_path = resolve_against(base, &config.archive_path);
        config.scenario_path = config
            .scenario_path
            .take()
            .map(|p| resolve_against(base, &p));
        Ok(config)
    }

    /// Files load-measures reads, relative to the output directory.
    pub fn measure_file_names(&self) -> Vec<String> {
        let mut files = Vec::new();
        if let Some(post) = &self.post_process {
            files.push(post.output_file.clone());
        }
        for f in &self.measure_files {
            if !files.contains(f) {
                files.push(f.clone());
            }
        }
        files
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bindings_and_formulas() {
        let config = ModelConfig::from_yaml_str(
            r#"
scope_file: scope.yml
model_source: MODEL
model_path: MODEL
archive_path: archive
command: ["sh", "run.sh"]
bindings:
  - parameter: ValueOfTime
    json_pointer: { file: defs/model_parameters.json, pointer: /0/VALUE, as_string: true }
  - parameter: Income
    fill: { template: inputs/income.csv.template, output: inputs/income.csv }
  - parameter: LandUse
    variant:
      dest: inputs
      choices: { base: L/1, growth: L/2 }
  - parameter: TechMix
    mixture:
      dest: inputs
      low: T/1
      high: T/2
      keys: [Geo, Year]
  - parameter: FuelCost
    assign: { file: params.yml, key: FuelCost }
post_process:
  measures:
    - name: DVMTPerCapita
      sum:
        columns: [{ table: Household.csv, column: Dvmt }]
        per: [{ table: Household.csv, column: HhSize }]
    - name: TruckDelay
      constant: { value: 0 }
"#,
        )
        .expect("config yaml");
        assert_eq!(config.bindings.len(), 5);
        assert_eq!(config.rel_output_path, "output");
        assert_eq!(config.timeout_seconds, 3600);
        let post = config.post_process.as_ref().expect("post section");
        assert_eq!(post.output_file, "ComputedMeasures.json");
        assert_eq!(post.measures.len(), 2);
        assert_eq!(config.measure_file_names(), vec!["ComputedMeasures.json"]);
        match &config.bindings[3].action {
            BindingAction::Mixture { keys, .. } => assert_eq!(keys, &["Geo", "Year"]),
            other => panic!("expected mixture, got {:?}", other),
        }
        match &config.bindings[4].action {
            BindingAction::Assign { operator, .. } => assert_eq!(operator, ":"),
            other => panic!("expected assign, got {:?}", other),
        }
    }
}
