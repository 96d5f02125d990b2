use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::design::{experiment_id, Design, Experiment};
use crate::fsutil::{atomic_write_bytes, ensure_dir};
use crate::{ModelError, ParamValue, Scope};

/// Captured output of the most recent simulator invocation. Retained on both
/// success and failure so a crashed run can be diagnosed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    pub stdout: String,
    pub stderr: String,
    pub exit: Option<i32>,
    pub timed_out: bool,
}

impl RunLog {
    /// Tail of the combined output, bounded for embedding in run records.
    pub fn excerpt(&self, max_bytes: usize) -> String {
        let combined = if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n=== STDERR ===\n{}", self.stdout, self.stderr)
        };
        if combined.len() <= max_bytes {
            return combined;
        }
        let start = combined.len() - max_bytes;
        // Respect char boundaries when slicing the tail.
        let start = (start..combined.len())
            .find(|i| combined.is_char_boundary(*i))
            .unwrap_or(combined.len());
        combined[start..].to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// One run's persisted outcome. Written once, never mutated; a rerun of the
/// same experiment gets a fresh run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub experiment_id: String,
    pub run_id: u32,
    pub status: RunStatus,
    pub measures: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSelection {
    All,
    Latest,
}

/// Handle returned by design creation: the ids assigned to each experiment,
/// in design order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignHandle {
    pub scope: String,
    pub name: String,
    pub experiment_ids: Vec<String>,
}

/// An experiment row joined with its runs, as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRuns {
    pub experiment_id: String,
    pub parameters: BTreeMap<String, ParamValue>,
    pub runs: Vec<RunRecord>,
}

/// Boundary to the persistent experiment store. The phase runner and
/// scheduler depend only on this trait, never on the store's layout.
pub trait ExperimentStore: Send + Sync {
    fn store_scope(&self, scope: &Scope) -> Result<(), ModelError>;
    fn read_scope(&self, name: &str) -> Result<Scope, ModelError>;
    fn create_design(
        &self,
        scope: &Scope,
        name: &str,
        experiments: &[Experiment],
    ) -> Result<DesignHandle, ModelError>;
    fn read_design(&self, scope: &str, name: &str) -> Result<Design, ModelError>;
    /// Allocate the next run id for an experiment. Serialized per store
    /// instance so concurrent workers never collide.
    fn next_run_id(&self, experiment_id: &str) -> Result<u32, ModelError>;
    /// Persist one run atomically: all measures land together or not at all.
    fn record_run(&self, record: &RunRecord) -> Result<(), ModelError>;
    fn read_experiments(
        &self,
        scope: &str,
        design: &str,
        runs: RunSelection,
    ) -> Result<Vec<ExperimentRuns>, ModelError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct DesignDoc {
    name: String,
    scope: String,
    created_at: String,
    experiments: Vec<DesignRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DesignRow {
    experiment_id: String,
    parameters: BTreeMap<String, ParamValue>,
}

/// File-backed store: a directory of atomically written JSON documents.
///
/// Layout: `scopes/<scope>.json`, `designs/<scope>/<name>.json`,
/// `runs/<experiment_id>/run_<nnn>.json`.
pub struct JsonStore {
    root: PathBuf,
    // Serializes run-id allocation between in-process workers.
    run_ids: Mutex<()>,
}

impl JsonStore {
    pub fn open(root: &Path) -> Result<JsonStore, ModelError> {
        ensure_dir(root)?;
        Ok(JsonStore {
            root: root.to_path_buf(),
            run_ids: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_path(&self, name: &str) -> PathBuf {
        self.root.join("scopes").join(format!("{}.json", name))
    }

    fn design_path(&self, scope: &str, name: &str) -> PathBuf {
        self.root
            .join("designs")
            .join(scope)
            .join(format!("{}.json", name))
    }

    fn runs_dir(&self, experiment_id: &str) -> PathBuf {
        self.root.join("runs").join(experiment_id)
    }

    fn run_path(&self, experiment_id: &str, run_id: u32) -> PathBuf {
        self.runs_dir(experiment_id)
            .join(format!("run_{:03}.json", run_id))
    }

    fn read_runs(&self, experiment_id: &str) -> Result<Vec<RunRecord>, ModelError> {
        let dir = self.runs_dir(experiment_id);
        let mut runs = Vec::new();
        if !dir.exists() {
            return Ok(runs);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("run_") || !name.ends_with(".json") {
                continue;
            }
            let record: RunRecord = serde_json::from_slice(&fs::read(entry.path())?)?;
            runs.push(record);
        }
        runs.sort_by_key(|r| r.run_id);
        Ok(runs)
    }

    fn max_run_id(&self, experiment_id: &str) -> Result<u32, ModelError> {
        let dir = self.runs_dir(experiment_id);
        let mut max = 0;
        if !dir.exists() {
            return Ok(max);
        }
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            let id = name
                .strip_prefix("run_")
                .and_then(|rest| rest.split('.').next())
                .and_then(|digits| digits.parse::<u32>().ok());
            if let Some(id) = id {
                max = max.max(id);
            }
        }
        Ok(max)
    }
}

impl ExperimentStore for JsonStore {
    fn store_scope(&self, scope: &Scope) -> Result<(), ModelError> {
        let path = self.scope_path(&scope.name);
        if path.exists() {
            // Scopes are immutable once stored.
            return Ok(());
        }
        atomic_write_bytes(&path, &serde_json::to_vec_pretty(scope)?)
    }

    fn read_scope(&self, name: &str) -> Result<Scope, ModelError> {
        let path = self.scope_path(name);
        if !path.exists() {
            return Err(ModelError::Store(format!("scope '{}' not found", name)));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn create_design(
        &self,
        scope: &Scope,
        name: &str,
        experiments: &[Experiment],
    ) -> Result<DesignHandle, ModelError> {
        let path = self.design_path(&scope.name, name);
        if path.exists() {
            return Err(ModelError::Store(format!(
                "design '{}' already exists in scope '{}'",
                name, scope.name
            )));
        }
        self.store_scope(scope)?;
        let mut rows = Vec::with_capacity(experiments.len());
        let mut ids = Vec::with_capacity(experiments.len());
        for experiment in experiments {
            let id = experiment_id(scope, experiment)?;
            let parameters: BTreeMap<String, ParamValue> =
                scope.resolve(experiment)?.into_iter().collect();
            ids.push(id.clone());
            rows.push(DesignRow {
                experiment_id: id,
                parameters,
            });
        }
        let doc = DesignDoc {
            name: name.to_string(),
            scope: scope.name.clone(),
            created_at: Utc::now().to_rfc3339(),
            experiments: rows,
        };
        atomic_write_bytes(&path, &serde_json::to_vec_pretty(&doc)?)?;
        info!(design = name, scope = %scope.name, experiments = experiments.len(), "design created");
        Ok(DesignHandle {
            scope: scope.name.clone(),
            name: name.to_string(),
            experiment_ids: ids,
        })
    }

    fn read_design(&self, scope: &str, name: &str) -> Result<Design, ModelError> {
        let path = self.design_path(scope, name);
        if !path.exists() {
            return Err(ModelError::Store(format!(
                "design '{}' not found in scope '{}'",
                name, scope
            )));
        }
        let doc: DesignDoc = serde_json::from_slice(&fs::read(path)?)?;
        Ok(Design {
            name: doc.name,
            scope: doc.scope,
            experiments: doc.experiments.into_iter().map(|r| r.parameters).collect(),
        })
    }

    fn next_run_id(&self, experiment_id: &str) -> Result<u32, ModelError> {
        let _guard = self
            .run_ids
            .lock()
            .map_err(|_| ModelError::Store("run id lock poisoned".to_string()))?;
        let next = self.max_run_id(experiment_id)? + 1;
        // Reserve the id with a marker file so another worker allocating for
        // the same experiment before this run is recorded skips past it.
        ensure_dir(&self.runs_dir(experiment_id))?;
        fs::File::create(
            self.runs_dir(experiment_id)
                .join(format!("run_{:03}.reserved", next)),
        )?;
        Ok(next)
    }

    fn record_run(&self, record: &RunRecord) -> Result<(), ModelError> {
        let path = self.run_path(&record.experiment_id, record.run_id);
        if path.exists() {
            return Err(ModelError::Store(format!(
                "run {} of experiment {} already recorded",
                record.run_id, record.experiment_id
            )));
        }
        atomic_write_bytes(&path, &serde_json::to_vec_pretty(record)?)?;
        let _ = fs::remove_file(path.with_extension("reserved"));
        Ok(())
    }

    fn read_experiments(
        &self,
        scope: &str,
        design: &str,
        runs: RunSelection,
    ) -> Result<Vec<ExperimentRuns>, ModelError> {
        let path = self.design_path(scope, design);
        if !path.exists() {
            return Err(ModelError::Store(format!(
                "design '{}' not found in scope '{}'",
                design, scope
            )));
        }
        let doc: DesignDoc = serde_json::from_slice(&fs::read(path)?)?;
        let mut out = Vec::with_capacity(doc.experiments.len());
        for row in doc.experiments {
            let mut all = self.read_runs(&row.experiment_id)?;
            if runs == RunSelection::Latest {
                all = all.pop().into_iter().collect();
            }
            out.push(ExperimentRuns {
                experiment_id: row.experiment_id,
                parameters: row.parameters,
                runs: all,
            });
        }
        Ok(out)
    }
}
