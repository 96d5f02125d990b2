use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use emx_core::{
    experiment_id, Design, Experiment, ExperimentStore, ModelError, RunRecord, RunStatus, Scope,
};

use crate::config::ModelConfig;
use crate::model::CoreModel;
use crate::workspace::{ExecutionContext, WorkspaceManager};

const LOG_EXCERPT_BYTES: usize = 4096;

/// Live experiment counts, safe to poll from any thread while a design is
/// running.
#[derive(Default)]
pub struct Progress {
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Progress {
    pub fn new() -> Progress {
        Progress::default()
    }

    fn add_pending(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::SeqCst);
    }

    fn begin(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, ok: bool) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            pending: self.pending.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentFailure {
    pub experiment_id: String,
    pub kind: String,
    pub message: String,
}

/// Outcome of one design execution. Completion order across workers is not
/// meaningful; entries are keyed by experiment id.
#[derive(Debug, Clone, Serialize)]
pub struct DesignReport {
    pub design: String,
    pub completed: Vec<String>,
    pub failures: Vec<ExperimentFailure>,
}

/// Runs designs against the store, either in one workspace or across a pool
/// of isolated worker workspaces.
pub struct Scheduler<'a> {
    config: &'a ModelConfig,
    scope: &'a Scope,
    store: &'a dyn ExperimentStore,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: &'a ModelConfig,
        scope: &'a Scope,
        store: &'a dyn ExperimentStore,
    ) -> Scheduler<'a> {
        Scheduler {
            config,
            scope,
            store,
        }
    }

    /// Run every experiment in the design through the full five-phase
    /// sequence in a single workspace, in design order. Each setup
    /// supersedes the previous experiment's bound state.
    pub fn run_sequential(
        &self,
        workspace: &Path,
        design: &Design,
        progress: &Progress,
    ) -> Result<DesignReport, ModelError> {
        let mut model = CoreModel::new(self.config.clone(), self.scope.clone(), workspace);
        progress.add_pending(design.experiments.len());
        let mut completed = Vec::new();
        let mut failures = Vec::new();
        for experiment in &design.experiments {
            progress.begin();
            match self.run_one(&mut model, experiment) {
                Ok(id) => {
                    progress.finish(true);
                    completed.push(id);
                }
                Err(failure) => {
                    progress.finish(false);
                    failures.push(failure);
                }
            }
        }
        Ok(DesignReport {
            design: design.name.clone(),
            completed,
            failures,
        })
    }

    /// Partition the design round-robin across `workers` threads. Each
    /// worker copies the template into its own private workspace exactly
    /// once, then runs its assignments strictly in order. The store is the
    /// only shared mutable resource.
    pub fn run_concurrent(
        &self,
        staging_root: &Path,
        design: &Design,
        workers: usize,
        progress: &Progress,
    ) -> Result<DesignReport, ModelError> {
        let workers = workers.max(1).min(design.experiments.len().max(1));
        progress.add_pending(design.experiments.len());
        info!(design = %design.name, workers, experiments = design.experiments.len(), "concurrent run");

        let completed = Mutex::new(Vec::new());
        let failures = Mutex::new(Vec::new());
        thread::scope(|s| {
            for w in 0..workers {
                let assigned: Vec<&Experiment> = design
                    .experiments
                    .iter()
                    .skip(w)
                    .step_by(workers)
                    .collect();
                let completed = &completed;
                let failures = &failures;
                s.spawn(move || {
                    let mut manager = WorkspaceManager::new(
                        &self.config.model_source,
                        &self.config.model_path,
                        staging_root,
                        ExecutionContext::Worker(w),
                    );
                    let workspace = match manager.workspace() {
                        Ok(path) => path.to_path_buf(),
                        Err(e) => {
                            // Without a workspace this worker can run
                            // nothing; fail its whole assignment.
                            error!(worker = w, error = %e, "workspace materialization failed");
                            for &experiment in &assigned {
                                progress.begin();
                                progress.finish(false);
                                let id = experiment_id(self.scope, experiment)
                                    .unwrap_or_default();
                                lock(failures).push(ExperimentFailure {
                                    experiment_id: id,
                                    kind: e.kind().to_string(),
                                    message: e.to_string(),
                                });
                            }
                            return;
                        }
                    };
                    let mut model =
                        CoreModel::new(self.config.clone(), self.scope.clone(), &workspace);
                    for experiment in assigned {
                        progress.begin();
                        match self.run_one(&mut model, experiment) {
                            Ok(id) => {
                                progress.finish(true);
                                lock(completed).push(id);
                            }
                            Err(failure) => {
                                progress.finish(false);
                                lock(failures).push(failure);
                            }
                        }
                    }
                });
            }
        });

        let mut completed = completed.into_inner().unwrap_or_else(|e| e.into_inner());
        let mut failures = failures.into_inner().unwrap_or_else(|e| e.into_inner());
        completed.sort();
        failures.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
        Ok(DesignReport {
            design: design.name.clone(),
            completed,
            failures,
        })
    }

    /// One experiment end to end. A failure in any phase is persisted as a
    /// failed run (with the log excerpt when one exists) and reported, but
    /// never aborts sibling experiments.
    fn run_one(
        &self,
        model: &mut CoreModel,
        experiment: &Experiment,
    ) -> Result<String, ExperimentFailure> {
        let id = match experiment_id(self.scope, experiment) {
            Ok(id) => id,
            Err(e) => {
                return Err(ExperimentFailure {
                    experiment_id: String::new(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                })
            }
        };
        let run_id = match self.store.next_run_id(&id) {
            Ok(run_id) => run_id,
            Err(e) => {
                return Err(ExperimentFailure {
                    experiment_id: id,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                })
            }
        };
        match self.execute(model, experiment, &id, run_id) {
            Ok(measures) => {
                let record = RunRecord {
                    experiment_id: id.clone(),
                    run_id,
                    status: RunStatus::Success,
                    measures,
                    error_kind: None,
                    log_excerpt: model
                        .last_run_logs()
                        .map(|log| log.excerpt(LOG_EXCERPT_BYTES)),
                    recorded_at: Utc::now().to_rfc3339(),
                };
                if let Err(e) = self.store.record_run(&record) {
                    return Err(ExperimentFailure {
                        experiment_id: id,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
                Ok(id)
            }
            Err(e) => {
                error!(experiment_id = %id, run_id, kind = e.kind(), error = %e, "experiment failed");
                let record = RunRecord {
                    experiment_id: id.clone(),
                    run_id,
                    status: RunStatus::Failed,
                    measures: BTreeMap::new(),
                    error_kind: Some(e.kind().to_string()),
                    log_excerpt: model
                        .last_run_logs()
                        .map(|log| log.excerpt(LOG_EXCERPT_BYTES)),
                    recorded_at: Utc::now().to_rfc3339(),
                };
                // The run failure is what gets reported; a store fault on
                // top of it must still be visible in the logs.
                if let Err(store_err) = self.store.record_run(&record) {
                    error!(
                        experiment_id = %id,
                        run_id,
                        error = %store_err,
                        "could not persist failed run"
                    );
                }
                Err(ExperimentFailure {
                    experiment_id: id,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn execute(
        &self,
        model: &mut CoreModel,
        experiment: &Experiment,
        id: &str,
        run_id: u32,
    ) -> Result<BTreeMap<String, f64>, ModelError> {
        model.setup(experiment)?;
        model.run()?;
        model.post_process()?;
        let measures = model.load_measures()?;
        model.archive(id, run_id)?;
        Ok(measures)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
