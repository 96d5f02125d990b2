use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use emx_core::fsutil::{atomic_write_bytes, clear_dir, copy_dir_filtered, ensure_dir};
use emx_core::{Experiment, ModelError, RunLog, Scope};

use crate::archive::{ArchivePathStrategy, NestedByRun};
use crate::binder::apply_bindings;
use crate::config::{ColumnRef, Formula, ModelConfig};

/// Lifecycle state of the model in one workspace. Phases advance strictly in
/// order; `setup` always resets to `SetupDone`, and any run fault lands in
/// `Failed` until the next setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unset,
    SetupDone,
    RunDone,
    PostProcessDone,
    MeasuresLoaded,
    Failed,
}

impl Phase {
    fn rank(&self) -> Option<u8> {
        match self {
            Phase::Unset => Some(0),
            Phase::SetupDone => Some(1),
            Phase::RunDone => Some(2),
            Phase::PostProcessDone => Some(3),
            Phase::MeasuresLoaded => Some(4),
            Phase::Failed => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unset => "unset",
            Phase::SetupDone => "setup_done",
            Phase::RunDone => "run_done",
            Phase::PostProcessDone => "post_process_done",
            Phase::MeasuresLoaded => "measures_loaded",
            Phase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// The core-model adapter: drives the external simulator through the
/// five-phase sequence against one workspace. One instance per execution
/// context; never shared across workers.
pub struct CoreModel {
    config: ModelConfig,
    scope: Scope,
    workspace: PathBuf,
    phase: Phase,
    extra_args: Vec<String>,
    last_run: Option<RunLog>,
    archive_strategy: Box<dyn ArchivePathStrategy>,
}

impl CoreModel {
    pub fn new(config: ModelConfig, scope: Scope, workspace: &Path) -> CoreModel {
        CoreModel {
            config,
            scope,
            workspace: workspace.to_path_buf(),
            phase: Phase::Unset,
            extra_args: Vec::new(),
            last_run: None,
            archive_strategy: Box::new(NestedByRun),
        }
    }

    pub fn with_archive_strategy(mut self, strategy: Box<dyn ArchivePathStrategy>) -> CoreModel {
        self.archive_strategy = strategy;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    fn model_dir(&self) -> PathBuf {
        self.workspace.join(&self.config.model_path)
    }

    fn output_dir(&self) -> PathBuf {
        self.model_dir().join(&self.config.rel_output_path)
    }

    fn require_at_least(&self, operation: &'static str, required: Phase) -> Result<(), ModelError> {
        let actual = match self.phase.rank() {
            Some(r) => r,
            None => {
                return Err(ModelError::Phase {
                    operation,
                    required: phase_name(required),
                    actual: self.phase.to_string(),
                })
            }
        };
        if actual < required.rank().unwrap_or(u8::MAX) {
            return Err(ModelError::Phase {
                operation,
                required: phase_name(required),
                actual: self.phase.to_string(),
            });
        }
        Ok(())
    }

    /// Bind an experiment's parameters into the workspace. Unrecognized
    /// names are rejected, omitted names take scope defaults, and the
    /// workspace afterwards reflects exactly this experiment. Always resets
    /// to `SetupDone`, discarding any prior run state.
    pub fn setup(&mut self, params: &Experiment) -> Result<(), ModelError> {
        let resolved = self.scope.resolve(params)?;
        info!(scope = %self.scope.name, phase = %self.phase, "setup");
        // The workspace reflects only the currently bound experiment, so
        // outputs from the previous one are dropped.
        clear_dir(&self.output_dir())?;
        self.extra_args = apply_bindings(&self.config, &self.model_dir(), &resolved)?;
        self.last_run = None;
        self.phase = Phase::SetupDone;
        Ok(())
    }

    /// Invoke the simulator against the current workspace, blocking until it
    /// exits or the configured timeout expires. Captured stdout/stderr stay
    /// retrievable through `last_run_logs` on success and failure alike.
    pub fn run(&mut self) -> Result<(), ModelError> {
        self.require_at_least("run", Phase::SetupDone)?;
        if self.config.command.is_empty() {
            return Err(ModelError::Setup("model command is empty".to_string()));
        }
        info!(command = ?self.config.command, "run");

        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..])
            .args(&self.extra_args)
            .current_dir(self.model_dir())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.phase = Phase::Failed;
                let log = RunLog::default();
                self.last_run = Some(log.clone());
                return Err(ModelError::Execution {
                    reason: format!("failed to spawn '{}': {}", self.config.command[0], e),
                    log,
                });
            }
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain(stdout_pipe));
        let stderr_reader = thread::spawn(move || drain(stderr_pipe));

        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_seconds);
        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(
                            timeout_seconds = self.config.timeout_seconds,
                            "model run timed out, killing"
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                        timed_out = true;
                        break None;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    self.phase = Phase::Failed;
                    let log = RunLog::default();
                    self.last_run = Some(log.clone());
                    return Err(ModelError::Execution {
                        reason: format!("failed waiting on model process: {}", e),
                        log,
                    });
                }
            }
        };

        let log = RunLog {
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
            exit: status.and_then(|s| s.code()),
            timed_out,
        };
        self.last_run = Some(log.clone());

        if timed_out {
            self.phase = Phase::Failed;
            return Err(ModelError::Execution {
                reason: format!(
                    "model run exceeded timeout of {}s",
                    self.config.timeout_seconds
                ),
                log,
            });
        }
        if log.exit != Some(0) {
            self.phase = Phase::Failed;
            return Err(ModelError::Execution {
                reason: match log.exit {
                    Some(code) => format!("model exited with status {}", code),
                    None => "model terminated by signal".to_string(),
                },
                log,
            });
        }

        let out = self.output_dir();
        ensure_dir(&out)?;
        fs::write(out.join("stdout.log"), &log.stdout)?;
        self.phase = Phase::RunDone;
        Ok(())
    }

    /// Logs captured by the most recent `run`, if any run has happened since
    /// the last setup.
    pub fn last_run_logs(&self) -> Option<&RunLog> {
        self.last_run.as_ref()
    }

    /// Compute derived measures from the raw output tables and write them to
    /// the configured computed-measures file. A pure function of the output
    /// directory: safe to repeat, overwrites its own file.
    pub fn post_process(&mut self) -> Result<(), ModelError> {
        self.require_at_least("post_process", Phase::RunDone)?;
        if let Some(post) = &self.config.post_process {
            let out_dir = self.output_dir();
            let mut tables: BTreeMap<String, Table> = BTreeMap::new();
            let mut computed = serde_json::Map::new();
            for derived in &post.measures {
                let value = match &derived.formula {
                    Formula::Constant { value } => *value,
                    Formula::Sum {
                        columns,
                        per,
                        scale,
                    } => {
                        let mut total = 0.0;
                        for c in columns {
                            total += column_sum(&out_dir, &mut tables, c, &derived.name)?;
                        }
                        if let Some(per) = per {
                            let mut denom = 0.0;
                            for c in per {
                                denom += column_sum(&out_dir, &mut tables, c, &derived.name)?;
                            }
                            if denom == 0.0 {
                                return Err(ModelError::MeasureExtraction {
                                    measure: format!("{} (zero denominator)", derived.name),
                                });
                            }
                            total /= denom;
                        }
                        total * scale
                    }
                    Formula::Mean { column } => {
                        let (sum, count) =
                            column_stats(&out_dir, &mut tables, column, &derived.name)?;
                        if count == 0 {
                            return Err(ModelError::MeasureExtraction {
                                measure: format!("{} (empty column)", derived.name),
                            });
                        }
                        sum / count as f64
                    }
                };
                computed.insert(derived.name.clone(), value.into());
            }
            let path = out_dir.join(&post.output_file);
            atomic_write_bytes(&path, &serde_json::to_vec_pretty(&Value::Object(computed))?)?;
            info!(file = %path.display(), "post-process complete");
        }
        if self.phase == Phase::RunDone {
            self.phase = Phase::PostProcessDone;
        }
        Ok(())
    }

    /// Extract the measure mapping from the output files. Every measure the
    /// scope declares must resolve or the call fails naming the first one
    /// missing.
    pub fn load_measures(&mut self) -> Result<BTreeMap<String, f64>, ModelError> {
        self.require_at_least("load_measures", Phase::PostProcessDone)?;
        let measures = self.measures_from(&self.output_dir())?;
        if self.phase == Phase::PostProcessDone {
            self.phase = Phase::MeasuresLoaded;
        }
        Ok(measures)
    }

    /// Read measures back out of a previously archived run instead of the
    /// live workspace, e.g. to score new measures against old runs.
    pub fn load_archived_measures(
        &self,
        experiment_id: &str,
        run_id: u32,
    ) -> Result<BTreeMap<String, f64>, ModelError> {
        let dir = self.archive_strategy.archive_path(
            &self.config.archive_path,
            &self.scope.name,
            experiment_id,
            run_id,
        );
        self.measures_from(&dir)
    }

    fn measures_from(&self, dir: &Path) -> Result<BTreeMap<String, f64>, ModelError> {
        let mut collected = BTreeMap::new();
        for file in self.config.measure_file_names() {
            let path = dir.join(&file);
            if !path.exists() {
                continue;
            }
            let doc: Value = serde_json::from_slice(&fs::read(&path)?)?;
            let Some(map) = doc.as_object() else {
                return Err(ModelError::Store(format!(
                    "measure file {} is not a JSON mapping",
                    path.display()
                )));
            };
            for (name, value) in map {
                if let Some(v) = numeric(value) {
                    collected.insert(name.clone(), v);
                }
            }
        }
        for measure in &self.scope.measures {
            if !collected.contains_key(measure) {
                return Err(ModelError::MeasureExtraction {
                    measure: measure.clone(),
                });
            }
        }
        Ok(collected)
    }

    /// Copy the run's output files into long-term storage at the path the
    /// naming strategy assigns to (experiment id, run id). Repeat calls for
    /// the same run fully overwrite the previous archive entry.
    pub fn archive(&self, experiment_id: &str, run_id: u32) -> Result<PathBuf, ModelError> {
        self.require_at_least("archive", Phase::RunDone)?;
        let dest = self.archive_strategy.archive_path(
            &self.config.archive_path,
            &self.scope.name,
            experiment_id,
            run_id,
        );
        let exclude: Vec<&str> = self.config.archive_exclude.iter().map(|s| s.as_str()).collect();
        clear_dir(&dest)?;
        ensure_dir(&dest)?;
        copy_dir_filtered(&self.output_dir(), &dest, &exclude)?;
        info!(
            experiment_id,
            run_id,
            to = %dest.display(),
            "archived run outputs"
        );
        Ok(dest)
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Unset => "unset",
        Phase::SetupDone => "setup_done",
        Phase::RunDone => "run_done",
        Phase::PostProcessDone => "post_process_done",
        Phase::MeasuresLoaded => "measures_loaded",
        Phase::Failed => "failed",
    }
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

struct Table {
    columns: BTreeMap<String, Vec<f64>>,
}

fn load_table(dir: &Path, name: &str) -> Result<Table, ModelError> {
    let path = dir.join(name);
    let mut reader = csv::Reader::from_path(&path).map_err(|e| {
        ModelError::MeasureExtraction {
            measure: format!("table {} ({})", path.display(), e),
        }
    })?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ModelError::MeasureExtraction {
            measure: format!("table {} headers ({})", name, e),
        })?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let mut columns: BTreeMap<String, Vec<f64>> =
        headers.iter().map(|h| (h.clone(), Vec::new())).collect();
    for record in reader.records() {
        let record = record.map_err(|e| ModelError::MeasureExtraction {
            measure: format!("table {} row ({})", name, e),
        })?;
        for (header, field) in headers.iter().zip(record.iter()) {
            if let Ok(v) = field.trim().parse::<f64>() {
                columns.get_mut(header).map(|col| col.push(v));
            }
        }
    }
    Ok(Table { columns })
}

fn column_stats(
    dir: &Path,
    cache: &mut BTreeMap<String, Table>,
    column: &ColumnRef,
    measure: &str,
) -> Result<(f64, usize), ModelError> {
    if !cache.contains_key(&column.table) {
        let table = load_table(dir, &column.table)?;
        cache.insert(column.table.clone(), table);
    }
    let table = &cache[&column.table];
    let values = table
        .columns
        .get(&column.column)
        .ok_or_else(|| ModelError::MeasureExtraction {
            measure: format!("{} (column '{}' not in {})", measure, column.column, column.table),
        })?;
    Ok((values.iter().sum(), values.len()))
}

fn column_sum(
    dir: &Path,
    cache: &mut BTreeMap<String, Table>,
    column: &ColumnRef,
    measure: &str,
) -> Result<f64, ModelError> {
    Ok(column_stats(dir, cache, column, measure)?.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{stub_model, test_dir};
    use crate::workspace::{ExecutionContext, WorkspaceManager};
    use emx_core::ParamValue;

    fn build(dir: &Path) -> CoreModel {
        let (config, scope) = stub_model(dir);
        let mut manager = WorkspaceManager::new(
            &config.model_source,
            &config.model_path,
            &dir.join("staging"),
            ExecutionContext::Master,
        );
        let workspace = manager.workspace().expect("workspace").to_path_buf();
        CoreModel::new(config, scope, &workspace)
    }

    #[test]
    fn five_phase_sequence_yields_every_scope_measure() {
        let dir = test_dir("model_seq");
        let mut model = build(&dir);
        assert_eq!(model.phase(), Phase::Unset);

        model.setup(&Experiment::new()).expect("setup");
        assert_eq!(model.phase(), Phase::SetupDone);
        model.run().expect("run");
        assert_eq!(model.phase(), Phase::RunDone);
        model.post_process().expect("post_process");
        let measures = model.load_measures().expect("load_measures");
        assert_eq!(model.phase(), Phase::MeasuresLoaded);
        for declared in &model.scope().measures.clone() {
            assert!(measures.contains_key(declared), "missing {}", declared);
        }
        // The stub echoes the bound Rate (default 1.0) into its output.
        assert_eq!(measures["MeanValue"], 1.0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_before_setup_is_a_phase_error() {
        let dir = test_dir("model_order");
        let mut model = build(&dir);
        let err = model.run().expect_err("must fail");
        assert_eq!(err.kind(), "phase");
        let err = model.post_process().expect_err("must fail");
        assert_eq!(err.kind(), "phase");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn setup_rebinds_and_resets_after_run() {
        let dir = test_dir("model_rebind");
        let mut model = build(&dir);
        model.setup(&Experiment::new()).expect("setup");
        model.run().expect("run");

        let mut params = Experiment::new();
        params.insert("Rate".to_string(), ParamValue::Number(2.5));
        model.setup(&params).expect("re-setup");
        assert_eq!(model.phase(), Phase::SetupDone);
        assert!(model.last_run_logs().is_none());

        model.run().expect("run");
        model.post_process().expect("post_process");
        let measures = model.load_measures().expect("load_measures");
        assert_eq!(measures["MeanValue"], 2.5);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn failed_run_keeps_logs_and_lands_in_failed() {
        let dir = test_dir("model_fail");
        let mut model = build(&dir);
        let mut params = Experiment::new();
        params.insert("FailFlag".to_string(), ParamValue::Number(1.0));
        model.setup(&params).expect("setup");
        let err = model.run().expect_err("must fail");
        assert!(err.is_retryable());
        assert_eq!(model.phase(), Phase::Failed);
        let log = model.last_run_logs().expect("logs retained");
        assert_eq!(log.exit, Some(1));
        assert!(log.stderr.contains("kaboom"));
        // Retry point: rebinding a healthy experiment recovers from Failed.
        model.setup(&Experiment::new()).expect("setup again");
        model.run().expect("run");
        assert_eq!(model.phase(), Phase::RunDone);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn timed_out_run_is_killed_and_reported() {
        let dir = test_dir("model_timeout");
        let (mut config, scope) = stub_model(&dir);
        config.command = vec!["sleep".to_string(), "30".to_string()];
        config.timeout_seconds = 1;
        let mut manager = WorkspaceManager::new(
            &config.model_source,
            &config.model_path,
            &dir.join("staging"),
            ExecutionContext::Master,
        );
        let workspace = manager.workspace().expect("workspace").to_path_buf();
        let mut model = CoreModel::new(config, scope, &workspace);
        model.setup(&Experiment::new()).expect("setup");
        let err = model.run().expect_err("must time out");
        assert_eq!(err.kind(), "execution");
        assert!(model.last_run_logs().expect("logs").timed_out);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn setup_drops_outputs_of_the_prior_experiment() {
        let dir = test_dir("model_stale");
        let mut model = build(&dir);
        model.setup(&Experiment::new()).expect("setup");
        model.run().expect("run");
        fs::write(model.output_dir().join("stale.txt"), "old").expect("write");

        let mut params = Experiment::new();
        params.insert("Rate".to_string(), ParamValue::Number(2.0));
        model.setup(&params).expect("re-setup");
        assert!(!model.output_dir().join("stale.txt").exists());

        model.run().expect("run");
        model.post_process().expect("post_process");
        let dest = model.archive("abc999", 1).expect("archive");
        assert!(!dest.join("stale.txt").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn post_process_is_idempotent() {
        let dir = test_dir("model_idem");
        let mut model = build(&dir);
        model.setup(&Experiment::new()).expect("setup");
        model.run().expect("run");
        model.post_process().expect("first");
        let first = model.load_measures().expect("load");
        model.post_process().expect("second");
        let second = model.load_measures().expect("load again");
        assert_eq!(first, second);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn archive_round_trip_matches_output_files() {
        let dir = test_dir("model_archive");
        let mut model = build(&dir);
        model.setup(&Experiment::new()).expect("setup");
        model.run().expect("run");
        model.post_process().expect("post_process");
        let dest = model.archive("abc123", 1).expect("archive");

        let archived = emx_core::fsutil::list_files(&dest).expect("list archive");
        let outputs =
            emx_core::fsutil::list_files(&model.output_dir()).expect("list outputs");
        assert_eq!(archived, outputs);

        // Overwrite policy: a second archive of the same run replaces the
        // entry rather than accumulating.
        let dest2 = model.archive("abc123", 1).expect("re-archive");
        assert_eq!(dest, dest2);
        assert_eq!(emx_core::fsutil::list_files(&dest2).expect("list"), outputs);

        let from_archive = model
            .load_archived_measures("abc123", 1)
            .expect("archived measures");
        assert_eq!(from_archive["MeanValue"], 1.0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn defaults_only_setup_binds_both_parameters_and_measures_load() {
        use crate::config::{BindingAction, ParameterBinding};
        use emx_core::{ParameterDef, Scope};

        let dir = test_dir("model_defaults");
        let template = dir.join("verspm_template");
        fs::create_dir_all(template.join("defs")).expect("template dirs");
        fs::write(
            template.join("defs/params.yml"),
            "ValueOfTime: 1\nIncome: 1\n",
        )
        .expect("template params");

        let scope = Scope {
            name: "verspm".to_string(),
            parameters: vec![
                ParameterDef {
                    name: "ValueOfTime".to_string(),
                    default: ParamValue::Number(13.0),
                },
                ParameterDef {
                    name: "Income".to_string(),
                    default: ParamValue::Number(46300.0),
                },
            ],
            measures: vec!["DVMTPerCapita".to_string()],
        };
        let (mut config, _) = stub_model(&dir);
        config.model_source = template;
        config.bindings = vec![
            ParameterBinding {
                parameter: "ValueOfTime".to_string(),
                action: BindingAction::Assign {
                    file: "defs/params.yml".to_string(),
                    key: "ValueOfTime".to_string(),
                    operator: ":".to_string(),
                },
            },
            ParameterBinding {
                parameter: "Income".to_string(),
                action: BindingAction::Assign {
                    file: "defs/params.yml".to_string(),
                    key: "Income".to_string(),
                    operator: ":".to_string(),
                },
            },
        ];
        config.post_process = None;
        config.measure_files = vec!["ComputedMeasures.json".to_string()];
        config.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p output && printf '{\"DVMTPerCapita\": 21.7}' > output/ComputedMeasures.json"
                .to_string(),
        ];

        let mut manager = WorkspaceManager::new(
            &config.model_source,
            &config.model_path,
            &dir.join("staging"),
            ExecutionContext::Master,
        );
        let workspace = manager.workspace().expect("workspace").to_path_buf();
        let mut model = CoreModel::new(config, scope, &workspace);

        model.setup(&Experiment::new()).expect("setup");
        let bound = fs::read_to_string(workspace.join("MODEL/defs/params.yml")).expect("read");
        assert_eq!(bound, "ValueOfTime: 13\nIncome: 46300\n");

        model.run().expect("run");
        model.post_process().expect("post_process");
        let measures = model.load_measures().expect("load_measures");
        assert_eq!(measures["DVMTPerCapita"], 21.7);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_declared_measure_names_the_measure() {
        let dir = test_dir("model_missing_measure");
        let (config, mut scope) = stub_model(&dir);
        scope.measures.push("NotProduced".to_string());
        let mut manager = WorkspaceManager::new(
            &config.model_source,
            &config.model_path,
            &dir.join("staging"),
            ExecutionContext::Master,
        );
        let workspace = manager.workspace().expect("workspace").to_path_buf();
        let mut model = CoreModel::new(config, scope, &workspace);
        model.setup(&Experiment::new()).expect("setup");
        model.run().expect("run");
        model.post_process().expect("post_process");
        let err = model.load_measures().expect_err("must fail");
        assert_eq!(err.kind(), "measure_extraction");
        assert!(err.to_string().contains("NotProduced"));
        let _ = fs::remove_dir_all(dir);
    }
}
