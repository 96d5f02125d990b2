//! Drives a file-based simulator through setup, run, post-process,
//! load-measures, and archive against isolated workspaces, and persists
//! every run in the experiment store.

pub mod archive;
pub mod binder;
pub mod config;
pub mod model;
pub mod scheduler;
pub mod workspace;

pub use archive::{ArchivePathStrategy, NestedByRun};
pub use config::{
    BindingAction, ColumnRef, DerivedMeasure, FillToken, Formula, ModelConfig, ParameterBinding,
    PostProcessConfig,
};
pub use model::{CoreModel, Phase};
pub use scheduler::{DesignReport, ExperimentFailure, Progress, ProgressSnapshot, Scheduler};
pub use workspace::{ExecutionContext, WorkspaceManager};
