//! Core data model for the experiment-execution pipeline: the scope schema,
//! designs and experiments, the error taxonomy, and the boundary to the
//! persistent experiment store.

mod design;
mod error;
pub mod fsutil;
mod scope;
mod store;

pub use design::{experiment_id, Design, Experiment};
pub use error::ModelError;
pub use scope::{ParamValue, ParameterDef, Scope};
pub use store::{
    DesignHandle, ExperimentRuns, ExperimentStore, JsonStore, RunLog, RunRecord, RunSelection,
    RunStatus,
};
