use std::path::{Path, PathBuf};

/// Pluggable archive-path naming. Supplied at model construction so callers
/// can relocate archives without touching the phase runner.
pub trait ArchivePathStrategy: Send + Sync {
    fn archive_path(&self, root: &Path, scope: &str, experiment_id: &str, run_id: u32) -> PathBuf;
}

/// Default layout: `<root>/<scope>/<experiment_id>/run_<nnn>`.
pub struct NestedByRun;

impl ArchivePathStrategy for NestedByRun {
    fn archive_path(&self, root: &Path, scope: &str, experiment_id: &str, run_id: u32) -> PathBuf {
        root.join(scope)
            .join(experiment_id)
            .join(format!("run_{:03}", run_id))
    }
}
