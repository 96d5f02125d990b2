use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use emx_core::fsutil::{copy_dir_filtered, ensure_dir};
use emx_core::ModelError;

/// Which execution context owns a workspace. Passed in explicitly at
/// construction; workers never have to sniff their environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Master,
    Worker(usize),
}

impl ExecutionContext {
    fn dir_name(&self) -> String {
        match self {
            ExecutionContext::Master => "master".to_string(),
            ExecutionContext::Worker(id) => format!("worker_{}", id),
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Master => write!(f, "master"),
            ExecutionContext::Worker(id) => write!(f, "worker {}", id),
        }
    }
}

/// Creates and tears down the isolated filesystem workspace for one
/// execution context. The template model tree is copied in lazily, at most
/// once per manager lifetime, and the workspace is then reused across every
/// experiment this context runs.
pub struct WorkspaceManager {
    template: PathBuf,
    model_path: String,
    dir: PathBuf,
    context: ExecutionContext,
    ready: bool,
}

impl WorkspaceManager {
    pub fn new(
        template: &Path,
        model_path: &str,
        staging_root: &Path,
        context: ExecutionContext,
    ) -> WorkspaceManager {
        WorkspaceManager {
            template: template.to_path_buf(),
            model_path: model_path.to_string(),
            dir: staging_root.join(context.dir_name()),
            context,
            ready: false,
        }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// The workspace directory, materializing it from the template on first
    /// use. The template itself is never written to.
    pub fn workspace(&mut self) -> Result<&Path, ModelError> {
        if !self.ready {
            if !self.template.is_dir() {
                return Err(ModelError::Setup(format!(
                    "model template not found: {}",
                    self.template.display()
                )));
            }
            let model_dir = self.dir.join(&self.model_path);
            ensure_dir(&model_dir)?;
            copy_dir_filtered(&self.template, &model_dir, &[])?;
            info!(
                context = %self.context,
                from = %self.template.display(),
                to = %model_dir.display(),
                "workspace materialized"
            );
            self.ready = true;
        }
        Ok(&self.dir)
    }

    /// Discard the workspace tree. Archive first if its outputs matter.
    pub fn discard(self) -> Result<(), ModelError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}
