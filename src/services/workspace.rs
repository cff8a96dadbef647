use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

use crate::models::SourceFormat;

const WORKSPACE_PREFIX: &str = "sheetconv-";

/// Private scratch directory for a single conversion.
///
/// Holds the staged upload and one output directory per converter step.
/// The directory and everything in it is removed by [`cleanup`](Self::cleanup)
/// or, on any path that skips it, when the workspace is dropped. Removal
/// failures are logged and never surface to the caller.
pub struct ConversionWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ConversionWorkspace {
    /// Create a uniquely named workspace under `root`
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        tracing::debug!("Created conversion workspace {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the upload as `<uuid>.<source-ext>`
    pub async fn stage_input(&self, data: &[u8], source: SourceFormat) -> io::Result<PathBuf> {
        let name = format!("{}.{}", Uuid::new_v4().simple(), source.extension());
        let staged = self.path.join(name);
        tokio::fs::write(&staged, data).await?;
        Ok(staged)
    }

    /// Fresh output directory for converter step `step` (1-based)
    pub async fn step_dir(&self, step: usize) -> io::Result<PathBuf> {
        let dir = self.path.join(format!("step-{}", step));
        tokio::fs::create_dir(&dir).await?;
        Ok(dir)
    }

    /// Location for a private converter user profile
    pub fn profile_dir(&self) -> PathBuf {
        self.path.join("profile")
    }

    /// Remove the workspace off the async threads
    pub async fn cleanup(mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => tracing::debug!("Removed conversion workspace {}", path.display()),
            Ok(Err(e)) => log_cleanup_failure(&path, &e),
            Err(e) => tracing::warn!(
                "Cleanup task for workspace {} did not complete: {}",
                path.display(),
                e
            ),
        }
    }
}

impl Drop for ConversionWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                log_cleanup_failure(&self.path, &e);
            }
        }
    }
}

fn log_cleanup_failure(path: &Path, err: &io::Error) {
    tracing::warn!(
        "Failed to remove conversion workspace {}: {}",
        path.display(),
        err
    );
}
