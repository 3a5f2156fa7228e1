//! Upload agent that delivers into a local directory tree.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use ulid::Ulid;

use super::{AgentPaths, OutboundFile, UploadAgent, UploadError};

/// Writes outbound files to `<root>/<outbound>/<filename>`.
#[derive(Debug, Clone)]
pub struct LocalDirAgent {
    root: PathBuf,
    paths: AgentPaths,
}

impl LocalDirAgent {
    /// Creates an agent rooted at `root` with default paths.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            paths: AgentPaths::default(),
        }
    }

    /// Overrides the directory layout.
    #[must_use]
    pub fn with_paths(mut self, paths: AgentPaths) -> Self {
        self.paths = paths;
        self
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, UploadError> {
        let path = Path::new(relative);
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(UploadError::Other(format!(
                "path '{relative}' escapes the agent root"
            )));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl UploadAgent for LocalDirAgent {
    async fn upload_file(&self, file: &OutboundFile) -> Result<(), UploadError> {
        let dir = self.resolve(&self.paths.outbound)?;
        let target = self.resolve(&format!("{}/{}", self.paths.outbound, file.filename))?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(UploadError::other)?;

        let tmp = dir.join(format!(".{}.tmp-{}", file.filename, Ulid::new()));
        tokio::fs::write(&tmp, &file.contents)
            .await
            .map_err(UploadError::other)?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(UploadError::other)
    }

    async fn delete(&self, path: &str) -> Result<(), UploadError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::other(e)),
        }
    }

    async fn ping(&self) -> Result<(), UploadError> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(UploadError::other)?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(UploadError::Other(format!(
                "{} is not a directory",
                self.root.display()
            )))
        }
    }

    fn paths(&self) -> &AgentPaths {
        &self.paths
    }

    fn hostname(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
