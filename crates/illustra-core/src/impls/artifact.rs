//! LocalArtifactStore - artifacts as files under `<root>/<story>/<task>.png`.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{StoryId, TaskId};
use crate::error::IllustraError;
use crate::ports::ArtifactStore;

#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, story_id: StoryId, task_id: TaskId) -> PathBuf {
        self.root
            .join(story_id.to_string())
            .join(format!("{task_id}.png"))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        story_id: StoryId,
        task_id: TaskId,
        bytes: &[u8],
    ) -> Result<String, IllustraError> {
        let path = self.path_for(story_id, task_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Write to a temp name first so a crash never leaves a truncated artifact.
        let tmp = path.with_extension("png.part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(%story_id, %task_id, path = %path.display(), size = bytes.len(), "artifact stored");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn remove(&self, reference: &str) -> Result<(), IllustraError> {
        match tokio::fs::remove_file(reference).await {
            Ok(()) => {
                debug!(path = reference, "artifact removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
