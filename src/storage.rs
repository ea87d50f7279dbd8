use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Persists binary artifacts such as screenshots
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` and returns an opaque id
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> anyhow::Result<String>;

    fn url(&self, id: &str) -> String;
}

/// Content-addressed files in a local directory, served under `public_base_url`.
pub struct LocalArtifactStore {
    dir: PathBuf,
    public_base_url: String,
}

impl LocalArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact dir {}", dir.display()))?;
        Ok(Self {
            dir,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn default_dir() -> anyhow::Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "webjudge")
            .ok_or_else(|| anyhow::anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.data_local_dir().join("artifacts"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves an id back to its file, rejecting anything that is not a plain id
    pub fn path_of(&self, id: &str) -> Option<PathBuf> {
        if is_valid_id(id) {
            Some(self.dir.join(id))
        } else {
            None
        }
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// Same content and name always map to the same id
pub fn artifact_id(bytes: &[u8], suggested_name: &str) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    let name = sanitize(suggested_name);
    if name.is_empty() {
        digest[..16].to_string()
    } else {
        format!("{}-{name}", &digest[..16])
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> anyhow::Result<String> {
        let id = artifact_id(bytes, suggested_name);
        let path = self.dir.join(&id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, bytes)
                .await
                .with_context(|| format!("Failed to write artifact {}", path.display()))?;
            log::debug!("Stored artifact {id} ({} bytes)", bytes.len());
        }
        Ok(id)
    }

    fn url(&self, id: &str) -> String {
        format!("{}/{id}", self.public_base_url)
    }
}
