//! Artifact rewrites and the workspace they are applied to.
//!
//! Repair strategies answer with one rewrite, a list of rewrites, or an
//! object wrapping a list. [`RewritePlan`] accepts all three and
//! [`RewritePlan::normalize`] turns them into one `Vec<Rewrite>`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::task::Artifact;
use crate::{Error, Result};

/// Replace the content of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewrite {
    #[serde(alias = "file", alias = "file_path")]
    pub path: String,
    #[serde(alias = "contents", alias = "code")]
    pub content: String,
}

impl Rewrite {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    fn is_usable(&self) -> bool {
        !self.path.trim().is_empty() && !self.content.is_empty()
    }
}

impl From<Rewrite> for Artifact {
    fn from(rewrite: Rewrite) -> Self {
        Artifact::new(rewrite.path, rewrite.content)
    }
}

/// Every shape a strategy may answer with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RewritePlan {
    Single(Rewrite),
    Many(Vec<Rewrite>),
    Wrapped { rewrites: Vec<Rewrite> },
}

impl RewritePlan {
    pub fn none() -> Self {
        RewritePlan::Many(Vec::new())
    }

    /// Parse a JSON answer in any accepted shape.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Flatten to a list, dropping rewrites with an empty path or content.
    pub fn normalize(self) -> Vec<Rewrite> {
        let all = match self {
            RewritePlan::Single(rewrite) => vec![rewrite],
            RewritePlan::Many(rewrites) | RewritePlan::Wrapped { rewrites } => rewrites,
        };
        all.into_iter()
            .filter(|r| {
                let usable = r.is_usable();
                if !usable {
                    warn!(path = %r.path, "dropping malformed rewrite");
                }
                usable
            })
            .collect()
    }
}

impl From<Rewrite> for RewritePlan {
    fn from(rewrite: Rewrite) -> Self {
        RewritePlan::Single(rewrite)
    }
}

impl From<Vec<Rewrite>> for RewritePlan {
    fn from(rewrites: Vec<Rewrite>) -> Self {
        RewritePlan::Many(rewrites)
    }
}

/// Where artifacts live while they are verified and repaired.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Directory handed to the verification gate.
    fn root(&self) -> &Path;

    async fn write(&self, artifact: &Artifact) -> Result<()>;

    /// Reject a path this workspace would refuse to write.
    fn check(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Apply every rewrite or none. All paths are checked before the
    /// first write.
    async fn apply(&self, rewrites: &[Rewrite]) -> Result<()> {
        for rewrite in rewrites {
            self.check(&rewrite.path)?;
        }
        for rewrite in rewrites {
            self.write(&Artifact::new(rewrite.path.clone(), rewrite.content.clone()))
                .await?;
        }
        Ok(())
    }
}

/// Workspace backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct DirWorkspace {
    root: PathBuf,
}

impl DirWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a relative artifact path under the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        if relative.trim().is_empty() {
            return Err(Error::Workspace("empty artifact path".into()));
        }
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(Error::Workspace(format!(
                        "artifact path escapes workspace: {}",
                        relative
                    )))
                }
            }
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl Workspace for DirWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn write(&self, artifact: &Artifact) -> Result<()> {
        let target = self.resolve(&artifact.path)?;
        write_file(&target, artifact.content.as_bytes()).await?;
        debug!(path = %target.display(), bytes = artifact.content.len(), "artifact written");
        Ok(())
    }

    fn check(&self, path: &str) -> Result<()> {
        self.resolve(path).map(|_| ())
    }

    /// Validates every path first, then writes. If a write fails midway the
    /// files already written are restored to their previous content.
    async fn apply(&self, rewrites: &[Rewrite]) -> Result<()> {
        let targets = rewrites
            .iter()
            .map(|r| self.resolve(&r.path))
            .collect::<Result<Vec<_>>>()?;

        let mut written: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::new();
        for (rewrite, target) in rewrites.iter().zip(targets) {
            let previous = tokio::fs::read(&target).await.ok();
            if let Err(e) = write_file(&target, rewrite.content.as_bytes()).await {
                warn!(path = %target.display(), error = %e, "rewrite failed, rolling back");
                restore(written).await;
                return Err(e);
            }
            written.push((target, previous));
        }
        debug!(files = written.len(), "rewrites applied");
        Ok(())
    }
}

async fn write_file(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, bytes).await?;
    Ok(())
}

async fn restore(written: Vec<(PathBuf, Option<Vec<u8>>)>) {
    for (target, previous) in written.into_iter().rev() {
        let result = match previous {
            Some(bytes) => tokio::fs::write(&target, bytes).await,
            None => tokio::fs::remove_file(&target).await,
        };
        if let Err(e) = result {
            warn!(path = %target.display(), error = %e, "could not roll back rewrite");
        }
    }
}
