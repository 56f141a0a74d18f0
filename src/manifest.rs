//! Repository manifests: remote URLs of discovered repositories, saved as a
//! `{relative path: remote url}` JSON object and restored by cloning.

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::git::{GitOp, GitRunner};
use crate::shutdown::ShutdownListener;

/// File name used when none is given
pub const DEFAULT_MANIFEST: &str = "export.json";

/// Mapping from repository path (relative to the scan root) to its origin URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub repositories: BTreeMap<String, String>,
}

/// Outcome of restoring a manifest
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub cloned: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
}

/// Look up the origin URL of every repository concurrently
///
/// Repositories without an origin, or whose lookup fails, are logged and left
/// out. The result is in path order.
pub async fn remote_urls(runner: &dyn GitRunner, repos: &[PathBuf]) -> Vec<(PathBuf, String)> {
    let mut lookups: FuturesUnordered<_> = repos
        .iter()
        .map(|repo| async move { (repo, runner.remote_url(repo).await) })
        .collect();

    let mut urls = Vec::with_capacity(repos.len());
    while let Some((repo, result)) = lookups.next().await {
        match result {
            Ok(Some(url)) => urls.push((repo.clone(), url)),
            Ok(None) => warn!(repo = %repo.display(), "No origin remote configured"),
            Err(e) => warn!(repo = %repo.display(), "Failed to read origin url: {}", e),
        }
    }

    urls.sort();
    urls
}

impl Manifest {
    /// Build a manifest for `repos`, keyed relative to `root`
    pub async fn collect(runner: &dyn GitRunner, root: &Path, repos: &[PathBuf]) -> Self {
        let repositories = remote_urls(runner, repos)
            .await
            .into_iter()
            .map(|(repo, url)| (relative_key(root, &repo), url))
            .collect();

        Self { repositories }
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    /// Load a manifest from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Write the manifest as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize manifest")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))?;

        info!("Saved {} repositories to {}", self.len(), path.display());
        Ok(())
    }

    /// Clone every entry below `root`, concurrently
    ///
    /// Entries whose target already contains `marker` are skipped. Entries
    /// that escape `root` or fail to clone are reported, not fatal.
    pub async fn clone_all(
        &self,
        runner: &dyn GitRunner,
        root: &Path,
        marker: &str,
        cancel: &ShutdownListener,
    ) -> Result<ImportSummary, SyncError> {
        let mut summary = ImportSummary::default();
        let mut clones = FuturesUnordered::new();

        for (key, url) in &self.repositories {
            let Some(dest) = resolve_key(root, key) else {
                warn!("Refusing to clone outside {}: {}", root.display(), key);
                summary
                    .failed
                    .push((key.clone(), "path escapes import root".to_string()));
                continue;
            };

            if dest.join(marker).exists() {
                info!(repo = %dest.display(), "Already cloned, skipping");
                summary.skipped.push(dest);
                continue;
            }

            clones.push(async move {
                let result = clone_one(runner, url, &dest).await;
                (key, dest, result)
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Interrupted with {} clones outstanding", clones.len());
                    drop(clones);
                    return Err(SyncError::Interrupted);
                }
                next = clones.next() => match next {
                    Some((_, dest, Ok(()))) => {
                        info!(repo = %dest.display(), "Cloned");
                        summary.cloned.push(dest);
                    }
                    Some((key, dest, Err(e))) => {
                        warn!(repo = %dest.display(), "Clone failed: {}", e);
                        summary.failed.push((key.clone(), e.to_string()));
                    }
                    None => break,
                },
            }
        }

        summary.cloned.sort();
        Ok(summary)
    }
}

async fn clone_one(runner: &dyn GitRunner, url: &str, dest: &Path) -> Result<(), SyncError> {
    let parent = dest.parent().unwrap_or(dest);
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| SyncError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;

    let op = GitOp::Clone {
        url: url.to_string(),
        dest: dest.to_path_buf(),
    };
    runner.run_op(parent, op).await.map(|_| ())
}

/// Manifest key for `repo`: its path below `root` with `/` separators
fn relative_key(root: &Path, repo: &Path) -> String {
    let relative = repo.strip_prefix(root).unwrap_or(repo);
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Target directory for a manifest key, `None` if it would leave `root`
fn resolve_key(root: &Path, key: &str) -> Option<PathBuf> {
    let relative = Path::new(key);
    let contained = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    contained.then(|| path_clean::clean(root.join(relative)))
}

/// Output path for an export: defaults to `export.json`, `.json` appended if missing
pub fn export_path(name: Option<&str>) -> PathBuf {
    match name {
        None | Some("") => PathBuf::from(DEFAULT_MANIFEST),
        Some(name) if name.ends_with(".json") => PathBuf::from(name),
        Some(name) => PathBuf::from(format!("{}.json", name)),
    }
}

/// Input path for an import: defaults to `export.json`
pub fn import_path(name: Option<&str>) -> PathBuf {
    match name {
        None | Some("") => {
            warn!("Filename not specified, using '{}'", DEFAULT_MANIFEST);
            PathBuf::from(DEFAULT_MANIFEST)
        }
        Some(name) => PathBuf::from(name),
    }
}
