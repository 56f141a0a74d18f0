//! Repository discovery by concurrent directory walking
//!
//! The walk is a fork-join over a [`JoinSet`]: every directory is one task
//! that lists its entries and hands back either "this is a repository root"
//! or the subdirectories to visit next. The coordinator spawns a task per
//! returned subdirectory, so the set of pending tasks is exactly the set of
//! directories still to inspect, and the walk is finished when the set is
//! empty. At most `workers` listings touch the filesystem at once.
//!
//! Descent stops at a repository root: neither its marker directory nor its
//! working tree is listed, so nested repositories are not reported.
//!
//! Symlinked directories are skipped unless `follow_symlinks` is set. When
//! following, each directory is visited once by canonical path, which also
//! breaks symlink cycles.

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;

/// Result of scanning a directory tree
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Repository roots, sorted
    pub roots: BTreeSet<PathBuf>,
    /// Directories whose entries were listed
    pub directories_scanned: usize,
    /// Directories that could not be listed and were treated as leaves
    pub unreadable: Vec<PathBuf>,
}

impl ScanReport {
    pub fn into_roots(self) -> Vec<PathBuf> {
        self.roots.into_iter().collect()
    }
}

/// Lists one directory: `Ok(None)` if it holds the marker, else its subdirectories
type ListFn = fn(PathBuf, Arc<EntryRules>) -> BoxFuture<'static, io::Result<Option<Vec<Child>>>>;

/// Concurrent repository finder
#[derive(Debug, Clone)]
pub struct Scanner {
    workers: usize,
    rules: Arc<EntryRules>,
    list: ListFn,
}

#[derive(Debug)]
struct EntryRules {
    marker: String,
    follow_symlinks: bool,
    exclude: Vec<Regex>,
}

/// What inspecting one directory produced
enum Inspection {
    Root(PathBuf),
    Expanded(Vec<Child>),
    Unreadable { dir: PathBuf, error: io::Error },
}

struct Child {
    path: PathBuf,
    /// Only resolved when following symlinks
    canonical: Option<PathBuf>,
}

impl Scanner {
    /// Build a scanner from configuration; fails on an invalid exclude pattern
    pub fn new(config: &ScanConfig) -> Result<Self> {
        let exclude = config
            .exclude_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("Invalid exclude pattern: {}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            workers: config.effective_workers(),
            rules: Arc::new(EntryRules {
                marker: config.marker.clone(),
                follow_symlinks: config.follow_symlinks,
                exclude,
            }),
            list: read_directory,
        })
    }

    /// Find every repository root at or below `root`
    ///
    /// Unreadable directories are logged and skipped; they never fail the scan.
    pub async fn scan(&self, root: &Path) -> ScanReport {
        let permits = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut report = ScanReport::default();
        let mut visited = HashSet::new();
        let mut jobs = JoinSet::new();

        if self.rules.follow_symlinks {
            if let Ok(canonical) = tokio::fs::canonicalize(root).await {
                visited.insert(canonical);
            }
        }

        info!("Scanning {} with {} workers", root.display(), self.workers);
        jobs.spawn(inspect(
            root.to_path_buf(),
            self.rules.clone(),
            permits.clone(),
            self.list,
        ));

        while let Some(joined) = jobs.join_next().await {
            let inspection = match joined {
                Ok(inspection) => inspection,
                Err(e) => {
                    warn!("Directory scan task failed: {}", e);
                    continue;
                }
            };

            match inspection {
                Inspection::Root(path) => {
                    report.directories_scanned += 1;
                    debug!("Found repository: {}", path.display());
                    report.roots.insert(path);
                }
                Inspection::Expanded(children) => {
                    report.directories_scanned += 1;
                    for child in children {
                        if let Some(canonical) = child.canonical {
                            if !visited.insert(canonical) {
                                debug!("Already visited: {}", child.path.display());
                                continue;
                            }
                        }
                        jobs.spawn(inspect(
                            child.path,
                            self.rules.clone(),
                            permits.clone(),
                            self.list,
                        ));
                    }
                }
                Inspection::Unreadable { dir, error } => {
                    warn!("Skipping unreadable directory {}: {}", dir.display(), error);
                    report.unreadable.push(dir);
                }
            }
        }

        debug_assert!(jobs.is_empty());
        info!(
            "Found {} repositories in {} directories",
            report.roots.len(),
            report.directories_scanned
        );

        report
    }
}

async fn inspect(
    dir: PathBuf,
    rules: Arc<EntryRules>,
    permits: Arc<Semaphore>,
    list: ListFn,
) -> Inspection {
    // The semaphore is never closed
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return Inspection::Unreadable {
                dir,
                error: io::Error::new(io::ErrorKind::Other, "scan cancelled"),
            }
        }
    };

    match list(dir.clone(), rules).await {
        Ok(Some(children)) => Inspection::Expanded(children),
        Ok(None) => Inspection::Root(dir),
        Err(error) => Inspection::Unreadable { dir, error },
    }
}

fn read_directory(
    dir: PathBuf,
    rules: Arc<EntryRules>,
) -> BoxFuture<'static, io::Result<Option<Vec<Child>>>> {
    Box::pin(async move { list_directory(&dir, &rules).await })
}

/// `Ok(None)` when `dir` holds the marker, otherwise its subdirectories
async fn list_directory(dir: &Path, rules: &EntryRules) -> io::Result<Option<Vec<Child>>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut children = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let path = entry.path();

        let is_dir = if file_type.is_dir() {
            true
        } else if file_type.is_symlink() && rules.follow_symlinks {
            // Dangling links are not directories
            tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
        } else {
            false
        };

        if !is_dir {
            continue;
        }

        let name = entry.file_name();
        if name == OsStr::new(&rules.marker) {
            return Ok(None);
        }

        if rules.is_excluded(&name) {
            debug!("Excluded: {}", path.display());
            continue;
        }

        let canonical = if rules.follow_symlinks {
            match tokio::fs::canonicalize(&path).await {
                Ok(canonical) => Some(canonical),
                Err(e) => {
                    debug!("Cannot resolve {}: {}", path.display(), e);
                    continue;
                }
            }
        } else {
            None
        };

        children.push(Child { path, canonical });
    }

    Ok(Some(children))
}

impl EntryRules {
    fn is_excluded(&self, name: &OsStr) -> bool {
        let name = name.to_string_lossy();
        self.exclude.iter().any(|pattern| pattern.is_match(&name))
    }
}

/// Turn a user-supplied root into an absolute, existing directory
///
/// `"."` means the current working directory; `~` and `$VARS` are expanded.
pub fn resolve_root(raw: &str) -> Result<PathBuf> {
    let cwd = || std::env::current_dir().context("Failed to determine working directory");

    let path = if raw.is_empty() || raw == "." {
        cwd()?
    } else {
        let expanded = shellexpand::full(raw)
            .with_context(|| format!("Failed to expand path: {}", raw))?;
        let path = PathBuf::from(expanded.as_ref());
        if path.is_absolute() {
            path
        } else {
            cwd()?.join(path)
        }
    };

    let path = path_clean::clean(path);

    let metadata = std::fs::metadata(&path)
        .with_context(|| format!("Error accessing path {}", path.display()))?;
    if !metadata.is_dir() {
        bail!("Not a directory: {}", path.display());
    }

    Ok(path)
}
