//! Sync Engine - brings every discovered repository up to date
//!
//! Recovery escalates through three tiers, each applied only to repositories
//! that are still failing:
//!
//! 1. `pull` for every repository at once
//! 2. `pull --rebase`, one repository at a time
//! 3. `reset --hard @{upstream}` followed by `pull`, one repository at a time
//!
//! Tiers two and three run sequentially so their (destructive) output stays
//! readable.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::git::{GitClient, GitOp, GitOutput, GitRunner};
use crate::shutdown::ShutdownListener;

/// Recovery tier that brought a repository in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Plain pull
    Pull,
    /// Pull with rebase
    Rebase,
    /// Hard reset to upstream, then pull
    Reset,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Pull => "pull",
            Tier::Rebase => "rebase",
            Tier::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Final state of one repository
#[derive(Debug)]
pub enum SyncOutcome {
    Recovered { tier: Tier },
    StillFailing { error: SyncError },
}

impl SyncOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, SyncOutcome::Recovered { .. })
    }
}

/// Most recent error for every repository that has not yet recovered
#[derive(Debug, Default)]
pub struct FailureRecord {
    failures: BTreeMap<PathBuf, SyncError>,
}

impl FailureRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `error` for `repo`, replacing any earlier one
    pub fn record(&mut self, repo: PathBuf, error: SyncError) {
        self.failures.insert(repo, error);
    }

    /// Forget `repo`'s failure after a successful attempt
    pub fn clear(&mut self, repo: &Path) -> Option<SyncError> {
        self.failures.remove(repo)
    }

    pub fn get(&self, repo: &Path) -> Option<&SyncError> {
        self.failures.get(repo)
    }

    /// Snapshot of the failing repositories, in path order
    pub fn paths(&self) -> Vec<PathBuf> {
        self.failures.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl IntoIterator for FailureRecord {
    type Item = (PathBuf, SyncError);
    type IntoIter = std::collections::btree_map::IntoIter<PathBuf, SyncError>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

/// Results from a complete sync operation
#[derive(Debug)]
pub struct SyncSummary {
    pub total_repositories: usize,
    pub duration: Duration,
    pub outcomes: BTreeMap<PathBuf, SyncOutcome>,
}

impl SyncSummary {
    /// Number of repositories that ended in sync
    pub fn recovered(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_recovered()).count()
    }

    /// Number of repositories recovered by a given tier
    pub fn recovered_by(&self, tier: Tier) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, SyncOutcome::Recovered { tier: t } if *t == tier))
            .count()
    }

    /// Repositories that never recovered, with their last error
    pub fn still_failing(&self) -> Vec<(&Path, &SyncError)> {
        self.outcomes
            .iter()
            .filter_map(|(path, outcome)| match outcome {
                SyncOutcome::StillFailing { error } => Some((path.as_path(), error)),
                SyncOutcome::Recovered { .. } => None,
            })
            .collect()
    }

    pub fn all_recovered(&self) -> bool {
        self.outcomes.values().all(SyncOutcome::is_recovered)
    }
}

/// The main sync engine that orchestrates repository synchronization
#[derive(Clone)]
pub struct SyncEngine {
    runner: Arc<dyn GitRunner>,
    shallow_depth: Option<u32>,
    max_parallel: usize,
}

impl SyncEngine {
    /// Create a sync engine that runs the `git` executable
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_runner(Arc::new(GitClient::new(config)), config)
    }

    /// Create a sync engine around any git runner
    pub fn with_runner(runner: Arc<dyn GitRunner>, config: &SyncConfig) -> Self {
        Self {
            runner,
            shallow_depth: config.shallow_depth,
            max_parallel: config.max_parallel,
        }
    }

    /// Sync every repository, escalating failures through the recovery tiers
    ///
    /// Returns `Err(SyncError::Interrupted)` if `cancel` fires first; any git
    /// process still running at that point is killed.
    pub async fn sync_all(
        &self,
        repositories: Vec<PathBuf>,
        cancel: &ShutdownListener,
    ) -> Result<SyncSummary, SyncError> {
        let start_time = Instant::now();
        let total_repositories = repositories.len();
        let mut outcomes = BTreeMap::new();

        info!("Syncing {} repositories", total_repositories);

        let mut failures = self.pull_all(repositories, cancel, &mut outcomes).await?;

        if !failures.is_empty() {
            info!("{} repositories failed to pull, retrying with rebase", failures.len());
            self.retry_with_rebase(&mut failures, cancel, &mut outcomes).await?;
        }

        if !failures.is_empty() {
            info!("{} repositories still failing, resetting to upstream", failures.len());
            self.retry_after_reset(&mut failures, cancel, &mut outcomes).await?;
        }

        for (repo, error) in failures {
            error!(repo = %repo.display(), "Could not sync: {}", error);
            outcomes.insert(repo, SyncOutcome::StillFailing { error });
        }

        let summary = SyncSummary {
            total_repositories,
            duration: start_time.elapsed(),
            outcomes,
        };

        info!(
            "Sync completed in {:.2}s: {} in sync, {} still failing",
            summary.duration.as_secs_f64(),
            summary.recovered(),
            total_repositories - summary.recovered()
        );

        Ok(summary)
    }

    /// First tier: pull every repository concurrently
    async fn pull_all(
        &self,
        repositories: Vec<PathBuf>,
        cancel: &ShutdownListener,
        outcomes: &mut BTreeMap<PathBuf, SyncOutcome>,
    ) -> Result<FailureRecord, SyncError> {
        let semaphore =
            (self.max_parallel > 0).then(|| Arc::new(Semaphore::new(self.max_parallel)));
        let mut futures = FuturesUnordered::new();

        for repo in repositories {
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let op = GitOp::pull(self.shallow_depth);

            futures.push(async move {
                let _permit = match &semaphore {
                    Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
                    None => None,
                };
                info!(repo = %repo.display(), "Pulling");
                let result = runner.run_op(&repo, op).await;
                (repo, result)
            });
        }

        let mut failures = FailureRecord::new();

        loop {
            // Waiting for the next completion and for cancellation is one wait,
            // so an interrupt is never stuck behind a slow pull.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Interrupted with {} pulls outstanding", futures.len());
                    // Dropping the futures drops their children, which kills them
                    drop(futures);
                    return Err(SyncError::Interrupted);
                }
                next = futures.next() => match next {
                    Some((repo, Ok(_))) => {
                        info!(repo = %repo.display(), "Pulled");
                        outcomes.insert(repo, SyncOutcome::Recovered { tier: Tier::Pull });
                    }
                    Some((repo, Err(e))) => {
                        warn!(repo = %repo.display(), "Pull failed: {}", e);
                        failures.record(repo, e);
                    }
                    None => break,
                },
            }
        }

        Ok(failures)
    }

    /// Second tier: pull with rebase, one repository at a time
    async fn retry_with_rebase(
        &self,
        failures: &mut FailureRecord,
        cancel: &ShutdownListener,
        outcomes: &mut BTreeMap<PathBuf, SyncOutcome>,
    ) -> Result<(), SyncError> {
        for repo in failures.paths() {
            if let Some(error) = failures.get(&repo) {
                info!(repo = %repo.display(), "Retrying pull with rebase after: {}", error);
            }

            let op = GitOp::RebasePull {
                depth: self.shallow_depth,
            };
            match self.run_cancellable(&repo, op, cancel).await {
                Ok(_) => {
                    info!(repo = %repo.display(), "Pulled with rebase");
                    failures.clear(&repo);
                    outcomes.insert(repo, SyncOutcome::Recovered { tier: Tier::Rebase });
                }
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(repo = %repo.display(), "Pull with rebase failed: {}", e);
                    failures.record(repo, e);
                }
            }
        }

        Ok(())
    }

    /// Third tier: reset to upstream and pull again, one repository at a time
    async fn retry_after_reset(
        &self,
        failures: &mut FailureRecord,
        cancel: &ShutdownListener,
        outcomes: &mut BTreeMap<PathBuf, SyncOutcome>,
    ) -> Result<(), SyncError> {
        for repo in failures.paths() {
            if let Some(error) = failures.get(&repo) {
                info!(repo = %repo.display(), "Resetting to upstream after: {}", error);
            }

            match self.run_cancellable(&repo, GitOp::HardReset, cancel).await {
                Ok(_) => {}
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(repo = %repo.display(), "Reset failed: {}", e);
                    failures.record(repo, e);
                    continue;
                }
            }

            match self
                .run_cancellable(&repo, GitOp::pull(self.shallow_depth), cancel)
                .await
            {
                Ok(_) => {
                    info!(repo = %repo.display(), "Pulled after reset");
                    failures.clear(&repo);
                    outcomes.insert(repo, SyncOutcome::Recovered { tier: Tier::Reset });
                }
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(repo = %repo.display(), "Pull after reset failed: {}", e);
                    failures.record(repo, e);
                }
            }
        }

        Ok(())
    }

    async fn run_cancellable(
        &self,
        repo: &Path,
        op: GitOp,
        cancel: &ShutdownListener,
    ) -> Result<GitOutput, SyncError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Interrupted),
            result = self.runner.run_op(repo, op) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Which kind of operation a scripted response applies to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Pull,
        Rebase,
        Reset,
    }

    fn kind(op: &GitOp) -> Kind {
        match op {
            GitOp::Pull | GitOp::ShallowPull { .. } => Kind::Pull,
            GitOp::RebasePull { .. } => Kind::Rebase,
            GitOp::HardReset => Kind::Reset,
            other => panic!("unexpected op {:?}", other),
        }
    }

    /// Succeeds unless told otherwise; records every call
    #[derive(Default)]
    struct ScriptedRunner {
        failures: Mutex<HashMap<(PathBuf, Kind), VecDeque<()>>>,
        hang: bool,
        calls: Mutex<Vec<(PathBuf, GitOp)>>,
    }

    impl ScriptedRunner {
        fn fail(self, repo: &str, kind: Kind, times: usize) -> Self {
            self.failures
                .lock()
                .unwrap()
                .entry((PathBuf::from(repo), kind))
                .or_default()
                .extend(std::iter::repeat(()).take(times));
            self
        }

        fn calls_for(&self, repo: &str) -> Vec<GitOp> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(path, _)| path == Path::new(repo))
                .map(|(_, op)| op.clone())
                .collect()
        }
    }

    #[async_trait]
    impl GitRunner for ScriptedRunner {
        async fn run_op(&self, repo: &Path, op: GitOp) -> Result<GitOutput, SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push((repo.to_path_buf(), op.clone()));

            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            let should_fail = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&(repo.to_path_buf(), kind(&op)))
                .and_then(|queue| queue.pop_front())
                .is_some();

            if should_fail {
                Err(SyncError::Exit {
                    command: op.to_string(),
                    code: Some(1),
                    stderr: format!("fatal: {} failed", op),
                })
            } else {
                Ok(GitOutput::default())
            }
        }
    }

    fn engine(runner: Arc<ScriptedRunner>) -> SyncEngine {
        SyncEngine::with_runner(runner, &SyncConfig::default())
    }

    fn repos(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[tokio::test]
    async fn test_all_pull_successfully() {
        let runner = Arc::new(ScriptedRunner::default());
        let summary = engine(runner.clone())
            .sync_all(repos(&["/r/a", "/r/b", "/r/c"]), &ShutdownListener::never())
            .await
            .unwrap();

        assert_eq!(summary.total_repositories, 3);
        assert_eq!(summary.recovered_by(Tier::Pull), 3);
        assert!(summary.all_recovered());
        assert_eq!(runner.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_first_pass_success_never_escalated() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .fail("/r/bad", Kind::Pull, 1)
                .fail("/r/bad", Kind::Rebase, 1),
        );
        let summary = engine(runner.clone())
            .sync_all(repos(&["/r/good", "/r/bad"]), &ShutdownListener::never())
            .await
            .unwrap();

        assert_eq!(runner.calls_for("/r/good"), vec![GitOp::ShallowPull { depth: 1 }]);
        assert_eq!(summary.recovered_by(Tier::Pull), 1);
        assert_eq!(summary.recovered_by(Tier::Reset), 1);
    }

    #[tokio::test]
    async fn test_rebase_recovers_without_reset() {
        let runner = Arc::new(ScriptedRunner::default().fail("/r/net", Kind::Pull, 1));
        let summary = engine(runner.clone())
            .sync_all(repos(&["/r/net"]), &ShutdownListener::never())
            .await
            .unwrap();

        assert_matches!(
            summary.outcomes.get(Path::new("/r/net")),
            Some(SyncOutcome::Recovered { tier: Tier::Rebase })
        );
        assert_eq!(
            runner.calls_for("/r/net"),
            vec![
                GitOp::ShallowPull { depth: 1 },
                GitOp::RebasePull { depth: Some(1) },
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_recovers_with_single_reset() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .fail("/r/diverged", Kind::Pull, 1)
                .fail("/r/diverged", Kind::Rebase, 1),
        );
        let summary = engine(runner.clone())
            .sync_all(repos(&["/r/diverged"]), &ShutdownListener::never())
            .await
            .unwrap();

        assert_matches!(
            summary.outcomes.get(Path::new("/r/diverged")),
            Some(SyncOutcome::Recovered { tier: Tier::Reset })
        );
        let calls = runner.calls_for("/r/diverged");
        assert_eq!(
            calls,
            vec![
                GitOp::ShallowPull { depth: 1 },
                GitOp::RebasePull { depth: Some(1) },
                GitOp::HardReset,
                GitOp::ShallowPull { depth: 1 },
            ]
        );
        assert_eq!(calls.iter().filter(|op| **op == GitOp::HardReset).count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_tiers_still_failing_with_last_error() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .fail("/r/broken", Kind::Pull, 2)
                .fail("/r/broken", Kind::Rebase, 1),
        );
        let summary = engine(runner.clone())
            .sync_all(repos(&["/r/broken", "/r/fine"]), &ShutdownListener::never())
            .await
            .unwrap();

        let failing = summary.still_failing();
        assert_eq!(failing.len(), 1);
        assert_eq!(failing[0].0, Path::new("/r/broken"));
        // The last attempt was the pull after the reset
        assert!(failing[0].1.to_string().contains("pull --depth=1"));
        assert!(!summary.all_recovered());
        assert_eq!(summary.recovered(), 1);
    }

    #[tokio::test]
    async fn test_failed_reset_skips_retry() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .fail("/r/no-upstream", Kind::Pull, 1)
                .fail("/r/no-upstream", Kind::Rebase, 1)
                .fail("/r/no-upstream", Kind::Reset, 1),
        );
        let summary = engine(runner.clone())
            .sync_all(repos(&["/r/no-upstream"]), &ShutdownListener::never())
            .await
            .unwrap();

        assert_eq!(runner.calls_for("/r/no-upstream").last(), Some(&GitOp::HardReset));
        let failing = summary.still_failing();
        assert!(failing[0].1.to_string().contains("reset --hard"));
    }

    #[tokio::test]
    async fn test_full_history_when_depth_disabled() {
        let runner = Arc::new(ScriptedRunner::default().fail("/r/a", Kind::Pull, 1));
        let config = SyncConfig {
            shallow_depth: None,
            ..SyncConfig::default()
        };
        SyncEngine::with_runner(runner.clone(), &config)
            .sync_all(repos(&["/r/a"]), &ShutdownListener::never())
            .await
            .unwrap();

        assert_eq!(
            runner.calls_for("/r/a"),
            vec![GitOp::Pull, GitOp::RebasePull { depth: None }]
        );
    }

    #[tokio::test]
    async fn test_empty_repository_list() {
        let runner = Arc::new(ScriptedRunner::default());
        let summary = engine(runner)
            .sync_all(Vec::new(), &ShutdownListener::never())
            .await
            .unwrap();

        assert_eq!(summary.total_repositories, 0);
        assert!(summary.all_recovered());
    }

    #[tokio::test]
    async fn test_interrupt_during_first_pass_returns_promptly() {
        let runner = Arc::new(ScriptedRunner {
            hang: true,
            ..ScriptedRunner::default()
        });
        let shutdown = Shutdown::new();
        let listener = shutdown.listener();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine(runner.clone()).sync_all(repos(&["/1", "/2", "/3", "/4", "/5"]), &listener),
        )
        .await
        .expect("sync should stop promptly after an interrupt");

        assert_matches!(result, Err(SyncError::Interrupted));
        assert_eq!(runner.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_interrupt_before_start() {
        let runner = Arc::new(ScriptedRunner::default());
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let result = engine(runner)
            .sync_all(repos(&["/r/a"]), &shutdown.listener())
            .await;

        assert_matches!(result, Err(SyncError::Interrupted));
    }

    #[tokio::test]
    async fn test_max_parallel_still_completes() {
        let runner = Arc::new(ScriptedRunner::default());
        let config = SyncConfig {
            max_parallel: 2,
            ..SyncConfig::default()
        };
        let summary = SyncEngine::with_runner(runner, &config)
            .sync_all(repos(&["/a", "/b", "/c", "/d", "/e"]), &ShutdownListener::never())
            .await
            .unwrap();

        assert_eq!(summary.recovered_by(Tier::Pull), 5);
    }

    #[test]
    fn test_failure_record_overwrite_and_clear() {
        let mut record = FailureRecord::new();
        let repo = PathBuf::from("/r/a");

        record.record(
            repo.clone(),
            SyncError::Timeout {
                command: "pull".to_string(),
                secs: 1,
            },
        );
        record.record(repo.clone(), SyncError::Interrupted);

        assert_eq!(record.len(), 1);
        assert_matches!(record.get(&repo), Some(SyncError::Interrupted));

        assert!(record.clear(&repo).is_some());
        assert!(record.is_empty());
        assert!(record.clear(&repo).is_none());
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Pull.to_string(), "pull");
        assert_eq!(Tier::Rebase.to_string(), "rebase");
        assert_eq!(Tier::Reset.to_string(), "reset");
    }
}
