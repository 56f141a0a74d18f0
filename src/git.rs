use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::SyncError;

/// A git invocation against one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOp {
    /// Standard fetch-and-integrate
    Pull,
    /// Fetch-and-integrate bounded to the last `depth` commits
    ShallowPull { depth: u32 },
    /// Integrate by rebasing local commits onto the fetched branch
    RebasePull { depth: Option<u32> },
    /// Discard local divergence and match the upstream branch (destructive)
    HardReset,
    /// Read the origin URL
    RemoteUrl,
    /// Clone `url` into `dest`
    Clone { url: String, dest: PathBuf },
}

impl GitOp {
    /// The tier-0 operation for the given depth setting
    pub fn pull(depth: Option<u32>) -> Self {
        match depth {
            Some(depth) => GitOp::ShallowPull { depth },
            None => GitOp::Pull,
        }
    }

    /// Arguments following `git -C <repo>`
    pub fn args(&self) -> Vec<String> {
        match self {
            GitOp::Pull => vec!["pull".to_string()],
            GitOp::ShallowPull { depth } => vec!["pull".to_string(), format!("--depth={}", depth)],
            GitOp::RebasePull { depth } => {
                let mut args = vec!["pull".to_string(), "--rebase".to_string()];
                if let Some(depth) = depth {
                    args.push(format!("--depth={}", depth));
                }
                args
            }
            GitOp::HardReset => vec![
                "reset".to_string(),
                "--hard".to_string(),
                "@{upstream}".to_string(),
            ],
            GitOp::RemoteUrl => vec![
                "config".to_string(),
                "--get".to_string(),
                "remote.origin.url".to_string(),
            ],
            GitOp::Clone { url, dest } => vec![
                "clone".to_string(),
                url.clone(),
                dest.to_string_lossy().into_owned(),
            ],
        }
    }

    /// Operations whose output is data for us rather than progress for the user
    fn captures_stdout(&self) -> bool {
        matches!(self, GitOp::RemoteUrl)
    }
}

impl fmt::Display for GitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Output of a successful git command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs git operations; the seam between the sync engine and the real binary
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `op` in `repo`, failing on spawn errors, non-zero exit or timeout
    async fn run_op(&self, repo: &Path, op: GitOp) -> Result<GitOutput, SyncError>;

    /// Look up `remote.origin.url`, `None` if the repository has no origin
    async fn remote_url(&self, repo: &Path) -> Result<Option<String>, SyncError> {
        match self.run_op(repo, GitOp::RemoteUrl).await {
            Ok(output) => {
                let url = output.stdout.trim().to_string();
                Ok((!url.is_empty()).then_some(url))
            }
            // `git config --get` exits 1 when the key is missing
            Err(SyncError::Exit { code: Some(1), .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Invokes the `git` executable
#[derive(Debug, Clone)]
pub struct GitClient {
    program: String,
    timeout: Option<Duration>,
    inherit_output: bool,
}

impl GitClient {
    /// Create a new Git client with the given sync settings
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            program: "git".to_string(),
            timeout: config.command_timeout(),
            inherit_output: config.inherit_output,
        }
    }

    /// Use a different executable (mainly for tests)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, repo: &Path, op: &GitOp) -> AsyncCommand {
        let mut command = AsyncCommand::new(&self.program);
        command
            .arg("-C")
            .arg(repo)
            .args(op.args())
            .stdin(Stdio::null())
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .kill_on_drop(true);

        // Keep git from walking up into an enclosing repository when the
        // marker in `repo` is empty or corrupt
        if let Some(parent) = repo.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.env("GIT_CEILING_DIRECTORIES", parent);
        }

        if self.inherit_output && !op.captures_stdout() {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        command
    }
}

#[async_trait]
impl GitRunner for GitClient {
    async fn run_op(&self, repo: &Path, op: GitOp) -> Result<GitOutput, SyncError> {
        let label = op.to_string();
        debug!(repo = %repo.display(), "git {}", label);

        // Dropping this future (timeout or cancellation) drops the child,
        // and kill_on_drop takes it down with it.
        let run = self.command(repo, &op).output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(SyncError::Timeout {
                        command: label,
                        secs: limit.as_secs(),
                    })
                }
            },
            None => run.await,
        }
        .map_err(|source| SyncError::Spawn {
            command: label.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(SyncError::Exit {
                command: label,
                code: output.status.code(),
                stderr,
            });
        }

        if !self.inherit_output && !op.captures_stdout() {
            for line in stdout.lines().chain(stderr.lines()) {
                info!(repo = %repo.display(), "{}", line);
            }
        }

        Ok(GitOutput { stdout, stderr })
    }
}
