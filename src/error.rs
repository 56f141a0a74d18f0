//! Error types for repository synchronization

use thiserror::Error;

/// Why a single git command against a repository did not succeed
///
/// These are recorded per repository and drive tier escalation; they never
/// abort a run on their own.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to start `git {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` exited with {}{}", exit_label(.code), stderr_suffix(.stderr))]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("interrupted")]
    Interrupted,
}

impl SyncError {
    /// True if the run was cancelled rather than the command failing
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SyncError::Interrupted)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let last = stderr.lines().rev().find(|line| !line.trim().is_empty());
    match last {
        Some(line) => format!(": {}", line.trim()),
        None => String::new(),
    }
}
