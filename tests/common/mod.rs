//! Common test utilities and helpers for reposweep tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Scratch workspace with a config file and a tree to scan
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub config_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("tree");
        let config_dir = temp_dir.path().join("config");
        std::fs::create_dir_all(&root).expect("Failed to create tree root");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            temp_dir,
            root,
            config_dir,
        }
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Config that keeps git quiet and logging minimal
    pub fn create_minimal_config(&self) -> PathBuf {
        let config_content = format!(
            r#"
root: "{}"
scan:
  workers: 4
sync:
  shallow_depth: null
  timeout: 60
  inherit_output: false
logging:
  level: "warn"
  color: false
"#,
            self.root.display()
        );
        self.create_test_config(&config_content)
    }

    /// Create `relative` below the tree root with an (empty) `.git` directory
    pub fn add_fake_repo(&self, relative: &str) -> PathBuf {
        make_repo_dir(&self.root.join(relative))
    }

    pub fn add_dir(&self, relative: &str) -> PathBuf {
        let dir = self.root.join(relative);
        std::fs::create_dir_all(&dir).expect("Failed to create dir");
        dir
    }
}

/// Make `dir` look like a repository root to the scanner
pub fn make_repo_dir(dir: &Path) -> PathBuf {
    std::fs::create_dir_all(dir.join(".git")).expect("Failed to create .git dir");
    dir.to_path_buf()
}

/// Whether a usable `git` binary is on PATH
pub fn is_git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run git in `dir` with a fixed identity, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "reposweep")
        .env("GIT_AUTHOR_EMAIL", "reposweep@example.com")
        .env("GIT_COMMITTER_NAME", "reposweep")
        .env("GIT_COMMITTER_EMAIL", "reposweep@example.com")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .expect("Failed to run git");

    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Commit `content` to `file` in `repo`
pub fn commit_file(repo: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(repo.join(file), content).expect("Failed to write file");
    git(repo, &["add", file]);
    git(repo, &["commit", "-q", "-m", message]);
}

/// Create an upstream repository with one commit on `main`
pub fn seed_upstream(dir: &Path) -> PathBuf {
    std::fs::create_dir_all(dir).expect("Failed to create upstream dir");
    git(dir, &["init", "-q"]);
    git(dir, &["checkout", "-q", "-b", "main"]);
    commit_file(dir, "README.md", "first\n", "initial");
    dir.to_path_buf()
}

/// Clone `upstream` into `dest`
pub fn clone_into(upstream: &Path, dest: &Path) -> PathBuf {
    let parent = dest.parent().expect("clone destination has a parent");
    std::fs::create_dir_all(parent).expect("Failed to create clone parent");
    git(
        parent,
        &[
            "clone",
            "-q",
            &upstream.to_string_lossy(),
            &dest.to_string_lossy(),
        ],
    );
    dest.to_path_buf()
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
