#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::HiveError;

/// Capability set the orchestrator needs from git. Implementations are
/// stateless: task status is owned by the dispatcher and result handler,
/// never mutated from here.
pub trait GitClient: Send + Sync {
    fn is_installed(&self) -> bool;
    fn is_clean(&self) -> Result<bool, HiveError>;
    fn checkout_new_branch(&self, branch: &str, base: &str) -> Result<(), HiveError>;
    fn add_all(&self) -> Result<(), HiveError>;
    fn commit(&self, message: &str) -> Result<(), HiveError>;
    fn push(&self, remote: &str, branch: &str) -> Result<(), HiveError>;
    fn create_pr(&self, title: &str, body: &str) -> Result<(), HiveError>;
}

/// Default implementation shelling out to `git` (and `gh` for pull
/// requests) in the configured work directory.
#[derive(Debug, Clone)]
pub struct ShellGit {
    work_dir: PathBuf,
}

impl ShellGit {
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn run(&self, args: &[&str]) -> Result<String, HiveError> {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => HiveError::GitNotFound,
                _ => HiveError::Other(format!("failed to run git: {e}")),
            })?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_owned())
        } else {
            Err(HiveError::Git {
                op: args.join(" "),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            })
        }
    }
}

impl GitClient for ShellGit {
    fn is_installed(&self) -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    fn is_clean(&self) -> Result<bool, HiveError> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(out.is_empty())
    }

    fn checkout_new_branch(&self, branch: &str, base: &str) -> Result<(), HiveError> {
        self.run(&["checkout", "-b", branch, base]).map(|_| ())
    }

    fn add_all(&self) -> Result<(), HiveError> {
        self.run(&["add", "."]).map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<(), HiveError> {
        self.run(&["commit", "-m", message]).map(|_| ())
    }

    fn push(&self, remote: &str, branch: &str) -> Result<(), HiveError> {
        self.run(&["push", "-u", remote, branch]).map(|_| ())
    }

    fn create_pr(&self, title: &str, body: &str) -> Result<(), HiveError> {
        let out = Command::new("gh")
            .args(["pr", "create", "--title", title, "--body", body])
            .current_dir(&self.work_dir)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => HiveError::GhNotFound,
                _ => HiveError::Other(format!("failed to run gh: {e}")),
            })?;
        if out.status.success() {
            Ok(())
        } else {
            let mut combined = String::from_utf8_lossy(&out.stdout).trim().to_owned();
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(stderr.trim());
            }
            Err(HiveError::Git {
                op: "gh pr create".to_owned(),
                stderr: combined,
            })
        }
    }
}
