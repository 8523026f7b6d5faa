//! Why we drive the Git CLI here instead of an embedded git library
//!
//! - The sandbox model leans on git's own semantics: `.git/info/exclude`
//!   handling, `ls-files --error-unmatch` tracked-file checks, and the
//!   working-tree protections the CLI enforces. An in-process library would
//!   bypass exactly the boundaries the restore gates rely on.
//! - Every invocation is a separate subprocess with its own timeout, so a
//!   wedged command aborts the current attempt instead of hanging the run.
//!
//! This module centralizes all git subprocess plumbing; the lifecycle code
//! in `git_lifecycle` composes these calls into the setup/reset/restore
//! state machine.

use std::{
    ffi::OsStr,
    path::Path,
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;
use utils::shell::resolve_executable_path;

/// Default per-call timeout for git subprocesses.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Tighter bound for `git add`, which should never take long.
pub const GIT_ADD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("git command timed out after {0:?}: {1}")]
    Timeout(Duration, String),
    #[error("i/o error running git: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of an unchecked git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    /// Run `git -C <repo_path> <args...>`, raising on non-zero exit.
    /// Returns stdout on success.
    pub async fn run<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_with_timeout(repo_path, args, GIT_TIMEOUT).await
    }

    /// Like [`run`](Self::run) with an explicit timeout.
    pub async fn run_with_timeout<I, S>(
        &self,
        repo_path: &Path,
        args: I,
        timeout: Duration,
    ) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.exec(repo_path, args, timeout).await?;
        if !out.success() {
            return Err(GitCliError::CommandFailed(out.stderr.trim().to_string()));
        }
        Ok(out.stdout)
    }

    /// Run a git command without treating non-zero exit as an error.
    /// Only spawn failures and timeouts surface as `Err`.
    pub async fn run_unchecked<I, S>(
        &self,
        repo_path: &Path,
        args: I,
    ) -> Result<GitOutput, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.exec(repo_path, args, GIT_TIMEOUT).await
    }

    /// Current branch name, or the commit SHA when HEAD is detached.
    /// Best-effort: returns an empty string if the queries fail.
    pub async fn current_ref(&self, repo_path: &Path) -> String {
        let abbrev = self
            .run_unchecked(repo_path, ["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map(|o| o.stdout_trimmed().to_string())
            .unwrap_or_default();
        if abbrev != "HEAD" {
            return abbrev;
        }
        self.run_unchecked(repo_path, ["rev-parse", "HEAD"])
            .await
            .map(|o| o.stdout_trimmed().to_string())
            .unwrap_or_default()
    }

    /// True if `relpath` is tracked by git (present in the index).
    pub async fn is_tracked(&self, repo_path: &Path, relpath: &str) -> bool {
        self.run_unchecked(repo_path, ["ls-files", "--error-unmatch", relpath])
            .await
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Paths of ignored files relative to the repo root.
    pub async fn list_ignored(&self, repo_path: &Path) -> Vec<String> {
        let Ok(out) = self
            .run_unchecked(
                repo_path,
                ["ls-files", "--others", "--ignored", "--exclude-standard"],
            )
            .await
        else {
            return Vec::new();
        };
        if !out.success() {
            return Vec::new();
        }
        out.stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect()
    }

    async fn exec<I, S>(
        &self,
        repo_path: &Path,
        args: I,
        timeout: Duration,
    ) -> Result<GitOutput, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let git = resolve_executable_path("git").ok_or(GitCliError::NotAvailable)?;
        let mut cmd = Command::new(&git);
        cmd.arg("-C").arg(repo_path);
        let mut rendered: Vec<String> = vec!["git".to_string()];
        for a in args {
            rendered.push(a.as_ref().to_string_lossy().into_owned());
            cmd.arg(a.as_ref());
        }
        cmd.kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => {
                let out = result?;
                Ok(GitOutput {
                    code: out.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                })
            }
            Err(_) => Err(GitCliError::Timeout(timeout, rendered.join(" "))),
        }
    }
}
