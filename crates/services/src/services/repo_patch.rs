//! Working-tree → unified-diff extraction against the baseline HEAD.

use std::{path::Path, time::Duration};

use utils::patch::strip_internal_files;

use super::git_cli::{GIT_ADD_TIMEOUT, GitCli, GitCliError};

const UNSTAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort unstage so the working tree is left exactly as the agent
/// left it, whatever happened in between.
async fn unstage(git: &GitCli, directory: &Path) {
    let _ = tokio::time::timeout(
        UNSTAGE_TIMEOUT,
        git.run_unchecked(directory, ["reset", "HEAD", "--quiet"]),
    )
    .await;
}

/// Produce a git-style unified diff of all changes against HEAD (the
/// baseline).
///
/// Everything is staged temporarily (including new untracked files) so the
/// diff captures tracked modifications, deletions, AND new files in one
/// clean patch; the index is unstaged again whether or not the diff
/// succeeds. Blocks touching harness-internal files are filtered out of the
/// result.
pub async fn get_patch(git: &GitCli, directory: &Path) -> Result<String, GitCliError> {
    let add = git
        .run_with_timeout(directory, ["add", "-A"], GIT_ADD_TIMEOUT)
        .await;
    if let Err(err) = add {
        unstage(git, directory).await;
        return Err(match err {
            GitCliError::CommandFailed(stderr) => {
                GitCliError::CommandFailed(format!("git add -A failed: {stderr}"))
            }
            other => other,
        });
    }

    let diff = git
        .run_unchecked(directory, ["diff", "--cached", "HEAD"])
        .await;
    // Always unstage before inspecting the result.
    unstage(git, directory).await;

    let out = diff?;
    if !out.success() {
        return Err(GitCliError::CommandFailed(format!(
            "git diff --cached failed (exit {}): {}",
            out.code,
            out.stderr.trim()
        )));
    }

    if out.stdout.trim().is_empty() {
        return Ok(String::new());
    }
    Ok(strip_internal_files(&out.stdout))
}

/// True when the repo has any uncommitted changes or untracked files.
pub async fn has_repo_changes(git: &GitCli, directory: &Path) -> Result<bool, GitCliError> {
    let out = git
        .run_unchecked(directory, ["status", "--porcelain"])
        .await?;
    Ok(!out.stdout.trim().is_empty())
}
