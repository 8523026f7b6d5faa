//! Git lifecycle management for agent evaluation runs.
//!
//! Owns every mutation of the target repository: baseline preparation,
//! history sanitization, ignored-file backup, per-retry reset, and final
//! restoration. The contract is transactional: whatever happens during a
//! run, `restore_repo` (or the partial-setup cleanup) brings the repository
//! back byte-identical (tracked content, branch/ref, ignored file contents
//! and modes) while treating everything an agent could have written as
//! hostile input.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utils::msg;

use super::{
    git_cli::{GitCli, GitCliError},
    sidecar::{
        self, BACKUP_DIR_PREFIX, DURABLE_SIDECAR, SIDECAR_FILENAME, SIDECAR_HINT, Sidecar,
        is_plausible_backup_dir, read_sidecar,
    },
};

/// Prefix of the encoded original-ref token returned by a sanitized setup.
pub const SANITIZED_PREFIX: &str = "__sanitized__:";

/// Exact commit message of the synthetic baseline commit.
pub const BASELINE_COMMIT_MESSAGE: &str = "baseline: pre-patch starting point (auto-generated)";

lazy_static! {
    static ref PR_BRANCH_RE: Regex = Regex::new(r"(?i)^pr[_-]?(\d+)$").unwrap();
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("ground truth patch not found: {0}")]
    PatchMissing(PathBuf),
    #[error("branch '{0}' not found locally or on remote")]
    BranchNotFound(String),
    #[error("failed to reverse-apply ground truth patch {patch}: {stderr}")]
    ReverseApplyFailed { patch: String, stderr: String },
    #[error("{0}")]
    RestoreFailed(String),
}

/// Metadata packed into the sanitized original-ref token. The token is held
/// in process memory only and never persisted inside the repo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SanitizedMeta {
    #[serde(default)]
    saved_ref: String,
    #[serde(default)]
    backup_dir: String,
    #[serde(default)]
    branch_head: String,
}

fn make_sanitized_ref(saved_ref: &str, backup_dir: &str, branch_head: &str) -> String {
    let meta = SanitizedMeta {
        saved_ref: saved_ref.to_string(),
        backup_dir: backup_dir.to_string(),
        branch_head: branch_head.to_string(),
    };
    format!(
        "{SANITIZED_PREFIX}{}",
        serde_json::to_string(&meta).expect("sanitized meta serializes")
    )
}

fn decode_sanitized_ref(original_ref: &str) -> Option<SanitizedMeta> {
    let body = original_ref.strip_prefix(SANITIZED_PREFIX)?;
    serde_json::from_str(body).ok()
}

/// Extract the trusted backup_dir from an encoded original-ref token.
///
/// Callers pass it to [`GitLifecycle::reset_to_baseline`] so the sidecar
/// lookup cannot be redirected by agent-tampered hint files.
pub fn decode_backup_dir(original_ref: &str) -> Option<PathBuf> {
    let meta = decode_sanitized_ref(original_ref)?;
    (!meta.backup_dir.is_empty()).then(|| PathBuf::from(meta.backup_dir))
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(10)]
}

/// Accept a relpath for restore only when it cannot escape the repo.
///
/// String-level check only; the destination may not exist yet or may be a
/// malicious symlink, so the filesystem boundary is re-verified separately
/// after `create_dir_all`. Rejects empty and absolute paths, `..`-escapes
/// after lexical normalization, and anything under `.git/` (overwriting git
/// internals is a code-execution vector).
pub fn is_safe_relpath(relpath: &str) -> bool {
    if relpath.is_empty() || Path::new(relpath).is_absolute() {
        return false;
    }
    let mut stack: Vec<&str> = Vec::new();
    for component in Path::new(relpath).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return false;
                }
            }
            Component::Normal(part) => match part.to_str() {
                Some(part) => stack.push(part),
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    match stack.first() {
        None => false,
        Some(&".git") => false,
        Some(_) => true,
    }
}

/// Remove a `.git` entry (directory, file, or symlink).
///
/// Symlinks are unlinked directly, never followed, so a symlink-to-dir
/// does not have its target tree deleted. Directory trees are made writable
/// first so locked backup directories can be cleaned up.
pub fn remove_git_entry(path: &Path) -> std::io::Result<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if meta.file_type().is_symlink() {
        fs::remove_file(path)
    } else if meta.is_dir() {
        make_tree_writable(path);
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn make_tree_writable(root: &Path) {
    let _ = fs::set_permissions(root, fs::Permissions::from_mode(0o700));
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            make_tree_writable(&path);
        } else {
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o700));
        }
    }
}

/// Copy a directory tree preserving symlinks as symlinks.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if meta.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn walk_relative_files(root: &Path, prefix: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let rel = prefix.join(entry.file_name());
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.is_dir() && !meta.file_type().is_symlink() {
            walk_relative_files(&path, &rel, out);
        } else {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
}

pub struct GitLifecycle {
    git: GitCli,
}

impl Default for GitLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl GitLifecycle {
    pub fn new() -> Self {
        Self { git: GitCli::new() }
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    /// Prepare the repo at the starting point for agent evaluation.
    ///
    /// 1. Validate `gt_patch` exists (before any git operation)
    /// 2. Record the current ref for later restoration
    /// 3. Checkout the target branch if requested (fetching if needed)
    /// 4. Hard-reset working tree and index
    /// 5. Reverse-apply the ground truth patch to undo the fix
    /// 6. Commit the result as the baseline
    /// 7. Sanitize history when requested
    ///
    /// After this, HEAD = baseline = pre-fix starting point, so
    /// `git diff HEAD` captures only the agent's changes and
    /// `git reset --hard <baseline>` restores the starting point.
    ///
    /// `mutated_flag` flips to `true` just before the first destructive git
    /// operation so callers know whether cleanup is needed if this returns
    /// an error partway through.
    ///
    /// Returns `(original_ref_token, baseline_commit)`.
    pub async fn setup_starting_point(
        &self,
        directory: &Path,
        branch: Option<&str>,
        gt_patch: Option<&Path>,
        repo_url: Option<&str>,
        sanitize: bool,
        mutated_flag: &mut bool,
    ) -> Result<(String, String), LifecycleError> {
        // 1) Validate gt_patch before any git modification.
        let mut gt_patch_abs: Option<PathBuf> = None;
        if let Some(gt_patch) = gt_patch {
            let abs = if gt_patch.is_absolute() {
                gt_patch.to_path_buf()
            } else {
                std::env::current_dir()?.join(gt_patch)
            };
            if !abs.is_file() {
                return Err(LifecycleError::PatchMissing(abs));
            }
            gt_patch_abs = Some(abs);
        }

        // 2) Record where we are so we can restore later.
        let abbrev = self
            .git
            .run_unchecked(directory, ["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .stdout_trimmed()
            .to_string();
        let mut original_ref = abbrev.clone();
        if original_ref == "HEAD" {
            // Detached HEAD: save the commit hash instead.
            original_ref = self
                .git
                .run(directory, ["rev-parse", "HEAD"])
                .await?
                .trim()
                .to_string();
        }

        // 3) Checkout the target branch if requested.
        if let Some(branch) = branch
            && abbrev != branch
        {
            let checkout = self.git.run_unchecked(directory, ["checkout", branch]).await?;
            if !checkout.success() {
                // Branch not found locally: resolve a remote URL (prefer the
                // configured origin, fall back to the caller-provided URL)
                // and try fetching.
                let origin_url = self
                    .git
                    .run_unchecked(directory, ["remote", "get-url", "origin"])
                    .await?
                    .stdout_trimmed()
                    .to_string();
                let resolved_url = if !origin_url.is_empty() {
                    Some(origin_url)
                } else {
                    repo_url.map(|s| s.to_string())
                };

                let mut fetched = false;
                if let Some(url) = &resolved_url {
                    msg::progress(format!(
                        "Branch '{branch}' not found locally, fetching from {url}..."
                    ));
                    let refspec = format!("{branch}:{branch}");
                    fetched = self
                        .git
                        .run_unchecked(directory, ["fetch", url.as_str(), refspec.as_str()])
                        .await?
                        .success();
                }

                if !fetched
                    && let Some(url) = &resolved_url
                    && let Some(caps) = PR_BRANCH_RE.captures(branch)
                {
                    let pr_number = &caps[1];
                    msg::progress(format!("Trying PR ref: pull/{pr_number}/head..."));
                    let refspec = format!("pull/{pr_number}/head:{branch}");
                    fetched = self
                        .git
                        .run_unchecked(directory, ["fetch", url.as_str(), refspec.as_str()])
                        .await?
                        .success();
                }

                if !fetched {
                    return Err(LifecycleError::BranchNotFound(branch.to_string()));
                }
                self.git.run(directory, ["checkout", branch]).await?;
            }
            *mutated_flag = true;
            msg::ok(format!("Checked out branch: {branch}"));
        }

        // HEAD of the branch before our baseline commit, for cleanup.
        let branch_head = self
            .git
            .run(directory, ["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string();

        // If the gt patch lives inside the repo, copy it out before the
        // reset/clean below destroys it. The temp file is deleted on drop.
        let mut gt_patch_tmp: Option<tempfile::NamedTempFile> = None;
        if let Some(abs) = gt_patch_abs.clone() {
            let abs_dir = fs::canonicalize(directory)?;
            let canon = fs::canonicalize(&abs)?;
            if canon.starts_with(&abs_dir) {
                let tmp = tempfile::Builder::new()
                    .prefix("gt_safe_")
                    .suffix(".patch")
                    .tempfile()?;
                fs::copy(&canon, tmp.path())?;
                gt_patch_abs = Some(tmp.path().to_path_buf());
                gt_patch_tmp = Some(tmp);
            }
        }

        // 4) Hard-reset to ensure a clean working tree AND index. A plain
        //    working-tree checkout would leave pre-staged changes intact.
        *mutated_flag = true;
        self.git.run(directory, ["reset", "--hard", "HEAD"]).await?;
        self.git.run(directory, ["clean", "-fd"]).await?;

        let Some(gt_patch_abs) = gt_patch_abs else {
            // No ground truth patch: current HEAD is the starting point.
            msg::ok(format!("Starting point: HEAD ({})", short(&branch_head)));
            if sanitize {
                let pre_sanitize_head = branch_head;
                let (new_head, backup_dir) = self.sanitize_git_history(directory).await?;
                let token = make_sanitized_ref(
                    &original_ref,
                    &backup_dir.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
                    &pre_sanitize_head,
                );
                return Ok((token, new_head));
            }
            return Ok((original_ref, branch_head));
        };

        // 5) Reverse-apply the ground truth patch.
        let apply = self
            .git
            .run_unchecked(directory, [
                std::ffi::OsStr::new("apply"),
                std::ffi::OsStr::new("--reverse"),
                gt_patch_abs.as_os_str(),
            ])
            .await?;
        if !apply.success() {
            return Err(LifecycleError::ReverseApplyFailed {
                patch: gt_patch_abs.to_string_lossy().into_owned(),
                stderr: apply.stderr.trim().to_string(),
            });
        }
        let basename = gt_patch_abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        msg::ok(format!("Reverse-applied ground truth patch: {basename}"));
        drop(gt_patch_tmp);

        // No changes to commit: the reverse-apply was a no-op.
        let status = self
            .git
            .run(directory, ["status", "--porcelain"])
            .await?
            .trim()
            .to_string();
        if status.is_empty() {
            msg::warn("Ground truth patch reverse-apply produced no changes.");
            if sanitize {
                let pre_sanitize_head = branch_head;
                let (new_head, backup_dir) = self.sanitize_git_history(directory).await?;
                let token = make_sanitized_ref(
                    &original_ref,
                    &backup_dir.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
                    &pre_sanitize_head,
                );
                return Ok((token, new_head));
            }
            return Ok((original_ref, branch_head));
        }

        // 6) Commit the baseline state under a fixed identity.
        self.git
            .run_with_timeout(directory, ["add", "-A"], super::git_cli::GIT_ADD_TIMEOUT)
            .await?;
        self.git
            .run(directory, [
                "-c",
                "user.name=Agent Eval",
                "-c",
                "user.email=agent-eval@noreply",
                "commit",
                "-m",
                BASELINE_COMMIT_MESSAGE,
            ])
            .await?;
        let mut baseline = self
            .git
            .run(directory, ["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string();
        msg::ok(format!("Baseline committed: {}", short(&baseline)));

        if sanitize {
            let (new_head, backup_dir) = self.sanitize_git_history(directory).await?;
            baseline = new_head;
            original_ref = make_sanitized_ref(
                &original_ref,
                &backup_dir.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
                &branch_head,
            );
        }

        Ok((original_ref, baseline))
    }

    /// Back up `.git`, then re-init with a single `base` commit.
    ///
    /// Handles both `.git` directories (normal repos) and `.git` files
    /// (worktrees / submodules). If re-init fails after `.git` was deleted,
    /// the original is restored from the backup before the error surfaces,
    /// so history is never irreversibly lost.
    async fn sanitize_git_history(
        &self,
        directory: &Path,
    ) -> Result<(String, Option<PathBuf>), LifecycleError> {
        let git_dir = directory.join(".git");
        let mut backup_dir: Option<PathBuf> = None;

        if git_dir.is_dir() || git_dir.is_file() {
            let backup = tempfile::Builder::new()
                .prefix(BACKUP_DIR_PREFIX)
                .tempdir()?
                .keep();
            let backup_git = backup.join(".git");
            if git_dir.is_dir() {
                copy_tree(&git_dir, &backup_git)?;
            } else {
                fs::copy(&git_dir, &backup_git)?;
            }
            remove_git_entry(&git_dir)?;
            backup_dir = Some(backup);
        }

        if let Err(err) = self.reinit_history(directory).await {
            // Re-init failed after .git was deleted; bring history back.
            if let Some(backup) = &backup_dir {
                let backup_git = backup.join(".git");
                remove_git_entry(&git_dir)?;
                if backup_git.is_dir() {
                    copy_tree(&backup_git, &git_dir)?;
                } else if backup_git.is_file() {
                    fs::copy(&backup_git, &git_dir)?;
                }
                remove_git_entry(backup)?;
                msg::ok("Sanitization failed; original .git restored from backup");
            }
            return Err(err);
        }

        let new_head = self
            .git
            .run(directory, ["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string();
        msg::ok(format!(
            "Sanitized git history; single commit: {}",
            short(&new_head)
        ));

        if let Some(backup) = &backup_dir {
            msg::ok(format!("Original .git backed up to: {}", backup.display()));

            // Hide the sidecar from all git operations so it never leaks
            // into agent-generated patches. The exclude entry must exist
            // BEFORE the ignored-files snapshot so the sidecar itself (once
            // written) is already excluded from git ls-files.
            let exclude_file = directory.join(".git/info/exclude");
            if let Some(parent) = exclude_file.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut f = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&exclude_file)?;
            writeln!(f, "\n{SIDECAR_FILENAME}")?;

            // Snapshot ignored files (contents + modes) before the agent
            // runs. Retry resets and the final restore use this backup to
            // bring pre-existing files back and remove agent-created ones.
            let (pre_agent_ignored, pre_agent_modes) =
                self.backup_ignored_files(directory, backup).await?;

            let sidecar_data = Sidecar {
                backup_dir: Some(backup.to_string_lossy().into_owned()),
                pre_agent_ignored: Some(pre_agent_ignored),
                pre_agent_modes,
            };
            let payload = serde_json::to_string(&sidecar_data)?;

            // In-repo copy (agent-writable, least trusted on read-back).
            fs::write(sidecar::in_repo_sidecar(directory), &payload)?;
            // Durable copy outside the repo.
            let durable_path = backup.join(DURABLE_SIDECAR);
            fs::write(&durable_path, &payload)?;
            // Hint inside .git/info/: the agent cannot delete files there
            // without breaking git itself.
            fs::write(
                directory.join(SIDECAR_HINT),
                durable_path.to_string_lossy().as_bytes(),
            )?;

            lock_backup_dir(backup);
        }

        Ok((new_head, backup_dir))
    }

    async fn reinit_history(&self, directory: &Path) -> Result<(), LifecycleError> {
        self.git.run(directory, ["init"]).await?;
        self.git
            .run(directory, ["config", "user.name", "agent-eval"])
            .await?;
        self.git
            .run(directory, ["config", "user.email", "agent-eval@noreply"])
            .await?;
        self.git
            .run_with_timeout(directory, ["add", "-A"], super::git_cli::GIT_ADD_TIMEOUT)
            .await?;
        self.git
            .run(directory, ["commit", "-m", "base", "--allow-empty"])
            .await?;
        Ok(())
    }

    /// Copy ignored files to `<backup>/ignored/` and record paths + modes.
    ///
    /// Contents are backed up (not just paths) so files the agent edits or
    /// deletes can be fully restored later.
    async fn backup_ignored_files(
        &self,
        directory: &Path,
        backup_dir: &Path,
    ) -> Result<(Vec<String>, HashMap<String, u32>), LifecycleError> {
        let ignored = self.git.list_ignored(directory).await;
        let mut modes: HashMap<String, u32> = HashMap::new();
        if ignored.is_empty() {
            return Ok((ignored, modes));
        }
        let ignored_root = backup_dir.join("ignored");
        for relpath in &ignored {
            let src = directory.join(relpath);
            if src.is_file() {
                modes.insert(relpath.clone(), fs::metadata(&src)?.permissions().mode());
                let dst = ignored_root.join(relpath);
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&src, &dst)?;
            }
        }
        Ok((ignored, modes))
    }

    /// Restore pre-existing ignored files and remove agent-created ones.
    ///
    /// Every relpath comes from a sidecar and is treated as attacker
    /// controlled. Gates, in order:
    /// - safe relative path (no absolute, no `..`, nothing under `.git/`)
    /// - not tracked by git (a tampered sidecar plus a payload in the
    ///   backup must not overwrite repository content)
    /// - resolved parent stays inside the repo after `create_dir_all`
    ///   (catches symlinked parent directories planted by the agent)
    /// - the agent's entity at the destination is removed without ever
    ///   following symlinks
    async fn restore_ignored_files(
        &self,
        directory: &Path,
        backup_dir: &Path,
        pre_agent_ignored: &HashSet<String>,
        pre_agent_modes: &HashMap<String, u32>,
    ) -> Result<(), LifecycleError> {
        let real_repo = fs::canonicalize(directory)?;

        // 1. Restore pre-existing files from the content backup.
        let ignored_root = backup_dir.join("ignored");
        if ignored_root.is_dir() {
            let mut ordered: Vec<&String> = pre_agent_ignored.iter().collect();
            ordered.sort();
            for relpath in ordered {
                if !is_safe_relpath(relpath) {
                    tracing::debug!(relpath = %relpath, "skipping unsafe sidecar relpath");
                    continue;
                }
                if self.git.is_tracked(directory, relpath).await {
                    tracing::debug!(relpath = %relpath, "skipping tracked path from sidecar");
                    continue;
                }

                let src = ignored_root.join(relpath);
                if !src.is_file() {
                    continue;
                }
                let dst = directory.join(relpath);

                let dst_dir = dst.parent().unwrap_or(directory).to_path_buf();
                fs::create_dir_all(&dst_dir)?;

                // Re-verify the resolved parent is inside the repo AFTER
                // create_dir_all; a symlinked parent resolves elsewhere.
                let Ok(real_dst_dir) = fs::canonicalize(&dst_dir) else {
                    continue;
                };
                if real_dst_dir != real_repo && !real_dst_dir.starts_with(&real_repo) {
                    continue;
                }

                // Now safe to clear whatever the agent left at dst, without
                // following symlinks.
                if let Ok(meta) = fs::symlink_metadata(&dst) {
                    if meta.is_dir() && !meta.file_type().is_symlink() {
                        fs::remove_dir_all(&dst)?;
                    } else {
                        fs::remove_file(&dst)?;
                    }
                }

                fs::copy(&src, &dst)?;
                // The backup is locked read-only, so the copied permissions
                // are locked too. Apply the recorded original mode, masked
                // to the permission bits with user-write forced on.
                let mode = match pre_agent_modes.get(relpath) {
                    Some(mode) => (mode & 0o777) | 0o200,
                    None => 0o640,
                };
                fs::set_permissions(&dst, fs::Permissions::from_mode(mode))?;
            }
        }

        // 2. Remove ignored files the agent created. The backup contents act
        //    as an authoritative complement to pre_agent_ignored: a file that
        //    physically exists in the backup was pre-existing even if the
        //    sidecar list was tampered to empty.
        let current: HashSet<String> = self.git.list_ignored(directory).await.into_iter().collect();
        let mut backed_up: Vec<String> = Vec::new();
        if ignored_root.is_dir() {
            walk_relative_files(&ignored_root, Path::new(""), &mut backed_up);
        }
        let mut known: HashSet<&str> = pre_agent_ignored.iter().map(|s| s.as_str()).collect();
        known.extend(backed_up.iter().map(|s| s.as_str()));
        known.insert(SIDECAR_FILENAME);

        let mut fresh: Vec<&String> = current.iter().filter(|p| !known.contains(p.as_str())).collect();
        fresh.sort();
        for relpath in fresh {
            if !is_safe_relpath(relpath) {
                continue;
            }
            let full = directory.join(relpath);
            let Ok(meta) = fs::symlink_metadata(&full) else {
                continue;
            };
            let result = if meta.file_type().is_symlink() || meta.is_file() {
                fs::remove_file(&full)
            } else if meta.is_dir() {
                fs::remove_dir_all(&full)
            } else {
                Ok(())
            };
            if let Err(err) = result {
                tracing::debug!(relpath = %relpath, %err, "could not remove agent-created ignored path");
            }
        }

        Ok(())
    }

    /// Reset the repo to the baseline commit between retries.
    ///
    /// `git clean -fd` skips ignored files, so pre-existing ignored files
    /// are then restored from the content backup and agent-created ignored
    /// files are removed. `backup_dir`, when provided, is the trusted
    /// location from the encoded original-ref token; the sidecar lookup then
    /// cannot be redirected by agent-tampered hint files.
    pub async fn reset_to_baseline(
        &self,
        directory: &Path,
        baseline_commit: &str,
        backup_dir: Option<&Path>,
    ) -> Result<(), LifecycleError> {
        self.git
            .run(directory, ["reset", "--hard", baseline_commit])
            .await?;
        self.git.run(directory, ["clean", "-fd"]).await?;

        if let Some(data) = read_sidecar(directory, backup_dir)
            && let Some(bd) = data.backup_dir.as_deref().filter(|s| !s.is_empty())
            && let Some(pre_ignored) = &data.pre_agent_ignored
        {
            let pre: HashSet<String> = pre_ignored.iter().cloned().collect();
            self.restore_ignored_files(directory, Path::new(bd), &pre, &data.pre_agent_modes)
                .await?;
        }
        Ok(())
    }

    /// Restore the repo to its original pre-setup state.
    ///
    /// Sanitized path: bring the original `.git` back from the backup, reset
    /// the branch to its pre-sanitize tip, restore ignored files, delete the
    /// backup, and switch back to the saved ref. Non-sanitized path: rewind
    /// a sentinel baseline commit and check out the original ref.
    ///
    /// Git commands that must succeed for correctness raise; read-only
    /// queries and best-effort cleanup do not.
    pub async fn restore_repo(
        &self,
        directory: &Path,
        original_ref: &str,
        baseline_commit: &str,
    ) -> Result<(), LifecycleError> {
        if let Some(meta) = decode_sanitized_ref(original_ref) {
            return self.restore_sanitized(directory, &meta).await;
        }

        let current_head = self
            .git
            .run_unchecked(directory, ["rev-parse", "HEAD"])
            .await?
            .stdout_trimmed()
            .to_string();

        // Mid-attempt dirty tree: get back to the baseline first.
        if baseline_commit != current_head {
            self.git
                .run(directory, ["reset", "--hard", baseline_commit])
                .await?;
            let _ = self.git.run_unchecked(directory, ["clean", "-fd"]).await;
        }

        // Only rewind the baseline commit if we actually created one; the
        // commit message check avoids rewinding a pre-existing commit.
        let commit_msg = self
            .git
            .run_unchecked(directory, ["log", "-1", "--format=%s", baseline_commit])
            .await?
            .stdout_trimmed()
            .to_string();
        if commit_msg == BASELINE_COMMIT_MESSAGE {
            let parent_ref = format!("{baseline_commit}^");
            let parent = self
                .git
                .run_unchecked(directory, ["rev-parse", "--verify", parent_ref.as_str()])
                .await?
                .stdout_trimmed()
                .to_string();
            if !parent.is_empty() && parent != baseline_commit {
                self.git
                    .run(directory, ["reset", "--hard", parent.as_str()])
                    .await?;
                msg::ok(format!(
                    "Removed baseline commit; branch restored to {}",
                    short(&parent)
                ));
            } else {
                let _ = self
                    .git
                    .run_unchecked(directory, ["reset", "--hard", "HEAD"])
                    .await;
            }
        } else {
            let _ = self
                .git
                .run_unchecked(directory, ["reset", "--hard", "HEAD"])
                .await;
        }
        let _ = self.git.run_unchecked(directory, ["clean", "-fd"]).await;

        // Switch back to the original branch/ref if we moved.
        let current_ref = self.git.current_ref(directory).await;
        if !original_ref.is_empty() && original_ref != current_ref {
            self.git.run(directory, ["checkout", original_ref]).await?;
            msg::ok(format!("Switched back to: {original_ref}"));
        }

        self.remove_sanitize_sidecar(directory);
        Ok(())
    }

    async fn restore_sanitized(
        &self,
        directory: &Path,
        meta: &SanitizedMeta,
    ) -> Result<(), LifecycleError> {
        // Read the sidecar BEFORE any cleanup; restoring the original .git
        // and git clean both remove sidecar sources. The explicit backup_dir
        // finds the durable copy even when the in-repo sidecar and the hint
        // are gone.
        let backup_dir = (!meta.backup_dir.is_empty()).then(|| PathBuf::from(&meta.backup_dir));
        let sidecar_data = read_sidecar(directory, backup_dir.as_deref());
        let pre_ignored: Option<HashSet<String>> = sidecar_data
            .as_ref()
            .and_then(|d| d.pre_agent_ignored.as_ref())
            .map(|v| v.iter().cloned().collect());

        let git_dir = directory.join(".git");
        let backup_git = backup_dir.as_ref().map(|b| b.join(".git"));
        let backup_git_ok = backup_git
            .as_ref()
            .map(|p| p.is_dir() || p.is_file())
            .unwrap_or(false);
        if !backup_git_ok {
            // Backup missing: history cannot be restored; hard failure.
            let _ = self
                .git
                .run_unchecked(directory, ["reset", "--hard", "HEAD"])
                .await;
            let _ = self.git.run_unchecked(directory, ["clean", "-fd"]).await;
            return Err(LifecycleError::RestoreFailed(format!(
                "Cannot restore repo: sanitized .git backup not found (expected at {}). \
Working tree cleaned but original history is lost.",
                backup_git
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<empty>".to_string())
            )));
        }
        let backup_dir = backup_dir.expect("backup_git_ok implies backup_dir");
        let backup_git = backup_git.expect("backup_git_ok implies backup_git");

        remove_git_entry(&git_dir)?;
        if backup_git.is_dir() {
            copy_tree(&backup_git, &git_dir)?;
        } else {
            fs::copy(&backup_git, &git_dir)?;
        }
        // The backup directory is still needed below for the ignored-files
        // content backup; it is deleted only after that restore.
        msg::ok("Original .git restored from backup");

        // Undo the baseline commit (if any) by resetting to the original
        // branch tip recorded before setup.
        if !meta.branch_head.is_empty() {
            self.git
                .run(directory, ["reset", "--hard", meta.branch_head.as_str()])
                .await?;
            msg::ok(format!(
                "Branch reset to original tip: {}",
                short(&meta.branch_head)
            ));
        } else {
            let _ = self
                .git
                .run_unchecked(directory, ["reset", "--hard", "HEAD"])
                .await;
        }
        let _ = self.git.run_unchecked(directory, ["clean", "-fd"]).await;

        if let Some(pre) = pre_ignored {
            let modes = sidecar_data
                .as_ref()
                .map(|d| d.pre_agent_modes.clone())
                .unwrap_or_default();
            self.restore_ignored_files(directory, &backup_dir, &pre, &modes)
                .await?;
        }

        remove_git_entry(&backup_dir)?;

        if !meta.saved_ref.is_empty() {
            let current_ref = self.git.current_ref(directory).await;
            if meta.saved_ref != current_ref {
                self.git
                    .run(directory, ["checkout", meta.saved_ref.as_str()])
                    .await?;
                msg::ok(format!("Switched back to: {}", meta.saved_ref));
            }
        }
        self.remove_sanitize_sidecar(directory);
        msg::ok("Repo fully restored to original state");
        Ok(())
    }

    /// Best-effort cleanup when setup mutated the repo but never returned.
    ///
    /// A sanitization backup discovered here comes from an untrusted sidecar
    /// source (no encoded token is available on this path), so the backed-up
    /// `.git` is NOT copied into the repo: a forged backup could carry
    /// hooks that execute on the next git operation. The path is surfaced
    /// for manual inspection instead, and the working tree is cleaned using
    /// whatever `.git` is currently in place.
    pub async fn best_effort_cleanup(
        &self,
        directory: &Path,
        pre_setup_ref: &str,
    ) -> Result<(), LifecycleError> {
        if let Some(backup_dir) = self.recover_sanitize_backup(directory) {
            msg::warn(format!(
                "Sanitization detected but .git not restored (untrusted source). \
Manual restore from: {}",
                backup_dir.display()
            ));
        }
        self.remove_sanitize_sidecar(directory);

        let _ = self
            .git
            .run_unchecked(directory, ["reset", "--hard", "HEAD"])
            .await;
        let _ = self.git.run_unchecked(directory, ["clean", "-fd"]).await;

        // Setup may have left a baseline commit on the current branch.
        let head_msg = self
            .git
            .run_unchecked(directory, ["log", "-1", "--format=%s"])
            .await?
            .stdout_trimmed()
            .to_string();
        if head_msg == BASELINE_COMMIT_MESSAGE {
            let parent = self
                .git
                .run_unchecked(directory, ["rev-parse", "--verify", "HEAD^"])
                .await?
                .stdout_trimmed()
                .to_string();
            if !parent.is_empty() {
                self.git
                    .run(directory, ["reset", "--hard", parent.as_str()])
                    .await?;
                msg::ok(format!(
                    "Removed leftover baseline commit; reset to {}",
                    short(&parent)
                ));
            }
        }

        let current = self.git.current_ref(directory).await;
        if !pre_setup_ref.is_empty() && pre_setup_ref != current {
            self.git.run(directory, ["checkout", pre_setup_ref]).await?;
            msg::ok(format!("Switched back to pre-setup ref: {pre_setup_ref}"));
        }
        Ok(())
    }

    /// Read the sidecar and return the backup_dir path, if it validates as a
    /// backup this harness plausibly created. A sidecar pointing anywhere
    /// else is ignored so a tampered file cannot direct the caller at an
    /// arbitrary external directory.
    pub fn recover_sanitize_backup(&self, directory: &Path) -> Option<PathBuf> {
        let data = read_sidecar(directory, None)?;
        let bd = data.backup_dir.filter(|s| !s.is_empty())?;
        let path = PathBuf::from(&bd);
        if !is_plausible_backup_dir(&path) {
            msg::warn(format!("Sidecar backup_dir failed validation, ignoring: {bd}"));
            return None;
        }
        Some(path)
    }

    /// Remove the in-repo sidecar if present.
    pub fn remove_sanitize_sidecar(&self, directory: &Path) {
        let sidecar = sidecar::in_repo_sidecar(directory);
        if sidecar.is_file() {
            let _ = fs::remove_file(sidecar);
        }
    }
}

/// Make the sidecar and ignored-file backup read-only.
///
/// Only `sidecar.json` and `ignored/` are locked; the `.git` backup stays
/// writable so the restore can copy it back without a chmod pass. The agent
/// runs as the same OS user and could chmod this back; later gates do not
/// rely on the lock.
fn lock_backup_dir(backup_dir: &Path) {
    let sidecar = backup_dir.join(DURABLE_SIDECAR);
    if sidecar.is_file() {
        let _ = fs::set_permissions(&sidecar, fs::Permissions::from_mode(0o440));
    }

    let ignored_root = backup_dir.join("ignored");
    if ignored_root.is_dir() {
        lock_tree(&ignored_root);
    }
}

fn lock_tree(root: &Path) {
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if meta.is_dir() && !meta.file_type().is_symlink() {
                lock_tree(&path);
            } else {
                let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o440));
            }
        }
    }
    let _ = fs::set_permissions(root, fs::Permissions::from_mode(0o550));
}
