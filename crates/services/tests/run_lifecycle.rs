//! Lifecycle integration tests: setup, per-retry reset, restore, and the
//! sidecar tamper gates, exercised against real git repositories.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use serde_json::json;
use services::services::{
    git_cli::GitCli,
    git_lifecycle::{BASELINE_COMMIT_MESSAGE, GitLifecycle, decode_backup_dir},
    repo_patch::{get_patch, has_repo_changes},
    sidecar::{SIDECAR_FILENAME, SIDECAR_HINT},
};
use tempfile::TempDir;
use utils::patch::{extract_files_from_patch, validate_patch};

fn write_file(base: &Path, rel: &str, content: &str) {
    let path = base.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
}

fn read_file(base: &Path, rel: &str) -> String {
    fs::read_to_string(base.join(rel)).unwrap()
}

async fn init_repo(git: &GitCli, path: &Path, files: &[(&str, &str)]) -> String {
    fs::create_dir_all(path).unwrap();
    git.run(path, ["init"]).await.unwrap();
    git.run(path, ["config", "user.name", "test"]).await.unwrap();
    git.run(path, ["config", "user.email", "test@test"]).await.unwrap();
    for (rel, content) in files {
        write_file(path, rel, content);
    }
    git.run(path, ["add", "-A"]).await.unwrap();
    git.run(path, ["commit", "-m", "initial", "--allow-empty"])
        .await
        .unwrap();
    head(git, path).await
}

async fn head(git: &GitCli, path: &Path) -> String {
    git.run(path, ["rev-parse", "HEAD"]).await.unwrap().trim().to_string()
}

async fn branch(git: &GitCli, path: &Path) -> String {
    git.run(path, ["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .unwrap()
        .trim()
        .to_string()
}

async fn status(git: &GitCli, path: &Path) -> String {
    git.run(path, ["status", "--porcelain"]).await.unwrap()
}

/// Commit `changes` as a fix commit and return its diff (the ground truth
/// patch) plus the new HEAD.
async fn commit_fix(git: &GitCli, path: &Path, changes: &[(&str, &str)]) -> (String, String) {
    for (rel, content) in changes {
        write_file(path, rel, content);
    }
    git.run(path, ["add", "-A"]).await.unwrap();
    git.run(path, ["commit", "-m", "fix"]).await.unwrap();
    let patch = git.run(path, ["diff", "HEAD~1", "HEAD"]).await.unwrap();
    (patch, head(git, path).await)
}

fn mode_of(base: &Path, rel: &str) -> u32 {
    fs::metadata(base.join(rel)).unwrap().permissions().mode() & 0o777
}

fn make_writable(root: &Path) {
    let _ = fs::set_permissions(root, fs::Permissions::from_mode(0o700));
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                make_writable(&path);
            } else {
                let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
            }
        }
    }
}

struct Fixture {
    _root: TempDir,
    repo: PathBuf,
    outside: PathBuf,
}

fn fixture() -> Fixture {
    let root = TempDir::new().unwrap();
    let repo = root.path().join("repo");
    let outside = root.path().join("outside");
    fs::create_dir_all(&outside).unwrap();
    Fixture {
        repo,
        outside,
        _root: root,
    }
}

#[tokio::test]
async fn setup_then_restore_is_identity_with_gt_patch() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(
        &git,
        &fx.repo,
        &[("a.txt", "original\n"), (".gitignore", ".env\n*.tmp\n")],
    )
    .await;
    write_file(&fx.repo, ".env", "SECRET=original\n");
    fs::set_permissions(fx.repo.join(".env"), fs::Permissions::from_mode(0o600)).unwrap();

    let (patch, fix_head) = commit_fix(&git, &fx.repo, &[("a.txt", "fixed\n")]).await;
    let gt_patch = fx.outside.join("fix.patch");
    fs::write(&gt_patch, &patch).unwrap();

    let pre_branch = branch(&git, &fx.repo).await;

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, Some(&gt_patch), None, true, &mut mutated)
        .await
        .unwrap();
    assert!(mutated);

    // The agent sees the pre-fix state under a single sanitized commit.
    assert_eq!(read_file(&fx.repo, "a.txt"), "original\n");
    let count = git
        .run(&fx.repo, ["rev-list", "--count", "HEAD"])
        .await
        .unwrap();
    assert_eq!(count.trim(), "1");
    assert!(fx.repo.join(SIDECAR_FILENAME).is_file());
    assert!(fx.repo.join(SIDECAR_HINT).is_file());

    let backup_dir = decode_backup_dir(&token).expect("sanitized token carries backup dir");
    assert!(backup_dir.join(".git").exists());
    assert_eq!(
        fs::read_to_string(backup_dir.join("ignored/.env")).unwrap(),
        "SECRET=original\n"
    );

    // Agent activity: edits, new files, ignored-file tampering.
    write_file(&fx.repo, "a.txt", "agent was here\n");
    write_file(&fx.repo, "new.txt", "agent file\n");
    write_file(&fx.repo, ".env", "SECRET=hacked\n");
    write_file(&fx.repo, "junk.tmp", "scratch\n");

    lifecycle
        .restore_repo(&fx.repo, &token, &baseline)
        .await
        .unwrap();

    assert_eq!(head(&git, &fx.repo).await, fix_head);
    assert_eq!(branch(&git, &fx.repo).await, pre_branch);
    assert_eq!(read_file(&fx.repo, "a.txt"), "fixed\n");
    assert!(!fx.repo.join("new.txt").exists());
    assert_eq!(read_file(&fx.repo, ".env"), "SECRET=original\n");
    assert_eq!(mode_of(&fx.repo, ".env"), 0o600);
    assert!(!fx.repo.join("junk.tmp").exists());
    assert!(!fx.repo.join(SIDECAR_FILENAME).exists());
    assert!(!backup_dir.exists());
    assert_eq!(status(&git, &fx.repo).await.trim(), "");
}

#[tokio::test]
async fn setup_without_gt_patch_uses_head_as_baseline() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    let initial = init_repo(&git, &fx.repo, &[("a.txt", "base\n")]).await;
    let pre_branch = branch(&git, &fx.repo).await;

    let mut mutated = false;
    let (original_ref, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, false, &mut mutated)
        .await
        .unwrap();

    assert_eq!(original_ref, pre_branch);
    assert_eq!(baseline, initial);

    lifecycle
        .restore_repo(&fx.repo, &original_ref, &baseline)
        .await
        .unwrap();
    assert_eq!(head(&git, &fx.repo).await, initial);
    assert_eq!(branch(&git, &fx.repo).await, pre_branch);
    assert_eq!(status(&git, &fx.repo).await.trim(), "");
}

#[tokio::test]
async fn setup_fails_before_mutation_on_missing_gt_patch() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    let initial = init_repo(&git, &fx.repo, &[("a.txt", "base\n")]).await;
    write_file(&fx.repo, "dirty.txt", "uncommitted\n");

    let mut mutated = false;
    let missing = fx.outside.join("no_such.patch");
    let result = lifecycle
        .setup_starting_point(&fx.repo, None, Some(&missing), None, true, &mut mutated)
        .await;

    assert!(result.is_err());
    assert!(!mutated);
    assert_eq!(head(&git, &fx.repo).await, initial);
    assert!(fx.repo.join("dirty.txt").exists());
}

#[tokio::test]
async fn reset_to_baseline_restores_tracked_and_ignored_state() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(
        &git,
        &fx.repo,
        &[("a.txt", "base\n"), (".gitignore", ".env\n*.tmp\n")],
    )
    .await;
    write_file(&fx.repo, ".env", "SECRET=original\n");

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, true, &mut mutated)
        .await
        .unwrap();
    let backup_dir = decode_backup_dir(&token).unwrap();

    write_file(&fx.repo, "a.txt", "attempt 1 damage\n");
    fs::remove_file(fx.repo.join(".env")).unwrap();
    write_file(&fx.repo, "extra.tmp", "leftover\n");

    lifecycle
        .reset_to_baseline(&fx.repo, &baseline, Some(&backup_dir))
        .await
        .unwrap();

    assert_eq!(head(&git, &fx.repo).await, baseline);
    assert_eq!(read_file(&fx.repo, "a.txt"), "base\n");
    assert_eq!(read_file(&fx.repo, ".env"), "SECRET=original\n");
    assert!(!fx.repo.join("extra.tmp").exists());

    lifecycle.restore_repo(&fx.repo, &token, &baseline).await.unwrap();
}

#[tokio::test]
async fn tampered_sidecar_paths_are_gated() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(
        &git,
        &fx.repo,
        &[
            ("tracked.txt", "tracked content\n"),
            (".gitignore", ".env\n"),
        ],
    )
    .await;
    write_file(&fx.repo, ".env", "SECRET=original\n");

    let precious = fx.outside.join("precious.txt");
    fs::write(&precious, "precious content\n").unwrap();

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, true, &mut mutated)
        .await
        .unwrap();
    let backup_dir = decode_backup_dir(&token).unwrap();
    let git_config_before = fs::read(fx.repo.join(".git/config")).unwrap();

    // Attacker: unlock the backup, plant a payload for a tracked file, and
    // rewrite the in-repo sidecar with hostile relpaths. Removing the hint
    // forces the next sidecar read (no trusted dir) onto the tampered copy.
    make_writable(&backup_dir.join("ignored"));
    write_file(&backup_dir, "ignored/tracked.txt", "PAYLOAD\n");
    let tampered = json!({
        "backup_dir": backup_dir.to_string_lossy(),
        "pre_agent_ignored": [
            ".env",
            "tracked.txt",
            precious.to_string_lossy(),
            "../escape.txt",
            ".git/config",
        ],
        "pre_agent_modes": {},
    });
    fs::write(
        fx.repo.join(SIDECAR_FILENAME),
        serde_json::to_string(&tampered).unwrap(),
    )
    .unwrap();
    fs::remove_file(fx.repo.join(SIDECAR_HINT)).unwrap();
    fs::remove_file(backup_dir.join("sidecar.json")).unwrap();

    fs::remove_file(fx.repo.join(".env")).unwrap();

    lifecycle
        .reset_to_baseline(&fx.repo, &baseline, None)
        .await
        .unwrap();

    // Gate B: tracked content untouched by the planted payload.
    assert_eq!(read_file(&fx.repo, "tracked.txt"), "tracked content\n");
    // Gate A: nothing outside the repo was written or deleted.
    assert_eq!(fs::read_to_string(&precious).unwrap(), "precious content\n");
    assert!(!fx.outside.join("escape.txt").exists());
    assert!(!fx.repo.parent().unwrap().join("escape.txt").exists());
    // Gate A: .git internals untouched.
    assert_eq!(fs::read(fx.repo.join(".git/config")).unwrap(), git_config_before);
    // Legitimate entry still restored.
    assert_eq!(read_file(&fx.repo, ".env"), "SECRET=original\n");
}

#[tokio::test]
async fn tampered_empty_ignored_list_does_not_delete_backed_up_files() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(&git, &fx.repo, &[(".gitignore", ".env\n")]).await;
    write_file(&fx.repo, ".env", "SECRET=original\n");

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, true, &mut mutated)
        .await
        .unwrap();
    let backup_dir = decode_backup_dir(&token).unwrap();

    // Attacker claims nothing pre-existed, hoping .env is removed as
    // agent-created. The backup contents are authoritative.
    let tampered = json!({
        "backup_dir": backup_dir.to_string_lossy(),
        "pre_agent_ignored": [],
        "pre_agent_modes": {},
    });
    fs::write(
        fx.repo.join(SIDECAR_FILENAME),
        serde_json::to_string(&tampered).unwrap(),
    )
    .unwrap();
    fs::remove_file(fx.repo.join(SIDECAR_HINT)).unwrap();
    fs::remove_file(backup_dir.join("sidecar.json")).unwrap();

    lifecycle
        .reset_to_baseline(&fx.repo, &baseline, None)
        .await
        .unwrap();

    assert_eq!(read_file(&fx.repo, ".env"), "SECRET=original\n");
}

#[tokio::test]
async fn symlinked_parent_does_not_redirect_restore_outside_repo() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(&git, &fx.repo, &[(".gitignore", "config\n")]).await;
    write_file(&fx.repo, "config/settings.ini", "[core]\nvalue=1\n");

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, true, &mut mutated)
        .await
        .unwrap();
    let backup_dir = decode_backup_dir(&token).unwrap();
    assert!(backup_dir.join("ignored/config/settings.ini").is_file());

    // Agent swaps the whole config directory for a symlink pointing outside.
    let external_dir = fx.outside.join("external_dir");
    fs::create_dir_all(&external_dir).unwrap();
    fs::remove_dir_all(fx.repo.join("config")).unwrap();
    std::os::unix::fs::symlink(&external_dir, fx.repo.join("config")).unwrap();

    lifecycle
        .reset_to_baseline(&fx.repo, &baseline, Some(&backup_dir))
        .await
        .unwrap();

    // Nothing was written through the symlink.
    assert!(external_dir.exists());
    assert_eq!(fs::read_dir(&external_dir).unwrap().count(), 0);
    // The planted symlink itself was cleared as agent-created.
    assert!(fx.repo.join("config").symlink_metadata().is_err());
}

#[tokio::test]
async fn restore_fails_loudly_when_backup_is_gone() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(&git, &fx.repo, &[("a.txt", "base\n")]).await;

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, true, &mut mutated)
        .await
        .unwrap();
    let backup_dir = decode_backup_dir(&token).unwrap();

    make_writable(&backup_dir);
    fs::remove_dir_all(&backup_dir).unwrap();

    let err = lifecycle
        .restore_repo(&fx.repo, &token, &baseline)
        .await
        .expect_err("missing backup must be a hard failure");
    assert!(err.to_string().contains("backup not found"), "{err}");
    // The working tree was still cleaned with the sanitized .git in place.
    assert_eq!(status(&git, &fx.repo).await.trim(), "");
}

#[tokio::test]
async fn best_effort_cleanup_rewinds_stray_baseline_commit() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    let initial = init_repo(&git, &fx.repo, &[("a.txt", "base\n")]).await;
    let pre_branch = branch(&git, &fx.repo).await;

    write_file(&fx.repo, "a.txt", "pre-fix\n");
    git.run(&fx.repo, ["add", "-A"]).await.unwrap();
    git.run(&fx.repo, ["commit", "-m", BASELINE_COMMIT_MESSAGE])
        .await
        .unwrap();

    lifecycle
        .best_effort_cleanup(&fx.repo, &pre_branch)
        .await
        .unwrap();

    assert_eq!(head(&git, &fx.repo).await, initial);
    assert_eq!(branch(&git, &fx.repo).await, pre_branch);
    assert_eq!(read_file(&fx.repo, "a.txt"), "base\n");
}

#[tokio::test]
async fn get_patch_captures_changes_and_leaves_tree_intact() {
    let fx = fixture();
    let git = GitCli::new();

    init_repo(&git, &fx.repo, &[("a.txt", "one\n")]).await;
    assert!(!has_repo_changes(&git, &fx.repo).await.unwrap());

    write_file(&fx.repo, "a.txt", "two\n");
    write_file(&fx.repo, "sub/new.txt", "fresh\n");
    assert!(has_repo_changes(&git, &fx.repo).await.unwrap());

    let status_before = status(&git, &fx.repo).await;
    let patch = get_patch(&git, &fx.repo).await.unwrap();
    let status_after = status(&git, &fx.repo).await;

    assert_eq!(status_before, status_after);
    let check = validate_patch(&patch);
    assert!(check.is_valid, "{}", check.reason);
    let files = extract_files_from_patch(&patch);
    assert!(files.contains(&"a.txt".to_string()));
    assert!(files.contains(&"sub/new.txt".to_string()));
}

#[tokio::test]
async fn sidecar_never_appears_in_patches() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(&git, &fx.repo, &[("a.txt", "base\n")]).await;

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, true, &mut mutated)
        .await
        .unwrap();

    write_file(&fx.repo, "a.txt", "changed by agent\n");
    let patch = get_patch(&git, &fx.repo).await.unwrap();
    assert!(!patch.contains(SIDECAR_FILENAME));
    let check = validate_patch(&patch);
    assert!(check.is_valid, "{}", check.reason);

    lifecycle.restore_repo(&fx.repo, &token, &baseline).await.unwrap();
}

#[tokio::test]
async fn modes_survive_restore_even_when_sidecar_modes_are_tampered() {
    let fx = fixture();
    let git = GitCli::new();
    let lifecycle = GitLifecycle::new();

    init_repo(&git, &fx.repo, &[(".gitignore", "run.sh\n")]).await;
    write_file(&fx.repo, "run.sh", "#!/bin/sh\necho hi\n");
    fs::set_permissions(fx.repo.join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();

    let mut mutated = false;
    let (token, baseline) = lifecycle
        .setup_starting_point(&fx.repo, None, None, None, true, &mut mutated)
        .await
        .unwrap();
    let backup_dir = decode_backup_dir(&token).unwrap();

    fs::set_permissions(fx.repo.join("run.sh"), fs::Permissions::from_mode(0o600)).unwrap();
    write_file(&fx.repo, "run.sh", "tampered\n");

    lifecycle
        .reset_to_baseline(&fx.repo, &baseline, Some(&backup_dir))
        .await
        .unwrap();

    assert_eq!(read_file(&fx.repo, "run.sh"), "#!/bin/sh\necho hi\n");
    assert_eq!(mode_of(&fx.repo, "run.sh"), 0o755);

    // Absurd float modes in a tampered sidecar are dropped by sanitization
    // and the restore falls back to a safe default instead of crashing.
    let text = format!(
        "{{\"backup_dir\":{},\"pre_agent_ignored\":[\"run.sh\"],\"pre_agent_modes\":{{\"run.sh\":1e99}}}}",
        serde_json::to_string(&backup_dir.to_string_lossy()).unwrap()
    );
    fs::write(fx.repo.join(SIDECAR_FILENAME), text).unwrap();
    fs::remove_file(fx.repo.join(SIDECAR_HINT)).unwrap();
    fs::remove_file(backup_dir.join("sidecar.json")).unwrap();
    fs::set_permissions(fx.repo.join("run.sh"), fs::Permissions::from_mode(0o600)).unwrap();

    lifecycle
        .reset_to_baseline(&fx.repo, &baseline, None)
        .await
        .unwrap();
    assert_eq!(read_file(&fx.repo, "run.sh"), "#!/bin/sh\necho hi\n");
    // Tampered mode rejected; safe default applied with user write forced.
    assert_eq!(mode_of(&fx.repo, "run.sh") & 0o200, 0o200);
}
