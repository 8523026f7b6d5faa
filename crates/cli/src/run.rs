//! Run mode: execute an agent to generate a code patch for a PR issue.
//!
//! The state machine: validate inputs → record pre-setup ref → resolve
//! model → sanitized baseline setup → retry loop → write patch and
//! trajectory → guaranteed restore. The restore runs no matter how the
//! middle phases ended, and a restore failure trumps every other outcome.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Args;
use executors::{
    client::{AgentClient, ClientError, print_response},
    model::{choose_server_model, resolve_model},
    trajectory::{
        TimingWindow, TrajectoryContext, collect_trajectory, epoch_iso, now_epoch, save_trajectory,
    },
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Value, json};
use services::services::{
    git_lifecycle::{GitLifecycle, decode_backup_dir},
    repo_patch::{get_patch, has_repo_changes},
};
use utils::{msg, patch::validate_patch, text::sanitize_prompt};

use crate::fetch::{fetch_patch_from_url, is_url};

const MAX_RETRIES: u32 = 3;
const AGENT: &str = "build";

lazy_static! {
    static ref REPO_FROM_URL_RE: Regex = Regex::new(r"^(https?://[^/]+/[^/]+/[^/]+)").unwrap();
}

#[derive(Args)]
pub struct RunArgs {
    /// Target repository working tree
    #[arg(short = 'd', long)]
    pub directory: PathBuf,

    /// Prompt markdown file (prompt_variants/<Project>/<version>.md)
    #[arg(short = 'f', long = "prompt-file")]
    pub prompt_file: PathBuf,

    /// Branch to check out before the run (fetched if absent locally)
    #[arg(long)]
    pub branch: Option<String>,

    /// Ground truth patch to reverse-apply: local path or URL
    #[arg(long = "gt-patch")]
    pub gt_patch: Option<String>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub async fn handler(args: RunArgs) -> Result<i32> {
    // ── Validate inputs (before any git mutation) ──

    let prompt_raw = match fs::read_to_string(&args.prompt_file) {
        Ok(text) => text,
        Err(err) => {
            msg::error(format!(
                "Could not read prompt file {}: {err}",
                args.prompt_file.display()
            ));
            return Ok(1);
        }
    };
    let prompt = sanitize_prompt(&prompt_raw);
    msg::ok("Prompt sanitized (repo URLs removed)");

    // Derive project/version from the prompt file path for output paths,
    // e.g. prompt_variants/Hutool/pr_692_v1.md → Hutool / pr_692_v1.
    let prompt_abs = fs::canonicalize(&args.prompt_file)
        .unwrap_or_else(|_| args.prompt_file.clone());
    let version_stem = prompt_abs
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    let project_name = prompt_abs
        .parent()
        .and_then(Path::file_name)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    let directory = match fs::canonicalize(&args.directory) {
        Ok(dir) => dir,
        Err(err) => {
            msg::error(format!(
                "Target directory {} is not accessible: {err}",
                args.directory.display()
            ));
            return Ok(1);
        }
    };
    let dir_str = directory.to_string_lossy().into_owned();

    // Resolve the ground truth patch; URLs download to a temp file that
    // lives until the end of the run.
    let gt_patch_original = args.gt_patch.clone();
    let mut gt_patch_tempfile: Option<tempfile::NamedTempFile> = None;
    let gt_patch_path: Option<PathBuf> = match &args.gt_patch {
        None => None,
        Some(spec) if is_url(spec) => {
            msg::progress("Downloading ground truth patch from URL...");
            let content = match fetch_patch_from_url(spec).await {
                Ok(content) => content,
                Err(err) => {
                    msg::error(format!("Failed to download ground truth patch: {err}"));
                    return Ok(1);
                }
            };
            let tmp = tempfile::Builder::new()
                .prefix("gt_")
                .suffix(".patch")
                .tempfile()
                .context("could not create temp file for downloaded patch")?;
            fs::write(tmp.path(), &content)?;
            msg::ok(format!(
                "Ground truth patch downloaded ({} bytes)",
                content.len()
            ));
            let path = tmp.path().to_path_buf();
            gt_patch_tempfile = Some(tmp);
            Some(path)
        }
        Some(spec) => {
            let abs = fs::canonicalize(spec).unwrap_or_else(|_| PathBuf::from(spec));
            if !abs.is_file() {
                msg::error(format!("Ground truth patch not found: {}", abs.display()));
                return Ok(1);
            }
            Some(abs)
        }
    };

    // Repo URL derived from a gt-patch URL, for branch fetching when the
    // repo has no remote configured.
    let gt_patch_repo_url: Option<String> = gt_patch_original
        .as_deref()
        .filter(|s| is_url(s))
        .and_then(|s| REPO_FROM_URL_RE.captures(s))
        .map(|caps| format!("{}.git", &caps[1]));

    // ── 1) Health check ──

    let t_start = now_epoch();
    let client = AgentClient::from_env();
    let health = match client.check_health().await {
        Ok(health) => health,
        Err(err) => {
            msg::error(format!("Agent server health check failed: {err}"));
            return Ok(1);
        }
    };

    // ── 2) Resolve model ──

    let (configured_model, configured_name) = resolve_model(AGENT);
    let chosen = choose_server_model(
        &client,
        configured_model,
        configured_name.as_deref(),
        Some(dir_str.as_str()),
    )
    .await;
    if let Some(warning) = &chosen.warning {
        msg::warn(warning);
    }
    if let Some(model) = &chosen.model {
        msg::ok(format!(
            "Model: {}:{}",
            chosen.provider_label.as_deref().unwrap_or(&model.provider_id),
            chosen.model_label.as_deref().unwrap_or(&model.model_id)
        ));
    } else if let (Some(provider_label), Some(model_label)) =
        (&chosen.provider_label, &chosen.model_label)
    {
        msg::ok(format!("Model: {provider_label}:{model_label} (server default)"));
    } else {
        msg::ok("Model: server default");
    }

    // ── 3) Pre-setup ref for worst-case cleanup ──

    let lifecycle = GitLifecycle::new();
    let pre_setup_ref = lifecycle.git().current_ref(&directory).await;

    // ── 4) Setup + retry loop + outputs ──
    //
    // State that must survive into the restore step regardless of how the
    // main phase ends.
    let mut mutated = false;
    let mut original_ref: Option<String> = None;
    let mut baseline_commit: Option<String> = None;
    let mut final_patch = String::new();
    let mut final_session_id: Option<String> = None;

    let run_result: Result<()> = run_phases(RunPhaseInputs {
        lifecycle: &lifecycle,
        client: &client,
        directory: &directory,
        dir_str: &dir_str,
        prompt: &prompt,
        branch: args.branch.as_deref(),
        gt_patch_path: gt_patch_path.as_deref(),
        gt_patch_original: gt_patch_original.as_deref(),
        gt_patch_repo_url: gt_patch_repo_url.as_deref(),
        chosen_model: chosen.model.clone(),
        health: &health,
        project_name: &project_name,
        version_stem: &version_stem,
        t_start,
        mutated: &mut mutated,
        original_ref: &mut original_ref,
        baseline_commit: &mut baseline_commit,
        final_patch: &mut final_patch,
        final_session_id: &mut final_session_id,
    })
    .await;

    // ── 7) Restore repo to original state (guaranteed) ──

    let mut restore_failed = false;
    match (&original_ref, &baseline_commit) {
        (Some(oref), Some(baseline)) => {
            if let Err(err) = lifecycle.restore_repo(&directory, oref, baseline).await {
                restore_failed = true;
                msg::error(format!("Failed to restore repo: {err}"));
            }
        }
        _ if !mutated => {
            // Setup failed before touching the repo; nothing to undo.
            msg::ok("Setup failed before mutating repo; no cleanup needed");
        }
        _ => {
            msg::warn("Setup did not complete; attempting basic cleanup...");
            match lifecycle.best_effort_cleanup(&directory, &pre_setup_ref).await {
                Ok(()) => msg::ok("Basic cleanup done"),
                Err(err) => {
                    restore_failed = true;
                    msg::error(format!("Basic cleanup failed: {err}"));
                }
            }
        }
    }

    drop(gt_patch_tempfile);

    // ── 9) Clean up the final session ──

    if let (Some(session_id), false) = (&final_session_id, final_patch.is_empty()) {
        client.cleanup_session(session_id, &dir_str).await;
    }

    // ── 10) Exit code ──

    if restore_failed {
        msg::error("Exiting with error: repo restore failed");
        return Ok(2);
    }
    if let Err(err) = run_result {
        msg::error(format!("{err:#}"));
        return Ok(1);
    }
    if final_patch.is_empty() {
        return Ok(1);
    }
    Ok(0)
}

struct RunPhaseInputs<'a> {
    lifecycle: &'a GitLifecycle,
    client: &'a AgentClient,
    directory: &'a Path,
    dir_str: &'a str,
    prompt: &'a str,
    branch: Option<&'a str>,
    gt_patch_path: Option<&'a Path>,
    gt_patch_original: Option<&'a str>,
    gt_patch_repo_url: Option<&'a str>,
    chosen_model: Option<executors::model::ModelRef>,
    health: &'a Value,
    project_name: &'a str,
    version_stem: &'a str,
    t_start: f64,
    mutated: &'a mut bool,
    original_ref: &'a mut Option<String>,
    baseline_commit: &'a mut Option<String>,
    final_patch: &'a mut String,
    final_session_id: &'a mut Option<String>,
}

struct AttemptOutcome {
    record: Value,
    trajectory: Option<Value>,
    is_valid: bool,
}

async fn run_phases(inputs: RunPhaseInputs<'_>) -> Result<()> {
    let RunPhaseInputs {
        lifecycle,
        client,
        directory,
        dir_str,
        prompt,
        branch,
        gt_patch_path,
        gt_patch_original,
        gt_patch_repo_url,
        chosen_model,
        health,
        project_name,
        version_stem,
        t_start,
        mutated,
        original_ref,
        baseline_commit,
        final_patch,
        final_session_id,
    } = inputs;

    // ── Setup (always sanitized) ──

    let (oref, baseline) = lifecycle
        .setup_starting_point(directory, branch, gt_patch_path, gt_patch_repo_url, true, mutated)
        .await?;
    *original_ref = Some(oref.clone());
    *baseline_commit = Some(baseline.clone());

    // Trusted backup dir from the encoded token: the sidecar lookup during
    // retries then cannot be redirected by agent-tampered hint files.
    let trusted_backup_dir = decode_backup_dir(&oref);

    // ── Retry loop ──

    let mut attempts: Vec<AttemptOutcome> = Vec::new();
    let mut final_error: Option<String> = None;
    let mut aborted = false;

    for attempt in 1..=MAX_RETRIES {
        println!("\n{}", "=".repeat(40));
        println!("[attempt {attempt}/{MAX_RETRIES}]");
        println!("{}", "=".repeat(40));

        let mut patch = String::new();
        let mut error: Option<String> = None;
        let mut abort_retries = false;
        let mut t_session_created = now_epoch();
        let mut t_task_sent = t_session_created;
        let mut t_task_done = t_session_created;
        let mut session_id: Option<String> = None;

        let step: Result<String> = async {
            // Reset to the baseline before each retry.
            if attempt > 1 {
                msg::progress("Resetting repo to baseline...");
                lifecycle
                    .reset_to_baseline(directory, &baseline, trusted_backup_dir.as_deref())
                    .await?;
                msg::ok(format!(
                    "Repo reset to baseline ({}).",
                    &baseline[..baseline.len().min(10)]
                ));
            }

            let sid = client.create_session(dir_str).await?;
            t_session_created = now_epoch();
            session_id = Some(sid.clone());
            *final_session_id = Some(sid.clone());

            t_task_sent = now_epoch();
            let reply = client
                .send_task(&sid, prompt, dir_str, AGENT, chosen_model.as_ref())
                .await?;
            t_task_done = now_epoch();

            print_response(Some(&reply));

            if !has_repo_changes(lifecycle.git(), directory).await? {
                msg::warn("Agent responded but made no changes to the repo.");
                Ok(String::new())
            } else {
                Ok(get_patch(lifecycle.git(), directory).await?)
            }
        }
        .await;

        match step {
            Ok(p) => patch = p,
            Err(err) => {
                t_task_done = now_epoch();
                if matches!(
                    err.downcast_ref::<ClientError>(),
                    Some(ClientError::AgentDidNotRun(_))
                ) {
                    abort_retries = true;
                }
                error = Some(format!("{err:#}"));
                msg::error(format!("{err:#}"));
            }
        }

        let (is_valid, reason) = if abort_retries {
            (false, "agent did not run".to_string())
        } else if !patch.is_empty() {
            let check = validate_patch(&patch);
            (check.is_valid, check.reason)
        } else {
            (false, "empty patch".to_string())
        };

        let t_attempt_end = now_epoch();
        let attempt_began = if session_id.is_some() {
            t_session_created
        } else {
            t_task_sent
        };
        let record = json!({
            "attempt": attempt,
            "session_id": session_id.as_deref(),
            "patch_valid": is_valid,
            "patch_validation_reason": reason.as_str(),
            "patch_length": patch.len(),
            "error": error.as_deref(),
            "duration": round3(t_attempt_end - attempt_began),
        });

        // Collect this attempt's trajectory before any cleanup.
        let mut trajectory = None;
        if let Some(sid) = &session_id {
            let ctx = TrajectoryContext {
                session_id: sid,
                directory,
                prompt,
                agent: AGENT,
                patch: &patch,
                health,
                timing: TimingWindow {
                    t_start,
                    t_session_created,
                    t_task_sent,
                    t_task_done,
                    t_end: t_attempt_end,
                },
                error: error.as_deref(),
                gt_patch_path: gt_patch_original,
                branch,
                baseline_commit: Some(baseline.as_str()),
            };
            match collect_trajectory(client, &ctx).await {
                Ok(t) => trajectory = Some(t),
                Err(err) => msg::warn(format!(
                    "Could not collect trajectory for attempt {attempt}: {err}"
                )),
            }
        }

        attempts.push(AttemptOutcome {
            record,
            trajectory,
            is_valid,
        });

        if is_valid {
            msg::ok(format!("Patch is valid ({reason})."));
            *final_patch = patch;
            final_error = None;
            break;
        }

        msg::warn(format!("Patch invalid: {reason}."));
        final_error = Some(
            error.unwrap_or_else(|| format!("attempt {attempt}: patch invalid: {reason}")),
        );
        if let Some(sid) = &session_id {
            client.cleanup_session(sid, dir_str).await;
        }
        if abort_retries {
            msg::error("Non-retryable failure detected; aborting further attempts.");
            aborted = true;
            break;
        }
        if attempt < MAX_RETRIES {
            msg::progress(format!("Retrying ({attempt}/{MAX_RETRIES})..."));
        }
    }

    if final_patch.is_empty() && !aborted {
        msg::error(format!(
            "All {MAX_RETRIES} attempts failed to produce a valid patch."
        ));
    }

    let t_end = now_epoch();

    // ── 5) Write the patch file ──

    let cwd = std::env::current_dir()?;
    if !final_patch.is_empty() {
        let output_path = cwd
            .join("generated_patches/patch")
            .join(project_name)
            .join(format!("{version_stem}.patch"));
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&output_path, final_patch.as_str())?;
        msg::ok(format!("Patch written to {}", output_path.display()));
    }

    // ── 6) Save the trajectory ──
    //
    // Use the trajectory from the attempt that produced the final result:
    // the valid attempt on success, the LAST attempt on failure. Never mix
    // an earlier attempt's conversation with a later attempt's patch.

    let mut final_trajectory: Option<Value> = None;
    if !final_patch.is_empty() {
        for outcome in attempts.iter().rev() {
            if outcome.is_valid && outcome.trajectory.is_some() {
                final_trajectory = outcome.trajectory.clone();
                break;
            }
        }
    } else if let Some(outcome) = attempts.last() {
        final_trajectory = outcome.trajectory.clone();
    }

    let mut final_trajectory = final_trajectory.unwrap_or_else(|| {
        // Minimal record when no trajectory could be collected.
        json!({
            "metadata": {
                "session_id": final_session_id.as_deref(),
                "directory": dir_str,
                "directory_name": directory.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                "agent": AGENT,
                "server_url": client.base_url(),
                "timestamp_utc": epoch_iso(now_epoch()),
                "branch": branch,
                "ground_truth_patch": gt_patch_original,
                "baseline_commit": baseline,
            },
            "input": {"prompt": prompt, "prompt_length": prompt.len()},
        })
    });

    if let Some(metadata) = final_trajectory.get_mut("metadata") {
        metadata["sanitized"] = json!(true);
    }
    final_trajectory["output"] = json!({
        "patch": final_patch,
        "patch_length": final_patch.len(),
        "patch_lines": if final_patch.is_empty() { 0 } else { final_patch.lines().count() },
        "has_patch": !final_patch.is_empty(),
        "error": final_error,
    });
    final_trajectory["timing"] = json!({
        "total_duration": round3(t_end - t_start),
        "started_at": epoch_iso(t_start),
        "finished_at": epoch_iso(t_end),
    });
    // The per-attempt records embed no trajectory data, so the attempts
    // list never duplicates the conversation.
    let clean_attempts: Vec<&Value> = attempts.iter().map(|a| &a.record).collect();
    final_trajectory["retry"] = json!({
        "max_retries": MAX_RETRIES,
        "total_attempts": attempts.len(),
        "attempts": clean_attempts,
    });

    let trajectory_path = cwd
        .join("generated_patches/trajectory")
        .join(project_name)
        .join(format!("{version_stem}.json"));
    save_trajectory(&final_trajectory, &trajectory_path)?;

    Ok(())
}
