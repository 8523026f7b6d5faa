//! Evaluate mode: compare agent patches against ground truth using an LLM
//! judge.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use evaluator::{EvaluateParams, PatchEvaluator};
use serde_json::Value;
use utils::msg;

use crate::fetch::{fetch_patch_from_url, is_url};

#[derive(Args)]
pub struct EvaluateArgs {
    /// Candidate patch produced by the agent: local path or URL
    #[arg(long = "agent-patch")]
    pub agent_patch: String,

    /// Ground truth patch: local path or URL
    #[arg(long = "gt-patch")]
    pub gt_patch: String,

    /// Issue text, or a path to a .md/.txt file containing it
    #[arg(long = "issue-statement")]
    pub issue_statement: String,

    /// Judge model (defaults to EVAL_MODEL, then gpt-5.2)
    #[arg(long = "eval-model")]
    pub eval_model: Option<String>,

    /// Write the evaluation JSON here instead of stdout
    #[arg(long = "eval-output")]
    pub eval_output: Option<PathBuf>,
}

/// Read a local file or fetch content from a URL. Errors are printed and
/// mapped to exit code 1 by the caller.
async fn read_file_or_url(spec: &str) -> Result<String, ()> {
    if is_url(spec) {
        msg::progress(format!("Downloading {spec}..."));
        match fetch_patch_from_url(spec).await {
            Ok(content) => {
                msg::ok(format!("Downloaded ({} bytes)", content.len()));
                Ok(content)
            }
            Err(err) => {
                eprintln!("[error] Failed to download: {err}");
                Err(())
            }
        }
    } else {
        let path = Path::new(spec);
        if !path.is_file() {
            eprintln!("[error] File not found: {spec}");
            return Err(());
        }
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(err) => {
                eprintln!("[error] Could not read {spec} as UTF-8: {err}");
                Err(())
            }
        }
    }
}

/// If the value looks like a path to a .md/.txt file, read it; otherwise
/// treat it as literal issue text.
///
/// Heuristic: a `.md`/`.txt` suffix means a file when it exists; a missing
/// file that still looks path-like (contains a separator, or is a single
/// token without whitespace) is an error; spaced text that merely happens
/// to end with `.md`/`.txt` is accepted as literal text with a warning.
fn resolve_text_or_file(value: &str) -> Result<String, ()> {
    let path = Path::new(value);
    let suffix = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    if matches!(suffix.as_deref(), Some("md") | Some("txt")) {
        if path.is_file() {
            return match std::fs::read_to_string(path) {
                Ok(content) => Ok(content),
                Err(err) => {
                    eprintln!("[error] Could not read {value} as UTF-8: {err}");
                    Err(())
                }
            };
        }
        let has_sep = value.contains('/');
        let has_whitespace = value.chars().any(char::is_whitespace);
        if has_sep || !has_whitespace {
            eprintln!("[error] Issue file not found: {value}");
            return Err(());
        }
        eprintln!(
            "[warn] Treating --issue-statement as literal text (ends with a file suffix, \
but contains spaces and no path separator): {value:?}"
        );
    }
    Ok(value.to_string())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

pub async fn handler(args: EvaluateArgs) -> Result<i32> {
    // ── Read inputs ──

    let Ok(agent_patch) = read_file_or_url(&args.agent_patch).await else {
        return Ok(1);
    };
    let Ok(gt_patch) = read_file_or_url(&args.gt_patch).await else {
        return Ok(1);
    };
    let Ok(issue_statement) = resolve_text_or_file(&args.issue_statement) else {
        return Ok(1);
    };

    // ── Credentials and judge configuration ──

    let api_key = env_nonempty("EVAL_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        eprintln!("[error] EVAL_API_KEY environment variable is required");
        return Ok(1);
    }
    let base_url = env_nonempty("EVAL_BASE_URL");
    let provider = env_nonempty("EVAL_PROVIDER");
    let model = args
        .eval_model
        .or_else(|| env_nonempty("EVAL_MODEL"))
        .unwrap_or_else(|| "gpt-5.2".to_string());

    let temperature_raw = env_nonempty("EVAL_TEMPERATURE").unwrap_or_else(|| "0.3".to_string());
    let temperature: f64 = match temperature_raw.parse() {
        Ok(t) => t,
        Err(_) => {
            eprintln!("[error] EVAL_TEMPERATURE must be a valid number");
            return Ok(1);
        }
    };
    if !temperature.is_finite() || temperature < 0.0 {
        eprintln!("[error] EVAL_TEMPERATURE must be a finite number >= 0");
        return Ok(1);
    }

    let max_tokens_raw = env_nonempty("EVAL_MAX_TOKENS").unwrap_or_else(|| "20480".to_string());
    let max_tokens: u32 = match max_tokens_raw.parse() {
        Ok(t) => t,
        Err(_) => {
            eprintln!("[error] EVAL_MAX_TOKENS must be a valid integer");
            return Ok(1);
        }
    };
    if max_tokens < 1 {
        eprintln!("[error] EVAL_MAX_TOKENS must be a positive integer");
        return Ok(1);
    }

    // ── Evaluate ──

    let evaluator = PatchEvaluator::new();
    let result_json = match evaluator
        .evaluate(EvaluateParams {
            api_key: &api_key,
            issue_statement: &issue_statement,
            model_name: &model,
            base_url: base_url.as_deref(),
            provider: provider.as_deref(),
            agent_patch: &agent_patch,
            gt_patch: &gt_patch,
            optional_notes: None,
            temperature,
            max_tokens,
        })
        .await
    {
        Ok(result) => result,
        Err(err) => {
            eprintln!("[error] Evaluation failed: {err}");
            return Ok(1);
        }
    };

    // ── Summary ──

    match serde_json::from_str::<Value>(&result_json) {
        Ok(parsed) if PatchEvaluator::is_evaluation_result(&parsed) => {
            let verdict = parsed
                .get("verdict")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            let score = parsed
                .get("overall_score")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());
            msg::ok(format!("Verdict: {verdict} | Overall score: {score}"));
        }
        _ => eprintln!("[warn] LLM response is not a valid evaluation result"),
    }

    // ── Output ──

    if let Some(output_path) = &args.eval_output {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output_path, &result_json)?;
        msg::ok(format!(
            "Evaluation result written to {}",
            output_path.display()
        ));
    } else {
        println!("{result_json}");
    }
    Ok(0)
}
