//! LLM-judge evaluation of candidate patches against a ground truth.
//!
//! The judge output is adversarial input: models emit JSON wrapped in
//! prose, fenced code blocks, secondary metadata objects, or with scores
//! outside their documented ranges. Extraction gathers every top-level JSON
//! object candidate, tests each against the evaluation schema, and clamps
//! the scores deterministically.

pub mod llm;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Value, json};
use thiserror::Error;

/// Weighted criteria: 9·A + 7·B + 4·C sums to 100 at full marks.
pub const CRITERION_KEYS: [&str; 3] = [
    "functional_correctness",
    "completeness_coverage",
    "equivalence_to_ground_truth",
];

const CRITERION_WEIGHTS: [f64; 3] = [9.0, 7.0, 4.0];

pub const EVAL_PROMPT_TEMPLATE: &str = r#"You are judging a patch produced by an automated coding agent against the pull request's known-good fix.

## Issue

{ISSUE_STATEMENT}

## Candidate patch (produced by the agent)

```diff
{GENERATED_PATCH}
```

## Ground truth patch (the PR's actual fix)

```diff
{GROUND_TRUTH_PATCH}
```

## Additional notes

{OPTIONAL_NOTES}

## Scoring

Rate the candidate patch on three criteria, each an integer from 0 to 5:

- functional_correctness: does the candidate actually fix the described issue without introducing regressions?
- completeness_coverage: does it cover every part of the issue the ground truth addresses, including tests and edge cases?
- equivalence_to_ground_truth: how close is the approach to the ground truth fix (same files, same behavior, comparable structure)?

Compute overall_score as round(9 * functional_correctness + 7 * completeness_coverage + 4 * equivalence_to_ground_truth), so a perfect patch scores 100.

Verdict: "PASS" when the candidate fully fixes the issue, "PARTIAL" when it fixes some of it, "FAIL" otherwise.

Respond with a single JSON object and nothing else:

{"verdict": "PASS" | "PARTIAL" | "FAIL", "overall_score": <0-100>, "scores": {"functional_correctness": <0-5>, "completeness_coverage": <0-5>, "equivalence_to_ground_truth": <0-5>}, "reasoning": "<short explanation>"}
"#;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{([A-Z_]+)\}").unwrap();
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("empty response from LLM")]
    EmptyResponse,
    #[error("LLM response contained no parseable JSON object")]
    NoJsonFound,
    #[error(transparent)]
    Api(#[from] llm::ApiError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Inputs for one evaluation call.
pub struct EvaluateParams<'a> {
    pub api_key: &'a str,
    pub issue_statement: &'a str,
    pub model_name: &'a str,
    pub base_url: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub agent_patch: &'a str,
    pub gt_patch: &'a str,
    pub optional_notes: Option<&'a str>,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Default)]
pub struct PatchEvaluator;

impl PatchEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Fill the template in a single pass.
    ///
    /// Each `{NAME}` token is replaced only when `NAME` is a known
    /// placeholder and the replacement text is never re-scanned, so a
    /// user-supplied issue statement containing the literal
    /// `{GENERATED_PATCH}` cannot trigger a second substitution. Duplicate
    /// placeholders are all filled from the same input.
    fn substitute(template: &str, fills: &[(&str, &str)]) -> String {
        PLACEHOLDER_RE
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                fills
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| (*value).to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn render_prompt(
        issue_statement: &str,
        generated_patch: &str,
        ground_truth_patch: &str,
        optional_notes: Option<&str>,
    ) -> String {
        Self::substitute(
            EVAL_PROMPT_TEMPLATE,
            &[
                ("ISSUE_STATEMENT", issue_statement),
                ("GENERATED_PATCH", generated_patch),
                ("GROUND_TRUTH_PATCH", ground_truth_patch),
                ("OPTIONAL_NOTES", optional_notes.unwrap_or("(none)")),
            ],
        )
    }

    /// Strict JSON parse: serde rejects `NaN`, `Infinity`, and literals
    /// that overflow to ±inf (e.g. `1e309`).
    pub fn strict_loads(text: &str) -> Option<Value> {
        serde_json::from_str(text).ok()
    }

    /// Gather every top-level JSON object candidate via a brace-matching
    /// scan that honors string literals and escaped quotes.
    ///
    /// A balanced span only consumes its full extent when it strict-parses;
    /// otherwise scanning resumes one byte later, so an unterminated string
    /// (or other malformed prefix) does not suppress later candidates.
    pub fn scan_json_candidates(text: &str) -> Vec<&str> {
        fn match_object(bytes: &[u8], start: usize) -> Option<usize> {
            let mut depth = 0i64;
            let mut in_string = false;
            let mut escaped = false;
            for (j, &b) in bytes.iter().enumerate().skip(start) {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                    }
                } else {
                    match b {
                        b'"' => in_string = true,
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                return Some(j);
                            }
                        }
                        _ => {}
                    }
                }
            }
            None
        }

        let bytes = text.as_bytes();
        let mut candidates = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'{' {
                if let Some(end) = match_object(bytes, i) {
                    let span = &text[i..=end];
                    if serde_json::from_str::<Value>(span).is_ok() {
                        candidates.push(span);
                        i = end + 1;
                        continue;
                    }
                }
            }
            i += 1;
        }
        candidates
    }

    /// Does this object look like an evaluation result? Requires a
    /// non-empty case-insensitive verdict in {pass, partial, fail}, a
    /// numeric overall_score (booleans are not numbers), and a `scores`
    /// object with at least one known criterion key.
    pub fn is_evaluation_result(value: &Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        let verdict_ok = obj
            .get("verdict")
            .and_then(Value::as_str)
            .map(|v| matches!(v.to_lowercase().as_str(), "pass" | "partial" | "fail"))
            .unwrap_or(false);
        let overall_ok = obj.get("overall_score").map(Value::is_number).unwrap_or(false);
        let scores_ok = obj
            .get("scores")
            .and_then(Value::as_object)
            .map(|scores| CRITERION_KEYS.iter().any(|k| scores.contains_key(*k)))
            .unwrap_or(false);
        verdict_ok && overall_ok && scores_ok
    }

    fn candidate_quality(value: &Value) -> i32 {
        let Some(obj) = value.as_object() else {
            return 0;
        };
        // (i) number of evaluation-critical keys present
        let mut score = ["verdict", "overall_score", "scores"]
            .iter()
            .filter(|k| obj.contains_key(**k))
            .count() as i32
            * 10;
        // (ii) quality of value types
        if obj.get("scores").map(Value::is_object).unwrap_or(false) {
            score += 1;
        }
        if let Some(overall) = obj.get("overall_score").and_then(Value::as_f64)
            && overall.is_finite()
        {
            score += 1;
        }
        score
    }

    /// Pull one canonical evaluation object out of potentially-messy model
    /// output. Prefers schema-passing candidates scored by key coverage and
    /// value quality (ties to the earlier candidate), falls back to the
    /// first parseable object, and errors when nothing parses.
    pub fn extract_evaluation_json(text: &str) -> Result<Value, EvalError> {
        let parsed: Vec<Value> = Self::scan_json_candidates(text)
            .into_iter()
            .filter_map(Self::strict_loads)
            .filter(Value::is_object)
            .collect();

        let mut best: Option<(i32, &Value)> = None;
        for candidate in &parsed {
            if !Self::is_evaluation_result(candidate) {
                continue;
            }
            let quality = Self::candidate_quality(candidate);
            // Strictly-greater keeps the earlier candidate on ties.
            if best.map(|(q, _)| quality > q).unwrap_or(true) {
                best = Some((quality, candidate));
            }
        }
        if let Some((_, value)) = best {
            return Ok(value.clone());
        }
        parsed.into_iter().next().ok_or(EvalError::NoJsonFound)
    }

    /// Clamp criteria to [0, 5], recompute the weighted overall, and
    /// canonicalize the verdict casing.
    ///
    /// Correction is skipped entirely when any criterion is missing or
    /// non-finite/non-numeric/boolean (partial payloads are surfaced
    /// untouched). A numeric overall_score is rewritten only when it is
    /// out of range or differs from the computed value; boolean or
    /// otherwise non-numeric stored values are left alone.
    pub fn validate_and_clamp_scores(value: &mut Value) {
        if let Some(verdict) = value.get("verdict").and_then(Value::as_str) {
            let lower = verdict.to_lowercase();
            if matches!(lower.as_str(), "pass" | "partial" | "fail") {
                value["verdict"] = json!(lower.to_uppercase());
            }
        }

        let Some(scores) = value.get("scores").and_then(Value::as_object).cloned() else {
            return;
        };

        let mut clamped = [0.0f64; 3];
        for (i, key) in CRITERION_KEYS.iter().enumerate() {
            let raw = match scores.get(*key) {
                // Booleans are Value::Bool, never numbers, so as_f64 keeps
                // them out despite typical truthiness.
                Some(v) if v.is_number() => v.as_f64(),
                _ => None,
            };
            let Some(raw) = raw.filter(|f| f.is_finite()) else {
                return;
            };
            clamped[i] = raw.clamp(0.0, 5.0);
        }

        for (i, key) in CRITERION_KEYS.iter().enumerate() {
            let as_int = clamped[i].fract() == 0.0;
            value["scores"][*key] = if as_int {
                json!(clamped[i] as i64)
            } else {
                json!(clamped[i])
            };
        }

        let computed = CRITERION_WEIGHTS
            .iter()
            .zip(clamped.iter())
            .map(|(w, s)| w * s)
            .sum::<f64>()
            .round()
            .clamp(0.0, 100.0) as i64;

        let stored = value.get("overall_score");
        let stored_num = match stored {
            Some(v) if v.is_number() => v.as_f64(),
            _ => None,
        };
        if let Some(stored_num) = stored_num
            && (!(0.0..=100.0).contains(&stored_num) || stored_num != computed as f64)
        {
            value["overall_score"] = json!(computed);
        }
    }

    /// Run one evaluation: validate inputs, render the prompt, call the
    /// judge, and normalize the result into a canonical JSON string.
    pub async fn evaluate(&self, params: EvaluateParams<'_>) -> Result<String, EvalError> {
        for (name, text) in [
            ("api_key", params.api_key),
            ("issue_statement", params.issue_statement),
            ("agent_patch", params.agent_patch),
            ("gt_patch", params.gt_patch),
        ] {
            if text.trim().is_empty() {
                return Err(EvalError::InvalidInput(format!(
                    "{name} must not be empty"
                )));
            }
        }

        let prompt = Self::render_prompt(
            params.issue_statement,
            params.agent_patch,
            params.gt_patch,
            params.optional_notes,
        );

        let client = llm::get_api_client(
            params.model_name,
            params.api_key,
            params.base_url,
            params.provider,
        )?;
        let response = client
            .call(
                &prompt,
                params.model_name,
                None,
                params.temperature,
                Some(params.max_tokens),
            )
            .await?;
        if response.trim().is_empty() {
            return Err(EvalError::EmptyResponse);
        }

        let mut value = Self::extract_evaluation_json(&response)?;
        Self::validate_and_clamp_scores(&mut value);
        Ok(serde_json::to_string_pretty(&value)?)
    }
}
