//! Trajectory collection: normalizes a session's conversation into a
//! structured record with aggregated token/cost/tool stats.
//!
//! Agent-server payloads are loosely shaped, so parts normalize into tagged
//! variants here, at one boundary; anything unrecognized is preserved under
//! `Unknown` so the trajectory file never loses data.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use utils::msg;

use crate::{
    analytics,
    client::{AgentClient, ClientError},
};

/// One normalized message part.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrajectoryPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_name: String,
        tool_id: String,
        /// pending / running / completed / error
        state: String,
        input: Value,
        output: Value,
        error: Option<Value>,
        started_at: Option<Value>,
        finished_at: Option<Value>,
    },
    StepStart {
        name: String,
    },
    StepFinish {
        name: String,
    },
    Snapshot {
        data: Value,
    },
    Unknown {
        raw_type: Option<String>,
        raw: Value,
    },
}

/// One normalized message.
#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryStep {
    pub message_id: String,
    pub role: String,
    pub created_at: Option<Value>,
    pub model: Option<Value>,
    /// Token usage, cost, timing, preserved raw.
    pub info: Value,
    pub metadata: Value,
    pub parts: Vec<TrajectoryPart>,
}

fn str_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn value_field(obj: &Value, keys: &[&str], default: Value) -> Value {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .cloned()
        .unwrap_or(default)
}

/// Normalize a single message part. Non-object parts become `Unknown`.
pub fn parse_part(part: &Value) -> TrajectoryPart {
    if !part.is_object() {
        return TrajectoryPart::Unknown {
            raw_type: None,
            raw: part.clone(),
        };
    }
    let ptype = part.get("type").and_then(Value::as_str).unwrap_or("unknown");

    match ptype {
        "text" => TrajectoryPart::Text {
            text: str_field(part, &["text"]).unwrap_or_default(),
        },
        "reasoning" => TrajectoryPart::Reasoning {
            text: str_field(part, &["text", "reasoning"]).unwrap_or_default(),
        },
        "tool" => TrajectoryPart::ToolCall {
            tool_name: str_field(part, &["name", "toolName"]).unwrap_or_else(|| "?".to_string()),
            tool_id: str_field(part, &["id", "toolCallId"]).unwrap_or_default(),
            state: str_field(part, &["state"]).unwrap_or_else(|| "?".to_string()),
            input: value_field(part, &["input", "args"], json!({})),
            output: value_field(part, &["output", "result"], json!("")),
            error: part.get("error").filter(|v| !v.is_null()).cloned(),
            started_at: part.get("startedAt").filter(|v| !v.is_null()).cloned(),
            finished_at: part.get("finishedAt").filter(|v| !v.is_null()).cloned(),
        },
        "step-start" => TrajectoryPart::StepStart {
            name: str_field(part, &["name"]).unwrap_or_default(),
        },
        "step-finish" => TrajectoryPart::StepFinish {
            name: str_field(part, &["name"]).unwrap_or_default(),
        },
        "snapshot" => TrajectoryPart::Snapshot {
            data: value_field(part, &["data", "snapshot"], json!({})),
        },
        other => TrajectoryPart::Unknown {
            raw_type: Some(other.to_string()),
            raw: part.clone(),
        },
    }
}

/// Normalize a single message. Non-objects produce an empty step; a missing
/// or non-list `parts` becomes `[]` (never iterate a string per character).
pub fn parse_message(message: &Value) -> TrajectoryStep {
    let Some(obj) = message.as_object() else {
        return TrajectoryStep {
            message_id: String::new(),
            role: "?".to_string(),
            created_at: None,
            model: None,
            info: json!({}),
            metadata: json!({}),
            parts: Vec::new(),
        };
    };
    let info = match obj.get("info") {
        Some(info @ Value::Object(_)) => info.clone(),
        _ => json!({}),
    };
    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| info.get("role").and_then(Value::as_str))
        .unwrap_or("?")
        .to_string();
    let parts = match obj.get("parts") {
        Some(Value::Array(parts)) => parts.iter().map(parse_part).collect(),
        _ => Vec::new(),
    };
    TrajectoryStep {
        message_id: str_field(message, &["id"]).unwrap_or_default(),
        role,
        created_at: message
            .get("createdAt")
            .or_else(|| message.get("created_at"))
            .filter(|v| !v.is_null())
            .cloned(),
        model: obj.get("model").filter(|v| !v.is_null()).cloned(),
        info,
        metadata: obj.get("metadata").cloned().unwrap_or_else(|| json!({})),
        parts,
    }
}

fn info_num(info: &Value, keys: &[&str]) -> i64 {
    for key in keys {
        if let Some(v) = info.get(*key) {
            if let Some(i) = v.as_i64() {
                return i;
            }
            if let Some(f) = v.as_f64() {
                return f as i64;
            }
        }
    }
    0
}

/// Aggregated token counts; both snake_case and camelCase field spellings
/// are accepted on input.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsage {
    pub total_tokens: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

pub fn aggregate_tokens(steps: &[TrajectoryStep]) -> TokenUsage {
    let mut usage = TokenUsage::default();
    for step in steps {
        usage.total_tokens += info_num(&step.info, &["totalTokens", "total_tokens"]);
        usage.prompt_tokens += info_num(&step.info, &["promptTokens", "prompt_tokens"]);
        usage.completion_tokens += info_num(&step.info, &["completionTokens", "completion_tokens"]);
    }
    usage
}

/// Timing window of one attempt, as UNIX epoch seconds.
#[derive(Debug, Clone, Copy)]
pub struct TimingWindow {
    pub t_start: f64,
    pub t_session_created: f64,
    pub t_task_sent: f64,
    pub t_task_done: f64,
    pub t_end: f64,
}

pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub fn epoch_iso(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, ((ts.fract().abs()) * 1e9) as u32)
        .unwrap_or_default()
        .to_rfc3339()
}

/// Inputs for building one attempt's trajectory record.
pub struct TrajectoryContext<'a> {
    pub session_id: &'a str,
    pub directory: &'a Path,
    pub prompt: &'a str,
    pub agent: &'a str,
    pub patch: &'a str,
    pub health: &'a Value,
    pub timing: TimingWindow,
    pub error: Option<&'a str>,
    pub gt_patch_path: Option<&'a str>,
    pub branch: Option<&'a str>,
    pub baseline_commit: Option<&'a str>,
}

/// Build a comprehensive trajectory record: session info, every message,
/// file status, diff data, aggregated stats, and derived analytics.
pub async fn collect_trajectory(
    client: &AgentClient,
    ctx: &TrajectoryContext<'_>,
) -> Result<Value, ClientError> {
    let dir_str = ctx.directory.to_string_lossy().into_owned();

    let session_raw = client.get_session(ctx.session_id, Some(dir_str.as_str())).await;
    let raw_messages = client
        .get_messages(ctx.session_id, Some(dir_str.as_str()))
        .await?;
    let file_status = client.get_file_status(Some(dir_str.as_str())).await;
    let diff_raw = client
        .get_session_diff(ctx.session_id, Some(dir_str.as_str()))
        .await;

    let steps: Vec<TrajectoryStep> = raw_messages.iter().map(parse_message).collect();

    let mut tool_calls: Vec<&TrajectoryPart> = Vec::new();
    let mut reasoning_steps = 0usize;
    for step in &steps {
        for part in &step.parts {
            match part {
                TrajectoryPart::ToolCall { .. } => tool_calls.push(part),
                TrajectoryPart::Reasoning { .. } => reasoning_steps += 1,
                _ => {}
            }
        }
    }

    let mut tool_summary: serde_json::Map<String, Value> = serde_json::Map::new();
    let mut failed_tool_calls = 0usize;
    for part in &tool_calls {
        if let TrajectoryPart::ToolCall { tool_name, state, .. } = part {
            let count = tool_summary
                .get(tool_name)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            tool_summary.insert(tool_name.clone(), json!(count + 1));
            if state == "error" {
                failed_tool_calls += 1;
            }
        }
    }

    let usage = aggregate_tokens(&steps);

    let steps_value = serde_json::to_value(&steps).unwrap_or_else(|_| json!([]));
    let metrics = analytics::compute_step_metrics(steps_value.as_array().map(Vec::as_slice).unwrap_or(&[]));
    let phases = analytics::detect_phases(&metrics);

    let session_model = session_raw
        .as_ref()
        .and_then(Value::as_object)
        .and_then(|s| s.get("model"))
        .cloned()
        .unwrap_or(Value::Null);

    let timing = ctx.timing;
    Ok(json!({
        "metadata": {
            "session_id": ctx.session_id,
            "directory": dir_str,
            "directory_name": ctx.directory.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "agent": ctx.agent,
            "server_url": client.base_url(),
            "server_version": ctx.health.get("version").and_then(Value::as_str).unwrap_or("?"),
            "model": session_model,
            "hostname": std::env::var("HOSTNAME").unwrap_or_else(|_| "?".to_string()),
            "platform": os_info::get().to_string(),
            "harness_version": env!("CARGO_PKG_VERSION"),
            "timestamp_utc": epoch_iso(now_epoch()),
            "branch": ctx.branch,
            "ground_truth_patch": ctx.gt_patch_path,
            "baseline_commit": ctx.baseline_commit,
        },
        "input": {
            "prompt": ctx.prompt,
            "prompt_length": ctx.prompt.len(),
        },
        "output": {
            "patch": ctx.patch,
            "patch_length": ctx.patch.len(),
            "patch_lines": if ctx.patch.is_empty() { 0 } else { ctx.patch.lines().count() },
            "has_patch": !ctx.patch.is_empty(),
            "error": ctx.error,
        },
        "timing": {
            "total_duration": round3(timing.t_end - timing.t_start),
            "session_creation": round3(timing.t_session_created - timing.t_start),
            "task_execution": round3(timing.t_task_done - timing.t_task_sent),
            "diff_retrieval": round3(timing.t_end - timing.t_task_done),
            "started_at": epoch_iso(timing.t_start),
            "finished_at": epoch_iso(timing.t_end),
        },
        "token_usage": usage,
        "stats": {
            "total_messages": steps.len(),
            "user_messages": steps.iter().filter(|s| s.role == "user").count(),
            "assistant_messages": steps.iter().filter(|s| s.role == "assistant").count(),
            "total_tool_calls": tool_calls.len(),
            "tool_call_breakdown": Value::Object(tool_summary),
            "failed_tool_calls": failed_tool_calls,
            "reasoning_steps": reasoning_steps,
        },
        "trajectory": steps_value,
        "analytics": {
            "steps": metrics,
            "phases": phases,
        },
        "session_raw": session_raw,
        "file_status": file_status,
        "diff_raw": diff_raw,
    }))
}

/// Write the trajectory as pretty JSON, creating parent directories.
pub fn save_trajectory(trajectory: &Value, out_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(trajectory)?;
    std::fs::write(out_path, &payload)?;
    let size_kb = payload.len() as f64 / 1024.0;
    let n_msgs = trajectory
        .pointer("/stats/total_messages")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "?".to_string());
    let n_tools = trajectory
        .pointer("/stats/total_tool_calls")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "?".to_string());
    msg::ok(format!(
        "Trajectory saved to {} ({size_kb:.1} KB, {n_msgs} messages, {n_tools} tool calls)",
        out_path.display()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_dict_part_becomes_unknown() {
        let part = parse_part(&json!(42));
        match part {
            TrajectoryPart::Unknown { raw_type, raw } => {
                assert_eq!(raw_type, None);
                assert_eq!(raw, json!(42));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn tool_part_supports_both_field_spellings() {
        let part = parse_part(&json!({
            "type": "tool",
            "toolName": "bash",
            "toolCallId": "call_1",
            "state": "completed",
            "args": {"command": "ls"},
            "result": "ok",
        }));
        match part {
            TrajectoryPart::ToolCall {
                tool_name,
                tool_id,
                state,
                input,
                output,
                ..
            } => {
                assert_eq!(tool_name, "bash");
                assert_eq!(tool_id, "call_1");
                assert_eq!(state, "completed");
                assert_eq!(input, json!({"command": "ls"}));
                assert_eq!(output, json!("ok"));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn unknown_part_type_preserves_raw() {
        let raw = json!({"type": "patch", "hash": "abc"});
        match parse_part(&raw) {
            TrajectoryPart::Unknown { raw_type, raw: kept } => {
                assert_eq!(raw_type.as_deref(), Some("patch"));
                assert_eq!(kept, raw);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn message_role_falls_back_to_info_then_question_mark() {
        let step = parse_message(&json!({"info": {"role": "assistant"}, "parts": []}));
        assert_eq!(step.role, "assistant");
        let step = parse_message(&json!({"parts": []}));
        assert_eq!(step.role, "?");
        let step = parse_message(&json!("not a message"));
        assert_eq!(step.role, "?");
        assert!(step.parts.is_empty());
    }

    #[test]
    fn string_parts_never_iterate_per_character() {
        let step = parse_message(&json!({"role": "assistant", "parts": "hello world"}));
        assert!(step.parts.is_empty());
    }

    #[test]
    fn token_aggregation_accepts_both_spellings() {
        let steps = vec![
            parse_message(&json!({"role": "assistant", "info": {"role": "assistant", "totalTokens": 100, "promptTokens": 60, "completionTokens": 40}, "parts": []})),
            parse_message(&json!({"role": "assistant", "info": {"role": "assistant", "total_tokens": 50, "prompt_tokens": 30, "completion_tokens": 20}, "parts": []})),
        ];
        let usage = aggregate_tokens(&steps);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(usage.prompt_tokens, 90);
        assert_eq!(usage.completion_tokens, 60);
    }
}
