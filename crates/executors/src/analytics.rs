//! Per-step derived metrics and heuristic phase detection.
//!
//! The phase split is approximate by construction and feeds offline
//! analysis only; nothing in the run lifecycle depends on it.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    pub index: usize,
    pub role: String,
    pub duration_s: Option<f64>,
    pub tool_time_ms: f64,
    /// Σ(tool durations) / step duration; may overcount parallel calls.
    pub tool_time_share: Option<f64>,
    pub tok_total: i64,
    pub tok_per_s: Option<f64>,
    /// cache_read / total tokens
    pub cache_ratio: f64,
    pub non_cache_tok: i64,
    pub out_in_ratio: Option<f64>,
    pub tool_calls: usize,
    pub finish: String,
    pub part_mix: String,
    /// Gap from the previous step's completion to this step's creation.
    pub idle_before_s: Option<f64>,
}

fn num(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|f| f.is_finite())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10000.0).round() / 10000.0
}

/// Compute derived per-message metrics, aligned 1:1 with the normalized
/// trajectory steps (serialized `TrajectoryStep` values).
pub fn compute_step_metrics(steps: &[Value]) -> Vec<StepMetrics> {
    let mut metrics = Vec::with_capacity(steps.len());

    for (i, step) in steps.iter().enumerate() {
        let info = step.get("info").cloned().unwrap_or(Value::Null);
        let tokens = info.get("tokens").cloned().unwrap_or(Value::Null);
        let tok_total = num(tokens.get("total")).unwrap_or(0.0) as i64;
        let tok_input = num(tokens.get("input")).unwrap_or(0.0) as i64;
        let tok_output = num(tokens.get("output")).unwrap_or(0.0) as i64;
        let cache_read = num(tokens.pointer("/cache/read")).unwrap_or(0.0) as i64;

        let t_created = num(info.pointer("/time/created"));
        let t_completed = num(info.pointer("/time/completed"));
        let duration_s = match (t_created, t_completed) {
            (Some(created), Some(completed)) => Some(round2((completed - created) / 1000.0)),
            _ => None,
        };

        let empty = Vec::new();
        let parts = step.get("parts").and_then(Value::as_array).unwrap_or(&empty);
        let mut tool_time_ms = 0.0;
        let mut tool_calls = 0usize;
        let mut part_types: Vec<&str> = Vec::new();
        for part in parts {
            let ptype = part.get("type").and_then(Value::as_str).unwrap_or("");
            if !ptype.is_empty() && !part_types.contains(&ptype) {
                part_types.push(ptype);
            }
            if ptype == "tool_call" {
                tool_calls += 1;
                if let (Some(ts), Some(te)) =
                    (num(part.get("started_at")), num(part.get("finished_at")))
                    && te >= ts
                {
                    tool_time_ms += te - ts;
                }
            }
        }
        part_types.sort_unstable();

        let tool_time_share = duration_s
            .filter(|d| *d > 0.0)
            .map(|d| round4(tool_time_ms / (d * 1000.0)));
        let tok_per_s = duration_s
            .filter(|d| *d > 0.0)
            .map(|d| ((tok_total as f64 / d) * 10.0).round() / 10.0);
        let cache_ratio = if tok_total > 0 {
            round4(cache_read as f64 / tok_total as f64)
        } else {
            0.0
        };
        let non_cache_tok = (tok_input - cache_read).max(0);
        let out_in_ratio = (tok_input > 0).then(|| round4(tok_output as f64 / tok_input as f64));

        let idle_before_s = if i > 0 {
            let prev_completed = num(steps[i - 1].pointer("/info/time/completed"));
            match (prev_completed, t_created) {
                (Some(prev), Some(this)) => Some(round2((this - prev) / 1000.0)),
                _ => None,
            }
        } else {
            None
        };

        metrics.push(StepMetrics {
            index: i,
            role: step
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string(),
            duration_s,
            tool_time_ms,
            tool_time_share,
            tok_total,
            tok_per_s,
            cache_ratio,
            non_cache_tok,
            out_in_ratio,
            tool_calls,
            finish: info
                .get("finish")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            part_mix: part_types.join(","),
            idle_before_s,
        });
    }

    metrics
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Phase {
    pub name: String,
    pub start_idx: usize,
    pub end_idx: usize,
    pub token_share: f64,
    pub runtime_share: f64,
}

fn full_run(len: usize) -> Vec<Phase> {
    vec![Phase {
        name: "Full Run".to_string(),
        start_idx: 0,
        end_idx: len.saturating_sub(1),
        token_share: 100.0,
        runtime_share: 100.0,
    }]
}

/// Heuristic three-phase split.
///
/// Boot: leading steps where cumulative runtime share exceeds 30% while
/// cumulative token share stays under 15%. Closeout: trailing steps that
/// finished with `stop`/`end_turn` (or made no tool calls) on above-mean
/// token counts. Steady: the middle. Degenerate inputs collapse to a single
/// "Full Run" phase.
pub fn detect_phases(metrics: &[StepMetrics]) -> Vec<Phase> {
    if metrics.len() < 3 {
        return full_run(metrics.len());
    }

    let total_tok: i64 = metrics.iter().map(|m| m.tok_total).sum();
    let total_rt: f64 = metrics.iter().map(|m| m.duration_s.unwrap_or(0.0)).sum();
    if total_tok == 0 || total_rt == 0.0 {
        return full_run(metrics.len());
    }

    let make_phase = |name: &str, start: usize, end: usize| -> Phase {
        let p_tok: i64 = metrics[start..=end].iter().map(|m| m.tok_total).sum();
        let p_rt: f64 = metrics[start..=end]
            .iter()
            .map(|m| m.duration_s.unwrap_or(0.0))
            .sum();
        Phase {
            name: name.to_string(),
            start_idx: start,
            end_idx: end,
            token_share: (p_tok as f64 / total_tok as f64 * 1000.0).round() / 10.0,
            runtime_share: (p_rt / total_rt * 1000.0).round() / 10.0,
        }
    };

    // Boot: cumulative token share < 15% while cumulative runtime > 30%.
    let mut cum_tok = 0i64;
    let mut cum_rt = 0.0f64;
    let mut boot_end: Option<usize> = None;
    for (i, m) in metrics.iter().enumerate() {
        cum_tok += m.tok_total;
        cum_rt += m.duration_s.unwrap_or(0.0);
        let tok_pct = cum_tok as f64 / total_tok as f64 * 100.0;
        let rt_pct = cum_rt / total_rt * 100.0;
        if tok_pct >= 15.0 || i >= metrics.len() - 2 {
            boot_end = if i > 0 && rt_pct > 30.0 { Some(i - 1) } else { None };
            break;
        }
        if rt_pct > 30.0 && tok_pct < 15.0 {
            boot_end = Some(i);
        }
    }

    // Closeout: trailing steps with finish=stop/end_turn or no tools, on
    // above-mean token counts.
    let avg_tok = total_tok as f64 / metrics.len() as f64;
    let mut closeout_start: Option<usize> = None;
    let lower = boot_end.unwrap_or(0) + 1;
    for i in (lower..metrics.len()).rev() {
        let m = &metrics[i];
        let is_close = (m.finish == "stop" || m.finish == "end_turn" || m.tool_calls == 0)
            && m.tok_total as f64 > avg_tok;
        if is_close {
            closeout_start = Some(i);
        } else {
            break;
        }
    }

    let mut phases = Vec::new();
    let mut steady_start = 0usize;
    if let Some(boot_end) = boot_end {
        phases.push(make_phase("Boot", 0, boot_end));
        steady_start = boot_end + 1;
    }

    let mut steady_end = metrics.len() - 1;
    match closeout_start {
        Some(c) if c > steady_start => steady_end = c - 1,
        _ => closeout_start = None,
    }

    if steady_start <= steady_end {
        phases.push(make_phase("Steady", steady_start, steady_end));
    }
    if let Some(c) = closeout_start {
        phases.push(make_phase("Closeout", c, metrics.len() - 1));
    }

    if phases.is_empty() {
        return full_run(metrics.len());
    }
    phases
}
