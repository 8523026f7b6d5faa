//! Stateless operations on git-style unified diffs: well-formedness
//! validation, changed-file extraction, and internal-file stripping.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Metadata file the harness writes inside the workspace during a sanitized
/// run. It must never leak into agent-generated patches.
pub const SANITIZE_SIDECAR: &str = ".agent_eval_sanitize_meta.json";

/// Internal files that are filtered out of extracted patches.
const INTERNAL_FILES: &[&str] = &[SANITIZE_SIDECAR];

lazy_static! {
    static ref HUNK_RE: Regex = Regex::new(r"^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@").unwrap();
    static ref PLUS_RE: Regex =
        Regex::new(r#"(?m)^\+\+\+ (?:"((?:[^"\\]|\\.)+)"|b/(.+))$"#).unwrap();
    static ref BINARY_RE: Regex =
        Regex::new(r"(?m)^(?:Binary files .* differ|GIT binary patch)$").unwrap();
    static ref DIFF_GIT_RE: Regex = Regex::new(r"(?m)^diff --git ").unwrap();
}

/// Outcome of validating a patch, with a human-readable reason either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchCheck {
    pub is_valid: bool,
    pub reason: String,
}

impl PatchCheck {
    fn valid(reason: String) -> Self {
        Self {
            is_valid: true,
            reason,
        }
    }

    fn invalid(reason: String) -> Self {
        Self {
            is_valid: false,
            reason,
        }
    }
}

/// Validate that a patch is a well-formed git-style unified diff.
///
/// Each `diff --git` block is checked independently: it must carry `---` and
/// `+++` file headers, at least one `@@ ... @@` hunk header, and at least one
/// content line inside a hunk. Rename-only, mode-change-only, and binary
/// blocks legitimately have no hunks and pass as-is.
pub fn validate_patch(patch: &str) -> PatchCheck {
    if patch.trim().is_empty() {
        return PatchCheck::invalid("empty patch".to_string());
    }

    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in patch.trim().lines() {
        if line.starts_with("diff --git ") {
            blocks.push(vec![line]);
        } else if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    if blocks.is_empty() {
        return PatchCheck::invalid("no 'diff --git' header found".to_string());
    }

    for (i, block) in blocks.iter().enumerate() {
        let idx = i + 1;
        let header = block[0];

        let is_rename = block.iter().any(|l| l.starts_with("rename from "))
            && block.iter().any(|l| l.starts_with("rename to "));
        let is_mode_change = block.iter().any(|l| l.starts_with("old mode "))
            && block.iter().any(|l| l.starts_with("new mode "));
        let is_binary = block.iter().any(|l| l.starts_with("Binary files "));

        let has_minus = block.iter().any(|l| l.starts_with("--- "));
        let has_plus = block.iter().any(|l| l.starts_with("+++ "));
        let has_hunks = block.iter().any(|l| HUNK_RE.is_match(l));

        // Metadata-only blocks (pure rename / mode change / binary) are valid
        // without hunks.
        if !has_hunks && (is_rename || is_mode_change || is_binary) {
            continue;
        }

        if !has_minus || !has_plus {
            return PatchCheck::invalid(format!(
                "block {idx} ({header}): missing '---' or '+++' file headers"
            ));
        }

        if !has_hunks {
            return PatchCheck::invalid(format!(
                "block {idx} ({header}): no '@@ ... @@' hunk headers"
            ));
        }

        let mut in_hunk = false;
        let mut content_lines = 0usize;
        for line in block {
            if HUNK_RE.is_match(line) {
                in_hunk = true;
                continue;
            }
            if in_hunk {
                if line.starts_with("diff --git ")
                    || line.starts_with("--- ")
                    || line.starts_with("+++ ")
                    || line.starts_with("index ")
                    || line.starts_with("new file")
                    || line.starts_with("deleted file")
                {
                    in_hunk = false;
                    continue;
                }
                if matches!(line.chars().next(), Some(' ' | '+' | '-' | '\\')) {
                    content_lines += 1;
                }
            }
        }

        if content_lines == 0 {
            return PatchCheck::invalid(format!(
                "block {idx} ({header}): hunk headers present but no diff content"
            ));
        }
    }

    PatchCheck::valid(format!("ok ({} file(s))", blocks.len()))
}

/// Remove surrounding double-quotes and unescape a git-quoted path.
///
/// Git quotes paths containing special characters as C-style strings; octal
/// escapes like `\303\251` encode raw UTF-8 bytes.
fn unquote_path(raw: &str) -> String {
    if !(raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2) {
        return raw.to_string();
    }
    let inner: Vec<u8> = raw[1..raw.len() - 1].bytes().collect();

    let mut out: Vec<u8> = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        if inner[i] == b'\\' && i + 1 < inner.len() {
            match inner[i + 1] {
                b'\\' => {
                    out.push(b'\\');
                    i += 2;
                }
                b'"' => {
                    out.push(b'"');
                    i += 2;
                }
                b'n' => {
                    out.push(b'\n');
                    i += 2;
                }
                b't' => {
                    out.push(b'\t');
                    i += 2;
                }
                c @ b'0'..=b'7' => {
                    let mut end = i + 2;
                    let mut value = (c - b'0') as u32;
                    while end < inner.len() && end < i + 4 && inner[end].is_ascii_digit() {
                        match inner[end] {
                            d @ b'0'..=b'7' => {
                                value = value * 8 + (d - b'0') as u32;
                                end += 1;
                            }
                            _ => break,
                        }
                    }
                    out.push(value as u8);
                    i = end;
                }
                _ => {
                    out.push(inner[i]);
                    i += 1;
                }
            }
        } else {
            out.push(inner[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Parse the b-path from a `diff --git` line where both paths are quoted.
fn parse_quoted_pair(rest: &str) -> Option<String> {
    if !rest.starts_with('"') {
        return None;
    }
    let bytes = rest.as_bytes();
    let mut i = 1;
    let mut closed = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => {
                closed = true;
                break;
            }
            _ => i += 1,
        }
    }
    if !closed {
        return None;
    }
    let remaining = &rest[i + 1..];
    if !remaining.starts_with(" \"") {
        return None;
    }
    let b_quoted = &remaining[1..];
    let path = unquote_path(b_quoted);
    Some(path.strip_prefix("b/").unwrap_or(&path).to_string())
}

/// Extract the b-side file path from a `diff --git a/... b/...` line.
///
/// Quoted paths are unescaped. For unquoted paths every ` b/` position is a
/// candidate split; a symmetric match (a-path sans `a/` equal to b-path sans
/// `b/`) wins outright, otherwise the last candidate stands in as the best
/// guess for renames and the caller can cross-check against `+++` lines.
pub fn parse_diff_git_line(line: &str) -> Option<String> {
    let rest = line.strip_prefix("diff --git ")?;

    if rest.starts_with('"') {
        return parse_quoted_pair(rest);
    }

    let mut candidates: Vec<&str> = Vec::new();
    let mut search_from = 0;
    while let Some(found) = rest[search_from..].find(" b/") {
        let idx = search_from + found;
        let a_part = &rest[..idx];
        let b_part = &rest[idx + 1..];
        if let (Some(a_path), Some(b_path)) = (a_part.strip_prefix("a/"), b_part.strip_prefix("b/"))
        {
            if a_path == b_path {
                return Some(b_path.to_string());
            }
            candidates.push(b_path);
        }
        search_from = idx + 1;
    }

    candidates.last().map(|s| s.to_string())
}

fn extract_plus_path(caps: &regex::Captures<'_>) -> Option<String> {
    if let Some(quoted) = caps.get(1) {
        let path = unquote_path(&format!("\"{}\"", quoted.as_str()));
        return Some(path.strip_prefix("b/").unwrap_or(&path).to_string());
    }
    caps.get(2).map(|m| m.as_str().to_string())
}

/// Extract unique changed-file paths from a unified diff.
///
/// Primary source is the `diff --git` header of each section; the `+++` line
/// within the same section resolves ambiguous renames. Binary sections are
/// excluded. Falls back to `+++` paths when no `diff --git` lines exist.
/// Filters `/dev/null` and deduplicates while preserving order.
pub fn extract_files_from_patch(patch_text: &str) -> Vec<String> {
    let section_starts: Vec<usize> = DIFF_GIT_RE.find_iter(patch_text).map(|m| m.start()).collect();

    let mut matches: Vec<String> = Vec::new();
    for (i, &start) in section_starts.iter().enumerate() {
        let section_end = section_starts
            .get(i + 1)
            .copied()
            .unwrap_or(patch_text.len());
        let section = &patch_text[start..section_end];

        if BINARY_RE.is_match(section) {
            continue;
        }

        let full_line = section.lines().next().unwrap_or(section);
        let Some(mut path) = parse_diff_git_line(full_line) else {
            continue;
        };

        // The +++ line inside this section is unambiguous; prefer it when it
        // disagrees (renames with tricky filenames).
        if let Some(caps) = PLUS_RE.captures(section)
            && let Some(alt) = extract_plus_path(&caps)
        {
            let alt = alt.trim();
            if !alt.is_empty() && alt != "/dev/null" && alt != path {
                path = alt.to_string();
            }
        }

        matches.push(path);
    }

    if matches.is_empty() {
        matches = PLUS_RE
            .captures_iter(patch_text)
            .filter_map(|caps| extract_plus_path(&caps))
            .collect();
    }

    let mut files = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for path in matches {
        let path = path.trim().to_string();
        if !path.is_empty() && path != "/dev/null" && seen.insert(path.clone()) {
            files.push(path);
        }
    }
    files
}

/// Check whether a `diff --git` header touches an internal file.
///
/// Matches `a/<name> b/` (a-side) and a line ending with `b/<name>` (b-side)
/// so that sibling names like `.file.json-notes` never collide.
fn is_internal_diff(header: &str) -> bool {
    INTERNAL_FILES.iter().any(|name| {
        header.contains(&format!("a/{name} b/")) || header.trim_end().ends_with(&format!("b/{name}"))
    })
}

/// Remove diff blocks that touch harness-internal files.
pub fn strip_internal_files(patch: &str) -> String {
    if patch.is_empty() {
        return String::new();
    }
    let mut result = String::with_capacity(patch.len());
    let mut skip = false;
    for line in patch.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            skip = is_internal_diff(line);
        }
        if !skip {
            result.push_str(line);
        }
    }
    if result.trim().is_empty() {
        String::new()
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_FILE_PATCH: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,2 @@
-old line
+new line
 context
";

    #[test]
    fn validate_rejects_empty_patch() {
        let check = validate_patch("");
        assert!(!check.is_valid);
        assert_eq!(check.reason, "empty patch");

        let check = validate_patch("   \n  ");
        assert!(!check.is_valid);
        assert_eq!(check.reason, "empty patch");
    }

    #[test]
    fn validate_rejects_missing_header() {
        let check = validate_patch("just some text\nwith lines\n");
        assert!(!check.is_valid);
        assert_eq!(check.reason, "no 'diff --git' header found");
    }

    #[test]
    fn validate_accepts_single_file_patch() {
        let check = validate_patch(ONE_FILE_PATCH);
        assert!(check.is_valid, "{}", check.reason);
        assert_eq!(check.reason, "ok (1 file(s))");
    }

    #[test]
    fn validate_accepts_binary_only_block() {
        let patch = "\
diff --git a/logo.png b/logo.png
index 1111111..2222222 100644
Binary files a/logo.png and b/logo.png differ
";
        let check = validate_patch(patch);
        assert!(check.is_valid, "{}", check.reason);
    }

    #[test]
    fn validate_accepts_pure_rename_block() {
        let patch = "\
diff --git a/old.rs b/new.rs
similarity index 100%
rename from old.rs
rename to new.rs
";
        let check = validate_patch(patch);
        assert!(check.is_valid, "{}", check.reason);
    }

    #[test]
    fn validate_accepts_mode_change_block() {
        let patch = "\
diff --git a/run.sh b/run.sh
old mode 100644
new mode 100755
";
        let check = validate_patch(patch);
        assert!(check.is_valid, "{}", check.reason);
    }

    #[test]
    fn validate_rejects_block_without_file_headers() {
        let patch = "\
diff --git a/a.txt b/a.txt
@@ -1,1 +1,1 @@
-x
+y
";
        let check = validate_patch(patch);
        assert!(!check.is_valid);
        assert!(check.reason.contains("missing '---' or '+++'"), "{}", check.reason);
    }

    #[test]
    fn validate_rejects_block_without_hunks() {
        let patch = "\
diff --git a/a.txt b/a.txt
--- a/a.txt
+++ b/a.txt
";
        let check = validate_patch(patch);
        assert!(!check.is_valid);
        assert!(check.reason.contains("no '@@ ... @@' hunk headers"), "{}", check.reason);
    }

    #[test]
    fn validate_rejects_hunks_without_content() {
        let patch = "\
diff --git a/a.txt b/a.txt
--- a/a.txt
+++ b/a.txt
@@ -1,1 +1,1 @@
";
        let check = validate_patch(patch);
        assert!(!check.is_valid);
        assert!(check.reason.contains("no diff content"), "{}", check.reason);
    }

    #[test]
    fn validate_reports_failing_block_index() {
        let bad_second = format!(
            "{ONE_FILE_PATCH}diff --git a/b.txt b/b.txt\n--- a/b.txt\n+++ b/b.txt\n"
        );
        let check = validate_patch(&bad_second);
        assert!(!check.is_valid);
        assert!(check.reason.starts_with("block 2"), "{}", check.reason);
    }

    #[test]
    fn parse_diff_git_line_prefers_symmetric_split() {
        let path = parse_diff_git_line("diff --git a/src/a b/c.txt b/src/a b/c.txt");
        assert_eq!(path.as_deref(), Some("src/a b/c.txt"));
    }

    #[test]
    fn parse_diff_git_line_plain() {
        let path = parse_diff_git_line("diff --git a/src/main.rs b/src/main.rs");
        assert_eq!(path.as_deref(), Some("src/main.rs"));
    }

    #[test]
    fn parse_diff_git_line_quoted_octal() {
        let path = parse_diff_git_line(r#"diff --git "a/caf\303\251.txt" "b/caf\303\251.txt""#);
        assert_eq!(path.as_deref(), Some("café.txt"));
    }

    #[test]
    fn parse_diff_git_line_rename_falls_back_to_last_candidate() {
        let path = parse_diff_git_line("diff --git a/old.txt b/new.txt");
        assert_eq!(path.as_deref(), Some("new.txt"));
    }

    #[test]
    fn extract_files_skips_binary_sections() {
        let patch = format!(
            "diff --git a/logo.png b/logo.png\nindex 1111111..2222222 100644\n\
Binary files a/logo.png and b/logo.png differ\n{ONE_FILE_PATCH}"
        );
        assert_eq!(extract_files_from_patch(&patch), vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn extract_files_dedups_and_filters_dev_null() {
        let patch = "\
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
--- a/gone.txt
+++ /dev/null
@@ -1,1 +0,0 @@
-bye
";
        assert_eq!(extract_files_from_patch(patch), vec!["gone.txt".to_string()]);
    }

    #[test]
    fn extract_files_falls_back_to_plus_lines() {
        let patch = "--- a/x.txt\n+++ b/x.txt\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(extract_files_from_patch(patch), vec!["x.txt".to_string()]);
    }

    #[test]
    fn strip_internal_removes_sidecar_block_only() {
        let patch = format!(
            "diff --git a/{SANITIZE_SIDECAR} b/{SANITIZE_SIDECAR}\n\
--- a/{SANITIZE_SIDECAR}\n+++ b/{SANITIZE_SIDECAR}\n@@ -1 +1 @@\n-a\n+b\n{ONE_FILE_PATCH}"
        );
        let out = strip_internal_files(&patch);
        assert!(!out.contains(SANITIZE_SIDECAR));
        assert!(out.contains("src/lib.rs"));
    }

    #[test]
    fn strip_internal_is_anchored_not_substring() {
        let cousin = format!("{SANITIZE_SIDECAR}-notes");
        let patch = format!(
            "diff --git a/{cousin} b/{cousin}\n--- a/{cousin}\n+++ b/{cousin}\n@@ -1 +1 @@\n-a\n+b\n"
        );
        let out = strip_internal_files(&patch);
        assert!(out.contains(&cousin));
    }

    #[test]
    fn strip_internal_returns_empty_when_nothing_left() {
        let patch = format!(
            "diff --git a/{SANITIZE_SIDECAR} b/{SANITIZE_SIDECAR}\n\
--- a/{SANITIZE_SIDECAR}\n+++ b/{SANITIZE_SIDECAR}\n@@ -1 +1 @@\n-a\n+b\n"
        );
        assert_eq!(strip_internal_files(&patch), "");
    }
}
