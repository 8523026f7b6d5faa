use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref REPO_LINK_RE: Regex =
        Regex::new(r"\n*\*\*Repo Link:\*\*\s*\n\[.*?\]\(.*?\)\s*\n*").unwrap();
    static ref HOSTED_URL_RE: Regex =
        Regex::new(r"(?i)https?://(?:github\.com|gitee\.com|gitlab\.com)/\S+").unwrap();
    static ref BLANK_RUN_RE: Regex = Regex::new(r"\n{3,}").unwrap();
}

/// Strip repo URLs from a prompt so agents cannot look up the PR online.
///
/// Removes the `**Repo Link:**` markdown block, redacts any remaining
/// git-hosting URL, and collapses runs of blank lines. Idempotent.
pub fn sanitize_prompt(prompt: &str) -> String {
    let sanitized = REPO_LINK_RE.replace_all(prompt, "\n\n");
    let sanitized = HOSTED_URL_RE.replace_all(&sanitized, "[REDACTED]");
    let sanitized = BLANK_RUN_RE.replace_all(&sanitized, "\n\n");
    sanitized.trim().to_string()
}

/// Format elapsed seconds as `15s` or `2m 30s`.
pub fn fmt_elapsed(seconds: f64) -> String {
    let s = seconds.max(0.0) as u64;
    if s < 60 {
        format!("{s}s")
    } else {
        format!("{}m {}s", s / 60, s % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_repo_link_block() {
        let prompt = "**Task:**\ndo things\n\n**Repo Link:**\n[https://github.com/a/b](https://github.com/a/b)\n\n**Problem:**\nfix it\n";
        let out = sanitize_prompt(prompt);
        assert!(!out.contains("Repo Link"));
        assert!(!out.contains("github.com"));
        assert!(out.contains("**Problem:**"));
    }

    #[test]
    fn redacts_hosted_urls_case_insensitively() {
        let out = sanitize_prompt("see HTTPS://GitHub.com/foo/bar and https://gitee.com/x/y#readme");
        assert_eq!(out, "see [REDACTED] and [REDACTED]");
    }

    #[test]
    fn leaves_other_urls_alone() {
        let out = sanitize_prompt("docs at https://docs.rs/serde");
        assert_eq!(out, "docs at https://docs.rs/serde");
    }

    #[test]
    fn collapses_blank_line_runs() {
        let out = sanitize_prompt("a\n\n\n\n\nb");
        assert_eq!(out, "a\n\nb");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let prompt = "**Repo Link:**\n[u](u)\n\n\n\nhttps://gitlab.com/a/b text";
        let once = sanitize_prompt(prompt);
        assert_eq!(sanitize_prompt(&once), once);
    }

    #[test]
    fn fmt_elapsed_formats() {
        assert_eq!(fmt_elapsed(15.4), "15s");
        assert_eq!(fmt_elapsed(150.0), "2m 30s");
    }
}
