//! Sanitization sidecar: the small JSON metadata file describing where the
//! `.git` backup lives and which ignored files existed before the agent ran.
//!
//! Every value read back from a sidecar is attacker-controlled: the agent
//! runs as the same OS user and can rewrite the in-repo copy or retarget the
//! hint file. Reads therefore sanitize field types and callers gate every
//! path before use.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::Value;

/// In-repo sidecar filename (also excluded from patches; see `utils::patch`).
pub const SIDECAR_FILENAME: &str = utils::patch::SANITIZE_SIDECAR;

/// Durable copy filename inside the backup directory.
pub const DURABLE_SIDECAR: &str = "sidecar.json";

/// Basename prefix of backup directories created during sanitization.
pub const BACKUP_DIR_PREFIX: &str = "agent_eval_git_bak_";

/// Relative path of the hint file pointing at the durable sidecar copy.
pub const SIDECAR_HINT: &str = ".git/info/sidecar_backup";

#[derive(Debug, Clone, Default, Serialize)]
pub struct Sidecar {
    pub backup_dir: Option<String>,
    pub pre_agent_ignored: Option<Vec<String>>,
    pub pre_agent_modes: HashMap<String, u32>,
}

impl Sidecar {
    /// Build a sanitized sidecar from untrusted JSON.
    ///
    /// - `backup_dir` must be a string or is nulled.
    /// - `pre_agent_ignored` must be a list; non-string entries are dropped,
    ///   a non-list value degrades to an empty list, an absent/null value
    ///   stays absent (callers distinguish "no snapshot" from "empty").
    /// - `pre_agent_modes` must map strings to finite numbers; NaN/Inf and
    ///   out-of-range values are rejected entry-by-entry.
    pub fn from_untrusted(value: Value) -> Option<Self> {
        let obj = value.as_object()?;

        let backup_dir = match obj.get("backup_dir") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };

        let pre_agent_ignored = match obj.get("pre_agent_ignored") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
            ),
            Some(_) => Some(Vec::new()),
        };

        let mut pre_agent_modes = HashMap::new();
        if let Some(Value::Object(map)) = obj.get("pre_agent_modes") {
            for (k, v) in map {
                let mode = match v {
                    Value::Number(n) => {
                        if let Some(i) = n.as_u64() {
                            u32::try_from(i).ok()
                        } else if let Some(f) = n.as_f64() {
                            // serde_json already rejects NaN/Infinity literals;
                            // this guards computed non-finite and negatives.
                            (f.is_finite() && f >= 0.0 && f <= u32::MAX as f64)
                                .then_some(f as u32)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if let Some(mode) = mode {
                    pre_agent_modes.insert(k.clone(), mode);
                }
            }
        }

        Some(Self {
            backup_dir,
            pre_agent_ignored,
            pre_agent_modes,
        })
    }
}

fn try_load(path: &Path) -> Option<Sidecar> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return None;
    }
    let text = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;
    Sidecar::from_untrusted(value)
}

/// Read sidecar data, preferring the most-trusted source available.
///
/// Lookup order (most → least trusted):
/// 1. `<backup_dir>/sidecar.json` via the explicit parameter: the path came
///    from the encoded original-ref held in process memory, which the agent
///    cannot touch.
/// 2. The `.git/info/sidecar_backup` hint file; the agent can retarget it.
/// 3. The in-repo sidecar; the agent can rewrite it freely.
pub fn read_sidecar(directory: &Path, backup_dir: Option<&Path>) -> Option<Sidecar> {
    if let Some(backup_dir) = backup_dir
        && !backup_dir.as_os_str().is_empty()
        && let Some(data) = try_load(&backup_dir.join(DURABLE_SIDECAR))
    {
        return Some(data);
    }

    let hint = directory.join(SIDECAR_HINT);
    if hint.is_file() {
        let durable_path = fs::read_to_string(&hint)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if let Some(data) = try_load(Path::new(&durable_path)) {
            return Some(data);
        }
    }

    try_load(&directory.join(SIDECAR_FILENAME))
}

/// Accept a sidecar-reported backup directory only if it looks like one we
/// created: right basename prefix, parent resolving into the system temp
/// root, and a `.git` child holding the backed-up history.
pub fn is_plausible_backup_dir(path: &Path) -> bool {
    if path.as_os_str().is_empty() || !path.is_dir() {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if !name.starts_with(BACKUP_DIR_PREFIX) {
        return false;
    }
    let Some(parent) = path.parent() else {
        return false;
    };
    let (Ok(real_parent), Ok(real_tmp)) =
        (fs::canonicalize(parent), fs::canonicalize(std::env::temp_dir()))
    else {
        return false;
    };
    if real_parent != real_tmp && !real_parent.starts_with(&real_tmp) {
        return false;
    }
    let backup_git = path.join(".git");
    backup_git.is_dir() || backup_git.is_file()
}

/// Location of the in-repo sidecar for `directory`.
pub fn in_repo_sidecar(directory: &Path) -> PathBuf {
    directory.join(SIDECAR_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitizes_field_types() {
        let data = Sidecar::from_untrusted(json!({
            "backup_dir": 42,
            "pre_agent_ignored": [".env", 13, {"x": 1}, "other"],
            "pre_agent_modes": {".env": 33188, "bad": "str", "f": 420.9, "neg": -1.0}
        }))
        .unwrap();
        assert_eq!(data.backup_dir, None);
        assert_eq!(
            data.pre_agent_ignored,
            Some(vec![".env".to_string(), "other".to_string()])
        );
        assert_eq!(data.pre_agent_modes.get(".env"), Some(&33188));
        assert_eq!(data.pre_agent_modes.get("f"), Some(&420));
        assert!(!data.pre_agent_modes.contains_key("bad"));
        assert!(!data.pre_agent_modes.contains_key("neg"));
    }

    #[test]
    fn non_list_ignored_degrades_to_empty() {
        let data = Sidecar::from_untrusted(json!({"pre_agent_ignored": "nope"})).unwrap();
        assert_eq!(data.pre_agent_ignored, Some(Vec::new()));
    }

    #[test]
    fn absent_ignored_stays_absent() {
        let data = Sidecar::from_untrusted(json!({"backup_dir": "/tmp/x"})).unwrap();
        assert_eq!(data.pre_agent_ignored, None);
    }

    #[test]
    fn non_object_rejected() {
        assert!(Sidecar::from_untrusted(json!(["not", "a", "dict"])).is_none());
        assert!(Sidecar::from_untrusted(json!("scalar")).is_none());
    }

    #[test]
    fn implausible_backup_dirs_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        // Wrong prefix
        assert!(!is_plausible_backup_dir(tmp.path()));
        // Right prefix but no .git child
        let bad = std::env::temp_dir().join(format!("{BACKUP_DIR_PREFIX}test_no_git"));
        std::fs::create_dir_all(&bad).unwrap();
        assert!(!is_plausible_backup_dir(&bad));
        std::fs::remove_dir_all(&bad).unwrap();
        // Nonexistent
        assert!(!is_plausible_backup_dir(Path::new("/nonexistent/nope")));
    }

    #[test]
    fn plausible_backup_dir_accepted() {
        let dir = std::env::temp_dir().join(format!("{BACKUP_DIR_PREFIX}test_ok"));
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        assert!(is_plausible_backup_dir(&dir));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
