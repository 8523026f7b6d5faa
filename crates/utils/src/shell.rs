use std::path::PathBuf;

/// Resolve an executable name to an absolute path via the `PATH` lookup.
pub fn resolve_executable_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}
