//! Database path from the environment: `PASSBATCH_DB` → `.env` in the working directory.

use log::debug;
use std::path::{Path, PathBuf};

use super::PackagePaths;

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `PASSBATCH_DB` from the process environment, else from `.env` in `dir`.
pub fn db_path_from_env(dir: &Path) -> Option<PathBuf> {
    let key = PackagePaths::get().db_env_key();
    if let Some(s) = non_empty_var(key) {
        return Some(PathBuf::from(s));
    }
    let env_path = dir.join(".env");
    if env_path.is_file() {
        if let Err(e) = dotenvy::from_path(&env_path) {
            debug!("{}: {}", env_path.display(), e);
        }
        if let Some(s) = non_empty_var(key) {
            debug!("{} loaded from {}", key, env_path.display());
            return Some(PathBuf::from(s));
        }
    }
    None
}

/// Final database path: explicit setting → environment → default filename in `dir`.
pub fn resolve_db_path(explicit: Option<&Path>, dir: &Path) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| db_path_from_env(dir))
        .unwrap_or_else(|| dir.join(PackagePaths::get().db_filename()))
}
