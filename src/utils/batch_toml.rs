//! Load `passbatch.toml` (CLI only). Library callers build [`Settings`] directly.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{JobSettings, Settings};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchToml {
    #[serde(default)]
    settings: SettingsSection,
    #[serde(default)]
    jobs: HashMap<String, JobSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsSection {
    db_path: Option<String>,
    report_dir: Option<String>,
    verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobSection {
    chunk_size: Option<usize>,
    page_size: Option<usize>,
    workers: Option<usize>,
    skip_limit: Option<usize>,
}

/// Load the config file. An explicit `path` must exist and parse; the default file in `dir` is
/// optional and a parse error in it is reported, not ignored.
fn load_batch_toml(path: Option<&Path>, dir: &Path) -> Result<Option<BatchToml>> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (dir.join(super::PackagePaths::get().config_filename()), false),
    };
    if !required && !path.is_file() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    let parsed = toml::from_str(&s).with_context(|| format!("parse config {}", path.display()))?;
    Ok(Some(parsed))
}

/// Overwrite a settings field from the file when present.
macro_rules! apply_file_opt {
    ($section:expr, $target:expr, $field:ident) => {
        if let Some(v) = $section.$field {
            $target.$field = Some(v);
        }
    };
}

/// Apply file config to settings (only fields present in the file). Call before applying CLI flags.
fn apply_file_to_settings(file: &BatchToml, settings: &mut Settings) {
    let s = &file.settings;
    if let Some(ref p) = s.db_path {
        settings.db_path = Some(PathBuf::from(p));
    }
    if let Some(ref p) = s.report_dir {
        settings.report_dir = Some(PathBuf::from(p));
    }
    if let Some(v) = s.verbose {
        settings.verbose = v;
    }
    for (name, section) in &file.jobs {
        let job = settings.jobs.entry(name.clone()).or_insert_with(JobSettings::default);
        apply_file_opt!(section, job, chunk_size);
        apply_file_opt!(section, job, page_size);
        apply_file_opt!(section, job, workers);
        apply_file_opt!(section, job, skip_limit);
    }
}

/// Settings from the config file alone (defaults when there is none). CLI flags go on top.
pub fn load_settings(path: Option<&Path>, dir: &Path) -> Result<Settings> {
    let mut settings = Settings::default();
    if let Some(file) = load_batch_toml(path, dir)? {
        apply_file_to_settings(&file, &mut settings);
    }
    Ok(settings)
}
