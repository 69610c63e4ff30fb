use anyhow::{bail, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::MergeError;

pub const DEFAULT_SUFFIX: &str = "_Extended.tif";
pub const DEFAULT_CHANNEL_PATTERN: &str = r"_([A-Za-z0-9]+)_Extended$";

fn file_name(p: &Path) -> &str {
    p.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Files in `dir` whose name ends with `suffix` and contains none of
/// `excludes`, sorted by path. `output` is never returned even if it matches.
pub fn discover_inputs(
    dir: &Path,
    suffix: &str,
    excludes: &[String],
    recursive: bool,
    output: &Path,
) -> Result<Vec<PathBuf>> {
    let output = output.canonicalize().ok();
    let is_output = |p: &Path| match &output {
        Some(o) => p.canonicalize().map(|c| &c == o).unwrap_or(false),
        None => false,
    };

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let name = file_name(p);
            name.ends_with(suffix) && !excludes.iter().any(|x| name.contains(x.as_str()))
        })
        .filter(|p| !is_output(p))
        .collect();

    if files.is_empty() {
        bail!(MergeError::NoInputs {
            dir: dir.to_path_buf(),
            suffix: suffix.to_string(),
        });
    }

    files.sort();
    Ok(files)
}

/// First capture group of `pattern` against the file stem, or the whole
/// stem when it does not match.
pub fn channel_name(path: &Path, pattern: &Regex) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    pattern
        .captures(&stem)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or(stem)
}
