//! Side-effecting adapters: configuration and case files, child processes,
//! the device bridge, the proposer and evaluator commands, and run artifacts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod adb;
pub mod case;
pub mod config;
pub mod device;
pub mod evaluator;
pub mod process;
pub mod prompt;
pub mod proposer;
pub mod run_record;
pub mod step_log;

/// Write `contents` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
