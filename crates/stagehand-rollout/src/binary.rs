//! Choosing the binary to roll out and pointing a unit at it.

use std::path::{Path, PathBuf};

use stagehand_core::{InstanceConfig, newest_version};

use crate::error::{RolloutError, RolloutResult};

/// Newest file in `dir` by dotted-version ordering of its name.
pub fn newest_binary(dir: &Path) -> RolloutResult<PathBuf> {
    let entries = std::fs::read_dir(dir).map_err(RolloutError::io(dir))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(RolloutError::io(dir))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    newest_version(names.iter().map(String::as_str))
        .map(|name| dir.join(name))
        .ok_or_else(|| RolloutError::NoBinary {
            dir: dir.to_path_buf(),
        })
}

/// The `ExecStart=` line an instance runs with.
pub fn exec_start_line(binary: &Path, instance: &InstanceConfig, config_path: &Path) -> String {
    let version = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "ExecStart={} serve --config {} --instance {} --port {} --app-version {}",
        binary.display(),
        config_path.display(),
        instance.name,
        instance.port,
        version
    )
}

/// Replace every `ExecStart=` line in `unit`. `None` if there is none.
pub fn retarget_exec_start(unit: &str, exec_line: &str) -> Option<String> {
    let mut found = false;
    let mut out: Vec<&str> = Vec::new();
    for line in unit.lines() {
        if line.trim_start().starts_with("ExecStart=") {
            found = true;
            out.push(exec_line);
        } else {
            out.push(line);
        }
    }
    if !found {
        return None;
    }
    let mut text = out.join("\n");
    if unit.ends_with('\n') {
        text.push('\n');
    }
    Some(text)
}
