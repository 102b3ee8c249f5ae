use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::util::{GIB, is_remote_path, wildcard_match};

// A path is excluded when the pattern matches the relative path or any of
// its components, like `du --exclude` does.
fn matches_exclude(rel: &Path, excludes: &[String]) -> bool {
    let rel_str = rel.to_string_lossy();
    excludes.iter().any(|pat| {
        wildcard_match(pat, &rel_str)
            || rel.components().any(|c| wildcard_match(pat, &c.as_os_str().to_string_lossy()))
    })
}

fn local_folder_size(path: &Path, excludes: &[String]) -> u64 {
    let mut total = 0u64;
    let walker = WalkDir::new(path).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !matches_exclude(
                entry.path().strip_prefix(path).unwrap_or(entry.path()),
                excludes,
            )
    });
    for entry in walker.flatten() {
        if entry.file_type().is_file()
            && let Ok(meta) = entry.metadata()
        {
            total += meta.len();
        }
    }
    total
}

fn remote_folder_size(
    path: &str,
    excludes: &[String],
    rclone_binary: &Path,
    rclone_config: &Path,
) -> Result<u64> {
    let mut cmd = Command::new(rclone_binary);
    cmd.arg("size").arg(path).arg("--json").arg(format!("--config={}", rclone_config.display()));
    for pat in excludes {
        cmd.arg(format!("--exclude={}", pat));
    }
    let output = cmd.output().with_context(|| format!("failed to run size command for {}", path))?;
    if !output.status.success() {
        anyhow::bail!("size command for {} exited with {:?}", path, output.status.code());
    }
    #[derive(serde::Deserialize)]
    struct SizeReport {
        #[serde(default)]
        bytes: u64,
    }
    let report: SizeReport = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("unparseable size output for {}", path))?;
    Ok(report.bytes)
}

/// Measure a staging folder in whole GiB, local paths via a directory
/// walk and remote paths via the tool's `size` command.
pub fn folder_size_gib(
    path: &str,
    excludes: &[String],
    rclone_binary: &Path,
    rclone_config: &Path,
) -> u64 {
    let bytes = if is_remote_path(path) {
        match remote_folder_size(path, excludes, rclone_binary, rclone_config) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to measure {}: {}", path, e);
                0
            }
        }
    } else {
        local_folder_size(Path::new(path), excludes)
    };
    bytes / GIB
}

/// Files currently held open under `path`, as relative paths. Relies on
/// `lsof`; remote paths and lookup failures yield an empty list.
pub fn opened_files(path: &str) -> Vec<String> {
    if is_remote_path(path) {
        tracing::debug!("skipping open files check for remote path {}", path);
        return Vec::new();
    }
    let output = match Command::new("lsof").args(["-wFn", "+D", path]).output() {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!("lsof unavailable for {}: {}", path, e);
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .filter(|name| Path::new(name).is_file())
        .filter_map(|name| name.strip_prefix(path).map(|rel| rel.trim_start_matches('/').to_string()))
        .filter(|rel| !rel.is_empty())
        .collect()
}

/// Delete empty directories at or below `min_depth` levels under `root`,
/// deepest first. Non-empty directories are left alone.
pub fn remove_empty_dirs(root: &Path, min_depth: usize) -> Result<()> {
    if is_remote_path(&root.to_string_lossy()) {
        tracing::info!("skipping empty directory removal for remote path {}", root.display());
        return Ok(());
    }
    if !root.exists() {
        anyhow::bail!("cannot remove empty directories from missing path {}", root.display());
    }
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(min_depth)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        // remove_dir refuses non-empty directories, which is the point
        if std::fs::remove_dir(&dir).is_ok() {
            tracing::debug!("removed empty directory {}", dir.display());
        }
    }
    Ok(())
}

/// Remove file-list and chunk temp files orphaned by a previous crash.
pub fn cleanup_orphaned_temp_files() {
    let tmp = std::env::temp_dir();
    let entries = match std::fs::read_dir(&tmp) {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("barrow_filelist_") || name.starts_with("barrow_chunk_") {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        tracing::info!("cleaned up {} orphaned temp file(s) from previous runs", removed);
    }
}
