use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Generates and slices file lists so the transfer tool does not re-scan
/// hundreds of thousands of files on every stage.
pub struct FileChunker {
    rclone_binary: PathBuf,
    rclone_config: PathBuf,
    source: String,
    excludes: Vec<String>,
    timeout_secs: u64,
}

impl FileChunker {
    pub fn new(
        rclone_binary: &Path,
        rclone_config: &Path,
        source: &str,
        excludes: Vec<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            rclone_binary: rclone_binary.to_path_buf(),
            rclone_config: rclone_config.to_path_buf(),
            source: source.to_string(),
            excludes,
            timeout_secs,
        }
    }

    /// Produce the complete file list with `lsf` (no checksums, fast).
    /// Returns the list path and line count; `Ok(None)` when the source
    /// holds nothing to upload. A timeout kills the child, deletes the
    /// partial list, and surfaces `ListGenerationTimeout` so the caller
    /// can fall back to whole-folder mode.
    pub fn generate_file_list(&self) -> Result<Option<(PathBuf, usize)>> {
        tracing::info!("generating file list for {}...", self.source);
        let list_file = tempfile::Builder::new()
            .prefix("barrow_filelist_")
            .suffix(".txt")
            .tempfile()
            .context("failed to create list temp file")?;
        let (file, list_path) = list_file.keep().context("failed to persist list temp file")?;

        let mut cmd = Command::new(&self.rclone_binary);
        cmd.arg("lsf")
            .arg(&self.source)
            .arg("--recursive")
            .arg("--files-only")
            .arg(format!("--config={}", self.rclone_config.display()));
        for pat in &self.excludes {
            cmd.arg(format!("--exclude={}", pat));
        }
        tracing::debug!("running: {:?}", cmd);
        cmd.stdout(Stdio::from(file)).stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let _ = std::fs::remove_file(&list_path);
                return Err(crate::UploadError::ToolSpawnFailed(
                    self.rclone_binary.display().to_string(),
                    e.to_string(),
                )
                .into());
            }
        };

        let deadline = Instant::now() + Duration::from_secs(self.timeout_secs);
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = std::fs::remove_file(&list_path);
                    return Err(crate::UploadError::ListGenerationTimeout(self.timeout_secs).into());
                }
                None => std::thread::sleep(Duration::from_millis(250)),
            }
        };

        if !status.success() {
            let _ = std::fs::remove_file(&list_path);
            anyhow::bail!("file list generation exited with {:?}", status.code());
        }

        let count = BufReader::new(std::fs::File::open(&list_path)?).lines().count();
        if count == 0 {
            tracing::warn!("no files found to upload");
            let _ = std::fs::remove_file(&list_path);
            return Ok(None);
        }
        tracing::info!("generated list of {} file(s)", count);
        Ok(Some((list_path, count)))
    }

    /// Split a file list into chunk files of at most `chunk_size` lines.
    pub fn create_chunks(list_file: &Path, chunk_size: usize) -> Result<Vec<(PathBuf, usize)>> {
        let reader = BufReader::new(
            std::fs::File::open(list_file)
                .with_context(|| format!("failed to open list {}", list_file.display()))?,
        );
        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            current.push(line);
            if current.len() >= chunk_size {
                chunks.push(Self::write_chunk(&current, chunks.len() + 1)?);
                current.clear();
            }
        }
        if !current.is_empty() {
            chunks.push(Self::write_chunk(&current, chunks.len() + 1)?);
        }
        tracing::info!("split into {} chunk(s) of up to {} files each", chunks.len(), chunk_size);
        Ok(chunks)
    }

    fn write_chunk(files: &[String], index: usize) -> Result<(PathBuf, usize)> {
        let chunk = tempfile::Builder::new()
            .prefix(&format!("barrow_chunk_{}_", index))
            .suffix(".txt")
            .tempfile()
            .context("failed to create chunk temp file")?;
        let (mut file, path) = chunk.keep().context("failed to persist chunk temp file")?;
        file.write_all(files.join("\n").as_bytes())?;
        file.write_all(b"\n")?;
        Ok((path, files.len()))
    }

    /// Delete chunk and list temp files after a run.
    pub fn cleanup(paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("failed to clean up {}: {}", path.display(), e);
                } else {
                    tracing::debug!("cleaned up {}", path.display());
                }
            }
        }
    }
}
