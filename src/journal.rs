use std::io::Write;
use std::path::PathBuf;

use crate::rc::TransferringFile;
use crate::util::{human_bytes, human_duration};

const MAX_BYTES: u64 = 5 * 1024 * 1024;
const BACKUPS: usize = 50;

/// Append-only JSONL journal of completed transfers, rotated by size.
pub struct TransferJournal {
    path: PathBuf,
}

impl TransferJournal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn rotate_if_needed(&self) {
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size < MAX_BYTES {
            return;
        }
        let backup = |i: usize| PathBuf::from(format!("{}.{}", self.path.display(), i));
        let _ = std::fs::remove_file(backup(BACKUPS));
        for i in (1..BACKUPS).rev() {
            let from = backup(i);
            if from.exists() {
                let _ = std::fs::rename(&from, backup(i + 1));
            }
        }
        let _ = std::fs::rename(&self.path, backup(1));
    }

    /// Record one completed file, enriched with the tool's stats snapshot
    /// when the file was still listed in it.
    pub fn log_completion(
        &self,
        uploader: &str,
        rel_path: &str,
        now: i64,
        stats: Option<&TransferringFile>,
    ) {
        let mut entry = serde_json::json!({
            "timestamp": now,
            "datetime": crate::util::format_ts(now),
            "uploader": uploader,
            "filename": rel_path,
        });
        if let Some(file) = stats {
            entry["size_bytes"] = file.size.into();
            entry["size_human"] = human_bytes(file.size).into();
            entry["avg_speed_bytes"] = (file.speed_avg as u64).into();
            entry["avg_speed_human"] = format!("{}/s", human_bytes(file.speed_avg as u64)).into();
            if file.speed_avg > 0.0 && file.size > 0 {
                let duration = file.size as f64 / file.speed_avg;
                entry["duration_seconds"] = ((duration * 10.0).round() / 10.0).into();
                entry["duration_human"] = human_duration(duration as i64).into();
            }
            entry["source"] = file.src_fs.clone().into();
            entry["destination"] = file.dst_fs.clone().into();
        }

        self.rotate_if_needed();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let open = std::fs::OpenOptions::new().create(true).append(true).open(&self.path);
        match open {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{}", entry) {
                    tracing::warn!("failed to append to transfer journal: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to open transfer journal: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_append_as_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = TransferJournal::new(dir.path().join("transfer-stats.jsonl"));
        journal.log_completion("gdrive", "tv/ep1.mkv", 1_700_000_000, None);
        let file = TransferringFile {
            name: "tv/ep2.mkv".into(),
            size: 2 * 1024 * 1024,
            speed_avg: 1024.0 * 1024.0,
            ..Default::default()
        };
        journal.log_completion("gdrive", "tv/ep2.mkv", 1_700_000_100, Some(&file));

        let raw = std::fs::read_to_string(dir.path().join("transfer-stats.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["filename"], "tv/ep1.mkv");
        assert!(first.get("size_bytes").is_none());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["size_bytes"], 2 * 1024 * 1024);
        assert_eq!(second["duration_seconds"], 2.0);
    }
}
