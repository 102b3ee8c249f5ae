use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{RecvTimeoutError, bounded};
use regex::Regex;

use crate::planner::StagePlan;
use crate::rc::StatsCell;
use crate::triggers::TriggerTracker;

/// Exit semantics of one transfer-tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    /// Exit 0: the tool finished its work list.
    Completed,
    /// Exit 7: the `--max-transfer` cutoff was reached. A success; the
    /// caller moves on to the next stage.
    MaxTransferReached,
    /// A trigger fired; the tool was terminated early.
    AbortedByTrigger { phrase: String, sleep_hours: u32 },
    /// Any other exit.
    ToolError { code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAction {
    Copy,
    Move,
}

impl ToolAction {
    fn as_str(&self) -> &'static str {
        match self {
            ToolAction::Copy => "copy",
            ToolAction::Move => "move",
        }
    }
}

/// One file reported transferred by the tool's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub rel_path: String,
    pub bytes: u64,
}

/// Everything needed to assemble a tool invocation.
pub struct UploadJob<'a> {
    pub action: ToolAction,
    pub source: &'a str,
    pub dest: &'a str,
    pub rclone_config: &'a Path,
    pub identity: Option<&'a str>,
    pub plan: Option<&'a StagePlan>,
    pub excludes: &'a [String],
    pub extras: &'a BTreeMap<String, serde_json::Value>,
    pub files_from: Option<&'a Path>,
    pub chunked: bool,
    pub dry_run: bool,
}

// Flags the planner owns; user-supplied copies are dropped from extras.
const PLANNER_MANAGED: &[&str] =
    &["--max-transfer", "--max-size", "--transfers", "--cutoff-mode", "--order-by", "--max-backlog"];

// Flags that conflict with an explicit file list. Filters were already
// applied while the list was generated.
const CHUNK_INCOMPATIBLE: &[&str] =
    &["--min-age", "--max-age", "--skip-links", "--max-size", "--order-by", "--max-backlog"];

fn render_extra(flag: &str, value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => flag.to_string(),
        serde_json::Value::String(s) => format!("{}={}", flag, s),
        other => format!("{}={}", flag, other),
    }
}

/// Assemble the argv for a stage run, binary excluded.
pub fn build_args(job: &UploadJob<'_>) -> Vec<String> {
    let mut args = vec![
        job.action.as_str().to_string(),
        job.source.to_string(),
        job.dest.to_string(),
        format!("--config={}", job.rclone_config.display()),
    ];
    if let Some(identity) = job.identity {
        args.push(format!("--drive-service-account-file={}", identity));
    }
    if let Some(plan) = job.plan {
        args.push(format!("--max-transfer={}", plan.max_transfer));
        if !job.chunked {
            args.push(format!("--max-size={}", plan.max_size));
        }
        args.push(format!("--transfers={}", plan.transfers));
        args.push("--cutoff-mode=cautious".to_string());
        if !job.chunked {
            if let Some(order_by) = plan.order_by {
                args.push(format!("--order-by={}", order_by));
            }
            if let Some(backlog) = plan.max_backlog {
                args.push(format!("--max-backlog={}", backlog));
            }
        }
    }
    if let Some(list) = job.files_from {
        args.push(format!("--files-from={}", list.display()));
    }
    for pat in job.excludes {
        args.push(format!("--exclude={}", pat));
    }
    for (flag, value) in job.extras {
        if PLANNER_MANAGED.contains(&flag.as_str()) {
            continue;
        }
        if job.chunked && CHUNK_INCOMPATIBLE.contains(&flag.as_str()) {
            tracing::debug!("dropping {} for chunked upload", flag);
            continue;
        }
        args.push(render_extra(flag, value));
    }
    if job.dry_run {
        args.push("--dry-run".to_string());
    }
    args
}

/// Look up a completed file's size: the RC stats snapshot first, a local
/// stat of the source file as fallback.
fn completed_file_size(rel_path: &str, stats: Option<&StatsCell>, source_root: &str) -> u64 {
    if let Some(cell) = stats
        && let Some(snapshot) = crate::rc::read_stats(cell)
        && let Some(file) = snapshot.find_file(rel_path)
        && file.size > 0
    {
        return file.size;
    }
    let local = Path::new(source_root).join(rel_path);
    match std::fs::metadata(&local) {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    }
}

/// Runtime wiring shared by every stage of an upload run.
pub struct RcloneDriver<'a> {
    pub binary: &'a Path,
    pub stop: Arc<AtomicBool>,
    pub stats: Option<StatsCell>,
}

impl RcloneDriver<'_> {
    /// Spawn the tool and stream its output until it exits, a trigger
    /// fires, or the stop flag is raised. Completion lines invoke
    /// `on_complete` in the order the tool emitted them.
    pub fn run(
        &self,
        job: &UploadJob<'_>,
        tracker: &mut TriggerTracker,
        on_complete: &mut dyn FnMut(CompletedFile),
    ) -> Result<DriverOutcome> {
        let args = build_args(job);
        tracing::debug!("spawning {} {}", self.binary.display(), args.join(" "));

        let mut child = match Command::new(self.binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return Err(crate::UploadError::ToolSpawnFailed(
                    self.binary.display().to_string(),
                    e.to_string(),
                )
                .into());
            }
        };

        let stderr = child.stderr.take().expect("stderr was piped");
        let (line_tx, line_rx) = bounded::<String>(256);
        let reader = std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let copied_re =
            Regex::new(r"INFO\s+:\s+(.+?):\s+Copied \(").expect("valid completion pattern");
        let mut abort: Option<(String, u32)> = None;

        // The reader thread owns stderr; its EOF (child exit or kill)
        // disconnects the channel and ends this loop. Timeouts only exist
        // to keep the stop flag responsive while the tool is quiet.
        loop {
            if self.stop.load(Ordering::SeqCst) {
                tracing::warn!("shutdown requested, terminating the transfer tool");
                let _ = child.kill();
                let _ = child.wait();
                drop(line_rx);
                let _ = reader.join();
                anyhow::bail!("upload cancelled by shutdown request");
            }
            match line_rx.recv_timeout(Duration::from_millis(250)) {
                Ok(line) => {
                    if let Some(caps) = copied_re.captures(&line) {
                        let rel_path = caps[1].trim().to_string();
                        let bytes =
                            completed_file_size(&rel_path, self.stats.as_ref(), job.source);
                        tracing::debug!("captured successful transfer: {}", rel_path);
                        on_complete(CompletedFile { rel_path, bytes });
                    }
                    if let Some(hit) = tracker.observe(&line, crate::util::unix_now()) {
                        abort = Some((hit.phrase, hit.sleep_hours));
                        let _ = child.kill();
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait()?;
        drop(line_rx);
        let _ = reader.join();

        if let Some((phrase, sleep_hours)) = abort {
            return Ok(DriverOutcome::AbortedByTrigger { phrase, sleep_hours });
        }
        Ok(match status.code() {
            Some(0) => DriverOutcome::Completed,
            Some(7) => {
                tracing::info!("received the max-transfer-reached signal from the transfer tool");
                DriverOutcome::MaxTransferReached
            }
            code => {
                tracing::warn!("{}", crate::UploadError::ToolFailed(code));
                DriverOutcome::ToolError { code }
            }
        })
    }
}

/// Seam between the orchestrator's stage loop and the real tool, so the
/// loop can be driven by a scripted runner in tests.
pub trait StageRunner {
    fn run_stage(
        &mut self,
        plan: &StagePlan,
        on_complete: &mut dyn FnMut(CompletedFile),
    ) -> Result<DriverOutcome>;
}
