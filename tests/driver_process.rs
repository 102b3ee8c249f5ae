#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use barrow::driver::{CompletedFile, DriverOutcome, RcloneDriver, ToolAction, UploadJob};
use barrow::triggers::{TriggerDef, TriggerTracker};

// Exercise the driver against small shell scripts standing in for the
// transfer tool: completion parsing, size fallback, exit translation and
// trigger aborts, all through the real spawn-and-stream path.

fn write_tool(dir: &Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-rclone.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write tool");
    let mut perms = std::fs::metadata(&path).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn job<'a>(source: &'a str, extras: &'a BTreeMap<String, serde_json::Value>) -> UploadJob<'a> {
    UploadJob {
        action: ToolAction::Copy,
        source,
        dest: "gdrive:/Media",
        rclone_config: Path::new("/dev/null"),
        identity: None,
        plan: None,
        excludes: &[],
        extras,
        files_from: None,
        chunked: false,
        dry_run: false,
    }
}

fn driver<'a>(binary: &'a Path) -> RcloneDriver<'a> {
    RcloneDriver { binary, stop: Arc::new(AtomicBool::new(false)), stats: None }
}

#[test]
fn completions_stream_in_order_with_stat_fallback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("staging");
    std::fs::create_dir_all(source.join("tv")).unwrap();
    std::fs::write(source.join("tv/ep1.mkv"), vec![0u8; 2048]).unwrap();
    std::fs::write(source.join("tv/ep2.mkv"), vec![0u8; 4096]).unwrap();

    let tool = write_tool(
        dir.path(),
        r#"echo '2024/01/15 10:30:45 INFO  : tv/ep1.mkv: Copied (new)' >&2
echo '2024/01/15 10:30:46 DEBUG : something unrelated' >&2
echo '2024/01/15 10:30:47 INFO  : tv/ep2.mkv: Copied (new)' >&2
exit 0"#,
    );

    let extras = BTreeMap::new();
    let source_str = source.to_string_lossy().to_string();
    let mut completed: Vec<CompletedFile> = Vec::new();
    let mut tracker = TriggerTracker::new(Vec::new());
    let outcome = driver(&tool)
        .run(&job(&source_str, &extras), &mut tracker, &mut |c| completed.push(c))
        .expect("run");

    assert_eq!(outcome, DriverOutcome::Completed);
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0], CompletedFile { rel_path: "tv/ep1.mkv".into(), bytes: 2048 });
    assert_eq!(completed[1], CompletedFile { rel_path: "tv/ep2.mkv".into(), bytes: 4096 });
}

#[test]
fn exit_seven_is_max_transfer_reached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tool = write_tool(dir.path(), "exit 7");
    let extras = BTreeMap::new();
    let mut tracker = TriggerTracker::new(Vec::new());
    let outcome =
        driver(&tool).run(&job("/nonexistent", &extras), &mut tracker, &mut |_| {}).expect("run");
    assert_eq!(outcome, DriverOutcome::MaxTransferReached);
}

#[test]
fn other_exit_codes_are_tool_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tool = write_tool(dir.path(), "exit 3");
    let extras = BTreeMap::new();
    let mut tracker = TriggerTracker::new(Vec::new());
    let outcome =
        driver(&tool).run(&job("/nonexistent", &extras), &mut tracker, &mut |_| {}).expect("run");
    assert_eq!(outcome, DriverOutcome::ToolError { code: Some(3) });
}

#[test]
fn repeated_trigger_phrase_aborts_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    // the tool would run for a long time; the third occurrence kills it
    let tool = write_tool(
        dir.path(),
        r#"echo 'ERROR : userRateLimitExceeded' >&2
echo 'ERROR : userRateLimitExceeded' >&2
echo 'ERROR : userRateLimitExceeded' >&2
sleep 30
exit 0"#,
    );
    let extras = BTreeMap::new();
    let mut tracker = TriggerTracker::new(vec![TriggerDef {
        phrase: "userRateLimitExceeded".to_string(),
        threshold: 3,
        window_secs: 60,
        sleep_hours: 25,
    }]);
    let started = std::time::Instant::now();
    let outcome =
        driver(&tool).run(&job("/nonexistent", &extras), &mut tracker, &mut |_| {}).expect("run");
    assert_eq!(
        outcome,
        DriverOutcome::AbortedByTrigger { phrase: "userRateLimitExceeded".into(), sleep_hours: 25 }
    );
    // the 30s sleep was cut short by the kill
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

#[test]
fn missing_binary_is_a_spawn_error() {
    let extras = BTreeMap::new();
    let mut tracker = TriggerTracker::new(Vec::new());
    let missing = Path::new("/nonexistent/fake-rclone");
    let err = driver(missing)
        .run(&job("/nonexistent", &extras), &mut tracker, &mut |_| {})
        .expect_err("spawn must fail");
    assert!(err.to_string().contains("failed to spawn"));
}
