use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::NaiveTime;

use crate::app::App;
use crate::config::UploaderConfig;
use crate::ledger::Ledgers;
use crate::lock::LockFile;
use crate::notify::NotifierSet;
use crate::orchestrator;
use crate::rotation;
use crate::util::{is_time_between, unix_now};

/// Clear expired uploader suspensions; report whether `to_check` is still
/// suspended.
pub fn check_suspended_uploaders(
    ledgers: &Ledgers,
    notify: &NotifierSet,
    to_check: Option<&str>,
    now: i64,
) -> bool {
    let expired: Vec<String> = ledgers.read_cache(|c| {
        c.uploader_bans.iter().filter(|(_, until)| now >= **until).map(|(n, _)| n.clone()).collect()
    });
    for name in &expired {
        ledgers.clear_uploader_ban(name);
        tracing::warn!("{} is no longer suspended due to a previously aborted upload", name);
        notify.send(&format!("Upload suspension has expired for remote: {}", name));
    }
    let mut suspended = false;
    if let Some(check) = to_check
        && let Some(until) = ledgers.uploader_ban(check)
        && now < until
    {
        tracing::info!(
            "{} is still suspended due to a previously aborted upload, normal operation resumes at {}",
            check,
            crate::util::format_ts(until)
        );
        suspended = true;
    }
    suspended
}

fn parse_window(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

/// Whether the uploader's schedule window (if any) allows a run now.
fn inside_schedule_window(uploader_cfg: &UploaderConfig, now: NaiveTime) -> bool {
    let Some(schedule) = &uploader_cfg.schedule else {
        return true;
    };
    if !schedule.enabled {
        return true;
    }
    match (parse_window(&schedule.allowed_from), parse_window(&schedule.allowed_until)) {
        (Some(from), Some(until)) => is_time_between(from, until, now),
        _ => {
            tracing::warn!(
                "unparseable schedule window '{}' -> '{}', allowing the run",
                schedule.allowed_from,
                schedule.allowed_until
            );
            true
        }
    }
}

/// One scheduled disk check for an uploader: skip while suspended, clear
/// expired identity bans, measure the staging folder, and kick off a
/// cleanup + upload once the folder crosses its limit inside the allowed
/// window.
pub fn scheduled_uploader_check(app: &App, name: &str, uploader_cfg: &UploaderConfig) -> Result<()> {
    tracing::debug!("scheduled disk check triggered for uploader: {}", name);
    let Some(remote) = app.cfg.remotes.get(name) else {
        return Err(crate::UploadError::MissingRemote(name.to_string()).into());
    };

    if check_suspended_uploaders(&app.ledgers, &app.notify, Some(name), unix_now()) {
        return Ok(());
    }
    rotation::clear_expired_identity_bans(&app.ledgers, name, unix_now());

    let used_gib = crate::fsutil::folder_size_gib(
        &remote.upload_folder,
        &uploader_cfg.size_excludes,
        &app.cfg.core.rclone_binary_path,
        &app.cfg.core.rclone_config_path,
    );
    if used_gib < uploader_cfg.max_size_gb {
        tracing::info!(
            "uploader {}: local folder is at {} GiB, {} GiB to go before uploading begins",
            name,
            used_gib,
            uploader_cfg.max_size_gb - used_gib
        );
        return Ok(());
    }
    tracing::info!(
        "uploader {}: local folder is {} GiB over its {} GiB limit",
        name,
        used_gib - uploader_cfg.max_size_gb,
        uploader_cfg.max_size_gb
    );

    let local_now = chrono::Local::now().time();
    if !inside_schedule_window(uploader_cfg, local_now) {
        let schedule = uploader_cfg.schedule.as_ref().expect("window checked above");
        tracing::info!(
            "uploader {}: current time is outside the allowed window {} -> {}",
            name,
            schedule.allowed_from,
            schedule.allowed_until
        );
        return Ok(());
    }

    do_hidden(app)?;
    orchestrator::do_upload(&app.upload_env(), Some(name))
}

/// Run the hidden-files cleanup collaborator for every configured hidden
/// folder, under the hidden lock.
pub fn do_hidden(app: &App) -> Result<()> {
    if app.cfg.hidden.is_empty() {
        return Ok(());
    }
    let lock = LockFile::hidden(&app.cfg.locks_dir());
    if lock.is_locked() {
        tracing::info!("waiting for running hidden cleaner to finish before proceeding...");
    }
    let _guard = lock.acquire(&app.shutdown)?;
    tracing::info!("starting hidden cleaning");
    for folder in app.cfg.hidden.keys() {
        if let Err(e) = app.hidden_cleaner.clean(folder) {
            tracing::error!("hidden cleanup failed for {}: {}", folder, e);
        }
    }
    tracing::info!("finished hidden cleaning");
    Ok(())
}

enum TaskKind {
    Uploader(String),
    Syncer(String),
}

struct ScheduledTask {
    kind: TaskKind,
    interval: Duration,
    next_due: Instant,
}

/// The main loop: per-uploader disk checks every `check_interval` minutes
/// and per-syncer runs every `sync_interval` hours, dispatched inline with
/// one-second granularity until shutdown.
pub fn run_loop(app: &mut App) -> Result<()> {
    let mut tasks = Vec::new();
    for (name, cfg) in &app.cfg.uploader {
        let interval = Duration::from_secs(cfg.check_interval * 60);
        tasks.push(ScheduledTask {
            kind: TaskKind::Uploader(name.clone()),
            interval,
            next_due: Instant::now() + interval,
        });
        tracing::info!(
            "added {} uploader to schedule, checking available disk space every {} minute(s)",
            name,
            cfg.check_interval
        );
    }
    for (name, cfg) in &app.cfg.syncer {
        let interval = Duration::from_secs(cfg.sync_interval * 3600);
        tasks.push(ScheduledTask {
            kind: TaskKind::Syncer(name.clone()),
            interval,
            next_due: Instant::now() + interval,
        });
        tracing::info!(
            "added {} syncer to schedule, syncing every {} hour(s)",
            name,
            cfg.sync_interval
        );
    }

    while !app.shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        for index in 0..tasks.len() {
            if tasks[index].next_due > now {
                continue;
            }
            match &tasks[index].kind {
                TaskKind::Uploader(name) => {
                    let name = name.clone();
                    let Some(cfg) = app.cfg.uploader.get(&name).cloned() else { continue };
                    if let Err(e) = scheduled_uploader_check(app, &name, &cfg) {
                        tracing::error!("scheduled check failed for uploader {}: {}", name, e);
                    }
                }
                TaskKind::Syncer(name) => {
                    let name = name.clone();
                    if let Err(e) = app.run_syncer(Some(&name)) {
                        tracing::error!("scheduled sync failed for syncer {}: {}", name, e);
                    }
                }
            }
            tasks[index].next_due = Instant::now() + tasks[index].interval;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    tracing::info!("scheduler stopped by shutdown request");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;

    fn uploader_cfg(schedule: Option<ScheduleConfig>) -> UploaderConfig {
        let raw = r#"{"check_interval": 30, "max_size_gb": 200}"#;
        let mut cfg: UploaderConfig = serde_json::from_str(raw).expect("parse");
        cfg.schedule = schedule;
        cfg
    }

    #[test]
    fn no_schedule_always_allows() {
        let cfg = uploader_cfg(None);
        assert!(inside_schedule_window(&cfg, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn window_gates_runs() {
        let cfg = uploader_cfg(Some(ScheduleConfig {
            enabled: true,
            allowed_from: "23:00".into(),
            allowed_until: "06:00".into(),
        }));
        assert!(inside_schedule_window(&cfg, NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
        assert!(!inside_schedule_window(&cfg, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn disabled_window_is_ignored() {
        let cfg = uploader_cfg(Some(ScheduleConfig {
            enabled: false,
            allowed_from: "23:00".into(),
            allowed_until: "06:00".into(),
        }));
        assert!(inside_schedule_window(&cfg, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn expired_uploader_suspension_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledgers = Ledgers::open(dir.path());
        let notify = NotifierSet::default();
        ledgers.set_uploader_ban("gdrive", 1000);

        assert!(check_suspended_uploaders(&ledgers, &notify, Some("gdrive"), 999));
        assert!(!check_suspended_uploaders(&ledgers, &notify, Some("gdrive"), 1000));
        assert_eq!(ledgers.uploader_ban("gdrive"), None);
    }
}
