use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::cache;
use crate::chunker::FileChunker;
use crate::config::{Config, RemoteConfig, TriggerConfig, UploaderConfig};
use crate::driver::{
    CompletedFile, DriverOutcome, RcloneDriver, StageRunner, ToolAction, UploadJob,
};
use crate::journal::TransferJournal;
use crate::ledger::Ledgers;
use crate::lock::LockFile;
use crate::notify::NotifierSet;
use crate::planner::plan_stage;
use crate::queues::{NzbgetClient, SabnzbdClient};
use crate::quota;
use crate::rc::{StatsCell, StatsPoller, new_stats_cell};
use crate::rotation;
use crate::triggers::TriggerTracker;
use crate::util::{GIB, human_bytes, human_duration, unix_now};

/// Stage loop floor: an identity with this much quota or less rotates out.
const STAGE_LOOP_FLOOR: u64 = 10 * GIB;

/// Suspension applied when a single-run (no service accounts) upload hits
/// the tool's max-transfer cutoff.
const MAX_TRANSFER_SUSPEND_HOURS: u32 = 25;

/// Cache write-back cadence, in completed files.
const CACHE_FLUSH_EVERY: usize = 50;

/// Shared collaborators for an upload pass.
pub struct UploadEnv<'a> {
    pub cfg: &'a Config,
    pub ledgers: &'a Ledgers,
    pub notify: Arc<NotifierSet>,
    pub journal: &'a TransferJournal,
    pub shutdown: Arc<AtomicBool>,
}

/// How one identity's stage loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    /// Exit 0 with nothing left to move; the uploader run is complete.
    Drained,
    /// Remaining quota fell to the stage floor; rotate to the next identity.
    QuotaDepleted,
    /// A trigger fired during some stage.
    Trigger { phrase: String, sleep_hours: u32 },
    /// The tool failed; ends the uploader run without banning anyone.
    Failed,
}

#[derive(Debug, Clone)]
pub struct IdentityRunReport {
    pub outcome: IdentityOutcome,
    pub stages: u32,
    pub bytes: u64,
    pub files: usize,
}

/// Run stages for a single identity until its quota floor, a trigger, a
/// tool failure, or a drained work list. Each stage gets parameters from
/// the planner for the quota remaining at that moment, and every
/// completion is charged against the identity as it streams in.
pub fn run_identity_stages(
    ledgers: &Ledgers,
    uploader: &str,
    identity: &str,
    daily_quota: u64,
    runner: &mut dyn StageRunner,
    on_complete: &mut dyn FnMut(&CompletedFile),
    now: &dyn Fn() -> i64,
) -> Result<IdentityRunReport> {
    let mut stages = 0u32;
    let mut total_bytes = 0u64;
    let mut total_files = 0usize;

    loop {
        let remaining = quota::remaining(ledgers, uploader, identity, now());
        if remaining <= STAGE_LOOP_FLOOR {
            tracing::info!(
                "service account '{}' quota depleted after {} stage(s), {} left",
                identity,
                stages,
                human_bytes(remaining)
            );
            return Ok(IdentityRunReport {
                outcome: IdentityOutcome::QuotaDepleted,
                stages,
                bytes: total_bytes,
                files: total_files,
            });
        }

        let plan = plan_stage(remaining, daily_quota);
        stages += 1;
        tracing::info!(
            "stage {} for '{}': {} remaining, strategy={}, transfers={}, max-transfer={}",
            stages,
            identity,
            human_bytes(remaining),
            plan.strategy.as_str(),
            plan.transfers,
            human_bytes(plan.max_transfer)
        );

        let mut stage_bytes = 0u64;
        let mut stage_files = 0usize;
        let mut sink = |completed: CompletedFile| {
            quota::charge(ledgers, uploader, identity, completed.bytes, now());
            stage_bytes += completed.bytes;
            stage_files += 1;
            on_complete(&completed);
        };
        let outcome = runner.run_stage(&plan, &mut sink)?;
        total_bytes += stage_bytes;
        total_files += stage_files;
        tracing::info!(
            "stage {} complete: uploaded {}, quota remaining {}",
            stages,
            human_bytes(stage_bytes),
            human_bytes(quota::remaining(ledgers, uploader, identity, now()))
        );

        match outcome {
            DriverOutcome::Completed => {
                if stage_files == 0 {
                    // the work list is dry; further stages would only rescan
                    return Ok(IdentityRunReport {
                        outcome: IdentityOutcome::Drained,
                        stages,
                        bytes: total_bytes,
                        files: total_files,
                    });
                }
                // more may fit under a new size window, plan another stage
            }
            DriverOutcome::MaxTransferReached => {
                // loop re-checks remaining quota and rotates at the floor
            }
            DriverOutcome::AbortedByTrigger { phrase, sleep_hours } => {
                return Ok(IdentityRunReport {
                    outcome: IdentityOutcome::Trigger { phrase, sleep_hours },
                    stages,
                    bytes: total_bytes,
                    files: total_files,
                });
            }
            DriverOutcome::ToolError { code } => {
                tracing::error!("stage {} failed with exit code {:?}", stages, code);
                return Ok(IdentityRunReport {
                    outcome: IdentityOutcome::Failed,
                    stages,
                    bytes: total_bytes,
                    files: total_files,
                });
            }
        }
    }
}

/// Result of a whole rotation over an uploader's identities.
#[derive(Debug, Clone)]
pub struct RotationReport {
    pub success: bool,
    pub suspended_until: Option<i64>,
    pub tool_failed: bool,
    pub total_bytes: u64,
    pub total_files: usize,
    pub identities_used: Vec<String>,
}

pub struct RotationCtx<'a> {
    pub ledgers: &'a Ledgers,
    pub notify: &'a NotifierSet,
    pub uploader: &'a str,
    pub daily_quota: u64,
}

/// Iterate usable identities, running the stage loop for each. Trigger
/// aborts ban the identity for the configured sleep and rotate; when the
/// last identity is banned the uploader is suspended until the earliest
/// ban expiry. A tool failure ends the run without any ban, and exit
/// code 7 along the way never bans anything.
pub fn run_identity_rotation<R, F>(
    ctx: &RotationCtx<'_>,
    identities: &[String],
    make_runner: &mut F,
    on_complete: &mut dyn FnMut(&CompletedFile),
    now: &dyn Fn() -> i64,
) -> Result<RotationReport>
where
    R: StageRunner,
    F: FnMut(&str) -> Result<R>,
{
    let mut report = RotationReport {
        success: false,
        suspended_until: None,
        tool_failed: false,
        total_bytes: 0,
        total_files: 0,
        identities_used: Vec::new(),
    };

    for (index, identity) in identities.iter().enumerate() {
        let sa_started = now();
        report.identities_used.push(identity.clone());
        tracing::info!(
            "service account {}/{} ({}) starting",
            index + 1,
            identities.len(),
            identity
        );

        let mut runner = make_runner(identity)?;
        let mut sink = |completed: &CompletedFile| {
            report.total_bytes += completed.bytes;
            report.total_files += 1;
            on_complete(completed);
        };
        let sa_report = run_identity_stages(
            ctx.ledgers,
            ctx.uploader,
            identity,
            ctx.daily_quota,
            &mut runner,
            &mut sink,
            now,
        )?;

        match sa_report.outcome {
            IdentityOutcome::Trigger { phrase, sleep_hours } => {
                let until = now() + (sleep_hours as i64) * 3600;
                rotation::ban_identity(ctx.ledgers, ctx.uploader, identity, until);
                tracing::info!(
                    "service account '{}' banned until {} after trigger '{}'",
                    identity,
                    crate::util::format_ts(until),
                    phrase
                );
                if index + 1 < identities.len() {
                    let next = &identities[index + 1];
                    ctx.notify.send(&format!(
                        "Service account {} hit '{}' for {}. This account uploaded {} across {} stage(s) in {}. \
                         Session total so far: {} files ({}). Cycling to {} ({} remaining)",
                        identity,
                        phrase,
                        ctx.uploader,
                        human_bytes(sa_report.bytes),
                        sa_report.stages,
                        human_duration(now() - sa_started),
                        report.total_files,
                        human_bytes(report.total_bytes),
                        next,
                        identities.len() - index - 1
                    ));
                    continue;
                }
                // bans may have expired while this upload was running
                rotation::clear_expired_identity_bans(ctx.ledgers, ctx.uploader, now());
                report.suspended_until = rotation::suspend_uploader(ctx.ledgers, ctx.uploader);
                ctx.notify.send(&format!(
                    "Upload was aborted for remote: {} due to trigger {}. Partial upload: {} files ({}). \
                     Uploads suspended for {} hours",
                    ctx.uploader,
                    phrase,
                    report.total_files,
                    human_bytes(report.total_bytes),
                    sleep_hours
                ));
                return Ok(report);
            }
            IdentityOutcome::Failed => {
                report.tool_failed = true;
                return Ok(report);
            }
            IdentityOutcome::Drained => {
                rotation::clear_identity_ban(ctx.ledgers, ctx.uploader, identity);
                report.success = true;
                return Ok(report);
            }
            IdentityOutcome::QuotaDepleted => {
                // rotate to the next identity; no ban involved
                continue;
            }
        }
    }

    // every identity ran out of quota; the bytes that fit were moved
    report.success = true;
    Ok(report)
}

/// Identities ready for an upload run, or the suspension applied when
/// there are none.
pub enum IdentityAvailability {
    Available(Vec<String>),
    NoneUsable { until: Option<i64> },
}

pub fn available_identities(ledgers: &Ledgers, uploader: &str, now: i64) -> IdentityAvailability {
    let usable = rotation::usable_identities(ledgers, uploader, now);
    if usable.is_empty() {
        IdentityAvailability::NoneUsable { until: rotation::suspend_uploader(ledgers, uploader) }
    } else {
        tracing::info!("{} service account(s) available for {}", usable.len(), uploader);
        IdentityAvailability::Available(usable)
    }
}

// ---------------------------------------------------------------------------
// production wiring

struct MonitorHandle {
    run: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// Production stage runner: builds an rclone invocation per stage, with
/// chunk iteration folded into the first stage when chunk mode is on.
struct RcloneStageRunner<'a> {
    driver: RcloneDriver<'a>,
    source: &'a str,
    dest: &'a str,
    rclone_config: &'a Path,
    identity: Option<String>,
    excludes: &'a [String],
    extras: &'a BTreeMap<String, serde_json::Value>,
    trigger_defs: &'a BTreeMap<String, TriggerConfig>,
    dry_run: bool,
    chunks: Option<Vec<(PathBuf, usize)>>,
    quota_remaining: Box<dyn Fn() -> u64 + 'a>,
}


impl StageRunner for RcloneStageRunner<'_> {
    fn run_stage(
        &mut self,
        plan: &crate::planner::StagePlan,
        on_complete: &mut dyn FnMut(CompletedFile),
    ) -> Result<DriverOutcome> {
        let mut tracker = TriggerTracker::from_config(self.trigger_defs);

        // chunked mode applies to the first stage only; later stages fall
        // back to whole-folder scans under the new size window
        if let Some(chunks) = self.chunks.take() {
            let total = chunks.len();
            tracing::info!("starting chunked upload: {} chunk(s)", total);
            for (index, (chunk_file, count)) in chunks.iter().enumerate() {
                tracing::info!("uploading chunk {}/{} ({} files)", index + 1, total, count);
                let job = UploadJob {
                    action: ToolAction::Copy,
                    source: self.source,
                    dest: self.dest,
                    rclone_config: self.rclone_config,
                    identity: self.identity.as_deref(),
                    plan: Some(plan),
                    excludes: self.excludes,
                    extras: self.extras,
                    files_from: Some(chunk_file),
                    chunked: true,
                    dry_run: self.dry_run,
                };
                let outcome = self.driver.run(&job, &mut tracker, on_complete)?;
                if outcome != DriverOutcome::Completed {
                    return Ok(outcome);
                }
                let left = (self.quota_remaining)();
                if left <= STAGE_LOOP_FLOOR {
                    tracing::info!(
                        "quota low ({}) mid-chunk-loop, stopping to rotate",
                        human_bytes(left)
                    );
                    break;
                }
            }
            return Ok(DriverOutcome::Completed);
        }

        let job = UploadJob {
            action: ToolAction::Copy,
            source: self.source,
            dest: self.dest,
            rclone_config: self.rclone_config,
            identity: self.identity.as_deref(),
            plan: Some(plan),
            excludes: self.excludes,
            extras: self.extras,
            files_from: None,
            chunked: false,
            dry_run: self.dry_run,
        };
        self.driver.run(&job, &mut tracker, on_complete)
    }
}

fn is_weekend_now() -> bool {
    use chrono::Datelike;
    matches!(chrono::Local::now().weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

// rclone exclude patterns treat glob characters literally only when
// escaped; opened-file paths are data, not patterns.
fn glob_escape(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Base excludes plus, on weekdays, the transferred-set cache. Weekend
/// runs ignore the cache so everything gets a full re-scan. Returns the
/// exclude list and how many entries came from the cache.
pub fn assemble_excludes(
    ledgers: &Ledgers,
    name: &str,
    fingerprint: &cache::CacheConfigKey,
    base: &[String],
    is_weekend: bool,
) -> (Vec<String>, usize) {
    let cached: BTreeSet<String> = if is_weekend {
        tracing::info!("weekend run - performing full transfer without cache excludes");
        BTreeSet::new()
    } else {
        let cached =
            ledgers.read_cache(|c| cache::cached_files(&c.transferred_files, name, fingerprint));
        if !cached.is_empty() {
            tracing::info!("weekday run - excluding {} cached file(s) from transfer", cached.len());
        }
        cached
    };
    let cached_count = cached.len();
    let mut excludes: Vec<String> = base.to_vec();
    excludes.extend(cached);
    (excludes, cached_count)
}

/// Open files under the staging folder that should be excluded, with the
/// uploader's opened_excludes filter applied.
fn opened_file_excludes(remote: &RemoteConfig, uploader_cfg: &UploaderConfig) -> Vec<String> {
    let open = crate::fsutil::opened_files(&remote.upload_folder);
    open.into_iter()
        .filter(|rel| {
            !uploader_cfg
                .opened_excludes
                .iter()
                .any(|needle| rel.to_lowercase().contains(&needle.to_lowercase()))
        })
        .map(|rel| glob_escape(&rel))
        .collect()
}

/// One scheduled or manual upload pass over the configured uploaders,
/// exclusively via the upload lock.
pub fn do_upload(env: &UploadEnv<'_>, only_remote: Option<&str>) -> Result<()> {
    let lock = LockFile::upload(&env.cfg.locks_dir());
    if lock.is_locked() {
        tracing::info!("waiting for running upload to finish before proceeding...");
    }
    let guard = lock.acquire(&env.shutdown)?;
    tracing::info!("starting upload");

    let mut monitor: Option<MonitorHandle> = None;
    for (name, uploader_cfg) in &env.cfg.uploader {
        if let Some(only) = only_remote
            && only != name
        {
            continue;
        }
        if env.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = run_uploader(env, name, uploader_cfg, &mut monitor) {
            tracing::error!("upload run failed for {}: {}", name, e);
            env.notify.send(&format!("Upload run failed for remote: {} ({})", name, e));
        }
    }

    if let Some(monitor) = monitor.take() {
        monitor.run.store(false, Ordering::SeqCst);
        let _ = monitor.handle.join();
    }
    drop(guard);
    tracing::info!("finished upload");
    Ok(())
}

fn run_uploader(
    env: &UploadEnv<'_>,
    name: &str,
    uploader_cfg: &UploaderConfig,
    monitor: &mut Option<MonitorHandle>,
) -> Result<()> {
    let remote = env
        .cfg
        .remotes
        .get(name)
        .ok_or_else(|| crate::UploadError::MissingRemote(name.to_string()))?;
    let is_weekend = is_weekend_now();
    let started = unix_now();

    env.notify.send(&format!(
        "Upload starting for {} ({})",
        name,
        if is_weekend { "weekend - full transfer" } else { "weekday - incremental transfer" }
    ));

    // stream monitor runs once per upload lock, if anything can be throttled
    if env.cfg.plex.enabled && uploader_cfg.can_be_throttled && monitor.is_none() {
        let run = Arc::new(AtomicBool::new(true));
        let plex_cfg = env.cfg.plex.clone();
        let rc_url = env.cfg.rc_url();
        let monitor_run = run.clone();
        let monitor_notify = env.notify.clone();
        let handle = std::thread::spawn(move || {
            crate::throttle::run_monitor(&plex_cfg, &rc_url, monitor_run, monitor_notify);
        });
        *monitor = Some(MonitorHandle { run, handle });
    } else if env.cfg.plex.enabled && !uploader_cfg.can_be_throttled {
        tracing::debug!("throttling disabled for remote {}, not starting stream monitor", name);
    }

    let stats_cell = new_stats_cell();
    let poller = StatsPoller::start(&env.cfg.rc_url(), stats_cell.clone());

    // 上传期间暂停下载队列，结束后恢复 — Pause download queues for the duration of the run, resume afterwards
    let nzbget = env.cfg.nzbget.enabled.then(|| NzbgetClient::new(&env.cfg.nzbget));
    let nzbget_paused = nzbget.as_ref().is_some_and(|c| {
        if c.pause_queue() {
            env.notify.send("Paused the Nzbget download queue, upload commencing!");
            true
        } else {
            tracing::error!("failed to pause the Nzbget download queue, continuing anyway");
            false
        }
    });
    let sabnzbd = env.cfg.sabnzbd.enabled.then(|| SabnzbdClient::new(&env.cfg.sabnzbd));
    let sabnzbd_paused = sabnzbd.as_ref().is_some_and(|c| {
        if c.pause_queue() {
            env.notify.send("Paused the Sabnzbd download queue, upload commencing!");
            true
        } else {
            tracing::error!("failed to pause the Sabnzbd download queue, continuing anyway");
            false
        }
    });

    let result = run_uploader_inner(env, name, uploader_cfg, remote, is_weekend, started, &stats_cell);

    poller.stop();
    if nzbget_paused
        && let Some(c) = &nzbget
    {
        if c.resume_queue() {
            env.notify.send("Resumed the Nzbget download queue!");
        } else {
            tracing::error!("failed to resume the Nzbget download queue");
        }
    }
    if sabnzbd_paused
        && let Some(c) = &sabnzbd
    {
        if c.resume_queue() {
            env.notify.send("Resumed the Sabnzbd download queue!");
        } else {
            tracing::error!("failed to resume the Sabnzbd download queue");
        }
    }

    // leftover empty directories only disappear on real runs
    if !env.cfg.core.dry_run
        && !crate::util::is_remote_path(&remote.upload_folder)
        && let Err(e) = crate::fsutil::remove_empty_dirs(
            Path::new(&remote.upload_folder),
            remote.remove_empty_dir_depth,
        )
    {
        tracing::warn!("empty directory sweep failed for {}: {}", name, e);
    }

    let mover_result = run_mover_pass(env, name, uploader_cfg);
    result.and(mover_result)
}

#[allow(clippy::too_many_arguments)]
fn run_uploader_inner(
    env: &UploadEnv<'_>,
    name: &str,
    uploader_cfg: &UploaderConfig,
    remote: &RemoteConfig,
    is_weekend: bool,
    started: i64,
    stats_cell: &StatsCell,
) -> Result<()> {
    let fingerprint = cache::fingerprint(name, remote);
    let (mut excludes, cached_count) = assemble_excludes(
        env.ledgers,
        name,
        &fingerprint,
        &remote.rclone_excludes,
        is_weekend,
    );
    if uploader_cfg.exclude_open_files {
        let open = opened_file_excludes(remote, uploader_cfg);
        if !open.is_empty() {
            tracing::info!("excluding {} open file(s) from upload", open.len());
            excludes.extend(open);
        }
    }

    // chunked mode: pre-generate the work list and slice it. Only the
    // staged (service-account) path consumes chunks.
    let mut chunks: Option<Vec<(PathBuf, usize)>> = None;
    let mut temp_paths: Vec<PathBuf> = Vec::new();
    if let Some(chunk_cfg) = &uploader_cfg.chunked_upload
        && chunk_cfg.enabled
        && uploader_cfg.service_account_path.is_some()
    {
        let chunker = FileChunker::new(
            &env.cfg.core.rclone_binary_path,
            &env.cfg.core.rclone_config_path,
            &remote.upload_folder,
            excludes.clone(),
            chunk_cfg.generate_list_timeout,
        );
        match chunker.generate_file_list() {
            Ok(Some((list, total))) => {
                match FileChunker::create_chunks(&list, chunk_cfg.chunk_size) {
                    Ok(created) if !created.is_empty() => {
                        tracing::info!("created {} chunk(s) from {} file(s)", created.len(), total);
                        temp_paths.extend(created.iter().map(|(p, _)| p.clone()));
                        temp_paths.push(list);
                        chunks = Some(created);
                    }
                    Ok(_) | Err(_) => {
                        tracing::error!("failed to create chunks, falling back to normal upload");
                        let _ = std::fs::remove_file(&list);
                    }
                }
            }
            Ok(None) => {
                tracing::info!("file list came back empty, falling back to normal upload");
            }
            Err(e) => {
                tracing::error!("{}, falling back to normal upload", e);
            }
        }
    }

    // shared completion sink: remember the file, journal it, and flush the
    // cache every so often
    let run_transferred = std::cell::RefCell::new(BTreeSet::<String>::new());
    let mut on_complete = |completed: &CompletedFile| {
        let mut set = run_transferred.borrow_mut();
        set.insert(completed.rel_path.clone());
        let snapshot = crate::rc::read_stats(stats_cell);
        let file_stats = snapshot.as_ref().and_then(|s| s.find_file(&completed.rel_path));
        env.journal.log_completion(name, &completed.rel_path, unix_now(), file_stats);
        if set.len() % CACHE_FLUSH_EVERY == 0 {
            env.ledgers.with_cache(|c| {
                if is_weekend {
                    cache::update_full(&mut c.transferred_files, name, &fingerprint, &set, unix_now());
                } else {
                    cache::update_incremental(&mut c.transferred_files, name, &fingerprint, &set);
                }
            });
            tracing::info!("periodic cache update: {} file(s) saved", set.len());
        }
    };

    let sa_dir = uploader_cfg.service_account_path.as_ref().filter(|dir| {
        let found = dir.exists();
        if !found {
            tracing::warn!(
                "service_account_path {} does not exist, uploading without accounts",
                dir.display()
            );
        }
        found
    });
    let run_result = if let Some(sa_dir) = sa_dir {
        rotation::reconcile(env.ledgers, name, sa_dir)?;
        match available_identities(env.ledgers, name, unix_now()) {
            IdentityAvailability::NoneUsable { until } => {
                let err = crate::UploadError::NoUsableIdentities { next_unban: until };
                tracing::info!("upload aborted for {}: {}", name, err);
                env.notify.send(&format!(
                    "Upload skipped for {}: all service accounts are currently suspended.{}",
                    name,
                    until
                        .map(|t| format!(" Next available in {}", human_duration(t - unix_now())))
                        .unwrap_or_default()
                ));
                None
            }
            IdentityAvailability::Available(identities) => {
                env.notify.send(&format!(
                    "Upload starting for {} using service account: {} ({} accounts available)",
                    name,
                    identities[0],
                    identities.len()
                ));
                let ctx = RotationCtx {
                    ledgers: env.ledgers,
                    notify: env.notify.as_ref(),
                    uploader: name,
                    daily_quota: quota::DAILY_QUOTA,
                };
                let mut chunk_slot = chunks.take();
                let mut make_runner = |identity: &str| {
                    let quota_identity = identity.to_string();
                    let quota_uploader = name.to_string();
                    let ledgers = env.ledgers;
                    Ok(RcloneStageRunner {
                        driver: RcloneDriver {
                            binary: &env.cfg.core.rclone_binary_path,
                            stop: env.shutdown.clone(),
                            stats: Some(stats_cell.clone()),
                        },
                        source: &remote.upload_folder,
                        dest: &remote.upload_remote,
                        rclone_config: &env.cfg.core.rclone_config_path,
                        identity: Some(identity.to_string()),
                        excludes: &excludes,
                        extras: &remote.rclone_extras,
                        trigger_defs: &remote.rclone_sleeps,
                        dry_run: env.cfg.core.dry_run,
                        // the pre-generated chunks belong to the first
                        // identity that runs; the rest rescan
                        chunks: chunk_slot.take(),
                        quota_remaining: Box::new(move || {
                            quota::remaining(ledgers, &quota_uploader, &quota_identity, unix_now())
                        }),
                    })
                };
                Some(run_identity_rotation(
                    &ctx,
                    &identities,
                    &mut make_runner,
                    &mut on_complete,
                    &unix_now,
                )?)
            }
        }
    } else {
        Some(run_single_upload(env, name, remote, &excludes, stats_cell, &mut on_complete)?)
    };

    // final cache write-back and the closing notification; aborted runs
    // keep their completions too, the set only ever grows
    if let Some(report) = &run_result {
        let set = run_transferred.borrow();
        if !set.is_empty() {
            env.ledgers.with_cache(|c| {
                if is_weekend {
                    cache::update_full(&mut c.transferred_files, name, &fingerprint, &set, unix_now());
                } else {
                    cache::update_incremental(&mut c.transferred_files, name, &fingerprint, &set);
                }
            });
            tracing::info!("transferred {} file(s)", set.len());
        }

        let elapsed = unix_now() - started;
        if report.success {
            if report.total_files > 0 {
                let avg = if elapsed > 0 { report.total_bytes / elapsed as u64 } else { 0 };
                let sa_info = match report.identities_used.len() {
                    0 => String::new(),
                    1 => format!(" using {}", report.identities_used[0]),
                    n => format!(" (cycled through {} service accounts)", n),
                };
                env.notify.send(&format!(
                    "Upload completed for {}: {} files ({}) transferred in {} at avg {}/s{}",
                    name,
                    report.total_files,
                    human_bytes(report.total_bytes),
                    human_duration(elapsed),
                    human_bytes(avg),
                    sa_info
                ));
            } else {
                let mode_info = if is_weekend {
                    "weekend - full scan completed".to_string()
                } else {
                    format!("{} files already cached", cached_count)
                };
                env.notify.send(&format!(
                    "Upload completed for {}: no new files to transfer ({})",
                    name, mode_info
                ));
            }
            // a clean run lifts a leftover uploader suspension
            if report.suspended_until.is_none() && env.ledgers.clear_uploader_ban(name) {
                tracing::info!("{} is no longer suspended due to a previously aborted upload", name);
            }
        } else if report.tool_failed {
            env.notify.send(&format!(
                "Upload was not completed successfully for remote: {} ({} files, {} transferred before failure)",
                name,
                report.total_files,
                human_bytes(report.total_bytes)
            ));
        }
    }

    // chunk and list temp files never outlive the run
    FileChunker::cleanup(temp_paths);
    Ok(())
}

/// Upload without service accounts: one invocation with the uploader's
/// own parameters, no staging.
fn run_single_upload(
    env: &UploadEnv<'_>,
    name: &str,
    remote: &RemoteConfig,
    excludes: &[String],
    stats_cell: &StatsCell,
    on_complete: &mut dyn FnMut(&CompletedFile),
) -> Result<RotationReport> {
    let mut report = RotationReport {
        success: false,
        suspended_until: None,
        tool_failed: false,
        total_bytes: 0,
        total_files: 0,
        identities_used: Vec::new(),
    };
    let driver = RcloneDriver {
        binary: &env.cfg.core.rclone_binary_path,
        stop: env.shutdown.clone(),
        stats: Some(stats_cell.clone()),
    };
    let job = UploadJob {
        action: ToolAction::Copy,
        source: &remote.upload_folder,
        dest: &remote.upload_remote,
        rclone_config: &env.cfg.core.rclone_config_path,
        identity: None,
        plan: None,
        excludes,
        extras: &remote.rclone_extras,
        files_from: None,
        chunked: false,
        dry_run: env.cfg.core.dry_run,
    };
    let mut tracker = TriggerTracker::from_config(&remote.rclone_sleeps);
    let mut sink = |completed: CompletedFile| {
        report.total_bytes += completed.bytes;
        report.total_files += 1;
        on_complete(&completed);
    };
    let outcome = driver.run(&job, &mut tracker, &mut sink)?;

    match outcome {
        DriverOutcome::Completed => {
            report.success = true;
        }
        DriverOutcome::MaxTransferReached => {
            // without accounts to rotate, the cutoff parks the whole
            // uploader until tomorrow's quota
            report.success = true;
            suspend_uploader_for(env, name, "max transfer reached", MAX_TRANSFER_SUSPEND_HOURS);
            report.suspended_until = env.ledgers.uploader_ban(name);
        }
        DriverOutcome::AbortedByTrigger { phrase, sleep_hours } => {
            suspend_uploader_for(env, name, &phrase, sleep_hours);
            report.suspended_until = env.ledgers.uploader_ban(name);
        }
        DriverOutcome::ToolError { .. } => {
            report.tool_failed = true;
        }
    }
    Ok(report)
}

fn suspend_uploader_for(env: &UploadEnv<'_>, name: &str, reason: &str, hours: u32) {
    if env.ledgers.uploader_ban(name).is_some() {
        tracing::info!("upload aborted due to '{}' for already-suspended {}", reason, name);
        env.notify.send(&format!("Upload was aborted for remote: {} due to trigger {}.", name, reason));
        return;
    }
    let until = unix_now() + (hours as i64) * 3600;
    env.ledgers.set_uploader_ban(name, until);
    tracing::info!(
        "upload aborted due to '{}', {} resumes normal operation in {} hour(s)",
        reason,
        name,
        hours
    );
    env.notify.send(&format!(
        "Upload was aborted for remote: {} due to trigger {}. Uploads suspended for {} hours",
        name, reason, hours
    ));
}

/// Post-upload move from a staging remote to its final remote.
fn run_mover_pass(env: &UploadEnv<'_>, name: &str, uploader_cfg: &UploaderConfig) -> Result<()> {
    let Some(mover) = &uploader_cfg.mover else {
        return Ok(());
    };
    if !mover.enabled {
        return Ok(());
    }
    if mover.move_from_remote.is_empty() || mover.move_to_remote.is_empty() {
        tracing::error!(
            "unable to act on '{}' mover: move_from_remote/move_to_remote must both be set",
            name
        );
        return Ok(());
    }

    tracing::info!("move starting from {} -> {}", mover.move_from_remote, mover.move_to_remote);
    env.notify.send(&format!(
        "Move has started for {} -> {}",
        mover.move_from_remote, mover.move_to_remote
    ));
    let driver = RcloneDriver {
        binary: &env.cfg.core.rclone_binary_path,
        stop: env.shutdown.clone(),
        stats: None,
    };
    let job = UploadJob {
        action: ToolAction::Move,
        source: &mover.move_from_remote,
        dest: &mover.move_to_remote,
        rclone_config: &env.cfg.core.rclone_config_path,
        identity: None,
        plan: None,
        excludes: &[],
        extras: &mover.rclone_extras,
        files_from: None,
        chunked: false,
        dry_run: env.cfg.core.dry_run,
    };
    let mut tracker = TriggerTracker::new(Vec::new());
    let outcome = driver.run(&job, &mut tracker, &mut |_| {})?;
    if outcome == DriverOutcome::Completed {
        env.notify.send(&format!(
            "Move finished successfully for {} -> {}",
            mover.move_from_remote, mover.move_to_remote
        ));
    } else {
        tracing::error!("move failed from {} -> {}", mover.move_from_remote, mover.move_to_remote);
        env.notify.send(&format!(
            "Move failed for {} -> {}",
            mover.move_from_remote, mover.move_to_remote
        ));
    }
    Ok(())
}
