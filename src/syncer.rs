use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::config::SyncerConfig;
use crate::ledger::Ledgers;
use crate::lock::LockFile;
use crate::notify::NotifierSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    Trigger { phrase: String, sleep_hours: u32 },
    Failed,
}

/// A remote sync service instance. Concrete services are provisioned
/// outside this crate; the orchestration below only depends on this
/// capability set.
pub trait SyncAgent {
    fn name(&self) -> &str;
    fn service(&self) -> &str;
    fn startup(&mut self) -> Result<String>;
    fn setup(&mut self, instance_id: &str, rclone_config: &Path) -> Result<()>;
    fn sync(&mut self, instance_id: &str, dry_run: bool) -> Result<SyncOutcome>;
    fn destroy(&mut self, instance_id: &str) -> Result<()>;
}

/// Build agents from the `syncer` config block. No services ship with
/// this binary; configured entries are reported so the operator knows
/// they were seen and skipped.
pub fn load_agents(configs: &BTreeMap<String, SyncerConfig>) -> Vec<Box<dyn SyncAgent>> {
    for (name, cfg) in configs {
        tracing::warn!(
            "syncer '{}' requests unsupported service '{}', skipping",
            name,
            cfg.service
        );
    }
    Vec::new()
}

/// Clear expired syncer suspensions; report whether `to_check` is still
/// suspended.
pub fn check_suspended_syncers(
    ledgers: &Ledgers,
    notify: &NotifierSet,
    to_check: Option<&str>,
    now: i64,
) -> bool {
    let mut suspended = false;
    let expired: Vec<String> = ledgers.read_cache(|c| {
        c.syncer_bans.iter().filter(|(_, until)| now >= **until).map(|(n, _)| n.clone()).collect()
    });
    for name in &expired {
        ledgers.with_cache(|c| {
            c.syncer_bans.remove(name);
        });
        tracing::warn!("{} is no longer suspended due to a previously aborted sync", name);
        notify.send(&format!("Sync suspension has expired for syncer: {}", name));
    }
    if let Some(check) = to_check {
        if let Some(until) = ledgers.read_cache(|c| c.syncer_bans.get(check).copied())
            && now < until
        {
            tracing::info!(
                "{} is still suspended, normal operation resumes at {}",
                check,
                crate::util::format_ts(until)
            );
            suspended = true;
        }
    }
    suspended
}

pub struct SyncCtx<'a> {
    pub ledgers: &'a Ledgers,
    pub notify: &'a NotifierSet,
    pub locks_dir: PathBuf,
    pub shutdown: &'a AtomicBool,
    pub dry_run: bool,
    pub rclone_config: PathBuf,
    pub now: i64,
}

/// Run every (or one) sync agent under the sync lock, with the same
/// trigger-suspension bookkeeping the uploader uses.
pub fn do_sync(ctx: &SyncCtx<'_>, agents: &mut [Box<dyn SyncAgent>], only: Option<&str>) -> Result<()> {
    let lock = LockFile::sync(&ctx.locks_dir);
    let _guard = lock.acquire(ctx.shutdown)?;
    tracing::info!("starting sync");

    for agent in agents.iter_mut() {
        if let Some(only) = only
            && agent.name() != only
        {
            continue;
        }
        let name = agent.name().to_string();
        ctx.notify.send(&format!("Sync initiated for syncer: {}", name));

        let instance_id = match agent.startup() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("syncer {} failed to start an instance: {}", name, e);
                ctx.notify.send(&format!(
                    "Syncer: {} failed to startup an instance. Manually check no instances are still running!",
                    name
                ));
                continue;
            }
        };
        if let Err(e) = agent.setup(&instance_id, &ctx.rclone_config) {
            tracing::error!("syncer {} failed to set up instance {}: {}", name, instance_id, e);
            ctx.notify.send(&format!(
                "Syncer: {} failed to setup its instance. Manually check no instances are still running!",
                name
            ));
            continue;
        }

        let outcome = match agent.sync(&instance_id, ctx.dry_run) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("sync errored for syncer {}: {}", name, e);
                SyncOutcome::Failed
            }
        };
        match outcome {
            SyncOutcome::Failed => {
                tracing::error!("sync unexpectedly failed for syncer: {}", name);
                ctx.notify.send(&format!(
                    "Sync failed unexpectedly for syncer: {}. Manually check no instances are still running!",
                    name
                ));
            }
            SyncOutcome::Trigger { phrase, sleep_hours } => {
                let already = ledger_has_ban(ctx.ledgers, &name);
                if !already {
                    let until = ctx.now + (sleep_hours as i64) * 3600;
                    ctx.ledgers.with_cache(|c| {
                        c.syncer_bans.insert(name.clone(), until);
                    });
                    tracing::info!(
                        "sync aborted due to trigger '{}', {} resumes in {} hour(s)",
                        phrase,
                        name,
                        sleep_hours
                    );
                    ctx.notify.send(&format!(
                        "Sync was aborted for syncer: {} due to trigger {}. Syncs suspended for {} hours",
                        name, phrase, sleep_hours
                    ));
                } else {
                    tracing::info!("sync aborted due to trigger '{}' for already-suspended {}", phrase, name);
                    ctx.notify.send(&format!(
                        "Sync was aborted for syncer: {} due to trigger {}.",
                        name, phrase
                    ));
                }
            }
            SyncOutcome::Completed => {
                tracing::info!("sync completed successfully for syncer: {}", name);
                ctx.notify.send(&format!("Sync was completed successfully for syncer: {}", name));
                ctx.ledgers.with_cache(|c| {
                    c.syncer_bans.remove(&name);
                });
            }
        }

        if let Err(e) = agent.destroy(&instance_id) {
            tracing::error!("syncer {} failed to destroy instance {}: {}", name, instance_id, e);
            ctx.notify.send(&format!(
                "Syncer: {} failed to destroy its instance: {}. Manually check no instances are still running!",
                name, instance_id
            ));
        }
    }

    tracing::info!("finished sync");
    Ok(())
}

fn ledger_has_ban(ledgers: &Ledgers, name: &str) -> bool {
    ledgers.read_cache(|c| c.syncer_bans.contains_key(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedAgent {
        outcome: SyncOutcome,
    }

    impl SyncAgent for ScriptedAgent {
        fn name(&self) -> &str {
            "nightly"
        }
        fn service(&self) -> &str {
            "scripted"
        }
        fn startup(&mut self) -> Result<String> {
            Ok("instance-1".to_string())
        }
        fn setup(&mut self, _instance_id: &str, _rclone_config: &Path) -> Result<()> {
            Ok(())
        }
        fn sync(&mut self, _instance_id: &str, _dry_run: bool) -> Result<SyncOutcome> {
            Ok(self.outcome.clone())
        }
        fn destroy(&mut self, _instance_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn ctx<'a>(ledgers: &'a Ledgers, notify: &'a NotifierSet, dir: &Path, shutdown: &'a AtomicBool) -> SyncCtx<'a> {
        SyncCtx {
            ledgers,
            notify,
            locks_dir: dir.join("locks"),
            shutdown,
            dry_run: false,
            rclone_config: PathBuf::from("/cfg/rclone.conf"),
            now: 10_000,
        }
    }

    #[test]
    fn trigger_outcome_suspends_the_syncer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledgers = Ledgers::open(dir.path());
        let notify = NotifierSet::default();
        let shutdown = AtomicBool::new(false);
        let mut agents: Vec<Box<dyn SyncAgent>> = vec![Box::new(ScriptedAgent {
            outcome: SyncOutcome::Trigger { phrase: "rateLimitExceeded".into(), sleep_hours: 6 },
        })];

        do_sync(&ctx(&ledgers, &notify, dir.path(), &shutdown), &mut agents, None).expect("sync");
        let until = ledgers.read_cache(|c| c.syncer_bans.get("nightly").copied());
        assert_eq!(until, Some(10_000 + 6 * 3600));
        assert!(check_suspended_syncers(&ledgers, &notify, Some("nightly"), 10_001));
        // suspension clears once the expiry passes
        assert!(!check_suspended_syncers(&ledgers, &notify, Some("nightly"), 10_000 + 6 * 3600));
    }

    #[test]
    fn completed_outcome_clears_a_previous_ban() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledgers = Ledgers::open(dir.path());
        ledgers.with_cache(|c| {
            c.syncer_bans.insert("nightly".into(), 99_999);
        });
        let notify = NotifierSet::default();
        let shutdown = AtomicBool::new(false);
        let mut agents: Vec<Box<dyn SyncAgent>> =
            vec![Box::new(ScriptedAgent { outcome: SyncOutcome::Completed })];

        do_sync(&ctx(&ledgers, &notify, dir.path(), &shutdown), &mut agents, None).expect("sync");
        assert_eq!(ledgers.read_cache(|c| c.syncer_bans.get("nightly").copied()), None);
    }
}
