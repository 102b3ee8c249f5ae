use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};

use crate::config::Config;
use crate::journal::TransferJournal;
use crate::ledger::Ledgers;
use crate::notify::NotifierSet;
use crate::orchestrator::UploadEnv;
use crate::syncer::SyncAgent;
use crate::util::{format_ts, human_bytes, unix_now};

/// Hidden-files cleanup collaborator. The real cleaner lives outside this
/// crate; the default just records that the call-site fired.
pub trait HiddenCleaner: Send + Sync {
    fn clean(&self, folder: &str) -> Result<()>;
}

pub struct NoopHiddenCleaner;

impl HiddenCleaner for NoopHiddenCleaner {
    fn clean(&self, folder: &str) -> Result<()> {
        tracing::debug!("no hidden-files cleaner is compiled in, skipping {}", folder);
        Ok(())
    }
}

/// Process-wide wiring: config, ledgers, and the collaborators every
/// subsystem talks to.
pub struct App {
    pub cfg: Config,
    pub ledgers: Ledgers,
    pub notify: Arc<NotifierSet>,
    pub journal: TransferJournal,
    pub shutdown: Arc<AtomicBool>,
    pub hidden_cleaner: Box<dyn HiddenCleaner>,
    pub syncers: Vec<Box<dyn SyncAgent>>,
}

impl App {
    pub fn init(cfg: Config) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        // Ctrl-C / SIGTERM raise the flag; the scheduler loop, lock waits
        // and the driver's read loop all observe it
        signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;

        // a bare binary name must resolve on PATH before any upload fires
        if !cfg.core.rclone_binary_path.is_absolute()
            && which::which(&cfg.core.rclone_binary_path).is_err()
        {
            tracing::warn!(
                "transfer tool binary '{}' was not found on PATH",
                cfg.core.rclone_binary_path.display()
            );
        }

        let ledgers = Ledgers::open(&cfg.state_dir);
        let notify = Arc::new(NotifierSet::from_config(&cfg.notifications));
        let journal = TransferJournal::new(cfg.logs_dir().join("transfer-stats.jsonl"));
        let syncers = crate::syncer::load_agents(&cfg.syncer);
        Ok(Self {
            cfg,
            ledgers,
            notify,
            journal,
            shutdown,
            hidden_cleaner: Box::new(NoopHiddenCleaner),
            syncers,
        })
    }

    pub fn upload_env(&self) -> UploadEnv<'_> {
        UploadEnv {
            cfg: &self.cfg,
            ledgers: &self.ledgers,
            notify: self.notify.clone(),
            journal: &self.journal,
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn run_syncer(&mut self, only: Option<&str>) -> Result<()> {
        let ctx = crate::syncer::SyncCtx {
            ledgers: &self.ledgers,
            notify: &self.notify,
            locks_dir: self.cfg.locks_dir(),
            shutdown: &self.shutdown,
            dry_run: self.cfg.core.dry_run,
            rclone_config: self.cfg.core.rclone_config_path.clone(),
            now: unix_now(),
        };
        if let Some(name) = only
            && crate::syncer::check_suspended_syncers(&self.ledgers, &self.notify, Some(name), unix_now())
        {
            return Ok(());
        }
        crate::syncer::do_sync(&ctx, &mut self.syncers, only)
    }

    /// Render suspensions and quota usage for the `status` subcommand.
    pub fn show_status(&self) -> Result<()> {
        let (cache, quota) = self.ledgers.snapshot();
        let now = unix_now();

        let mut uploader_rows: Vec<Vec<CellStruct>> = Vec::new();
        for name in self.cfg.uploader.keys() {
            let suspended = match cache.uploader_bans.get(name) {
                Some(until) if *until > now => format_ts(*until),
                _ => "-".to_string(),
            };
            let bans = cache.sa_bans.get(name);
            let total = bans.map(|b| b.len()).unwrap_or(0);
            let banned = bans
                .map(|b| b.values().filter(|v| v.is_some_and(|t| t > now)).count())
                .unwrap_or(0);
            uploader_rows.push(vec![
                name.cell(),
                suspended.cell().justify(Justify::Right),
                format!("{}/{}", total - banned, total).cell().justify(Justify::Right),
            ]);
        }
        if !uploader_rows.is_empty() {
            let title = vec![
                "Uploader".cell().bold(true),
                "Suspended Until".cell().bold(true),
                "Accounts Usable".cell().bold(true),
            ];
            print_stdout(uploader_rows.table().title(title))?;
        }

        let mut quota_rows: Vec<Vec<CellStruct>> = Vec::new();
        for (uploader, identities) in &quota {
            for (identity, entry) in identities {
                quota_rows.push(vec![
                    uploader.cell(),
                    identity.cell(),
                    human_bytes(entry.bytes).cell().justify(Justify::Right),
                    format_ts(entry.reset_time).cell().justify(Justify::Right),
                ]);
            }
        }
        if !quota_rows.is_empty() {
            let title = vec![
                "Uploader".cell().bold(true),
                "Service Account".cell().bold(true),
                "Used Today".cell().bold(true),
                "Resets At".cell().bold(true),
            ];
            print_stdout(quota_rows.table().title(title))?;
        } else {
            println!("No service account quota usage recorded.");
        }
        Ok(())
    }
}
