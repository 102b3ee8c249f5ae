use anyhow::Result;
use clap::Parser;
use std::fs::OpenOptions;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod app;
mod cache;
mod chunker;
mod cli;
mod config;
mod driver;
mod error;
mod fsutil;
mod journal;
mod ledger;
mod lock;
mod notify;
mod orchestrator;
mod planner;
mod plex;
mod queues;
mod quota;
mod rc;
mod rotation;
mod scheduler;
mod syncer;
mod throttle;
mod triggers;
mod util;

pub use error::UploadError;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let cfg = config::Config::load(cli.config.as_deref())?;
    init_tracing(&cfg, cli.debug);

    // 在处理命令前清理上次崩溃遗留的临时文件 — Clean up temp files left behind by a crashed run before processing commands
    fsutil::cleanup_orphaned_temp_files();

    let mut app = app::App::init(cfg)?;

    match cli.command {
        cli::Commands::Run {} => {
            tracing::info!("started in run mode");
            scheduler::run_loop(&mut app)
        }
        cli::Commands::Upload { remote } => {
            tracing::info!("started in upload mode");
            scheduler::do_hidden(&app)?;
            orchestrator::do_upload(&app.upload_env(), remote.as_deref())
        }
        cli::Commands::Clean {} => {
            tracing::info!("started in clean mode");
            scheduler::do_hidden(&app)
        }
        cli::Commands::Sync { syncer } => {
            tracing::info!("started in sync mode");
            app.run_syncer(syncer.as_deref())
        }
        cli::Commands::Status {} => app.show_status(),
    }
}

fn init_tracing(cfg: &config::Config, debug: bool) {
    let logs_dir = cfg.logs_dir();
    let _ = std::fs::create_dir_all(&logs_dir);
    let log_path = logs_dir.join("barrow.log");
    let level_str = if debug { "debug" } else { "info" };

    let console_layer = fmt::layer().with_target(false).with_filter(EnvFilter::new(level_str));

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Leak the worker guard so the background writer thread stays
            // alive for the life of the process; dropping it on return
            // would lose buffered log lines.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(console_layer).with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open log file at {}: {}", log_path.display(), e);
            tracing_subscriber::registry().with(console_layer).init();
        }
    }
}
