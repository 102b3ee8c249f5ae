use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the config file (defaults to ~/.barrow/config.json)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Write debug-level output to the log file
    #[clap(long, global = true)]
    pub debug: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Run the scheduler until interrupted", display_order = 1)]
    Run {},
    #[clap(about = "Perform a single upload pass now", display_order = 2)]
    Upload {
        #[clap(help = "Only upload this remote")]
        remote: Option<String>,
    },
    #[clap(about = "Run the hidden-files cleaner once", display_order = 3)]
    Clean {},
    #[clap(about = "Run all configured syncers once", display_order = 4)]
    Sync {
        #[clap(help = "Only run this syncer")]
        syncer: Option<String>,
    },
    #[clap(about = "Show suspensions and service account quota usage", name = "status", display_order = 5)]
    Status {},
}
