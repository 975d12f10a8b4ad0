use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "imap-migrate")]
#[clap(author, version, about)]
pub struct Args {
    /// Path to the configuration file.
    #[clap(short, long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Scan and report only; nothing is created or appended on the destination.
    #[clap(long)]
    pub simulate: bool,
    /// Skip the confirmation prompt before a live migration.
    #[clap(short = 'y', long)]
    pub yes: bool,
    /// Suppress any progress output if set.
    #[clap(short, long)]
    pub quiet: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
